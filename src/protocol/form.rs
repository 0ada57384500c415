//! `multipart/form-data` POST of the finished file.

use std::path::PathBuf;

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, LOCATION};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, instrument};
use url::Url;

use super::headers::strip_response_cookies;
use super::{UploadError, UploadOutcome, UploadReporter};
use crate::session::Metadata;

/// Streams the persisted file to `endpoint` once the download has ended.
///
/// The file part is named `field_name`; metadata fields precede it as text
/// parts so servers can read them before the body.
#[derive(Debug)]
pub(crate) struct FormUpload {
    client: Client,
    endpoint: Url,
    field_name: String,
    metadata: Metadata,
    headers: HeaderMap,
    path: PathBuf,
}

impl FormUpload {
    pub(crate) fn new(
        client: Client,
        endpoint: Url,
        field_name: String,
        metadata: Metadata,
        headers: HeaderMap,
        path: PathBuf,
    ) -> Self {
        Self {
            client,
            endpoint,
            field_name,
            metadata,
            headers,
            path,
        }
    }

    #[instrument(skip(self, reporter), fields(endpoint = %self.endpoint))]
    pub(crate) async fn run(self, reporter: &UploadReporter) -> Result<UploadOutcome, UploadError> {
        let url = self.endpoint.to_string();
        let file = File::open(&self.path)
            .await
            .map_err(|e| UploadError::io(&self.path, e))?;
        let length = file
            .metadata()
            .await
            .map_err(|e| UploadError::io(&self.path, e))?
            .len();

        let progress = reporter.clone();
        let mut streamed: u64 = 0;
        let body = ReaderStream::new(file).inspect(move |chunk| {
            if let Ok(bytes) = chunk {
                streamed += bytes.len() as u64;
                progress.streamed(streamed);
            }
        });

        let mut part = Part::stream_with_length(Body::wrap_stream(body), length);
        if let Some(filename) = &self.metadata.filename {
            part = part.file_name(filename.clone());
        }
        if let Some(content_type) = &self.metadata.content_type {
            part = part.mime_str(content_type).map_err(|e| {
                UploadError::protocol(&url, format!("invalid content type {content_type}: {e}"))
            })?;
        }

        let mut form = Form::new();
        for (name, value) in self.metadata.fields() {
            form = form.text(name, value);
        }
        let form = form.part(self.field_name.clone(), part);

        debug!(bytes = length, field = %self.field_name, "posting form upload");
        let response = self
            .client
            .post(self.endpoint.clone())
            .headers(self.headers)
            .multipart(form)
            .send()
            .await
            .map_err(|e| UploadError::network(&url, e))?;

        let status = response.status();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| self.endpoint.join(value).ok());
        let headers = strip_response_cookies(response.headers());
        let body = response
            .text()
            .await
            .map_err(|e| UploadError::network(&url, e))?;

        if status.is_client_error() || status.is_server_error() {
            return Err(UploadError::http_status_with_body(
                url,
                status.as_u16(),
                Some(body),
            ));
        }

        info!(status = status.as_u16(), bytes = length, "form upload accepted");
        let body = serde_json::from_str(&body).unwrap_or(serde_json::Value::String(body));
        Ok(UploadOutcome {
            url: Some(location.map_or(url, |location| location.to_string())),
            response: Some(serde_json::json!({
                "status": status.as_u16(),
                "headers": headers,
                "body": body,
            })),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::session::SessionMessage;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn upload_to(server: &MockServer, dir: &TempDir, contents: &[u8]) -> FormUpload {
        let file = dir.path().join("tok");
        std::fs::write(&file, contents).unwrap();
        FormUpload::new(
            Client::new(),
            Url::parse(&format!("{}/upload", server.uri())).unwrap(),
            "file".to_string(),
            Metadata::new("report.pdf", "application/pdf").with_field("folder", "inbox"),
            HeaderMap::new(),
            file,
        )
    }

    #[tokio::test]
    async fn test_posts_file_and_metadata_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload"))
            .and(body_string_contains("name=\"file\"; filename=\"report.pdf\""))
            .and(body_string_contains("name=\"folder\""))
            .and(body_string_contains("hello form"))
            .respond_with(ResponseTemplate::new(201).set_body_string(r#"{"id":7}"#))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let upload = upload_to(&server, &dir, b"hello form").await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = upload.run(&UploadReporter::new(tx)).await.unwrap();
        let response = outcome.response.unwrap();
        assert_eq!(response["status"], 201);
        assert_eq!(response["body"]["id"], 7);

        let mut streamed = 0;
        while let Ok(message) = rx.try_recv() {
            if let SessionMessage::UploadStreamed { bytes_uploaded } = message {
                streamed = bytes_uploaded;
            }
        }
        assert_eq!(streamed, 10);
    }

    #[tokio::test]
    async fn test_error_status_fails_upload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(413).set_body_string("too large"))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let upload = upload_to(&server, &dir, b"data").await;
        let (tx, _rx) = mpsc::unbounded_channel();

        let error = upload.run(&UploadReporter::new(tx)).await.unwrap_err();
        assert_eq!(error.status(), Some(413));
        assert!(matches!(
            error,
            UploadError::HttpStatus { body: Some(ref body), .. } if body == "too large"
        ));
    }

    #[tokio::test]
    async fn test_set_cookie_stripped_from_success_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("set-cookie", "session=secret")
                    .insert_header("x-request-id", "abc"),
            )
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let upload = upload_to(&server, &dir, b"data").await;
        let (tx, _rx) = mpsc::unbounded_channel();

        let outcome = upload.run(&UploadReporter::new(tx)).await.unwrap();
        let headers = &outcome.response.unwrap()["headers"];
        assert!(headers.get("set-cookie").is_none());
        assert_eq!(headers["x-request-id"], "abc");
    }
}
