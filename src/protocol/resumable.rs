//! Resumable chunked upload (tus 1.0) fed by the live tee.
//!
//! The upload is created with a deferred length as soon as the first chunk
//! arrives (or a pre-issued upload URL is reused), bytes are sent in PATCH
//! requests of at most [`RESUMABLE_CHUNK_CEILING`], and the final PATCH
//! declares `Upload-Length` once the download has ended.
//!
//! Pause drops the in-flight request. Resume asks the server for its offset
//! and continues from there, discarding buffered bytes the server already has.
//! A length the server already reports is never declared again.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{Buf, Bytes, BytesMut};
use reqwest::header::{CONTENT_TYPE, HeaderMap, LOCATION};
use reqwest::{Client, Response};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace};
use url::Url;

use super::{UploadError, UploadOutcome, UploadReporter};
use crate::constants::{RESUMABLE_CHUNK_CEILING, TUS_VERSION};
use crate::session::{Chunk, Metadata};
use crate::signals::ControlSignal;

const TUS_RESUMABLE: &str = "Tus-Resumable";
const UPLOAD_OFFSET: &str = "Upload-Offset";
const UPLOAD_LENGTH: &str = "Upload-Length";
const UPLOAD_DEFER_LENGTH: &str = "Upload-Defer-Length";
const UPLOAD_METADATA: &str = "Upload-Metadata";
const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

/// Most unacknowledged bytes the driver holds before it stops taking chunks.
const INTAKE_LIMIT: usize = 2 * RESUMABLE_CHUNK_CEILING;

/// What a HEAD request reports about an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadStatus {
    /// Bytes the server has stored.
    pub offset: u64,
    /// `Upload-Length`, once the server knows it.
    pub length: Option<u64>,
}

/// The three requests of the tus core protocol.
#[async_trait]
pub trait ResumableClient: Send + Sync + std::fmt::Debug {
    /// Creates an upload of deferred length and returns its URL.
    async fn create(
        &self,
        endpoint: &Url,
        metadata: &Metadata,
        headers: &HeaderMap,
    ) -> Result<Url, UploadError>;

    /// Returns the offset and known length the server has for `upload_url`.
    async fn status(
        &self,
        upload_url: &Url,
        headers: &HeaderMap,
    ) -> Result<UploadStatus, UploadError>;

    /// Sends `body` at `offset` and returns the server's new offset.
    ///
    /// `final_length` is sent as `Upload-Length` when given.
    async fn patch(
        &self,
        upload_url: &Url,
        offset: u64,
        body: Bytes,
        final_length: Option<u64>,
        headers: &HeaderMap,
    ) -> Result<u64, UploadError>;
}

/// [`ResumableClient`] speaking tus 1.0 over `reqwest`.
#[derive(Debug, Clone)]
pub struct TusClient {
    client: Client,
}

impl TusClient {
    /// Wraps an HTTP client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResumableClient for TusClient {
    async fn create(
        &self,
        endpoint: &Url,
        metadata: &Metadata,
        headers: &HeaderMap,
    ) -> Result<Url, UploadError> {
        let mut request = self
            .client
            .post(endpoint.clone())
            .headers(headers.clone())
            .header(TUS_RESUMABLE, TUS_VERSION)
            .header(UPLOAD_DEFER_LENGTH, "1")
            .body(Bytes::new());
        let encoded = encode_metadata(metadata);
        if !encoded.is_empty() {
            request = request.header(UPLOAD_METADATA, encoded);
        }

        let response = request
            .send()
            .await
            .map_err(|e| UploadError::network(endpoint.as_str(), e))?;
        let response = check_status(response, endpoint).await?;

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                UploadError::protocol(endpoint.as_str(), "creation response has no Location header")
            })?;
        endpoint.join(location).map_err(|e| {
            UploadError::protocol(endpoint.as_str(), format!("invalid Location {location}: {e}"))
        })
    }

    async fn status(
        &self,
        upload_url: &Url,
        headers: &HeaderMap,
    ) -> Result<UploadStatus, UploadError> {
        let response = self
            .client
            .head(upload_url.clone())
            .headers(headers.clone())
            .header(TUS_RESUMABLE, TUS_VERSION)
            .send()
            .await
            .map_err(|e| UploadError::network(upload_url.as_str(), e))?;
        let response = check_status(response, upload_url).await?;
        Ok(UploadStatus {
            offset: upload_offset(&response, upload_url)?,
            length: header_u64(&response, UPLOAD_LENGTH),
        })
    }

    async fn patch(
        &self,
        upload_url: &Url,
        offset: u64,
        body: Bytes,
        final_length: Option<u64>,
        headers: &HeaderMap,
    ) -> Result<u64, UploadError> {
        let mut request = self
            .client
            .patch(upload_url.clone())
            .headers(headers.clone())
            .header(TUS_RESUMABLE, TUS_VERSION)
            .header(CONTENT_TYPE, OFFSET_OCTET_STREAM)
            .header(UPLOAD_OFFSET, offset.to_string());
        if let Some(length) = final_length {
            request = request.header(UPLOAD_LENGTH, length.to_string());
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| UploadError::network(upload_url.as_str(), e))?;
        let response = check_status(response, upload_url).await?;
        upload_offset(&response, upload_url)
    }
}

/// Encodes metadata as `key base64(value)` pairs separated by commas.
fn encode_metadata(metadata: &Metadata) -> String {
    metadata
        .fields()
        .into_iter()
        .filter(|(key, _)| !key.is_empty() && !key.contains([' ', ',']))
        .map(|(key, value)| format!("{key} {}", STANDARD.encode(value)))
        .collect::<Vec<_>>()
        .join(",")
}

async fn check_status(response: Response, url: &Url) -> Result<Response, UploadError> {
    let status = response.status();
    if status.is_client_error() || status.is_server_error() {
        let body = response.text().await.ok();
        return Err(UploadError::http_status_with_body(
            url.as_str(),
            status.as_u16(),
            body,
        ));
    }
    Ok(response)
}

fn header_u64(response: &Response, name: &str) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
}

fn upload_offset(response: &Response, url: &Url) -> Result<u64, UploadError> {
    header_u64(response, UPLOAD_OFFSET)
        .ok_or_else(|| UploadError::protocol(url.as_str(), "response has no valid Upload-Offset"))
}

/// Bytes taken from the tee that the server has not acknowledged yet.
///
/// `skip` counts incoming bytes the server already stores (a pre-issued
/// upload URL can be ahead of the local stream); they are dropped on arrival.
#[derive(Debug)]
struct TeeBuffer {
    chunks: mpsc::Receiver<Chunk>,
    pending: BytesMut,
    offset: u64,
    received: u64,
    skip: u64,
    ended: bool,
}

impl TeeBuffer {
    fn new(chunks: mpsc::Receiver<Chunk>) -> Self {
        Self {
            chunks,
            pending: BytesMut::new(),
            offset: 0,
            received: 0,
            skip: 0,
            ended: false,
        }
    }

    fn started(&self) -> bool {
        self.received > 0 || self.ended
    }

    fn wants_more(&self, limit: usize) -> bool {
        !self.ended && self.pending.len() < limit
    }

    fn accept(&mut self, chunk: Option<Chunk>) -> Result<(), UploadError> {
        match chunk {
            Some(Chunk::Data(mut bytes)) => {
                self.received += bytes.len() as u64;
                if self.skip > 0 {
                    let skipped = usize::try_from(self.skip).unwrap_or(usize::MAX).min(bytes.len());
                    bytes.advance(skipped);
                    self.skip -= skipped as u64;
                }
                self.pending.extend_from_slice(&bytes);
                Ok(())
            }
            Some(Chunk::End) => {
                self.ended = true;
                Ok(())
            }
            None => Err(UploadError::Abandoned),
        }
    }

    /// Drops everything below the server's `offset`.
    fn acknowledge(&mut self, offset: u64, url: &Url) -> Result<(), UploadError> {
        let buffered_end = self.offset + self.pending.len() as u64;
        if offset > buffered_end && !self.ended {
            self.skip = offset - self.received;
            self.pending.clear();
            self.offset = offset;
            return Ok(());
        }
        if offset < self.offset || offset > buffered_end {
            return Err(UploadError::protocol(
                url.as_str(),
                format!(
                    "server offset {offset} outside buffered range {}..={buffered_end}",
                    self.offset
                ),
            ));
        }
        let consumed = usize::try_from(offset - self.offset).unwrap_or(self.pending.len());
        self.pending.advance(consumed);
        self.offset = offset;
        Ok(())
    }
}

enum Attempt<T> {
    Done(Result<T, UploadError>),
    Paused,
}

/// Pause and resume bookkeeping.
#[derive(Debug)]
struct Control {
    signals: mpsc::UnboundedReceiver<ControlSignal>,
    open: bool,
    paused: bool,
    need_sync: bool,
}

impl Control {
    fn apply(&mut self, signal: Option<ControlSignal>) {
        match signal {
            Some(ControlSignal::Pause) if !self.paused => {
                info!("upload paused");
                self.paused = true;
            }
            Some(ControlSignal::Resume) if self.paused => {
                info!("upload resumed");
                self.paused = false;
                self.need_sync = true;
            }
            Some(signal) => debug!(?signal, "ignoring redundant control signal"),
            None => self.open = false,
        }
    }
}

/// Runs `request` until it completes or a pause arrives, taking tee chunks meanwhile.
async fn interruptible<T>(
    request: impl Future<Output = Result<T, UploadError>>,
    control: &mut Control,
    tee: &mut TeeBuffer,
) -> Attempt<T> {
    tokio::pin!(request);
    loop {
        tokio::select! {
            biased;
            signal = control.signals.recv(), if control.open => {
                control.apply(signal);
                if control.paused {
                    return Attempt::Paused;
                }
            }
            result = &mut request => return Attempt::Done(result),
            chunk = tee.chunks.recv(), if tee.wants_more(INTAKE_LIMIT) => {
                if let Err(error) = tee.accept(chunk) {
                    return Attempt::Done(Err(error));
                }
            }
        }
    }
}

/// Drives one tus upload from the tee.
#[derive(Debug)]
pub(crate) struct ResumableUpload {
    client: Arc<dyn ResumableClient>,
    endpoint: Option<Url>,
    upload_url: Option<Url>,
    metadata: Metadata,
    headers: HeaderMap,
    chunks: mpsc::Receiver<Chunk>,
    control: mpsc::UnboundedReceiver<ControlSignal>,
}

impl ResumableUpload {
    pub(crate) fn new(
        client: Arc<dyn ResumableClient>,
        endpoint: Option<Url>,
        upload_url: Option<Url>,
        metadata: Metadata,
        headers: HeaderMap,
        chunks: mpsc::Receiver<Chunk>,
        control: mpsc::UnboundedReceiver<ControlSignal>,
    ) -> Self {
        Self {
            client,
            endpoint,
            upload_url,
            metadata,
            headers,
            chunks,
            control,
        }
    }

    #[instrument(skip_all, fields(endpoint = ?self.endpoint, upload_url = ?self.upload_url))]
    pub(crate) async fn run(self, reporter: &UploadReporter) -> Result<UploadOutcome, UploadError> {
        let Self {
            client,
            endpoint,
            upload_url,
            metadata,
            headers,
            chunks,
            control,
        } = self;

        let mut tee = TeeBuffer::new(chunks);
        let mut control = Control {
            signals: control,
            open: true,
            paused: false,
            need_sync: upload_url.is_some(),
        };
        let mut target = upload_url;
        let mut length_declared = false;

        loop {
            if tee.ended && tee.pending.is_empty() && length_declared {
                break;
            }

            let has_work = !tee.pending.is_empty() || (tee.ended && !length_declared);
            if control.paused || !tee.started() || !has_work {
                tokio::select! {
                    signal = control.signals.recv(), if control.open => control.apply(signal),
                    chunk = tee.chunks.recv(), if !control.paused && tee.wants_more(INTAKE_LIMIT) => {
                        tee.accept(chunk)?;
                    }
                    else => return Err(UploadError::Abandoned),
                }
                continue;
            }

            let url = if let Some(url) = &target {
                url.clone()
            } else {
                let endpoint = endpoint.as_ref().ok_or_else(|| {
                    UploadError::protocol("", "no resumable endpoint or upload URL configured")
                })?;
                match interruptible(
                    client.create(endpoint, &metadata, &headers),
                    &mut control,
                    &mut tee,
                )
                .await
                {
                    Attempt::Done(created) => {
                        let url = created?;
                        info!(upload_url = %url, "created resumable upload");
                        target = Some(url.clone());
                        url
                    }
                    Attempt::Paused => continue,
                }
            };

            if control.need_sync {
                match interruptible(client.status(&url, &headers), &mut control, &mut tee).await {
                    Attempt::Done(status) => {
                        let UploadStatus { offset, length } = status?;
                        debug!(offset, length, "synchronized with server offset");
                        tee.acknowledge(offset, &url)?;
                        // A dropped final PATCH may already have been committed
                        if length.is_some() {
                            length_declared = true;
                        }
                        reporter.uploaded(offset);
                        control.need_sync = false;
                    }
                    Attempt::Paused => {}
                }
                continue;
            }

            let take = tee.pending.len().min(RESUMABLE_CHUNK_CEILING);
            let body = Bytes::copy_from_slice(&tee.pending[..take]);
            let final_length = (tee.ended && take == tee.pending.len() && !length_declared)
                .then_some(tee.received);
            let offset = tee.offset;
            trace!(offset, bytes = take, final_length, "sending resumable chunk");

            match interruptible(
                client.patch(&url, offset, body, final_length, &headers),
                &mut control,
                &mut tee,
            )
            .await
            {
                Attempt::Done(acknowledged) => {
                    let acknowledged = acknowledged?;
                    tee.acknowledge(acknowledged, &url)?;
                    if final_length.is_some() {
                        length_declared = true;
                    }
                    reporter.uploaded(acknowledged);
                }
                Attempt::Paused => control.need_sync = true,
            }
        }

        let url = target.map(|url| url.to_string());
        info!(bytes = tee.received, upload_url = ?url, "resumable upload completed");
        Ok(UploadOutcome {
            response: Some(serde_json::json!({
                "upload_url": url,
                "bytes": tee.received,
            })),
            url,
        })
    }
}
