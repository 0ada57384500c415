//! Shared fixtures for the integration tests: an in-process tus server, an
//! in-memory object store and relay/event helpers.

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use transload_core::protocol::{MultipartTarget, PartReceipt};
use transload_core::{
    Chunk, ObjectStorageClient, Relay, RelayOptions, Session, SessionEvent, UploadError,
};
use wiremock::matchers::path_regex;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Path of the single upload resource the fake tus server hands out.
pub const TUS_UPLOAD_PATH: &str = "/files/upload-1";

/// Relay storing session files under `dir`, accepting `127.0.0.1` destinations.
pub fn relay(dir: &Path) -> Relay {
    Relay::new(RelayOptions {
        storage_dir: dir.to_path_buf(),
        debug: true,
        ..RelayOptions::default()
    })
    .expect("relay should build")
}

/// Deterministic payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Feeds `data` in `chunk_size` pieces followed by the end marker.
pub async fn feed(session: &mut Session, data: &[u8], chunk_size: usize) {
    for piece in data.chunks(chunk_size) {
        session
            .handle_chunk(Chunk::Data(Bytes::copy_from_slice(piece)))
            .await
            .expect("chunk should be accepted");
    }
    session
        .handle_chunk(Chunk::End)
        .await
        .expect("end should be accepted");
}

/// Drains a session's events until its coordinator finishes.
pub async fn collect_events(mut events: mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut collected = Vec::new();
    while let Some(event) = tokio::time::timeout(Duration::from_secs(30), events.recv())
        .await
        .expect("session should finish")
    {
        collected.push(event);
    }
    collected
}

/// Asserts exactly one terminal event, last, and strictly increasing progress.
pub fn assert_event_sequence(events: &[SessionEvent]) {
    let terminal = events.iter().filter(|event| event.is_terminal()).count();
    assert_eq!(terminal, 1, "expected a single terminal event: {events:?}");
    assert!(
        events.last().is_some_and(SessionEvent::is_terminal),
        "terminal event must be last: {events:?}"
    );
    let percentages: Vec<f64> = events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Progress { percentage, .. } => Some(*percentage),
            _ => None,
        })
        .collect();
    assert!(
        percentages.windows(2).all(|pair| pair[0] < pair[1]),
        "progress must strictly increase: {percentages:?}"
    );
    assert!(percentages.iter().all(|p| (0.0..=100.0).contains(p)));
}

/// State of the fake tus server.
#[derive(Debug, Default)]
pub struct TusState {
    /// Bytes stored for the upload.
    pub data: Vec<u8>,
    /// Declared `Upload-Length`, once sent.
    pub length: Option<u64>,
    /// `(offset, len)` of each accepted PATCH.
    pub patches: Vec<(u64, usize)>,
    /// Number of creation requests.
    pub creations: usize,
    /// Number of offset (HEAD) requests.
    pub heads: usize,
    /// `Upload-Metadata` header of the creation request.
    pub metadata: Option<String>,
}

/// Minimal tus 1.0 server with one upload resource.
#[derive(Debug, Clone, Default)]
pub struct TusServer {
    pub state: Arc<Mutex<TusState>>,
}

impl TusServer {
    /// Starts a mock server answering the tus endpoints under `/files`.
    pub async fn start() -> (MockServer, Self) {
        Self::start_with(Self::default()).await
    }

    /// Starts a mock server around an existing state (e.g. with stored bytes).
    pub async fn start_with(tus: Self) -> (MockServer, Self) {
        let server = MockServer::start().await;
        Mock::given(path_regex("^/files/?.*$"))
            .respond_with(tus.clone())
            .mount(&server)
            .await;
        (server, tus)
    }

    /// Snapshot of the stored bytes.
    pub fn data(&self) -> Vec<u8> {
        self.state.lock().unwrap().data.clone()
    }
}

fn header<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    request
        .headers
        .get(name)
        .and_then(|value| value.to_str().ok())
}

impl Respond for TusServer {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let mut state = self.state.lock().unwrap();
        match request.method.as_str() {
            "POST" => {
                state.creations += 1;
                state.metadata = header(request, "upload-metadata").map(str::to_string);
                ResponseTemplate::new(201)
                    .insert_header("Tus-Resumable", "1.0.0")
                    .insert_header("Location", TUS_UPLOAD_PATH)
            }
            "HEAD" => {
                state.heads += 1;
                let mut response = ResponseTemplate::new(200)
                    .insert_header("Tus-Resumable", "1.0.0")
                    .insert_header("Upload-Offset", state.data.len().to_string().as_str());
                if let Some(length) = state.length {
                    response = response.insert_header("Upload-Length", length.to_string().as_str());
                } else {
                    response = response.insert_header("Upload-Defer-Length", "1");
                }
                response
            }
            "PATCH" => {
                let offset = header(request, "upload-offset")
                    .and_then(|value| value.parse::<u64>().ok())
                    .unwrap_or(u64::MAX);
                if offset != state.data.len() as u64 {
                    return ResponseTemplate::new(409);
                }
                if let Some(length) =
                    header(request, "upload-length").and_then(|value| value.parse::<u64>().ok())
                {
                    if state.length.is_some() {
                        return ResponseTemplate::new(400);
                    }
                    state.length = Some(length);
                }
                state.data.extend_from_slice(&request.body);
                state.patches.push((offset, request.body.len()));
                ResponseTemplate::new(204)
                    .insert_header("Tus-Resumable", "1.0.0")
                    .insert_header("Upload-Offset", state.data.len().to_string().as_str())
            }
            _ => ResponseTemplate::new(405),
        }
    }
}

/// Object store keeping everything in memory.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    pub targets: Mutex<Vec<MultipartTarget>>,
    pub parts: Mutex<Vec<(i32, Bytes)>>,
    pub completed: Mutex<Option<Vec<PartReceipt>>>,
    pub aborted: Mutex<bool>,
}

impl MemoryObjectStore {
    /// Concatenation of every uploaded part in part order.
    pub fn object(&self) -> Vec<u8> {
        let mut parts = self.parts.lock().unwrap().clone();
        parts.sort_by_key(|(number, _)| *number);
        parts.into_iter().flat_map(|(_, bytes)| bytes.to_vec()).collect()
    }
}

#[async_trait]
impl ObjectStorageClient for MemoryObjectStore {
    async fn create_multipart_upload(
        &self,
        target: &MultipartTarget,
    ) -> Result<String, UploadError> {
        self.targets.lock().unwrap().push(target.clone());
        Ok("upload-1".to_string())
    }

    async fn upload_part(
        &self,
        _target: &MultipartTarget,
        _upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<PartReceipt, UploadError> {
        self.parts.lock().unwrap().push((part_number, body));
        Ok(PartReceipt {
            part_number,
            e_tag: format!("etag-{part_number}"),
        })
    }

    async fn complete_multipart_upload(
        &self,
        target: &MultipartTarget,
        _upload_id: &str,
        parts: &[PartReceipt],
    ) -> Result<Option<String>, UploadError> {
        *self.completed.lock().unwrap() = Some(parts.to_vec());
        Ok(Some(format!(
            "https://{}.storage.example.com/{}",
            target.bucket, target.key
        )))
    }

    async fn abort_multipart_upload(
        &self,
        _target: &MultipartTarget,
        _upload_id: &str,
    ) -> Result<(), UploadError> {
        *self.aborted.lock().unwrap() = true;
        Ok(())
    }
}
