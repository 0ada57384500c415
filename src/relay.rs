//! Host-facing entry point: shared collaborators and session creation.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use rand::Rng;
use rand::distributions::Alphanumeric;
use reqwest::Client;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS, TOKEN_LENGTH, default_user_agent};
use crate::notify::{StateNotifier, StateStore};
use crate::progress::ProgressEstimator;
use crate::protocol::headers::sanitize_headers;
use crate::protocol::{
    FormUpload, ObjectStorageTarget, ObjectStorageUpload, ResumableClient, ResumableUpload,
    TusClient, UploadReporter, UploadStrategy,
};
use crate::session::validation::validate;
use crate::session::{
    AllowList, Coordinator, Destination, Lifecycle, ProtocolConfig, Session, SessionConfig,
    ValidationError, ValidationRules,
};
use crate::signals::{ControlSignal, MailboxReceivers, SignalBus};
use crate::stream::DualStreamWriter;

/// Relay-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOptions {
    /// Directory holding one file per live session.
    pub storage_dir: PathBuf,
    /// Accept destinations without a top-level domain.
    pub debug: bool,
    /// Destination URL patterns, see [`AllowList`]. Empty allows all.
    pub allow_list: Vec<String>,
    /// HTTP connect timeout.
    pub connect_timeout_secs: u64,
    /// HTTP read timeout between received bytes.
    pub read_timeout_secs: u64,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            storage_dir: std::env::temp_dir().join("transload"),
            debug: false,
            allow_list: Vec::new(),
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            read_timeout_secs: READ_TIMEOUT_SECS,
        }
    }
}

/// Errors creating a relay or starting a session.
#[derive(Debug, Error)]
pub enum RelayError {
    /// An allow-list pattern did not compile.
    #[error("invalid allow-list pattern: {0}")]
    InvalidAllowList(#[source] regex::Error),

    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// The session file or storage directory could not be created.
    #[error("storage error at {path}: {source}")]
    Storage {
        /// Path that failed.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// What a validated configuration will upload to.
enum Plan {
    Form {
        endpoint: Url,
        field_name: String,
    },
    Resumable {
        endpoint: Option<Url>,
        upload_url: Option<Url>,
    },
    ObjectStorage(Option<ObjectStorageTarget>),
}

impl Plan {
    fn new(protocol: ProtocolConfig, destination: Destination) -> Result<Self, ValidationError> {
        match protocol {
            ProtocolConfig::FormMultipart { field_name, .. } => Ok(Self::Form {
                endpoint: destination
                    .endpoint
                    .ok_or(ValidationError::MissingDestination)?,
                field_name: field_name.trim().to_string(),
            }),
            ProtocolConfig::Resumable { .. } => Ok(Self::Resumable {
                endpoint: destination.endpoint,
                upload_url: destination.upload_url,
            }),
            ProtocolConfig::ObjectStorage(target) => Ok(Self::ObjectStorage(target)),
        }
    }
}

/// Creates sessions and routes control signals to them.
///
/// One relay serves any number of concurrent sessions; they share the HTTP
/// client, the signal bus and the optional state store, and nothing else.
#[derive(Debug)]
pub struct Relay {
    options: RelayOptions,
    rules: ValidationRules,
    http: Client,
    resumable: Arc<dyn ResumableClient>,
    bus: SignalBus,
    store: Option<Arc<dyn StateStore>>,
}

impl Relay {
    /// Builds a relay.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidAllowList`] for a pattern that does not
    /// compile and [`RelayError::HttpClient`] if the client cannot be built.
    pub fn new(options: RelayOptions) -> Result<Self, RelayError> {
        let allow_list = AllowList::new(&options.allow_list).map_err(RelayError::InvalidAllowList)?;
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(options.connect_timeout_secs))
            .read_timeout(Duration::from_secs(options.read_timeout_secs))
            .gzip(true)
            .user_agent(default_user_agent())
            .build()?;
        debug!(
            storage_dir = %options.storage_dir.display(),
            debug = options.debug,
            allow_patterns = options.allow_list.len(),
            "relay configured"
        );

        Ok(Self {
            rules: ValidationRules {
                debug: options.debug,
                allow_list,
            },
            resumable: Arc::new(TusClient::new(http.clone())),
            http,
            bus: SignalBus::new(),
            store: None,
            options,
        })
    }

    /// Persists every session's latest event to `store`.
    #[must_use]
    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replaces the tus client used by resumable sessions.
    #[must_use]
    pub fn with_resumable_client(mut self, client: Arc<dyn ResumableClient>) -> Self {
        self.resumable = client;
        self
    }

    /// The relay's settings.
    #[must_use]
    pub fn options(&self) -> &RelayOptions {
        &self.options
    }

    /// The bus addressing live sessions by token.
    #[must_use]
    pub fn signal_bus(&self) -> &SignalBus {
        &self.bus
    }

    /// Validates a configuration without starting anything.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] found.
    pub fn validate(&self, config: &SessionConfig) -> Result<Destination, ValidationError> {
        validate(config, &self.rules)
    }

    /// Starts a session.
    ///
    /// A configuration that fails validation still yields a [`Session`],
    /// carrying the error in [`Session::error`]; no file, mailbox or task is
    /// created for it.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Storage`] if the session file cannot be created.
    #[instrument(skip(self, config), fields(protocol = %config.protocol.kind()))]
    pub async fn start_session(&self, config: SessionConfig) -> Result<Session, RelayError> {
        let token = self.new_token();
        let path = self.options.storage_dir.join(&token);
        let protocol = config.protocol.kind();

        let plan = match validate(&config, &self.rules)
            .and_then(|destination| Plan::new(config.protocol, destination))
        {
            Ok(plan) => plan,
            Err(error) => {
                warn!(%token, error = %error, status = error.status(), "rejected session configuration");
                return Ok(Session::rejected(token, path, protocol, error));
            }
        };

        tokio::fs::create_dir_all(&self.options.storage_dir)
            .await
            .map_err(|source| RelayError::Storage {
                path: self.options.storage_dir.clone(),
                source,
            })?;

        let headers = sanitize_headers(&config.headers);
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (tee_tx, tee_rx) = mpsc::channel(1);
        let tee_tx = protocol.uses_tee().then_some(tee_tx);
        let (writer, sink) = DualStreamWriter::create(path.clone(), tee_tx, messages_tx.clone())
            .await
            .map_err(|source| RelayError::Storage {
                path: path.clone(),
                source,
            })?;

        let MailboxReceivers { control, ready } = self.bus.register(&token);
        let reporter = UploadReporter::new(messages_tx);
        let metadata = config.metadata;
        let strategy = match plan {
            Plan::Form {
                endpoint,
                field_name,
            } => UploadStrategy::form(
                FormUpload::new(
                    self.http.clone(),
                    endpoint,
                    field_name,
                    metadata,
                    headers,
                    path.clone(),
                ),
                reporter,
            ),
            Plan::Resumable {
                endpoint,
                upload_url,
            } => UploadStrategy::resumable(
                ResumableUpload::new(
                    Arc::clone(&self.resumable),
                    endpoint,
                    upload_url,
                    metadata,
                    headers,
                    tee_rx,
                    control,
                ),
                reporter,
            ),
            Plan::ObjectStorage(target) => UploadStrategy::object_storage(
                ObjectStorageUpload::new(target, metadata, path.clone(), sink.clone()),
                reporter,
            ),
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let terminated = Arc::new(AtomicBool::new(false));
        let coordinator = Coordinator::new(
            token.clone(),
            messages_rx,
            sink,
            strategy,
            ProgressEstimator::new(config.declared_size),
            StateNotifier::new(token.clone(), events_tx, self.store.clone()),
            Lifecycle::new(token.clone(), path.clone(), self.bus.clone()),
            Arc::clone(&terminated),
        )
        .spawn();

        info!(%token, %protocol, path = %path.display(), "session started");
        Ok(Session::running(
            token,
            path,
            protocol,
            writer,
            events_rx,
            ready,
            coordinator,
            terminated,
        ))
    }

    /// Pauses a live resumable upload. Returns false if no session received it.
    #[instrument(skip(self))]
    pub fn pause(&self, token: &str) -> bool {
        self.bus.send(token, ControlSignal::Pause)
    }

    /// Resumes a paused upload. Returns false if no session received it.
    #[instrument(skip(self))]
    pub fn resume(&self, token: &str) -> bool {
        self.bus.send(token, ControlSignal::Resume)
    }

    /// Fires the one-time listener-attached signal for `token`.
    #[instrument(skip(self))]
    pub fn listener_attached(&self, token: &str) -> bool {
        self.bus.listener_attached(token)
    }

    fn new_token(&self) -> String {
        loop {
            let token: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(TOKEN_LENGTH)
                .map(char::from)
                .collect();
            if !self.bus.is_registered(&token) {
                return token;
            }
        }
    }
}
