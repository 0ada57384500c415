//! CLI entry point for the transload tool.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::header::CONTENT_TYPE;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use transload_core::constants::default_user_agent;
use transload_core::protocol::default_key;
use transload_core::{
    Chunk, ErrorDetail, Metadata, ObjectStorageTarget, ProtocolConfig, Relay, RelayOptions,
    S3MultipartClient, SessionConfig, SessionError, SessionEvent, SqliteStateStore,
};
use url::Url;

mod cli;

use cli::{Args, ProtocolArg};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    let mut options = RelayOptions {
        debug: args.debug,
        allow_list: args.allow.clone(),
        ..RelayOptions::default()
    };
    if let Some(dir) = &args.storage_dir {
        options.storage_dir.clone_from(dir);
    }
    let mut relay = Relay::new(options)?;
    if let Some(db_path) = &args.state_db {
        let store = SqliteStateStore::open(db_path)
            .await
            .with_context(|| format!("failed to open state database {}", db_path.display()))?;
        relay = relay.with_state_store(Arc::new(store));
    }

    let protocol = protocol_config(&args).await;
    let mut config = SessionConfig::new(protocol);
    for (name, value) in &args.headers {
        config = config.with_header(name, value);
    }

    // Reject a bad destination before touching the source
    if let Err(error) = relay.validate(&config) {
        bail!("invalid session configuration ({}): {error}", error.status());
    }

    let http = reqwest::Client::builder()
        .user_agent(default_user_agent())
        .connect_timeout(Duration::from_secs(relay.options().connect_timeout_secs))
        .build()?;
    let response = http
        .get(&args.source)
        .send()
        .await
        .with_context(|| format!("failed to fetch {}", args.source))?
        .error_for_status()?;

    let content_type = args.content_type.clone().or_else(|| {
        response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    });
    config = config.with_metadata(metadata(&args, content_type));
    if let Some(size) = response.content_length() {
        config = config.with_declared_size(size);
    }

    let mut session = relay.start_session(config).await?;
    if let Some(error) = session.error() {
        bail!("invalid session configuration ({}): {error}", error.status());
    }
    info!(token = session.token(), protocol = %session.protocol(), "Transload starting");

    let events = session
        .take_events()
        .context("session event channel unavailable")?;
    let reporter = spawn_reporter(events, args.quiet);
    relay.listener_attached(session.token());

    let mut body = response.bytes_stream();
    while let Some(bytes) = body.next().await {
        let bytes = bytes.with_context(|| format!("failed reading {}", args.source))?;
        match session.handle_chunk(Chunk::Data(bytes)).await {
            Ok(()) => {}
            Err(SessionError::Terminated) => break,
            Err(error) => return Err(error.into()),
        }
    }
    if !session.is_terminated() {
        match session.handle_chunk(Chunk::End).await {
            Ok(()) | Err(SessionError::Terminated) => {}
            Err(error) => return Err(error.into()),
        }
    }

    let summary = session.join().await?;
    if let Some(error) = reporter.await? {
        bail!("upload failed ({}): {}", error.kind, error.message);
    }

    info!(
        bytes_written = summary.bytes_written,
        bytes_uploaded = summary.bytes_uploaded,
        "Transload complete"
    );
    Ok(())
}

async fn protocol_config(args: &Args) -> ProtocolConfig {
    match args.protocol {
        ProtocolArg::Form => ProtocolConfig::FormMultipart {
            endpoint: args.endpoint.clone().unwrap_or_default(),
            field_name: args.field_name.clone(),
        },
        ProtocolArg::Resumable => ProtocolConfig::Resumable {
            endpoint: args.endpoint.clone(),
            upload_url: args.upload_url.clone(),
        },
        ProtocolArg::ObjectStorage => {
            let Some(bucket) = &args.bucket else {
                warn!("no --bucket given, object storage is not configured");
                return ProtocolConfig::ObjectStorage(None);
            };
            let client = S3MultipartClient::from_env(args.region.clone(), args.s3_endpoint.clone())
                .await;
            let mut target = ObjectStorageTarget::new(Arc::new(client), bucket.clone());
            if let Some(acl) = &args.acl {
                target = target.with_acl(acl.clone());
            }
            if let Some(prefix) = &args.key_prefix {
                let prefix = prefix.trim_end_matches('/').to_string();
                target = target
                    .with_key_generator(move |metadata| format!("{prefix}/{}", default_key(metadata)));
            }
            ProtocolConfig::ObjectStorage(Some(target))
        }
    }
}

fn metadata(args: &Args, content_type: Option<String>) -> Metadata {
    let filename = args.filename.clone().or_else(|| {
        Url::parse(&args.source).ok().and_then(|url| {
            url.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
                .filter(|segment| !segment.is_empty())
        })
    });
    let mut metadata = Metadata {
        filename,
        content_type,
        ..Metadata::default()
    };
    for (name, value) in &args.metadata {
        metadata = metadata.with_field(name, value);
    }
    metadata
}

/// Drives the progress bar from session events. Resolves to the error detail
/// of a failed upload.
fn spawn_reporter(
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    quiet: bool,
) -> JoinHandle<Option<ErrorDetail>> {
    tokio::spawn(async move {
        let bar = if quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(100)
        };
        bar.set_style(
            ProgressStyle::with_template("{bar:40} {pos:>3}% {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        let mut failure = None;
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Progress {
                    percentage,
                    bytes_uploaded,
                    bytes_total,
                } => {
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    bar.set_position(percentage.floor() as u64);
                    bar.set_message(format!("{bytes_uploaded}/{bytes_total} bytes"));
                }
                SessionEvent::Success { url, .. } => {
                    bar.finish_with_message("done");
                    if let Some(url) = url {
                        info!(%url, "Uploaded");
                    }
                }
                SessionEvent::Error { error, .. } => {
                    bar.abandon_with_message(error.message.clone());
                    failure = Some(error);
                }
            }
        }
        failure
    })
}
