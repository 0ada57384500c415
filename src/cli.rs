//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Relay a download to an upload destination while it is still arriving.
///
/// Transload fetches SOURCE, keeps a local copy of every chunk and uploads it
/// concurrently over form multipart, tus or an S3-compatible multipart upload.
#[derive(Parser, Debug)]
#[command(name = "transload")]
#[command(author, version, about)]
pub struct Args {
    /// URL of the file to relay
    pub source: String,

    /// Upload protocol
    #[arg(short, long, value_enum)]
    pub protocol: ProtocolArg,

    /// Destination endpoint (form target or tus creation endpoint)
    #[arg(short, long)]
    pub endpoint: Option<String>,

    /// Pre-issued tus upload URL to continue
    #[arg(long)]
    pub upload_url: Option<String>,

    /// Form field name for the file part
    #[arg(long, default_value = "file")]
    pub field_name: String,

    /// File name sent to the destination (defaults to the last path segment of SOURCE)
    #[arg(long)]
    pub filename: Option<String>,

    /// Content type sent to the destination (defaults to the source response's)
    #[arg(long)]
    pub content_type: Option<String>,

    /// Extra metadata field, repeatable
    #[arg(long = "meta", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub metadata: Vec<(String, String)>,

    /// Outbound header for the destination, repeatable
    #[arg(short = 'H', long = "header", value_name = "NAME=VALUE", value_parser = parse_key_value)]
    pub headers: Vec<(String, String)>,

    /// Object-storage bucket (required for a configured object-storage client)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Canned ACL applied to the object
    #[arg(long)]
    pub acl: Option<String>,

    /// Prefix prepended to generated object keys
    #[arg(long)]
    pub key_prefix: Option<String>,

    /// Object-storage region (defaults to the AWS environment)
    #[arg(long)]
    pub region: Option<String>,

    /// S3-compatible endpoint URL (MinIO, R2)
    #[arg(long)]
    pub s3_endpoint: Option<String>,

    /// Directory for the local copies of in-flight downloads
    #[arg(long)]
    pub storage_dir: Option<PathBuf>,

    /// SQLite database for durable session state
    #[arg(long)]
    pub state_db: Option<PathBuf>,

    /// Allow destinations without a top-level domain (e.g. localhost)
    #[arg(long)]
    pub debug: bool,

    /// Destination URL pattern (`*` wildcard within host or path), repeatable
    #[arg(long = "allow", value_name = "PATTERN")]
    pub allow: Vec<String>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

/// Protocol choices on the command line.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolArg {
    /// multipart/form-data POST after the download completes
    Form,
    /// tus 1.0 upload concurrent with the download
    Resumable,
    /// S3 multipart upload tailing the local file
    ObjectStorage,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}
