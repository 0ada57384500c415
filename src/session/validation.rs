//! Session configuration validation.
//!
//! Runs before any I/O. Object-storage sessions skip destination checks
//! because their destination is configured server-side; every other protocol
//! needs at least one destination URL, and each URL given must:
//!
//! 1. parse, with an explicit `http`/`https` scheme
//! 2. have a top-level domain (skipped in debug mode)
//! 3. match an allow-list pattern, when an allow-list is configured

use regex::Regex;
use tracing::debug;
use url::{Host, Position, Url};

use super::{ProtocolConfig, SessionConfig, ValidationError};

/// Compiled destination allow-list.
///
/// A pattern is split into its origin (`scheme://host[:port]`) and the rest
/// (path, query, fragment). Each part is matched against the same part of the
/// parsed URL, so a wildcard in the host can never reach into the path. `*`
/// matches any run of characters within its part, everything else is
/// literal, and the origin compares case-insensitively. A pattern without a
/// path covers every path of its origin.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    patterns: Vec<AllowPattern>,
}

#[derive(Debug, Clone)]
struct AllowPattern {
    origin: Regex,
    rest: Regex,
}

impl AllowList {
    /// Compiles the given patterns.
    ///
    /// # Errors
    ///
    /// Returns the regex error for a pattern that does not compile (for
    /// example one that exceeds the regex size limit).
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|pattern| AllowPattern::compile(pattern.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// True if no patterns are configured (every destination allowed).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// True if `url` matches at least one pattern, or the list is empty.
    #[must_use]
    pub fn permits(&self, url: &Url) -> bool {
        if self.is_empty() {
            return true;
        }
        let origin = origin_of(url);
        let rest = &url[Position::BeforePath..];
        self.patterns
            .iter()
            .any(|pattern| pattern.origin.is_match(&origin) && pattern.rest.is_match(rest))
    }
}

impl AllowPattern {
    fn compile(pattern: &str) -> Result<Self, regex::Error> {
        let scheme_end = pattern.find("://").map_or(0, |index| index + 3);
        let (origin, rest) = match pattern[scheme_end..].find('/') {
            Some(index) => pattern.split_at(scheme_end + index),
            None => (pattern, "/*"),
        };
        Ok(Self {
            origin: wildcard(origin, "(?i)")?,
            rest: wildcard(rest, "")?,
        })
    }
}

fn wildcard(pattern: &str, flags: &str) -> Result<Regex, regex::Error> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("{flags}^{body}$"))
}

/// `scheme://host[:port]`, without credentials.
fn origin_of(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}://{host}:{port}", url.scheme()),
        None => format!("{}://{host}", url.scheme()),
    }
}

/// Validation settings shared by every session of a relay.
#[derive(Debug, Clone, Default)]
pub struct ValidationRules {
    /// Accept hosts without a top-level domain (localhost, IPs).
    pub debug: bool,
    /// Destination allow-list.
    pub allow_list: AllowList,
}

/// Parsed destination URLs of a validated configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Destination {
    /// Form endpoint or tus creation endpoint.
    pub endpoint: Option<Url>,
    /// Pre-issued tus upload URL.
    pub upload_url: Option<Url>,
}

/// Validates a session configuration.
///
/// # Errors
///
/// Returns the first [`ValidationError`] found.
pub fn validate(
    config: &SessionConfig,
    rules: &ValidationRules,
) -> Result<Destination, ValidationError> {
    match &config.protocol {
        ProtocolConfig::ObjectStorage(_) => Ok(Destination::default()),
        ProtocolConfig::FormMultipart {
            endpoint,
            field_name,
        } => {
            let endpoint = non_empty(Some(endpoint)).ok_or(ValidationError::MissingDestination)?;
            let endpoint = check_url(endpoint, rules)?;
            if field_name.trim().is_empty() {
                return Err(ValidationError::MissingFieldName);
            }
            Ok(Destination {
                endpoint: Some(endpoint),
                upload_url: None,
            })
        }
        ProtocolConfig::Resumable {
            endpoint,
            upload_url,
        } => {
            let endpoint = non_empty(endpoint.as_ref());
            let upload_url = non_empty(upload_url.as_ref());
            if endpoint.is_none() && upload_url.is_none() {
                return Err(ValidationError::MissingDestination);
            }
            Ok(Destination {
                endpoint: endpoint.map(|url| check_url(url, rules)).transpose()?,
                upload_url: upload_url.map(|url| check_url(url, rules)).transpose()?,
            })
        }
    }
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty())
}

fn check_url(raw: &str, rules: &ValidationRules) -> Result<Url, ValidationError> {
    let url = Url::parse(raw).map_err(|error| ValidationError::InvalidUrl {
        url: raw.to_string(),
        reason: match error {
            url::ParseError::RelativeUrlWithoutBase => "missing scheme".to_string(),
            other => other.to_string(),
        },
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ValidationError::UnsupportedScheme {
            url: raw.to_string(),
            scheme: url.scheme().to_string(),
        });
    }

    if !rules.debug && !has_top_level_domain(&url) {
        return Err(ValidationError::MissingTopLevelDomain {
            url: raw.to_string(),
        });
    }

    if !rules.allow_list.permits(&url) {
        debug!(url = %raw, "destination rejected by allow-list");
        return Err(ValidationError::NotAllowed {
            url: raw.to_string(),
        });
    }

    Ok(url)
}

fn has_top_level_domain(url: &Url) -> bool {
    let Some(Host::Domain(domain)) = url.host() else {
        return false;
    };
    let domain = domain.trim_end_matches('.');
    domain.rsplit_once('.').is_some_and(|(rest, tld)| {
        !rest.is_empty()
            && (tld.starts_with("xn--")
                || (tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic())))
    })
}
