//! Typed configuration for the Consul backend
//!
//! The host hands over a [`BackendConfig`] string map. It is validated once
//! against the recognized options and resolved into a [`ConsulConfig`] with
//! every default filled in.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::backend::{BackendConfig, BackendError, BackendResult};

/// Address of a local Consul agent
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:8500";

/// Scheme used when none is configured
pub const DEFAULT_SCHEME: Scheme = Scheme::Http;

/// Session TTL for locks (15 seconds)
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(15);

/// Shortest session TTL Consul accepts
pub const MIN_LOCK_TTL: Duration = Duration::from_secs(10);

/// Longest session TTL Consul accepts (24 hours)
pub const MAX_LOCK_TTL: Duration = Duration::from_secs(86_400);

/// Every option name the backend understands
pub const RECOGNIZED_OPTIONS: &[&str] = &[
    "path",
    "access_token",
    "address",
    "scheme",
    "datacenter",
    "http_auth",
    "lock_ttl",
    "timeout",
    "ca_file",
];

/// Transport scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            other => Err(BackendError::configuration(format!(
                "Invalid scheme '{}': expected 'http' or 'https'",
                other
            ))),
        }
    }
}

/// HTTP basic-auth credentials
#[derive(Clone, PartialEq, Eq)]
pub struct HttpBasicAuth {
    pub username: String,
    pub password: String,
}

impl HttpBasicAuth {
    /// Parse `username` or `username:password`.
    ///
    /// Only the first colon separates the two, so passwords may contain
    /// colons. Any input is accepted.
    pub fn parse(auth: &str) -> Self {
        match auth.split_once(':') {
            Some((username, password)) => Self {
                username: username.to_string(),
                password: password.to_string(),
            },
            None => Self {
                username: auth.to_string(),
                password: String::new(),
            },
        }
    }
}

impl fmt::Debug for HttpBasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpBasicAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Resolved Consul backend configuration
#[derive(Clone, PartialEq, Eq)]
pub struct ConsulConfig {
    /// KV key the state is stored under
    pub path: String,
    /// ACL token sent as `X-Consul-Token`
    pub access_token: Option<String>,
    /// `host:port`, optionally prefixed with `http://` or `https://`
    pub address: String,
    pub scheme: Scheme,
    /// Datacenter to address; `None` means the agent's own
    pub datacenter: Option<String>,
    pub http_auth: Option<HttpBasicAuth>,
    /// TTL of lock sessions
    pub lock_ttl: Duration,
    /// Per-request timeout
    pub timeout: Option<Duration>,
    /// Extra CA bundle (PEM) for https
    pub ca_file: Option<PathBuf>,
}

impl ConsulConfig {
    /// Configuration for `path` with every other option at its default
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            access_token: None,
            address: DEFAULT_ADDRESS.to_string(),
            scheme: DEFAULT_SCHEME,
            datacenter: None,
            http_auth: None,
            lock_ttl: DEFAULT_LOCK_TTL,
            timeout: None,
            ca_file: None,
        }
    }

    /// Validate the raw attributes and resolve defaults
    pub fn from_backend_config(config: &BackendConfig) -> BackendResult<Self> {
        let mut unknown: Vec<&str> = config
            .attributes
            .keys()
            .map(String::as_str)
            .filter(|key| !RECOGNIZED_OPTIONS.contains(key))
            .collect();
        if !unknown.is_empty() {
            unknown.sort_unstable();
            return Err(BackendError::configuration(format!(
                "Unknown attribute(s): {}",
                unknown.join(", ")
            )));
        }

        let path = config
            .get_string("path")
            .ok_or_else(|| BackendError::configuration("Missing required attribute: path"))?;

        let mut consul = Self::new(path);

        if let Some(token) = config.get_string("access_token") {
            consul.access_token = Some(token.to_string());
        }
        if let Some(address) = config.get_string("address") {
            consul.address = address.to_string();
        }
        if let Some(scheme) = config.get_string("scheme") {
            consul.scheme = scheme.parse()?;
        }
        if let Some(datacenter) = config.get_string("datacenter") {
            consul.datacenter = Some(datacenter.to_string());
        }
        if let Some(auth) = config.get_string("http_auth") {
            consul.http_auth = Some(HttpBasicAuth::parse(auth));
        }
        if let Some(ttl) = config.get_string("lock_ttl") {
            consul.lock_ttl = parse_lock_ttl(ttl)?;
        }
        if let Some(timeout) = config.get_string("timeout") {
            let timeout = parse_duration(timeout).ok_or_else(|| {
                BackendError::configuration(format!("Invalid timeout '{}'", timeout))
            })?;
            consul.timeout = Some(timeout).filter(|t| !t.is_zero());
        }
        if let Some(ca_file) = config.get_string("ca_file") {
            consul.ca_file = Some(PathBuf::from(ca_file));
        }

        Ok(consul)
    }

    /// Key holding the lock for this state path
    pub fn lock_key(&self) -> String {
        lock_key_for(&self.path)
    }
}

impl fmt::Debug for ConsulConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsulConfig")
            .field("path", &self.path)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("address", &self.address)
            .field("scheme", &self.scheme)
            .field("datacenter", &self.datacenter)
            .field("http_auth", &self.http_auth)
            .field("lock_ttl", &self.lock_ttl)
            .field("timeout", &self.timeout)
            .field("ca_file", &self.ca_file)
            .finish()
    }
}

pub(crate) fn lock_key_for(path: &str) -> String {
    format!("{}/.lock", path.trim_end_matches('/'))
}

fn parse_lock_ttl(value: &str) -> BackendResult<Duration> {
    let ttl = parse_duration(value)
        .ok_or_else(|| BackendError::configuration(format!("Invalid lock_ttl '{}'", value)))?;
    if !(MIN_LOCK_TTL..=MAX_LOCK_TTL).contains(&ttl) {
        return Err(BackendError::configuration(format!(
            "lock_ttl must be between {}s and {}s, got {}s",
            MIN_LOCK_TTL.as_secs(),
            MAX_LOCK_TTL.as_secs(),
            ttl.as_secs()
        )));
    }
    Ok(ttl)
}

/// Parse a duration string like "15s", "2m", "1h" or bare seconds
fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => s.split_at(pos),
        None => (s, "s"),
    };
    let value = digits.parse::<u64>().ok()?;
    let secs = match unit {
        "s" => value,
        "m" => value.checked_mul(60)?,
        "h" => value.checked_mul(3600)?,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}
