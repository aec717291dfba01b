//! HTTP transport to the Consul agent
//!
//! Building a [`Transport`] is local assembly only: nothing is sent until a
//! backend issues its first request.

use reqwest::{Client, Method, RequestBuilder, Url};

use crate::backend::{BackendError, BackendResult};
use crate::config::{ConsulConfig, HttpBasicAuth, Scheme};

/// Header carrying the ACL token
const TOKEN_HEADER: &str = "X-Consul-Token";

/// Authenticated handle to a Consul agent.
///
/// Immutable once built. Cloning is cheap and shares the connection pool, so
/// one transport can back several clients bound to different paths.
#[derive(Clone)]
pub struct Transport {
    client: Client,
    base_url: Url,
    datacenter: Option<String>,
    token: Option<String>,
    http_auth: Option<HttpBasicAuth>,
}

impl Transport {
    /// Assemble a transport from a resolved configuration
    pub fn new(config: &ConsulConfig) -> BackendResult<Self> {
        let base_url = resolve_base_url(&config.address, config.scheme)?;

        let mut builder = Client::builder().user_agent(concat!(
            env!("CARGO_PKG_NAME"),
            "/",
            env!("CARGO_PKG_VERSION")
        ));
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(ca_file) = &config.ca_file {
            let pem = std::fs::read(ca_file).map_err(|e| {
                BackendError::TransportInit(format!(
                    "Failed to read CA file {}: {}",
                    ca_file.display(),
                    e
                ))
            })?;
            let certificate = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                BackendError::TransportInit(format!(
                    "Invalid CA file {}: {}",
                    ca_file.display(),
                    e
                ))
            })?;
            builder = builder.add_root_certificate(certificate);
        }

        let client = builder
            .build()
            .map_err(|e| BackendError::TransportInit(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            datacenter: config.datacenter.clone(),
            token: config.access_token.clone(),
            http_auth: config.http_auth.clone(),
        })
    }

    /// Root URL of the agent, e.g. `http://127.0.0.1:8500/`
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Scheme actually used, after any prefix on the address was applied
    pub fn scheme(&self) -> Scheme {
        if self.base_url.scheme() == "https" {
            Scheme::Https
        } else {
            Scheme::Http
        }
    }

    pub fn datacenter(&self) -> Option<&str> {
        self.datacenter.as_deref()
    }

    pub fn http_auth(&self) -> Option<&HttpBasicAuth> {
        self.http_auth.as_ref()
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// URL of a KV key
    pub(crate) fn kv_url(&self, key: &str) -> BackendResult<Url> {
        self.api_url(["kv"].into_iter().chain(key.trim_start_matches('/').split('/')))
    }

    /// URL of a session endpoint, e.g. `session/create` or `session/info/<id>`
    pub(crate) fn session_url(&self, action: &str, id: Option<&str>) -> BackendResult<Url> {
        self.api_url(["session", action].into_iter().chain(id))
    }

    fn api_url<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> BackendResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                BackendError::TransportInit(format!("{} cannot be used as a base URL", self.base_url))
            })?
            .pop_if_empty()
            .push("v1")
            .extend(segments);
        Ok(url)
    }

    /// Start a request with datacenter, token and basic auth applied
    pub(crate) fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let mut request = self.client.request(method, url);
        if let Some(dc) = &self.datacenter {
            request = request.query(&[("dc", dc)]);
        }
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token);
        }
        if let Some(auth) = &self.http_auth {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }
        request
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("base_url", &self.base_url.as_str())
            .field("datacenter", &self.datacenter)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("http_auth", &self.http_auth)
            .finish()
    }
}

/// Combine address and scheme into the agent's root URL.
///
/// An explicit `http://` or `https://` prefix on the address wins over the
/// configured scheme.
fn resolve_base_url(address: &str, scheme: Scheme) -> BackendResult<Url> {
    let (scheme, host) = match address.split_once("://") {
        Some(("http", host)) => (Scheme::Http, host),
        Some(("https", host)) => (Scheme::Https, host),
        Some((other, _)) => {
            return Err(BackendError::TransportInit(format!(
                "Unknown protocol scheme: {}",
                other
            )));
        }
        None => (scheme, address),
    };

    let url = Url::parse(&format!("{}://{}/", scheme, host.trim_end_matches('/')))
        .map_err(|e| BackendError::TransportInit(format!("Invalid address '{}': {}", address, e)))?;

    if url.path() != "/" || url.query().is_some() || url.host_str().is_none() {
        return Err(BackendError::TransportInit(format!(
            "Invalid address '{}': expected host:port",
            address
        )));
    }

    Ok(url)
}
