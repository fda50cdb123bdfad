//! Server configuration options.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MockError, Result};

/// Where to bind the listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortSpec {
    /// Bind this exact port.
    Exact(u16),
    /// Try each port in order; the first successful bind wins.
    Range { start: u16, end: u16 },
}

impl From<u16> for PortSpec {
    fn from(port: u16) -> Self {
        PortSpec::Exact(port)
    }
}

/// HTTP/2 ALPN offer policy for TLS connections.
///
/// Without HTTPS configured, `Fallback` behaves as `Disabled`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Http2Mode {
    /// Always offer `h2` alongside `http/1.1`.
    Enabled,
    /// Never offer `h2`.
    Disabled,
    /// Offer `h2` only when the client's ALPN list does not include
    /// `http/1.1`.
    #[default]
    Fallback,
}

/// TLS material for HTTPS termination. The CA key and certificate are
/// supplied by the caller, either inline as PEM strings or as file paths,
/// never both for the same item.
#[derive(Clone, Debug, Default)]
pub struct HttpsOptions {
    pub key: Option<String>,
    pub cert: Option<String>,
    pub key_path: Option<PathBuf>,
    pub cert_path: Option<PathBuf>,
}

impl HttpsOptions {
    pub fn from_pem(key: impl Into<String>, cert: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            cert: Some(cert.into()),
            ..Default::default()
        }
    }

    pub fn from_files(key_path: impl Into<PathBuf>, cert_path: impl Into<PathBuf>) -> Self {
        Self {
            key_path: Some(key_path.into()),
            cert_path: Some(cert_path.into()),
            ..Default::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.key.is_some() && self.key_path.is_some() {
            return Err(MockError::Config(
                "https: both `key` and `key_path` were provided".into(),
            ));
        }
        if self.cert.is_some() && self.cert_path.is_some() {
            return Err(MockError::Config(
                "https: both `cert` and `cert_path` were provided".into(),
            ));
        }
        if self.key.is_none() && self.key_path.is_none() {
            return Err(MockError::Config("https: no CA key provided".into()));
        }
        if self.cert.is_none() && self.cert_path.is_none() {
            return Err(MockError::Config("https: no CA certificate provided".into()));
        }
        Ok(())
    }
}

/// Automatic CORS handling. When set, preflight `OPTIONS` requests are
/// answered before rule dispatch and matching responses are decorated with
/// `access-control-allow-origin`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CorsOptions {
    pub allowed_origin: String,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: String,
    pub allow_credentials: bool,
    pub max_age_seconds: Option<u64>,
}

impl Default for CorsOptions {
    fn default() -> Self {
        Self {
            allowed_origin: "*".into(),
            allowed_methods: ["GET", "HEAD", "POST", "PUT", "DELETE", "PATCH", "OPTIONS"]
                .map(String::from)
                .to_vec(),
            allowed_headers: "*".into(),
            allow_credentials: false,
            max_age_seconds: Some(86_400),
        }
    }
}

/// Options accepted by [`crate::MockServer::new`].
#[derive(Clone, Debug)]
pub struct MockServerOptions {
    /// Auto-respond to CORS preflights. Enabling this makes `options()`
    /// rule registration fail, since preflight interception would be
    /// ambiguous.
    pub cors: Option<CorsOptions>,
    /// Verbose per-exchange logging.
    pub debug: bool,
    /// Enables TLS termination and MITM of tunnelled connections.
    pub https: Option<HttpsOptions>,
    /// ALPN offer policy.
    pub http2: Http2Mode,
    /// Append an example rule registration to 503 miss bodies.
    pub suggest_changes: bool,
    /// Record matched traffic into per-rule seen lists.
    pub record_traffic: bool,
    /// Byte cap for in-memory body capture. Bodies past the cap are treated
    /// as empty by body matchers; passthrough still forwards them whole.
    pub max_body_size: usize,
    /// Deprecated server-level trust bypass for upstream WebSocket
    /// connections; prefer per-rule `ignore_host_certificate_errors`.
    pub ignore_websocket_host_certificate_errors: Vec<String>,
    /// Bound on user callbacks and passthrough rewrite hooks.
    pub callback_timeout: Duration,
    /// How long `stop()` waits for in-flight exchanges to drain.
    pub shutdown_grace: Duration,
}

impl Default for MockServerOptions {
    fn default() -> Self {
        Self {
            cors: None,
            debug: false,
            https: None,
            http2: Http2Mode::default(),
            suggest_changes: true,
            record_traffic: true,
            max_body_size: usize::MAX,
            ignore_websocket_host_certificate_errors: Vec::new(),
            callback_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_millis(500),
        }
    }
}

impl MockServerOptions {
    pub(crate) fn validate(&self) -> Result<()> {
        if let Some(https) = &self.https {
            https.validate()?;
        }
        Ok(())
    }
}
