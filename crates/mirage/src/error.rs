//! Public error type for the mock server façade.

/// Errors surfaced by the control-plane API.
///
/// Per-request failures (bad clients, failed upstreams, user callbacks that
/// blow up) never appear here; they are reported through the event surface
/// and turned into 4xx/5xx responses on the wire.
#[derive(Debug, thiserror::Error)]
pub enum MockError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no free port in range {start}..={end}")]
    PortRangeExhausted { start: u16, end: u16 },

    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("server is not running")]
    NotRunning,

    #[error("server is already running")]
    AlreadyRunning,

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MockError>;
