//! Handler variants: what a matched rule does with the exchange.

use std::fmt;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::Stream;
use http::{Method, StatusCode};

use crate::request::{HeaderList, MockResponse, ParsedRequest};

/// User callback producing a response for each matched request. Runs on a
/// separate task with a bounded timeout; errors and panics surface to the
/// peer as a 500.
pub type CallbackFn =
    Arc<dyn Fn(ParsedRequest) -> BoxFuture<'static, anyhow::Result<MockResponse>> + Send + Sync>;

/// One response body, produced as a sequence of chunks.
pub type ByteStream =
    Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send + Sync + 'static>>;

/// Produces a fresh body stream per invocation, so a streaming rule can
/// serve more than one request.
pub type StreamFactory = Arc<dyn Fn() -> ByteStream + Send + Sync>;

/// Rewrite hook over the outbound passthrough request.
pub type RewriteRequestFn = Arc<
    dyn Fn(PassthroughRequest) -> BoxFuture<'static, anyhow::Result<PassthroughRequest>>
        + Send
        + Sync,
>;

/// Rewrite hook over the upstream response before it is relayed.
pub type RewriteResponseFn = Arc<
    dyn Fn(PassthroughResponse) -> BoxFuture<'static, anyhow::Result<PassthroughResponse>>
        + Send
        + Sync,
>;

/// The outbound exchange as seen by `before_request`.
#[derive(Clone, Debug)]
pub struct PassthroughRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderList,
    pub body: Bytes,
}

/// The upstream response as seen by `before_response`. A hook receiving
/// this has materialized the body; without hooks the body streams through.
#[derive(Clone, Debug)]
pub struct PassthroughResponse {
    pub status: StatusCode,
    pub headers: HeaderList,
    pub body: Bytes,
}

/// Configuration for proxied rules.
#[derive(Clone, Default)]
pub struct PassthroughConfig {
    /// Replacement base (`scheme://host[:port]`) for the target URL; the
    /// incoming path and query are kept.
    pub target: Option<String>,
    pub before_request: Option<RewriteRequestFn>,
    pub before_response: Option<RewriteResponseFn>,
    /// Destinations (glob over hostname, or explicit `host:port`) for which
    /// upstream certificate verification is disabled.
    pub ignore_host_certificate_errors: Vec<String>,
}

impl PassthroughConfig {
    /// Forward to `scheme://host[:port]` instead of the original
    /// destination, keeping the incoming path and query.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Rewrite the outbound request before it is sent upstream.
    pub fn with_before_request<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(PassthroughRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<PassthroughRequest>> + Send + 'static,
    {
        let hook = Arc::new(hook);
        self.before_request = Some(Arc::new(
            move |req| -> BoxFuture<'static, anyhow::Result<PassthroughRequest>> {
                let hook = Arc::clone(&hook);
                Box::pin(async move { hook(req).await })
            },
        ));
        self
    }

    /// Rewrite the upstream response before it is relayed to the client.
    /// Using this hook materializes the response body.
    pub fn with_before_response<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(PassthroughResponse) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<PassthroughResponse>> + Send + 'static,
    {
        let hook = Arc::new(hook);
        self.before_response = Some(Arc::new(
            move |resp| -> BoxFuture<'static, anyhow::Result<PassthroughResponse>> {
                let hook = Arc::clone(&hook);
                Box::pin(async move { hook(resp).await })
            },
        ));
        self
    }

    /// Disable upstream certificate verification for the given destinations
    /// (glob over hostname, or explicit `host:port`).
    pub fn with_ignored_certificate_errors(mut self, patterns: Vec<String>) -> Self {
        self.ignore_host_certificate_errors = patterns;
        self
    }
}

impl fmt::Debug for PassthroughConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassthroughConfig")
            .field("target", &self.target)
            .field("before_request", &self.before_request.is_some())
            .field("before_response", &self.before_response.is_some())
            .field(
                "ignore_host_certificate_errors",
                &self.ignore_host_certificate_errors,
            )
            .finish()
    }
}

/// HTTP handler variants.
#[derive(Clone)]
pub enum HandlerAction {
    /// Write a canned status/headers/body.
    Reply {
        status: StatusCode,
        headers: HeaderList,
        body: Bytes,
    },
    /// Write status/headers, then pump a stream of chunks.
    StreamReply {
        status: StatusCode,
        headers: HeaderList,
        stream: StreamFactory,
    },
    /// Ask a user callback for the response.
    Callback(CallbackFn),
    /// Serve a file from disk.
    File { status: StatusCode, path: PathBuf },
    /// Hold the connection open and never respond.
    Timeout,
    /// Close the socket without a response.
    CloseConnection,
    /// Close the socket with an RST.
    ResetConnection,
    /// Forward to the origin, optionally rewriting.
    Passthrough(PassthroughConfig),
}

impl fmt::Debug for HandlerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerAction::Reply { status, body, .. } => f
                .debug_struct("Reply")
                .field("status", status)
                .field("body_len", &body.len())
                .finish(),
            HandlerAction::StreamReply { status, .. } => {
                f.debug_struct("StreamReply").field("status", status).finish()
            }
            HandlerAction::Callback(_) => f.write_str("Callback"),
            HandlerAction::File { status, path } => f
                .debug_struct("File")
                .field("status", status)
                .field("path", path)
                .finish(),
            HandlerAction::Timeout => f.write_str("Timeout"),
            HandlerAction::CloseConnection => f.write_str("CloseConnection"),
            HandlerAction::ResetConnection => f.write_str("ResetConnection"),
            HandlerAction::Passthrough(cfg) => cfg.fmt(f),
        }
    }
}

impl HandlerAction {
    /// Convenience constructor for a plain reply.
    pub fn reply(status: u16, body: impl Into<Bytes>) -> Self {
        HandlerAction::Reply {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
            headers: HeaderList::new(),
            body: body.into(),
        }
    }

    pub fn stream<S>(status: u16, headers: HeaderList, factory: S) -> Self
    where
        S: Fn() -> ByteStream + Send + Sync + 'static,
    {
        HandlerAction::StreamReply {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
            headers,
            stream: Arc::new(factory),
        }
    }

    pub fn callback<F, Fut>(f: F) -> Self
    where
        F: Fn(ParsedRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<MockResponse>> + Send + 'static,
    {
        let f = Arc::new(f);
        HandlerAction::Callback(Arc::new(
            move |req| -> BoxFuture<'static, anyhow::Result<MockResponse>> {
                let f = Arc::clone(&f);
                Box::pin(async move { f(req).await })
            },
        ))
    }
}

/// WebSocket handler variants.
#[derive(Clone)]
pub enum WsHandlerAction {
    /// Accept the upgrade and echo every message back.
    Echo,
    /// Reject the handshake with the given status and body.
    Reject { status: StatusCode, body: Bytes },
    /// Accept the upgrade and pipe frames to/from the upstream.
    Passthrough(WsPassthroughConfig),
}

impl fmt::Debug for WsHandlerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WsHandlerAction::Echo => f.write_str("Echo"),
            WsHandlerAction::Reject { status, .. } => {
                f.debug_struct("Reject").field("status", status).finish()
            }
            WsHandlerAction::Passthrough(cfg) => cfg.fmt(f),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct WsPassthroughConfig {
    /// Replacement base (`ws(s)://host[:port]`) for the upstream URL.
    pub target: Option<String>,
    pub ignore_host_certificate_errors: Vec<String>,
}
