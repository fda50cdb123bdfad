//! Per-request pipeline: parse → events → dispatch → execute.
//!
//! Data flow per request: parse the head, emit `request-initiated`, read the
//! body (capped capture), emit `request`, select a rule against a store
//! snapshot, execute its handler, emit the terminal event before the
//! response is handed to the connection.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderName, HeaderValue, Method, Request, Response, StatusCode, Version};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::listener::{self, ConnCtx};
use super::{cors, executor, websocket};
use crate::events::EventSequence;
use crate::request::{
    CapturedBody, Exchange, HeaderList, MockResponse, ParsedRequest, Protocol, Scheme,
};
use crate::rule::{self, Dispatch, RuleProtocol};

pub(crate) type BodyError = Box<dyn std::error::Error + Send + Sync>;
pub(crate) type MirageBody = BoxBody<Bytes, BodyError>;

/// Service errors that deliberately terminate the connection instead of
/// producing a response.
#[derive(Clone, Copy, Debug)]
pub(crate) enum TerminalAction {
    Close,
    Reset,
}

impl fmt::Display for TerminalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalAction::Close => f.write_str("connection closed by rule"),
            TerminalAction::Reset => f.write_str("connection reset by rule"),
        }
    }
}

impl std::error::Error for TerminalAction {}

/// True when a connection error is one of our own close/reset actions
/// rather than a protocol failure.
pub(crate) fn is_terminal_action(err: &(dyn std::error::Error + Send + Sync + 'static)) -> bool {
    if err.downcast_ref::<TerminalAction>().is_some() {
        return true;
    }
    let mut source = err.source();
    while let Some(current) = source {
        if current.downcast_ref::<TerminalAction>().is_some() {
            return true;
        }
        source = current.source();
    }
    false
}

pub(crate) fn full_body(bytes: impl Into<Bytes>) -> MirageBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

pub(crate) fn empty_body() -> MirageBody {
    full_body(Bytes::new())
}

/// Infallible plain-text response.
pub(crate) fn plain_response(status: StatusCode, body: impl Into<Bytes>) -> Response<MirageBody> {
    let mut response = Response::new(full_body(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain"),
    );
    response
}

/// Materialize a [`MockResponse`] as a wire response.
pub(crate) fn mock_to_response(mock: &MockResponse) -> Response<MirageBody> {
    let mut builder = Response::builder().status(mock.status);
    for (name, value) in mock.headers.iter() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(full_body(mock.body.clone()))
        .unwrap_or_else(|_| plain_response(StatusCode::INTERNAL_SERVER_ERROR, "invalid response"))
}

pub(crate) async fn handle_request(
    ctx: ConnCtx,
    req: Request<Incoming>,
) -> Result<Response<MirageBody>, TerminalAction> {
    if req.method() == Method::CONNECT {
        return handle_connect(ctx, req).await;
    }

    let server = Arc::clone(&ctx.server);
    let id = server.next_request_id.fetch_add(1, Ordering::SeqCst) + 1;
    let head = parse_head(&ctx, id, &req);

    if server.debug.load(Ordering::Relaxed) {
        info!(id, method = %head.method, url = %head.url(), "incoming request");
    } else {
        debug!(id, method = %head.method, path = %head.path, "incoming request");
    }

    let seq = EventSequence::new(Arc::clone(&server.events));
    seq.request_initiated(head.clone());

    if is_websocket_upgrade(req.headers()) {
        return websocket::handle_upgrade(ctx, req, head, seq).await;
    }

    if let Some(cors_options) = &server.options.cors {
        if head.method == Method::OPTIONS
            && req.headers().contains_key("access-control-request-method")
        {
            seq.request(head.clone());
            let (response, summary) = cors::preflight_response(cors_options);
            seq.response(id, None, summary);
            return Ok(response);
        }
    }

    let mut shutdown_rx = ctx.shutdown.subscribe();
    let work = process(&ctx, req, head, &seq);
    tokio::select! {
        result = work => result,
        _ = shutdown_rx.recv() => {
            seq.abort(Some(id), "server stopping");
            Err(TerminalAction::Close)
        }
    }
}

async fn process(
    ctx: &ConnCtx,
    req: Request<Incoming>,
    head: ParsedRequest,
    seq: &EventSequence,
) -> Result<Response<MirageBody>, TerminalAction> {
    let server = &ctx.server;
    let id = head.id;

    let (_parts, body) = req.into_parts();
    let collected = match body.collect().await {
        Ok(collected) => collected,
        Err(e) => {
            seq.client_error(
                Some(ctx.remote_addr),
                format!("failed to read request body: {e}"),
            );
            return Ok(plain_response(StatusCode::BAD_REQUEST, "bad request body"));
        }
    };
    let trailers = collected.trailers().map(HeaderList::from);
    let bytes = collected.to_bytes();

    let mut request = head;
    request.body = CapturedBody::new(bytes, server.options.max_body_size);
    request.trailers = trailers;
    if request.body.is_oversized() {
        debug!(id, "request body exceeded max_body_size, matching will see it as empty");
    }

    seq.request(request.clone());

    let snapshot = server.store.snapshot();
    match rule::select_rule(&snapshot, RuleProtocol::Http, &request) {
        Dispatch::Matched(entry) => {
            debug!(id, rule = %entry.rule.id, "rule matched");
            let (executed, summary) = executor::execute(ctx, &entry, &request).await;
            if server.options.record_traffic {
                entry.record(Exchange {
                    request: request.clone(),
                    response: summary.clone(),
                });
            }
            match executed {
                executor::Executed::Respond(mut response) => {
                    if let Some(cors_options) = &server.options.cors {
                        cors::decorate(response.headers_mut(), cors_options);
                    }
                    if let Some(summary) = summary {
                        seq.response(id, Some(entry.rule.id), summary);
                    }
                    Ok(response)
                }
                executor::Executed::Close => {
                    seq.abort(Some(id), "connection closed by rule");
                    Err(TerminalAction::Close)
                }
                executor::Executed::Reset => {
                    if let Some(handle) = &ctx.reset_handle {
                        handle.arm();
                    }
                    seq.abort(Some(id), "connection reset by rule");
                    Err(TerminalAction::Reset)
                }
            }
        }
        Dispatch::Unmatched => {
            debug!(id, "no rule matched");
            let body = rule::miss_body(
                &request,
                &snapshot,
                RuleProtocol::Http,
                server.options.suggest_changes,
            );
            let summary = MockResponse::new(503)
                .with_header("content-type", "text/plain")
                .with_body(body.clone());
            let mut response = mock_to_response(&summary);
            if let Some(cors_options) = &server.options.cors {
                cors::decorate(response.headers_mut(), cors_options);
            }
            seq.response(id, None, summary);
            Ok(response)
        }
    }
}

/// `CONNECT host:port`: answer 200 and either loop the tunnel back into
/// connection classification (MITM) or splice bytes straight to the origin.
async fn handle_connect(
    ctx: ConnCtx,
    req: Request<Incoming>,
) -> Result<Response<MirageBody>, TerminalAction> {
    let Some(authority) = req.uri().authority().cloned() else {
        return Ok(plain_response(
            StatusCode::BAD_REQUEST,
            "CONNECT requires an authority",
        ));
    };
    let host = authority.host().trim_matches(['[', ']']).to_string();
    let port = authority.port_u16().unwrap_or(443);
    debug!(%host, port, mitm = ctx.server.ca.is_some(), "CONNECT tunnel");

    if ctx.server.ca.is_some() {
        let mut tunnel_ctx = ctx.clone();
        tunnel_ctx.tunnel_target = Some((host, port));
        let on_upgrade = hyper::upgrade::on(req);
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let io = TokioIo::new(upgraded);
                    if let Err(e) = listener::handle_connection(io, tunnel_ctx).await {
                        debug!("tunnel ended with error: {e:#}");
                    }
                }
                Err(e) => debug!("CONNECT upgrade failed: {e}"),
            }
        });
        return Ok(Response::new(empty_body()));
    }

    // No MITM configured: open the origin connection first so connect
    // failures surface as 502 instead of a dead tunnel.
    match TcpStream::connect((host.as_str(), port)).await {
        Ok(upstream) => {
            let on_upgrade = hyper::upgrade::on(req);
            tokio::spawn(async move {
                match on_upgrade.await {
                    Ok(upgraded) => {
                        let _ = listener::tunnel_raw(TokioIo::new(upgraded), upstream).await;
                    }
                    Err(e) => debug!("CONNECT upgrade failed: {e}"),
                }
            });
            Ok(Response::new(empty_body()))
        }
        Err(e) => {
            warn!(%host, port, "CONNECT target unreachable: {e}");
            Ok(plain_response(StatusCode::BAD_GATEWAY, "CONNECT target unreachable"))
        }
    }
}

fn is_websocket_upgrade(headers: &http::HeaderMap) -> bool {
    headers
        .get(http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

fn parse_head(ctx: &ConnCtx, id: u64, req: &Request<Incoming>) -> ParsedRequest {
    let uri = req.uri();
    let scheme = match uri.scheme_str() {
        Some("https") => Scheme::Https,
        Some("http") => Scheme::Http,
        _ => ctx.scheme,
    };

    let fallback_port = ctx
        .tunnel_target
        .as_ref()
        .map(|(_, port)| *port)
        .unwrap_or_else(|| scheme.default_port());

    let (host, port) = if let Some(authority) = uri.authority() {
        (
            authority.host().trim_matches(['[', ']']).to_string(),
            authority.port_u16().unwrap_or_else(|| scheme.default_port()),
        )
    } else if let Some(host_header) = req
        .headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
    {
        parse_host_header(host_header, fallback_port)
    } else if let Some((host, port)) = &ctx.tunnel_target {
        (host.clone(), *port)
    } else {
        ("localhost".to_string(), scheme.default_port())
    };

    let protocol = match req.version() {
        Version::HTTP_2 => Protocol::Http2,
        _ => Protocol::Http1,
    };

    ParsedRequest {
        id,
        received_at: chrono::Utc::now(),
        remote_addr: ctx.remote_addr,
        protocol,
        scheme,
        host,
        port,
        method: req.method().clone(),
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        headers: HeaderList::from(req.headers()),
        body: CapturedBody::empty(),
        trailers: None,
    }
}

fn parse_host_header(value: &str, default_port: u16) -> (String, u16) {
    if let Some((host, port)) = value.rsplit_once(':') {
        if let Ok(port) = port.parse::<u16>() {
            if !host.is_empty() {
                return (host.trim_matches(['[', ']']).to_string(), port);
            }
        }
    }
    (value.trim_matches(['[', ']']).to_string(), default_port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_header_parsing() {
        assert_eq!(
            parse_host_header("example.test:8080", 80),
            ("example.test".to_string(), 8080)
        );
        assert_eq!(
            parse_host_header("example.test", 80),
            ("example.test".to_string(), 80)
        );
        assert_eq!(parse_host_header("[::1]:9000", 80), ("::1".to_string(), 9000));
    }

    #[test]
    fn terminal_actions_are_recognized_through_source_chains() {
        let direct: BodyError = Box::new(TerminalAction::Close);
        assert!(is_terminal_action(direct.as_ref()));

        #[derive(Debug)]
        struct Wrapper(TerminalAction);
        impl fmt::Display for Wrapper {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("wrapper")
            }
        }
        impl std::error::Error for Wrapper {
            fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
                Some(&self.0)
            }
        }
        let wrapped: BodyError = Box::new(Wrapper(TerminalAction::Reset));
        assert!(is_terminal_action(wrapped.as_ref()));

        let plain: BodyError = Box::new(std::io::Error::other("io"));
        assert!(!is_terminal_action(plain.as_ref()));
    }

    #[test]
    fn websocket_upgrade_detection_is_case_insensitive() {
        let mut headers = http::HeaderMap::new();
        headers.insert(http::header::UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(is_websocket_upgrade(&headers));
        headers.insert(http::header::UPGRADE, HeaderValue::from_static("h2c"));
        assert!(!is_websocket_upgrade(&headers));
    }

    #[test]
    fn plain_response_sets_status_and_content_type() {
        let response = plain_response(StatusCode::SERVICE_UNAVAILABLE, "nope");
        assert_eq!(response.status(), 503);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/plain"
        );
    }
}
