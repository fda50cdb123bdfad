//! WebSocket upgrades: echo, reject, and MITM passthrough.
//!
//! The HTTP parser has already consumed the upgrade request, so the 101
//! handshake is completed manually with the derived accept key and the
//! upgraded byte stream is wrapped back into a WebSocket session.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use http::{HeaderValue, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Message, Role};
use tokio_tungstenite::{connect_async_tls_with_config, Connector, WebSocketStream};
use tracing::{debug, warn};

use super::listener::ConnCtx;
use super::service::{empty_body, mock_to_response, MirageBody, TerminalAction};
use crate::events::EventSequence;
use crate::request::{Exchange, MockResponse, ParsedRequest, Protocol, Scheme};
use crate::rule::{self, Dispatch, RuleAction, RuleProtocol, WsHandlerAction, WsPassthroughConfig};
use crate::tls::{destination_matches, insecure_client_config};

pub(crate) async fn handle_upgrade(
    ctx: ConnCtx,
    mut req: Request<Incoming>,
    mut head: ParsedRequest,
    seq: EventSequence,
) -> Result<Response<MirageBody>, TerminalAction> {
    head.protocol = Protocol::WebSocket;
    let id = head.id;
    let server = Arc::clone(&ctx.server);

    // Upgrade requests carry no body; the request is complete at the head.
    seq.request(head.clone());

    let snapshot = server.store.snapshot();
    let entry = match rule::select_rule(&snapshot, RuleProtocol::WebSocket, &head) {
        Dispatch::Matched(entry) => entry,
        Dispatch::Unmatched => {
            let body = rule::miss_body(
                &head,
                &snapshot,
                RuleProtocol::WebSocket,
                server.options.suggest_changes,
            );
            let summary = MockResponse::new(503)
                .with_header("content-type", "text/plain")
                .with_body(body);
            seq.response(id, None, summary.clone());
            return Ok(mock_to_response(&summary));
        }
    };

    let Some(key) = req
        .headers()
        .get("sec-websocket-key")
        .map(|v| v.as_bytes().to_vec())
    else {
        seq.client_error(
            Some(ctx.remote_addr),
            "websocket upgrade without Sec-WebSocket-Key",
        );
        return Ok(mock_to_response(
            &MockResponse::new(400).with_body("missing Sec-WebSocket-Key"),
        ));
    };

    let action = match &entry.rule.action {
        RuleAction::Ws(action) => action.clone(),
        RuleAction::Http(_) => {
            let summary = MockResponse::new(500).with_body("misrouted rule");
            seq.response(id, Some(entry.rule.id), summary.clone());
            return Ok(mock_to_response(&summary));
        }
    };

    let record = |summary: &MockResponse| {
        if server.options.record_traffic {
            entry.record(Exchange {
                request: head.clone(),
                response: Some(summary.clone()),
            });
        }
    };

    match action {
        WsHandlerAction::Echo => {
            let on_upgrade = hyper::upgrade::on(&mut req);
            tokio::spawn(echo_session(on_upgrade));
            let summary = MockResponse::new(101);
            record(&summary);
            seq.response(id, Some(entry.rule.id), summary);
            Ok(accept_response(&key, None))
        }

        WsHandlerAction::Reject { status, body } => {
            let summary = MockResponse {
                status,
                headers: crate::request::HeaderList::new(),
                body,
            };
            record(&summary);
            seq.response(id, Some(entry.rule.id), summary.clone());
            Ok(mock_to_response(&summary))
        }

        WsHandlerAction::Passthrough(config) => {
            match connect_upstream(&ctx, &head, &config).await {
                Ok((upstream, subprotocol)) => {
                    let on_upgrade = hyper::upgrade::on(&mut req);
                    tokio::spawn(pipe_session(on_upgrade, upstream));
                    let summary = MockResponse::new(101);
                    record(&summary);
                    seq.response(id, Some(entry.rule.id), summary);
                    Ok(accept_response(&key, subprotocol))
                }
                Err(message) => {
                    warn!(id, "websocket passthrough failed: {message}");
                    let summary = MockResponse::new(502).with_body(message);
                    record(&summary);
                    seq.response(id, Some(entry.rule.id), summary.clone());
                    Ok(mock_to_response(&summary))
                }
            }
        }
    }
}

/// The 101 handshake response completing the client-side upgrade.
fn accept_response(key: &[u8], subprotocol: Option<String>) -> Response<MirageBody> {
    let accept = derive_accept_key(key);
    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(http::header::UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(http::header::CONNECTION, HeaderValue::from_static("Upgrade"));
    if let Ok(accept) = HeaderValue::from_str(&accept) {
        headers.insert("sec-websocket-accept", accept);
    }
    if let Some(protocol) = subprotocol {
        if let Ok(protocol) = HeaderValue::from_str(&protocol) {
            headers.insert("sec-websocket-protocol", protocol);
        }
    }
    response
}

type UpstreamWs =
    WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Open the upstream WebSocket, forwarding the handshake headers that
/// matter and applying the certificate trust policy.
async fn connect_upstream(
    ctx: &ConnCtx,
    head: &ParsedRequest,
    config: &WsPassthroughConfig,
) -> Result<(UpstreamWs, Option<String>), String> {
    let url = match &config.target {
        Some(base) => format!(
            "{}{}{}",
            base.trim_end_matches('/'),
            head.path,
            head.query
                .as_deref()
                .map(|q| format!("?{q}"))
                .unwrap_or_default()
        ),
        None => {
            // ws:// mirrors http://, wss:// mirrors https://.
            let scheme = match head.scheme {
                Scheme::Http => "ws",
                Scheme::Https => "wss",
            };
            let mut url = format!("{}://{}{}", scheme, head.authority(), head.path);
            if let Some(q) = &head.query {
                url.push('?');
                url.push_str(q);
            }
            url
        }
    };

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| format!("invalid upstream websocket URL {url}: {e}"))?;

    // A fresh Sec-WebSocket-Key is generated for the upstream handshake;
    // only identity and subprotocol headers are carried over.
    for header in ["sec-websocket-protocol", "origin", "cookie", "authorization"] {
        if let Some(value) = head.headers.get(header) {
            if let Ok(value) = HeaderValue::from_str(value) {
                request.headers_mut().insert(header, value);
            }
        }
    }

    let uri = request.uri();
    let host = uri.host().unwrap_or_default().to_string();
    let port = uri
        .port_u16()
        .unwrap_or(if uri.scheme_str() == Some("wss") { 443 } else { 80 });

    let mut bypass = destination_matches(&config.ignore_host_certificate_errors, &host, port);
    if !bypass {
        bypass = destination_matches(
            &ctx.server.options.ignore_websocket_host_certificate_errors,
            &host,
            port,
        );
    }
    let connector = if bypass {
        warn!(%host, port, "upstream websocket certificate verification disabled");
        Some(Connector::Rustls(Arc::new(insecure_client_config())))
    } else {
        None
    };

    let (upstream, response) = connect_async_tls_with_config(request, None, false, connector)
        .await
        .map_err(|e| format!("failed to connect upstream websocket {url}: {e}"))?;

    let subprotocol = response
        .headers()
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    Ok((upstream, subprotocol))
}

/// Echo every data message back; mirror close frames and answer pings.
async fn echo_session(on_upgrade: OnUpgrade) {
    let upgraded = match on_upgrade.await {
        Ok(upgraded) => upgraded,
        Err(e) => {
            debug!("websocket upgrade failed: {e}");
            return;
        }
    };
    let mut ws =
        WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;

    while let Some(message) = ws.next().await {
        match message {
            Ok(Message::Text(_) | Message::Binary(_)) => {
                let Ok(message) = message else { break };
                if ws.send(message).await.is_err() {
                    break;
                }
            }
            Ok(Message::Ping(payload)) => {
                if ws.send(Message::Pong(payload)).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(frame)) => {
                let _ = ws.send(Message::Close(frame)).await;
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!("websocket echo ended: {e}");
                break;
            }
        }
    }
}

/// Shuttle frames between the client and the upstream, preserving message
/// boundaries and close codes; each side is closed only after the other has
/// drained.
async fn pipe_session(on_upgrade: OnUpgrade, upstream: UpstreamWs) {
    let upgraded = match on_upgrade.await {
        Ok(upgraded) => upgraded,
        Err(e) => {
            debug!("websocket upgrade failed: {e}");
            return;
        }
    };
    let client =
        WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;

    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let client_to_upstream = async {
        while let Some(message) = client_rx.next().await {
            match message {
                Ok(message) => {
                    let is_close = message.is_close();
                    if upstream_tx.send(message).await.is_err() || is_close {
                        break;
                    }
                }
                Err(e) => {
                    debug!("websocket client read error: {e}");
                    break;
                }
            }
        }
        let _ = upstream_tx.close().await;
    };

    let upstream_to_client = async {
        while let Some(message) = upstream_rx.next().await {
            match message {
                Ok(message) => {
                    let is_close = message.is_close();
                    if client_tx.send(message).await.is_err() || is_close {
                        break;
                    }
                }
                Err(e) => {
                    debug!("websocket upstream read error: {e}");
                    break;
                }
            }
        }
        let _ = client_tx.close().await;
    };

    tokio::join!(client_to_upstream, upstream_to_client);
    debug!("websocket passthrough session closed");
}
