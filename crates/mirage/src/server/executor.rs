//! Handler execution: turns a matched rule into a response or a terminal
//! socket action.

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use http::Response;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use tracing::{debug, warn};

use super::listener::ConnCtx;
use super::service::{mock_to_response, plain_response, BodyError, MirageBody};
use crate::client::PassthroughOutcome;
use crate::request::{HeaderList, MockResponse, ParsedRequest};
use crate::rule::{HandlerAction, RuleAction, RuleEntry};

pub(crate) enum Executed {
    Respond(Response<MirageBody>),
    Close,
    Reset,
}

/// Execute a rule's handler. Returns the wire action plus the response
/// summary used for events and recorded traffic (absent for terminal socket
/// actions, and carrying an empty body for streamed responses).
pub(crate) async fn execute(
    ctx: &ConnCtx,
    entry: &Arc<RuleEntry>,
    request: &ParsedRequest,
) -> (Executed, Option<MockResponse>) {
    let action = match &entry.rule.action {
        RuleAction::Http(action) => action,
        RuleAction::Ws(_) => {
            // WebSocket rules never reach the HTTP executor.
            let summary = MockResponse::new(500).with_body("misrouted rule");
            return (Executed::Respond(mock_to_response(&summary)), Some(summary));
        }
    };

    match action {
        HandlerAction::Reply {
            status,
            headers,
            body,
        } => {
            let summary = MockResponse {
                status: *status,
                headers: headers.clone(),
                body: body.clone(),
            };
            (Executed::Respond(mock_to_response(&summary)), Some(summary))
        }

        HandlerAction::StreamReply {
            status,
            headers,
            stream,
        } => {
            let chunks = stream().map(|chunk| {
                chunk
                    .map(Frame::data)
                    .map_err(|e| Box::new(e) as BodyError)
            });
            let body = BodyExt::boxed(StreamBody::new(chunks));
            let summary = MockResponse {
                status: *status,
                headers: headers.clone(),
                body: Bytes::new(),
            };
            let mut response = Response::new(body);
            *response.status_mut() = *status;
            apply_headers(response.headers_mut(), headers);
            (Executed::Respond(response), Some(summary))
        }

        HandlerAction::Callback(callback) => {
            let callback = Arc::clone(callback);
            let request = request.clone();
            // Callbacks run on their own task so a panic is contained.
            let task = tokio::spawn(async move { callback(request).await });
            let abort = task.abort_handle();
            let summary = match tokio::time::timeout(ctx.server.options.callback_timeout, task)
                .await
            {
                Ok(Ok(Ok(response))) => response,
                Ok(Ok(Err(e))) => {
                    warn!("callback rule failed: {e:#}");
                    MockResponse::new(500).with_body(format!("callback failed: {e}"))
                }
                Ok(Err(join_error)) => {
                    warn!("callback rule panicked: {join_error}");
                    MockResponse::new(500).with_body("callback panicked")
                }
                Err(_) => {
                    abort.abort();
                    warn!("callback rule timed out");
                    MockResponse::new(500).with_body("callback timed out")
                }
            };
            (Executed::Respond(mock_to_response(&summary)), Some(summary))
        }

        HandlerAction::File { status, path } => match tokio::fs::read(path).await {
            Ok(contents) => {
                let summary = MockResponse {
                    status: *status,
                    headers: HeaderList::new(),
                    body: Bytes::from(contents),
                };
                (Executed::Respond(mock_to_response(&summary)), Some(summary))
            }
            Err(e) => {
                warn!(path = %path.display(), "file rule failed to read: {e}");
                let summary = MockResponse::new(500).with_body("failed to read mocked file");
                (Executed::Respond(mock_to_response(&summary)), Some(summary))
            }
        },

        // Hold the socket open; the peer's own timeout (or server shutdown,
        // via the caller's select) decides when this ends.
        HandlerAction::Timeout => {
            debug!("timeout rule holding connection open");
            std::future::pending::<()>().await;
            (Executed::Close, None)
        }

        HandlerAction::CloseConnection => (Executed::Close, None),
        HandlerAction::ResetConnection => (Executed::Reset, None),

        HandlerAction::Passthrough(config) => {
            let outcome = ctx
                .server
                .passthrough
                .execute(request, config, &[], ctx.server.options.callback_timeout)
                .await;
            match outcome {
                PassthroughOutcome::Streamed { head, response } => {
                    let response =
                        response.map(|body| body.map_err(|e| Box::new(e) as BodyError).boxed());
                    (Executed::Respond(response), Some(head))
                }
                PassthroughOutcome::Materialized(mock) => {
                    (Executed::Respond(mock_to_response(&mock)), Some(mock))
                }
                PassthroughOutcome::Failed { status, message } => {
                    warn!("passthrough failed: {message}");
                    let summary = MockResponse {
                        status,
                        headers: HeaderList::new(),
                        body: Bytes::from(message),
                    };
                    let response = plain_response(status, summary.body.clone());
                    (Executed::Respond(response), Some(summary))
                }
            }
        }
    }
}

fn apply_headers(target: &mut http::HeaderMap, headers: &HeaderList) {
    for (name, value) in headers.iter() {
        if let (Ok(name), Ok(value)) = (
            http::HeaderName::from_bytes(name.as_bytes()),
            http::HeaderValue::from_str(value),
        ) {
            target.append(name, value);
        }
    }
}
