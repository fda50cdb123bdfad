//! Fluent construction of rules.
//!
//! The builders are thin data constructors: each `then_*` terminal builds an
//! immutable [`Rule`] and registers it with the server, yielding a
//! [`MockedEndpoint`] handle.

use std::path::PathBuf;

use bytes::Bytes;
use http::StatusCode;
use regex::Regex;

use super::{
    ByteStream, CompletionLimit, HandlerAction, MockedEndpoint, PassthroughConfig, Rule,
    WsHandlerAction, WsPassthroughConfig,
};
use crate::error::Result;
use crate::matcher::{HeaderValueMatch, RequestMatcher};
use crate::request::{HeaderList, MockResponse, ParsedRequest, Scheme};
use crate::server::MockServer;

/// Builder for HTTP rules. Created by the server's verb helpers
/// (`get`, `post`, …), [`MockServer::any_request`] and
/// [`MockServer::unmatched_request`].
#[must_use = "a rule is only registered once a then_* terminal is called"]
pub struct RequestRuleBuilder<'a> {
    server: &'a MockServer,
    matchers: Vec<RequestMatcher>,
    limit: CompletionLimit,
    fallback: bool,
}

impl<'a> RequestRuleBuilder<'a> {
    pub(crate) fn new(server: &'a MockServer, matchers: Vec<RequestMatcher>) -> Self {
        Self {
            server,
            matchers,
            limit: CompletionLimit::Unlimited,
            fallback: false,
        }
    }

    pub(crate) fn fallback(server: &'a MockServer) -> Self {
        Self {
            server,
            matchers: Vec::new(),
            limit: CompletionLimit::Unlimited,
            fallback: true,
        }
    }

    /// Handle at most one request.
    pub fn once(mut self) -> Self {
        self.limit = CompletionLimit::AtMost(1);
        self
    }

    /// Handle at most two requests.
    pub fn twice(mut self) -> Self {
        self.limit = CompletionLimit::AtMost(2);
        self
    }

    /// Handle at most `n` requests, then become inert.
    pub fn times(mut self, n: u64) -> Self {
        self.limit = CompletionLimit::AtMost(n);
        self
    }

    /// Add an arbitrary matcher to the rule's `all(...)` set.
    pub fn matching(mut self, matcher: RequestMatcher) -> Self {
        self.matchers.push(matcher);
        self
    }

    pub fn with_header(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let matcher =
            RequestMatcher::Header(name.into(), HeaderValueMatch::Exact(value.into()));
        self.matching(matcher)
    }

    pub fn with_header_matching(self, name: impl Into<String>, value: Regex) -> Self {
        self.matching(RequestMatcher::Header(
            name.into(),
            HeaderValueMatch::Regex(value),
        ))
    }

    pub fn with_query(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.matching(RequestMatcher::Query(vec![(name.into(), value.into())]))
    }

    pub fn with_exact_query(self, query: impl Into<String>) -> Self {
        self.matching(RequestMatcher::ExactQuery(query.into()))
    }

    pub fn with_body_containing(self, needle: impl Into<String>) -> Self {
        self.matching(RequestMatcher::BodyContains(needle.into()))
    }

    pub fn with_json_body(self, value: serde_json::Value) -> Self {
        self.matching(RequestMatcher::BodyJson(value))
    }

    pub fn with_form_body(self, pairs: Vec<(String, String)>) -> Self {
        self.matching(RequestMatcher::BodyForm(pairs))
    }

    pub fn with_cookie(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.matching(RequestMatcher::Cookie(name.into(), value.into()))
    }

    pub fn with_hostname(self, host: impl Into<String>) -> Self {
        self.matching(RequestMatcher::Hostname(host.into()))
    }

    pub fn with_port(self, port: u16) -> Self {
        self.matching(RequestMatcher::Port(port))
    }

    pub fn with_scheme(self, scheme: Scheme) -> Self {
        self.matching(RequestMatcher::Scheme(scheme))
    }

    fn register(self, action: HandlerAction) -> Result<MockedEndpoint> {
        let rule = Rule::http(RequestMatcher::All(self.matchers), self.limit, action);
        self.server.register_http_rule(rule, self.fallback)
    }

    /// Respond with a canned status and body.
    pub fn then_reply(self, status: u16, body: impl Into<Bytes>) -> Result<MockedEndpoint> {
        self.register(HandlerAction::reply(status, body))
    }

    /// Respond with a fully specified response.
    pub fn then_reply_with(self, response: MockResponse) -> Result<MockedEndpoint> {
        self.register(HandlerAction::Reply {
            status: response.status,
            headers: response.headers,
            body: response.body,
        })
    }

    /// Respond with a JSON-serialized body and `content-type:
    /// application/json`.
    pub fn then_json<T: serde::Serialize>(self, status: u16, value: &T) -> Result<MockedEndpoint> {
        let response = MockResponse::json(status, value)
            .map_err(|e| crate::error::MockError::Config(format!("unserializable body: {e}")))?;
        self.then_reply_with(response)
    }

    /// Write the head, then pump a fresh stream of chunks per request.
    pub fn then_stream<S>(
        self,
        status: u16,
        headers: HeaderList,
        factory: S,
    ) -> Result<MockedEndpoint>
    where
        S: Fn() -> ByteStream + Send + Sync + 'static,
    {
        self.register(HandlerAction::stream(status, headers, factory))
    }

    /// Produce the response from an async callback. Errors, panics and
    /// timeouts surface to the peer as a 500.
    pub fn then_callback<F, Fut>(self, f: F) -> Result<MockedEndpoint>
    where
        F: Fn(ParsedRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<MockResponse>> + Send + 'static,
    {
        self.register(HandlerAction::callback(f))
    }

    /// Serve a file from disk with the given status.
    pub fn then_file(self, status: u16, path: impl Into<PathBuf>) -> Result<MockedEndpoint> {
        self.register(HandlerAction::File {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
            path: path.into(),
        })
    }

    /// Hold the connection open and never respond.
    pub fn then_timeout(self) -> Result<MockedEndpoint> {
        self.register(HandlerAction::Timeout)
    }

    /// Close the connection without responding.
    pub fn then_close_connection(self) -> Result<MockedEndpoint> {
        self.register(HandlerAction::CloseConnection)
    }

    /// Reset the connection (RST) without responding.
    pub fn then_reset_connection(self) -> Result<MockedEndpoint> {
        self.register(HandlerAction::ResetConnection)
    }

    /// Forward matching requests to their original destination.
    pub fn then_passthrough(self) -> Result<MockedEndpoint> {
        self.register(HandlerAction::Passthrough(PassthroughConfig::default()))
    }

    /// Forward with explicit passthrough configuration.
    pub fn then_passthrough_with(self, config: PassthroughConfig) -> Result<MockedEndpoint> {
        self.register(HandlerAction::Passthrough(config))
    }

    /// Forward matching requests to another server, keeping path and query.
    pub fn then_forward_to(self, target: impl Into<String>) -> Result<MockedEndpoint> {
        self.register(HandlerAction::Passthrough(PassthroughConfig {
            target: Some(target.into()),
            ..Default::default()
        }))
    }
}

/// Builder for WebSocket rules, created by [`MockServer::any_websocket`].
#[must_use = "a rule is only registered once a then_* terminal is called"]
pub struct WsRuleBuilder<'a> {
    server: &'a MockServer,
    matchers: Vec<RequestMatcher>,
    limit: CompletionLimit,
}

impl<'a> WsRuleBuilder<'a> {
    pub(crate) fn new(server: &'a MockServer, matchers: Vec<RequestMatcher>) -> Self {
        Self {
            server,
            matchers,
            limit: CompletionLimit::Unlimited,
        }
    }

    pub fn once(mut self) -> Self {
        self.limit = CompletionLimit::AtMost(1);
        self
    }

    pub fn times(mut self, n: u64) -> Self {
        self.limit = CompletionLimit::AtMost(n);
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.matchers.push(RequestMatcher::Url(url.into()));
        self
    }

    pub fn matching(mut self, matcher: RequestMatcher) -> Self {
        self.matchers.push(matcher);
        self
    }

    fn register(self, action: WsHandlerAction) -> Result<MockedEndpoint> {
        let rule = Rule::websocket(RequestMatcher::All(self.matchers), self.limit, action);
        self.server.register_ws_rule(rule)
    }

    /// Accept the upgrade and echo every message back to the client.
    pub fn then_echo(self) -> Result<MockedEndpoint> {
        self.register(WsHandlerAction::Echo)
    }

    /// Reject the handshake with the given status.
    pub fn then_reject(self, status: u16, body: impl Into<Bytes>) -> Result<MockedEndpoint> {
        self.register(WsHandlerAction::Reject {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_REQUEST),
            body: body.into(),
        })
    }

    /// Pipe frames between the client and the original destination.
    pub fn then_passthrough(self) -> Result<MockedEndpoint> {
        self.register(WsHandlerAction::Passthrough(WsPassthroughConfig::default()))
    }

    /// Pipe frames between the client and the given upstream
    /// (`ws://` or `wss://` base URL).
    pub fn then_forward_to(self, target: impl Into<String>) -> Result<MockedEndpoint> {
        self.register(WsHandlerAction::Passthrough(WsPassthroughConfig {
            target: Some(target.into()),
            ..Default::default()
        }))
    }

    /// Pipe frames with explicit passthrough configuration.
    pub fn then_passthrough_with(self, config: WsPassthroughConfig) -> Result<MockedEndpoint> {
        self.register(WsHandlerAction::Passthrough(config))
    }
}
