//! The rule data model: matcher + completion limit + handler.

mod builder;
mod dispatch;
mod endpoint;
mod handler;
mod store;

pub use builder::{RequestRuleBuilder, WsRuleBuilder};
pub(crate) use dispatch::{miss_body, select_rule, Dispatch};
pub use endpoint::MockedEndpoint;
pub use handler::{
    ByteStream, CallbackFn, HandlerAction, PassthroughConfig, PassthroughRequest,
    PassthroughResponse, RewriteRequestFn, RewriteResponseFn, StreamFactory, WsHandlerAction,
    WsPassthroughConfig,
};
pub(crate) use store::{RuleEntry, RuleStore, StoreSnapshot};

use std::fmt;

use crate::matcher::RequestMatcher;

/// Opaque unique rule id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RuleId(uuid::Uuid);

impl RuleId {
    pub(crate) fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuleProtocol {
    Http,
    WebSocket,
}

/// How many requests a rule may handle before it becomes inert.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompletionLimit {
    #[default]
    Unlimited,
    AtMost(u64),
}

/// What to do once a rule has matched.
#[derive(Clone)]
pub enum RuleAction {
    Http(HandlerAction),
    Ws(WsHandlerAction),
}

impl fmt::Debug for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleAction::Http(action) => action.fmt(f),
            RuleAction::Ws(action) => action.fmt(f),
        }
    }
}

/// An immutable registered rule.
#[derive(Clone, Debug)]
pub struct Rule {
    pub id: RuleId,
    pub protocol: RuleProtocol,
    pub matcher: RequestMatcher,
    pub completion_limit: CompletionLimit,
    pub action: RuleAction,
}

impl Rule {
    pub fn http(
        matcher: RequestMatcher,
        completion_limit: CompletionLimit,
        action: HandlerAction,
    ) -> Self {
        Self {
            id: RuleId::new(),
            protocol: RuleProtocol::Http,
            matcher,
            completion_limit,
            action: RuleAction::Http(action),
        }
    }

    pub fn websocket(
        matcher: RequestMatcher,
        completion_limit: CompletionLimit,
        action: WsHandlerAction,
    ) -> Self {
        Self {
            id: RuleId::new(),
            protocol: RuleProtocol::WebSocket,
            matcher,
            completion_limit,
            action: RuleAction::Ws(action),
        }
    }

    /// One-line description used in 503 miss bodies.
    pub fn summary(&self) -> String {
        self.matcher.summary()
    }
}
