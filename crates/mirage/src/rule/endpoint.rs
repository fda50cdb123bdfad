//! Endpoint handles returned by rule registration.

use std::sync::Arc;

use super::{CompletionLimit, RuleEntry, RuleId};
use crate::request::{Exchange, ParsedRequest};

/// A live reference to a registered rule, exposing its counters and seen
/// traffic.
///
/// The handle shares the rule's state block rather than going through the
/// store, so it stays valid after `reset()` or `set_request_rules()` remove
/// the rule: the counters simply freeze at their last-known values (or at
/// zero after `reset()`, which clears state before detaching).
#[derive(Clone)]
pub struct MockedEndpoint {
    entry: Arc<RuleEntry>,
}

impl MockedEndpoint {
    pub(crate) fn new(entry: Arc<RuleEntry>) -> Self {
        Self { entry }
    }

    pub fn id(&self) -> RuleId {
        self.entry.rule.id
    }

    /// How many requests this rule has handled.
    pub fn request_count(&self) -> u64 {
        self.entry.invocations()
    }

    /// Requests recorded for this rule, in arrival order. Empty forever when
    /// the server was configured with `record_traffic: false`.
    pub fn seen_requests(&self) -> Vec<ParsedRequest> {
        self.entry
            .seen()
            .into_iter()
            .map(|exchange| exchange.request)
            .collect()
    }

    /// Recorded request/response pairs.
    pub fn seen_exchanges(&self) -> Vec<Exchange> {
        self.entry.seen()
    }

    /// Whether this endpoint still expects traffic: its completion limit has
    /// not been reached, and (for unlimited rules) it has not yet seen any
    /// request at all.
    pub fn is_pending(&self) -> bool {
        let invocations = self.entry.invocations();
        match self.entry.rule.completion_limit {
            CompletionLimit::AtMost(limit) => invocations < limit,
            CompletionLimit::Unlimited => invocations == 0,
        }
    }

    pub(crate) fn entry(&self) -> &Arc<RuleEntry> {
        &self.entry
    }
}

impl std::fmt::Debug for MockedEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockedEndpoint")
            .field("id", &self.id())
            .field("request_count", &self.request_count())
            .field("pending", &self.is_pending())
            .finish()
    }
}
