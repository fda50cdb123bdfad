//! Thread-safe rule storage.
//!
//! Two ordered sequences (HTTP and WebSocket) plus one optional fallback
//! slot. Writes are serialized behind a single lock; the dispatcher takes a
//! snapshot and releases the lock before any matching or handler execution,
//! so a request observes either the pre- or post-mutation rule lists, never
//! a torn mix.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::{CompletionLimit, Rule, RuleProtocol};
use crate::error::{MockError, Result};
use crate::request::Exchange;

/// A rule plus its runtime state (invocation counter, seen traffic).
///
/// The state lives alongside the rule in one allocation so that endpoint
/// handles can keep observing last-known values after the rule has been
/// removed from the store; removal simply stops further increments.
pub struct RuleEntry {
    pub rule: Rule,
    invocations: AtomicU64,
    seen: RwLock<Vec<Exchange>>,
}

impl RuleEntry {
    fn new(rule: Rule) -> Arc<Self> {
        Arc::new(Self {
            rule,
            invocations: AtomicU64::new(0),
            seen: RwLock::new(Vec::new()),
        })
    }

    /// Atomically claim one invocation slot. Concurrent claimants may both
    /// observe eligibility; the increment itself decides who gets the last
    /// slot under a finite limit.
    pub fn claim(&self) -> bool {
        match self.rule.completion_limit {
            CompletionLimit::Unlimited => {
                self.invocations.fetch_add(1, Ordering::SeqCst);
                true
            }
            CompletionLimit::AtMost(limit) => self
                .invocations
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    (n < limit).then_some(n + 1)
                })
                .is_ok(),
        }
    }

    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn exhausted(&self) -> bool {
        match self.rule.completion_limit {
            CompletionLimit::Unlimited => false,
            CompletionLimit::AtMost(limit) => self.invocations() >= limit,
        }
    }

    pub fn record(&self, exchange: Exchange) {
        self.seen.write().push(exchange);
    }

    pub fn seen(&self) -> Vec<Exchange> {
        self.seen.read().clone()
    }

    pub(crate) fn clear_state(&self) {
        self.invocations.store(0, Ordering::SeqCst);
        self.seen.write().clear();
    }
}

/// Consistent read view used by the dispatcher, one per incoming request.
#[derive(Clone, Default)]
pub struct StoreSnapshot {
    pub http: Vec<Arc<RuleEntry>>,
    pub ws: Vec<Arc<RuleEntry>>,
    pub fallback: Option<Arc<RuleEntry>>,
}

impl StoreSnapshot {
    pub fn rules_for(&self, protocol: RuleProtocol) -> &[Arc<RuleEntry>] {
        match protocol {
            RuleProtocol::Http => &self.http,
            RuleProtocol::WebSocket => &self.ws,
        }
    }
}

#[derive(Default)]
struct StoreInner {
    http: Vec<Arc<RuleEntry>>,
    ws: Vec<Arc<RuleEntry>>,
    fallback: Option<Arc<RuleEntry>>,
}

#[derive(Default)]
pub struct RuleStore {
    inner: RwLock<StoreInner>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, rule: Rule) -> Arc<RuleEntry> {
        let entry = RuleEntry::new(rule);
        let mut inner = self.inner.write();
        match entry.rule.protocol {
            RuleProtocol::Http => inner.http.push(Arc::clone(&entry)),
            RuleProtocol::WebSocket => inner.ws.push(Arc::clone(&entry)),
        }
        entry
    }

    /// Atomic replace of one protocol's sequence. The other protocol's rules
    /// and the fallback slot are left untouched.
    pub fn set(&self, protocol: RuleProtocol, rules: Vec<Rule>) -> Vec<Arc<RuleEntry>> {
        debug_assert!(rules.iter().all(|r| r.protocol == protocol));
        let entries: Vec<_> = rules.into_iter().map(RuleEntry::new).collect();
        let mut inner = self.inner.write();
        match protocol {
            RuleProtocol::Http => inner.http = entries.clone(),
            RuleProtocol::WebSocket => inner.ws = entries.clone(),
        }
        entries
    }

    /// Install the fallback rule. Fails if one is already installed or the
    /// matcher is anything other than "always".
    pub fn set_fallback(&self, rule: Rule) -> Result<Arc<RuleEntry>> {
        if !rule.matcher.is_always() {
            return Err(MockError::Config(
                "a fallback rule must match any request".into(),
            ));
        }
        let mut inner = self.inner.write();
        if inner.fallback.is_some() {
            return Err(MockError::Config(
                "a fallback rule is already registered".into(),
            ));
        }
        let entry = RuleEntry::new(rule);
        inner.fallback = Some(Arc::clone(&entry));
        Ok(entry)
    }

    /// Clear both sequences, the fallback, and all per-rule state. Live
    /// connections are not touched.
    pub fn reset(&self) {
        let mut inner = self.inner.write();
        for entry in inner
            .http
            .iter()
            .chain(inner.ws.iter())
            .chain(inner.fallback.iter())
        {
            entry.clear_state();
        }
        inner.http.clear();
        inner.ws.clear();
        inner.fallback = None;
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let inner = self.inner.read();
        StoreSnapshot {
            http: inner.http.clone(),
            ws: inner.ws.clone(),
            fallback: inner.fallback.clone(),
        }
    }
}
