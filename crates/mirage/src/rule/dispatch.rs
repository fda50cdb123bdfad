//! Ordered rule dispatch.
//!
//! Scans a store snapshot in declaration order. A rule is eligible when its
//! matcher matches and it still has invocation capacity; the capacity claim
//! is atomic, so under concurrency a limit-N rule hands out exactly N slots
//! and losers fall through to the next eligible rule.

use std::sync::Arc;

use super::{RuleEntry, RuleProtocol, StoreSnapshot};
use crate::request::ParsedRequest;

pub(crate) enum Dispatch {
    Matched(Arc<RuleEntry>),
    /// No rule (and no fallback) took the request.
    Unmatched,
}

pub(crate) fn select_rule(
    snapshot: &StoreSnapshot,
    protocol: RuleProtocol,
    request: &ParsedRequest,
) -> Dispatch {
    for entry in snapshot.rules_for(protocol) {
        if entry.rule.matcher.matches(request) && entry.claim() {
            return Dispatch::Matched(Arc::clone(entry));
        }
    }
    if protocol == RuleProtocol::Http {
        if let Some(fallback) = &snapshot.fallback {
            if fallback.claim() {
                return Dispatch::Matched(Arc::clone(fallback));
            }
        }
    }
    Dispatch::Unmatched
}

/// Body of the synthesized 503 for requests no rule matched. Kept to a
/// stable leading substring so callers can assert on it.
pub(crate) fn miss_body(
    request: &ParsedRequest,
    snapshot: &StoreSnapshot,
    protocol: RuleProtocol,
    suggest_changes: bool,
) -> String {
    let mut body = String::from("No rules were found matching this request.\n");
    body.push_str(&format!(
        "This request was: {} {}\n",
        request.method,
        request.url()
    ));

    let rules = snapshot.rules_for(protocol);
    if rules.is_empty() {
        body.push_str("\nNo rules are configured.\n");
    } else {
        body.push_str("\nThe configured rules were:\n");
        for entry in rules {
            let state = if entry.exhausted() {
                " (done handling its requests)"
            } else {
                ""
            };
            body.push_str(&format!("- {}{}\n", entry.rule.summary(), state));
        }
    }

    if suggest_changes {
        let verb = request.method.as_str().to_ascii_lowercase();
        body.push_str(&format!(
            "\nYou can handle this request with:\n\
             server.{verb}(\"{}\").then_reply(200, \"...\")?;\n",
            request.path
        ));
    }
    body
}
