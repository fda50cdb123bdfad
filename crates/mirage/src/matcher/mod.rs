//! Composite request matchers.
//!
//! A matcher is a predicate tree over a parsed request: leaf criteria plus
//! `All`/`Any` combinators with short-circuit evaluation. `All([])` matches
//! every request and is the canonical "always" matcher used by fallback
//! rules. Evaluation is deterministic and side-effect free.

mod target;

use http::Method;
use regex::Regex;

use crate::request::{ParsedRequest, Scheme};

/// How a header value is compared.
#[derive(Clone, Debug)]
pub enum HeaderValueMatch {
    Exact(String),
    Regex(Regex),
}

/// A predicate over a parsed request.
#[derive(Clone, Debug)]
pub enum RequestMatcher {
    /// Matches when every child matches. Empty = always matches.
    All(Vec<RequestMatcher>),
    /// Matches when any child matches. Empty = never matches.
    Any(Vec<RequestMatcher>),
    Method(Method),
    /// String URL pattern: relative path, `host[:port]/path`, or absolute
    /// URL. Query strings are ignored on both sides.
    Url(String),
    /// Regex tried against the absolute URL (sans query), then the path.
    UrlRegex(Regex),
    /// Each named parameter must be present with the given value.
    Query(Vec<(String, String)>),
    /// The raw query string must match exactly.
    ExactQuery(String),
    Header(String, HeaderValueMatch),
    Cookie(String, String),
    BodyContains(String),
    /// Body must parse as JSON and structurally include the given value.
    BodyJson(serde_json::Value),
    /// Form-encoded body must contain the given pairs.
    BodyForm(Vec<(String, String)>),
    Hostname(String),
    Port(u16),
    Scheme(Scheme),
}

impl RequestMatcher {
    /// The matcher used by fallback rules.
    pub fn always() -> Self {
        RequestMatcher::All(Vec::new())
    }

    pub fn is_always(&self) -> bool {
        matches!(self, RequestMatcher::All(children) if children.is_empty())
    }

    pub fn matches(&self, req: &ParsedRequest) -> bool {
        match self {
            RequestMatcher::All(children) => children.iter().all(|m| m.matches(req)),
            RequestMatcher::Any(children) => children.iter().any(|m| m.matches(req)),
            RequestMatcher::Method(method) => req.method == *method,
            RequestMatcher::Url(pattern) => target::url_pattern_matches(pattern, req),
            RequestMatcher::UrlRegex(regex) => target::url_regex_matches(regex, req),
            RequestMatcher::Query(expected) => {
                let params = req.query_params();
                expected
                    .iter()
                    .all(|(k, v)| params.iter().any(|(pk, pv)| pk == k && pv == v))
            }
            RequestMatcher::ExactQuery(expected) => {
                req.query.as_deref().unwrap_or("") == expected.trim_start_matches('?')
            }
            RequestMatcher::Header(name, value) => req.headers.get_all(name).any(|v| match value {
                HeaderValueMatch::Exact(expected) => v == expected,
                HeaderValueMatch::Regex(regex) => regex.is_match(v),
            }),
            RequestMatcher::Cookie(name, value) => req
                .cookies()
                .iter()
                .any(|(k, v)| k == name && v == value),
            RequestMatcher::BodyContains(needle) => {
                req.body.as_str_lossy().contains(needle.as_str())
            }
            RequestMatcher::BodyJson(expected) => {
                match serde_json::from_slice::<serde_json::Value>(req.body.as_bytes()) {
                    Ok(actual) => json_includes(expected, &actual),
                    Err(_) => false,
                }
            }
            RequestMatcher::BodyForm(expected) => {
                let pairs = crate::request::parse_query_pairs(&req.body.as_str_lossy());
                expected
                    .iter()
                    .all(|(k, v)| pairs.iter().any(|(pk, pv)| pk == k && pv == v))
            }
            RequestMatcher::Hostname(host) => req.host.eq_ignore_ascii_case(host),
            RequestMatcher::Port(port) => req.port == *port,
            RequestMatcher::Scheme(scheme) => req.scheme == *scheme,
        }
    }

    /// One-line description, used in 503 miss bodies.
    pub fn summary(&self) -> String {
        match self {
            RequestMatcher::All(children) if children.is_empty() => "any request".into(),
            RequestMatcher::All(children) => children
                .iter()
                .map(|m| m.summary())
                .collect::<Vec<_>>()
                .join(" and "),
            RequestMatcher::Any(children) => children
                .iter()
                .map(|m| m.summary())
                .collect::<Vec<_>>()
                .join(" or "),
            RequestMatcher::Method(m) => format!("method {m}"),
            RequestMatcher::Url(p) => format!("url {p}"),
            RequestMatcher::UrlRegex(r) => format!("url matching /{r}/"),
            RequestMatcher::Query(q) => format!("query {q:?}"),
            RequestMatcher::ExactQuery(q) => format!("exact query {q:?}"),
            RequestMatcher::Header(k, HeaderValueMatch::Exact(v)) => format!("header {k}={v}"),
            RequestMatcher::Header(k, HeaderValueMatch::Regex(r)) => {
                format!("header {k} matching /{r}/")
            }
            RequestMatcher::Cookie(k, v) => format!("cookie {k}={v}"),
            RequestMatcher::BodyContains(s) => format!("body containing {s:?}"),
            RequestMatcher::BodyJson(v) => format!("body including JSON {v}"),
            RequestMatcher::BodyForm(pairs) => format!("form body {pairs:?}"),
            RequestMatcher::Hostname(h) => format!("hostname {h}"),
            RequestMatcher::Port(p) => format!("port {p}"),
            RequestMatcher::Scheme(s) => format!("scheme {}", s.as_str()),
        }
    }
}

/// Structural inclusion: every key/element in `expected` must be present in
/// `actual`; objects recurse, arrays compare by index prefix.
fn json_includes(expected: &serde_json::Value, actual: &serde_json::Value) -> bool {
    use serde_json::Value;
    match (expected, actual) {
        (Value::Object(exp), Value::Object(act)) => exp
            .iter()
            .all(|(k, v)| act.get(k).is_some_and(|a| json_includes(v, a))),
        (Value::Array(exp), Value::Array(act)) => {
            exp.len() <= act.len()
                && exp
                    .iter()
                    .zip(act.iter())
                    .all(|(e, a)| json_includes(e, a))
        }
        (e, a) => e == a,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{CapturedBody, HeaderList, Protocol};
    use bytes::Bytes;
    use chrono::Utc;
    use serde_json::json;

    fn request() -> ParsedRequest {
        ParsedRequest {
            id: 0,
            received_at: Utc::now(),
            remote_addr: "127.0.0.1:1".parse().unwrap(),
            protocol: Protocol::Http1,
            scheme: Scheme::Http,
            host: "localhost".into(),
            port: 8080,
            method: Method::POST,
            path: "/submit".into(),
            query: Some("kind=a&n=1".into()),
            headers: HeaderList::new(),
            body: CapturedBody::empty(),
            trailers: None,
        }
    }

    fn with_body(mut req: ParsedRequest, body: &str, max: usize) -> ParsedRequest {
        req.body = CapturedBody::new(Bytes::copy_from_slice(body.as_bytes()), max);
        req
    }

    #[test]
    fn empty_all_always_matches() {
        assert!(RequestMatcher::always().matches(&request()));
        assert!(RequestMatcher::always().is_always());
        assert!(!RequestMatcher::All(vec![RequestMatcher::Port(1)]).is_always());
    }

    #[test]
    fn empty_any_never_matches() {
        assert!(!RequestMatcher::Any(vec![]).matches(&request()));
    }

    #[test]
    fn all_short_circuits_and_any_accepts_first() {
        let req = request();
        assert!(RequestMatcher::All(vec![
            RequestMatcher::Method(Method::POST),
            RequestMatcher::Url("/submit".into()),
        ])
        .matches(&req));
        assert!(!RequestMatcher::All(vec![
            RequestMatcher::Method(Method::GET),
            RequestMatcher::Url("/submit".into()),
        ])
        .matches(&req));
        assert!(RequestMatcher::Any(vec![
            RequestMatcher::Method(Method::GET),
            RequestMatcher::Method(Method::POST),
        ])
        .matches(&req));
    }

    #[test]
    fn query_matcher_requires_explicit_parameters() {
        let req = request();
        // The URL matcher ignores the query entirely.
        assert!(RequestMatcher::Url("/submit".into()).matches(&req));
        assert!(RequestMatcher::Query(vec![("kind".into(), "a".into())]).matches(&req));
        assert!(!RequestMatcher::Query(vec![("kind".into(), "b".into())]).matches(&req));
        assert!(RequestMatcher::ExactQuery("kind=a&n=1".into()).matches(&req));
        assert!(!RequestMatcher::ExactQuery("kind=a".into()).matches(&req));
    }

    #[test]
    fn header_regex_and_exact() {
        let mut req = request();
        req.headers.push("X-Request-Id", "req-42");
        assert!(RequestMatcher::Header(
            "x-request-id".into(),
            HeaderValueMatch::Exact("req-42".into())
        )
        .matches(&req));
        assert!(RequestMatcher::Header(
            "x-request-id".into(),
            HeaderValueMatch::Regex(Regex::new(r"^req-\d+$").unwrap())
        )
        .matches(&req));
    }

    #[test]
    fn body_matchers() {
        let req = with_body(request(), r#"{"user":{"name":"ada","age":36}}"#, usize::MAX);
        assert!(RequestMatcher::BodyContains("ada".into()).matches(&req));
        assert!(RequestMatcher::BodyJson(json!({"user": {"name": "ada"}})).matches(&req));
        assert!(!RequestMatcher::BodyJson(json!({"user": {"name": "bob"}})).matches(&req));

        let form = with_body(request(), "a=1&b=x%20y", usize::MAX);
        assert!(RequestMatcher::BodyForm(vec![("b".into(), "x y".into())]).matches(&form));
    }

    #[test]
    fn oversized_body_matches_as_empty() {
        let req = with_body(request(), "needle haystack", 4);
        assert!(!RequestMatcher::BodyContains("needle".into()).matches(&req));
        // An empty-body matcher view still matches empty-string containment.
        assert!(RequestMatcher::BodyContains(String::new()).matches(&req));
    }

    #[test]
    fn json_inclusion_is_structural() {
        assert!(json_includes(&json!([1, 2]), &json!([1, 2, 3])));
        assert!(!json_includes(&json!([1, 4]), &json!([1, 2, 3])));
        assert!(json_includes(&json!({}), &json!({"a": 1})));
    }
}
