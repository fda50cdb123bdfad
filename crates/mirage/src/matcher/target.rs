//! URL comparison policy for string and regex matchers.
//!
//! A string matcher can be relative (`/path`), host-relative
//! (`host:8000/path`), or an absolute URL (`http://host/path`). Query
//! strings are always stripped from both the pattern and the comparison
//! target; matching query parameters requires an explicit query matcher.

use regex::Regex;

use crate::request::{ParsedRequest, Scheme};

/// Evaluate a string URL pattern against a request.
pub(crate) fn url_pattern_matches(pattern: &str, req: &ParsedRequest) -> bool {
    let pattern = strip_query(pattern);

    if pattern.starts_with('/') {
        return req.path == pattern;
    }

    if let Some(rest) = pattern
        .strip_prefix("http://")
        .map(|r| (Scheme::Http, r))
        .or_else(|| pattern.strip_prefix("https://").map(|r| (Scheme::Https, r)))
    {
        let (scheme, rest) = rest;
        return absolute_matches(scheme, rest, req);
    }

    // Host-relative: `host[:port]/path` (also accepts a bare `host[:port]`).
    host_relative_matches(pattern, req)
}

/// A regex matcher tries the absolute URL first, then the bare path.
pub(crate) fn url_regex_matches(regex: &Regex, req: &ParsedRequest) -> bool {
    regex.is_match(&req.url_without_query()) || regex.is_match(&req.path)
}

fn strip_query(pattern: &str) -> &str {
    match pattern.split_once('?') {
        Some((before, _)) => before,
        None => pattern,
    }
}

fn absolute_matches(scheme: Scheme, rest: &str, req: &ParsedRequest) -> bool {
    if scheme != req.scheme {
        return false;
    }
    let (authority, path) = split_authority(rest);
    let (host, port) = split_host_port(authority);
    if !host.eq_ignore_ascii_case(&req.host) {
        return false;
    }
    if port.unwrap_or_else(|| scheme.default_port()) != req.port {
        return false;
    }
    normalize_path(path) == req.path
}

fn host_relative_matches(pattern: &str, req: &ParsedRequest) -> bool {
    let (authority, path) = split_authority(pattern);
    let (host, port) = split_host_port(authority);
    if !host.eq_ignore_ascii_case(&req.host) {
        return false;
    }
    if let Some(port) = port {
        if port != req.port {
            return false;
        }
    }
    normalize_path(path) == req.path
}

fn split_authority(rest: &str) -> (&str, &str) {
    match rest.find('/') {
        Some(idx) => rest.split_at(idx),
        None => (rest, "/"),
    }
}

fn split_host_port(authority: &str) -> (&str, Option<u16>) {
    match authority.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host, Some(port)),
            Err(_) => (authority, None),
        },
        None => (authority, None),
    }
}

fn normalize_path(path: &str) -> &str {
    if path.is_empty() {
        "/"
    } else {
        path
    }
}
