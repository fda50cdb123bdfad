//! Outbound HTTP(S) client for passthrough rules.
//!
//! One shared pooled client verifies upstream certificates against the
//! system roots; a second client built with the trust-bypass verifier is
//! used only for exchanges whose destination matches an
//! `ignore_host_certificate_errors` pattern.

use std::time::Duration;

use bytes::Bytes;
use http::{HeaderName, HeaderValue, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, warn};

use crate::request::{HeaderList, MockResponse, ParsedRequest};
use crate::rule::{PassthroughConfig, PassthroughRequest, PassthroughResponse};
use crate::tls::{destination_matches, insecure_client_config};

/// Hop-by-hop headers stripped in both directions (RFC 7230 §6.1).
pub(crate) const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

type HyperClient =
    Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Result of a proxied exchange.
pub(crate) enum PassthroughOutcome {
    /// Relay the upstream response, streaming the body through.
    Streamed {
        /// Status and headers for event reporting; the body is not captured.
        head: MockResponse,
        response: hyper::Response<Incoming>,
    },
    /// A rewrite hook materialized the response.
    Materialized(MockResponse),
    /// The upstream could not be reached or a hook failed.
    Failed { status: StatusCode, message: String },
}

pub(crate) struct PassthroughClient {
    verifying: HyperClient,
    insecure: HyperClient,
}

impl PassthroughClient {
    pub(crate) fn new() -> Self {
        Self {
            verifying: build_client(false),
            insecure: build_client(true),
        }
    }

    /// Forward `request` to its origin (or the configured target),
    /// applying the rule's rewrite hooks.
    pub(crate) async fn execute(
        &self,
        request: &ParsedRequest,
        config: &PassthroughConfig,
        extra_ignore: &[String],
        hook_timeout: Duration,
    ) -> PassthroughOutcome {
        let url = match &config.target {
            Some(base) => format!(
                "{}{}{}",
                base.trim_end_matches('/'),
                request.path,
                request
                    .query
                    .as_deref()
                    .map(|q| format!("?{q}"))
                    .unwrap_or_default()
            ),
            None => request.url(),
        };

        let mut outbound = PassthroughRequest {
            method: request.method.clone(),
            url,
            headers: strip_request_headers(&request.headers),
            body: request.body.raw().clone(),
        };

        if let Some(hook) = &config.before_request {
            match tokio::time::timeout(hook_timeout, hook(outbound.clone())).await {
                // The body length is derived from the (possibly rewritten)
                // body, never from a stale header.
                Ok(Ok(mut rewritten)) => {
                    rewritten.headers.remove("content-length");
                    outbound = rewritten;
                }
                Ok(Err(e)) => {
                    return PassthroughOutcome::Failed {
                        status: StatusCode::BAD_GATEWAY,
                        message: format!("before_request hook failed: {e}"),
                    }
                }
                Err(_) => {
                    return PassthroughOutcome::Failed {
                        status: StatusCode::BAD_GATEWAY,
                        message: "before_request hook timed out".into(),
                    }
                }
            }
        }

        let uri: Uri = match outbound.url.parse() {
            Ok(uri) => uri,
            Err(e) => {
                return PassthroughOutcome::Failed {
                    status: StatusCode::BAD_GATEWAY,
                    message: format!("invalid passthrough URL {}: {e}", outbound.url),
                }
            }
        };
        let host = uri.host().unwrap_or_default().to_string();
        let port = uri.port_u16().unwrap_or_else(|| {
            if uri.scheme_str() == Some("https") {
                443
            } else {
                80
            }
        });

        let mut bypass = destination_matches(&config.ignore_host_certificate_errors, &host, port);
        if !bypass && !extra_ignore.is_empty() {
            bypass = destination_matches(extra_ignore, &host, port);
        }
        let client = if bypass {
            warn!(%host, port, "upstream certificate verification disabled for this exchange");
            &self.insecure
        } else {
            &self.verifying
        };

        let mut builder = hyper::Request::builder().method(outbound.method.clone()).uri(uri);
        for (name, value) in outbound.headers.iter() {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                builder = builder.header(name, value);
            }
        }
        let upstream_request = match builder.body(Full::new(outbound.body.clone())) {
            Ok(req) => req,
            Err(e) => {
                return PassthroughOutcome::Failed {
                    status: StatusCode::BAD_GATEWAY,
                    message: format!("failed to build upstream request: {e}"),
                }
            }
        };

        debug!(method = %outbound.method, url = %outbound.url, "forwarding to upstream");
        let mut response = match tokio::time::timeout(
            UPSTREAM_TIMEOUT,
            client.request(upstream_request),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                return PassthroughOutcome::Failed {
                    status: StatusCode::BAD_GATEWAY,
                    message: format!("upstream request to {} failed: {e}", outbound.url),
                }
            }
            Err(_) => {
                return PassthroughOutcome::Failed {
                    status: StatusCode::GATEWAY_TIMEOUT,
                    message: format!("upstream request to {} timed out", outbound.url),
                }
            }
        };

        strip_response_headers(response.headers_mut());

        if let Some(hook) = &config.before_response {
            let (parts, body) = response.into_parts();
            let body = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    return PassthroughOutcome::Failed {
                        status: StatusCode::BAD_GATEWAY,
                        message: format!("failed to read upstream body: {e}"),
                    }
                }
            };
            let upstream = PassthroughResponse {
                status: parts.status,
                headers: HeaderList::from(&parts.headers),
                body,
            };
            match tokio::time::timeout(hook_timeout, hook(upstream)).await {
                Ok(Ok(mut rewritten)) => {
                    rewritten.headers.remove("content-length");
                    return PassthroughOutcome::Materialized(MockResponse {
                        status: rewritten.status,
                        headers: rewritten.headers,
                        body: rewritten.body,
                    })
                }
                Ok(Err(e)) => {
                    return PassthroughOutcome::Failed {
                        status: StatusCode::BAD_GATEWAY,
                        message: format!("before_response hook failed: {e}"),
                    }
                }
                Err(_) => {
                    return PassthroughOutcome::Failed {
                        status: StatusCode::BAD_GATEWAY,
                        message: "before_response hook timed out".into(),
                    }
                }
            }
        }

        let head = MockResponse {
            status: response.status(),
            headers: HeaderList::from(response.headers()),
            body: Bytes::new(),
        };
        PassthroughOutcome::Streamed { head, response }
    }
}

fn build_client(insecure: bool) -> HyperClient {
    let mut http_connector = HttpConnector::new();
    http_connector.set_keepalive(Some(POOL_IDLE_TIMEOUT));
    http_connector.set_connect_timeout(Some(Duration::from_secs(10)));
    http_connector.enforce_http(false);

    let https_connector = if insecure {
        hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(insecure_client_config())
            .https_or_http()
            .enable_all_versions()
            .wrap_connector(http_connector)
    } else {
        hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .expect("failed to load native root certificates")
            .https_or_http()
            .enable_all_versions()
            .wrap_connector(http_connector)
    };

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(8)
        .build(https_connector)
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| name.eq_ignore_ascii_case(h))
}

/// Drop hop-by-hop headers plus `host` and `content-length`, both of which
/// are re-derived for the outbound request.
fn strip_request_headers(headers: &HeaderList) -> HeaderList {
    headers
        .iter()
        .filter(|(name, _)| {
            !is_hop_by_hop(name)
                && !name.eq_ignore_ascii_case("host")
                && !name.eq_ignore_ascii_case("content-length")
        })
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

fn strip_response_headers(headers: &mut http::HeaderMap) {
    let doomed: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop(name.as_str()))
        .cloned()
        .collect();
    for name in doomed {
        headers.remove(name);
    }
}
