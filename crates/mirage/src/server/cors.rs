//! Automatic CORS preflight handling.

use http::{HeaderValue, Response, StatusCode};

use super::service::{mock_to_response, MirageBody};
use crate::config::CorsOptions;
use crate::request::MockResponse;

/// Answer a preflight `OPTIONS` request before rule dispatch. Returns the
/// wire response and the summary used for the `response` event.
pub(crate) fn preflight_response(options: &CorsOptions) -> (Response<MirageBody>, MockResponse) {
    let mut summary = MockResponse::new(StatusCode::NO_CONTENT.as_u16())
        .with_header("access-control-allow-origin", &options.allowed_origin)
        .with_header(
            "access-control-allow-methods",
            options.allowed_methods.join(", "),
        )
        .with_header("access-control-allow-headers", &options.allowed_headers);
    if options.allow_credentials {
        summary = summary.with_header("access-control-allow-credentials", "true");
    }
    if let Some(max_age) = options.max_age_seconds {
        summary = summary.with_header("access-control-max-age", max_age.to_string());
    }
    let response = mock_to_response(&summary);
    (response, summary)
}

/// Add the origin header to ordinary responses, without clobbering one a
/// rule already set.
pub(crate) fn decorate(headers: &mut http::HeaderMap, options: &CorsOptions) {
    if headers.contains_key("access-control-allow-origin") {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(&options.allowed_origin) {
        headers.insert("access-control-allow-origin", value);
    }
    if options.allow_credentials {
        headers.insert(
            "access-control-allow-credentials",
            HeaderValue::from_static("true"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preflight_carries_cors_headers() {
        let (response, summary) = preflight_response(&CorsOptions::default());
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(summary.headers.get("access-control-allow-origin"), Some("*"));
        assert!(summary
            .headers
            .get("access-control-allow-methods")
            .unwrap()
            .contains("GET"));
    }

    #[test]
    fn decorate_respects_existing_header() {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            "access-control-allow-origin",
            HeaderValue::from_static("https://app.test"),
        );
        decorate(&mut headers, &CorsOptions::default());
        assert_eq!(
            headers.get("access-control-allow-origin").unwrap(),
            "https://app.test"
        );
    }
}
