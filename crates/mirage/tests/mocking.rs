//! End-to-end HTTP mocking scenarios, driven with reqwest.

use mirage::{MockResponse, MockServer, MockServerOptions};
use regex::Regex;

fn options() -> MockServerOptions {
    MockServerOptions::default()
}

async fn started(options: MockServerOptions) -> MockServer {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
    let server = MockServer::new(options).expect("server options are valid");
    server.start(None).await.expect("server starts");
    server
}

#[tokio::test]
async fn canned_reply_and_seen_requests() {
    let server = started(options()).await;
    let endpoint = server.get("/a").then_reply(200, "x").unwrap();

    let response = reqwest::get(server.url_for("/a").unwrap()).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "x");

    assert_eq!(endpoint.request_count(), 1);
    let seen = endpoint.seen_requests();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].path, "/a");
    assert_eq!(seen[0].method, http::Method::GET);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn once_rule_exhausts_to_miss() {
    let server = started(options()).await;
    let endpoint = server.get("/a").once().then_reply(200, "x").unwrap();
    let url = server.url_for("/a").unwrap();

    let first = reqwest::get(&url).await.unwrap();
    assert_eq!(first.status(), 200);
    assert_eq!(first.text().await.unwrap(), "x");
    assert!(!endpoint.is_pending());

    let second = reqwest::get(&url).await.unwrap();
    assert_eq!(second.status(), 503);
    let body = second.text().await.unwrap();
    assert!(body.contains("No rules were found matching"), "got: {body}");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn regex_rule_with_catch_all() {
    let server = started(options()).await;
    server
        .get(Regex::new(r"^/x").unwrap())
        .then_reply(204, "")
        .unwrap();
    server.any_request().then_reply(200, "fallback").unwrap();

    let client = reqwest::Client::new();
    let matched = client
        .get(server.url_for("/x/1").unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(matched.status(), 204);

    // A POST misses the GET rule and lands on the catch-all.
    let fallback = client
        .post(server.url_for("/x/1").unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(fallback.status(), 200);
    assert_eq!(fallback.text().await.unwrap(), "fallback");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn unmatched_request_fallback_rule() {
    let server = started(options()).await;
    server.unmatched_request().then_reply(418, "teapot").unwrap();

    let response = reqwest::get(server.url_for("/anywhere").unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), 418);
    assert_eq!(response.text().await.unwrap(), "teapot");

    // Only one fallback may exist.
    assert!(server.unmatched_request().then_reply(500, "").is_err());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn declaration_order_decides_between_overlapping_rules() {
    let server = started(options()).await;
    server.get("/same").then_reply(200, "first").unwrap();
    server.get("/same").then_reply(200, "second").unwrap();

    let body = reqwest::get(server.url_for("/same").unwrap())
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "first");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn limited_rule_falls_through_to_later_match() {
    let server = started(options()).await;
    server.get("/a").times(2).then_reply(200, "limited").unwrap();
    server.get("/a").then_reply(200, "after").unwrap();

    let url = server.url_for("/a").unwrap();
    for _ in 0..2 {
        let body = reqwest::get(&url).await.unwrap().text().await.unwrap();
        assert_eq!(body, "limited");
    }
    let body = reqwest::get(&url).await.unwrap().text().await.unwrap();
    assert_eq!(body, "after");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn matchers_refine_rules() {
    let server = started(options()).await;
    server
        .post("/submit")
        .with_header("x-kind", "a")
        .with_body_containing("needle")
        .then_reply(201, "matched")
        .unwrap();
    server.any_request().then_reply(400, "nope").unwrap();

    let client = reqwest::Client::new();
    let url = server.url_for("/submit").unwrap();

    let hit = client
        .post(&url)
        .header("x-kind", "a")
        .body("hay needle stack")
        .send()
        .await
        .unwrap();
    assert_eq!(hit.status(), 201);

    let wrong_header = client
        .post(&url)
        .header("x-kind", "b")
        .body("hay needle stack")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong_header.status(), 400);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn query_matching_requires_explicit_matcher() {
    let server = started(options()).await;
    server
        .get("/q")
        .with_query("kind", "a")
        .then_reply(200, "a")
        .unwrap();
    server.get("/q").then_reply(200, "any").unwrap();

    let client = reqwest::Client::new();
    let with_param = client
        .get(server.url_for("/q?kind=a").unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(with_param.text().await.unwrap(), "a");

    // The plain URL rule matches regardless of query.
    let other = client
        .get(server.url_for("/q?kind=b").unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(other.text().await.unwrap(), "any");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn callback_rules_build_responses_from_the_request() {
    let server = started(options()).await;
    server
        .post("/echo")
        .then_callback(|req| async move {
            Ok(MockResponse::new(200)
                .with_header("x-seen-path", req.path.clone())
                .with_body(req.body.raw().clone()))
        })
        .unwrap();

    let client = reqwest::Client::new();
    let response = client
        .post(server.url_for("/echo").unwrap())
        .body("ping")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-seen-path"], "/echo");
    assert_eq!(response.text().await.unwrap(), "ping");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn failing_callback_surfaces_as_500() {
    let server = started(options()).await;
    server
        .get("/boom")
        .then_callback(|_req| async move { anyhow::bail!("deliberate failure") })
        .unwrap();

    let response = reqwest::get(server.url_for("/boom").unwrap()).await.unwrap();
    assert_eq!(response.status(), 500);
    assert!(response.text().await.unwrap().contains("deliberate failure"));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn json_reply_sets_content_type() {
    let server = started(options()).await;
    server
        .get("/json")
        .then_json(200, &serde_json::json!({"ok": true}))
        .unwrap();

    let response = reqwest::get(server.url_for("/json").unwrap()).await.unwrap();
    assert_eq!(response.headers()["content-type"], "application/json");
    let value: serde_json::Value = response.json().await.unwrap();
    assert_eq!(value["ok"], true);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn close_connection_rule_kills_the_socket() {
    let server = started(options()).await;
    server.get("/dead").then_close_connection().unwrap();

    let result = reqwest::get(server.url_for("/dead").unwrap()).await;
    assert!(result.is_err());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn timeout_rule_never_responds() {
    let server = started(options()).await;
    server.get("/hang").then_timeout().unwrap();

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_millis(300))
        .build()
        .unwrap();
    let result = client.get(server.url_for("/hang").unwrap()).send().await;
    assert!(result.err().is_some_and(|e| e.is_timeout()));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn reset_clears_rules_and_counters() {
    let server = started(options()).await;
    let endpoint = server.get("/a").then_reply(200, "x").unwrap();

    reqwest::get(server.url_for("/a").unwrap()).await.unwrap();
    assert_eq!(endpoint.request_count(), 1);

    server.reset();
    assert_eq!(endpoint.request_count(), 0);
    assert!(endpoint.seen_requests().is_empty());
    assert!(server.mocked_endpoints().is_empty());

    let response = reqwest::get(server.url_for("/a").unwrap()).await.unwrap();
    assert_eq!(response.status(), 503);
    assert!(response
        .text()
        .await
        .unwrap()
        .contains("No rules were found matching"));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn record_traffic_off_keeps_seen_requests_empty() {
    let server = started(MockServerOptions {
        record_traffic: false,
        ..options()
    })
    .await;
    let endpoint = server.get("/a").then_reply(200, "x").unwrap();

    reqwest::get(server.url_for("/a").unwrap()).await.unwrap();
    assert_eq!(endpoint.request_count(), 1);
    assert!(endpoint.seen_requests().is_empty());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn oversized_bodies_match_as_empty() {
    let server = started(MockServerOptions {
        max_body_size: 8,
        ..options()
    })
    .await;
    server
        .post("/upload")
        .with_body_containing("needle")
        .then_reply(200, "matched body")
        .unwrap();
    server.any_request().then_reply(200, "fell through").unwrap();

    let client = reqwest::Client::new();
    let url = server.url_for("/upload").unwrap();

    // Small body: the body matcher sees it.
    let small = client.post(&url).body("needle").send().await.unwrap();
    assert_eq!(small.text().await.unwrap(), "matched body");

    // Oversized body: treated as empty, so the body matcher misses.
    let big = client
        .post(&url)
        .body("needle surrounded by lots of hay")
        .send()
        .await
        .unwrap();
    assert_eq!(big.text().await.unwrap(), "fell through");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn pending_endpoints_lists_unsatisfied_rules() {
    let server = started(options()).await;
    let hit = server.get("/hit").then_reply(200, "").unwrap();
    let _not_hit = server.get("/not-hit").then_reply(200, "").unwrap();

    reqwest::get(server.url_for("/hit").unwrap()).await.unwrap();

    let pending = server.pending_endpoints();
    assert_eq!(pending.len(), 1);
    assert_ne!(pending[0].id(), hit.id());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn set_request_rules_leaves_websocket_rules_alone() {
    let server = started(options()).await;
    server.get("/old").then_reply(200, "old").unwrap();
    let ws = server.any_websocket().then_echo().unwrap();

    server.set_request_rules(Vec::new()).unwrap();

    // The HTTP rule is gone, the WS rule survives.
    let response = reqwest::get(server.url_for("/old").unwrap()).await.unwrap();
    assert_eq!(response.status(), 503);
    assert!(server
        .mocked_endpoints()
        .iter()
        .any(|endpoint| endpoint.id() == ws.id()));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn proxy_env_points_at_the_server() {
    let server = started(options()).await;
    let env = server.proxy_env().unwrap();
    assert_eq!(env.http_proxy, server.url().unwrap());
    assert_eq!(env.https_proxy, server.url().unwrap());
    server.stop().await.unwrap();
}

#[tokio::test]
async fn stopping_refuses_new_url_access() {
    let server = started(options()).await;
    server.stop().await.unwrap();
    assert!(server.url().is_err());
    assert!(server.stop().await.is_err());
}
