//! Proxied rules: forwarding, rewrites, upstream failures. A second
//! MockServer instance stands in for the origin.

use mirage::{MockResponse, MockServer, MockServerOptions, PassthroughConfig};

async fn started() -> MockServer {
    let server = MockServer::new(MockServerOptions::default()).unwrap();
    server.start(None).await.unwrap();
    server
}

/// Origin that echoes method, one header and the body back.
async fn echo_origin() -> MockServer {
    let origin = started().await;
    origin
        .any_request()
        .then_callback(|req| async move {
            let mut response = MockResponse::new(200)
                .with_header("x-echo-method", req.method.as_str())
                .with_header("x-echo-path", req.path.clone())
                .with_body(req.body.raw().clone());
            if let Some(value) = req.header("x-token") {
                response = response.with_header("x-echo-token", value);
            }
            Ok(response)
        })
        .unwrap();
    origin
}

#[tokio::test]
async fn forward_preserves_method_path_headers_and_body() {
    let origin = echo_origin().await;
    let proxy = started().await;
    proxy
        .any_request()
        .then_forward_to(origin.url().unwrap())
        .unwrap();

    let client = reqwest::Client::new();
    let response = client
        .put(proxy.url_for("/things/42?full=1").unwrap())
        .header("x-token", "secret")
        .body("the payload")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-echo-method"], "PUT");
    assert_eq!(response.headers()["x-echo-path"], "/things/42");
    assert_eq!(response.headers()["x-echo-token"], "secret");
    assert_eq!(response.text().await.unwrap(), "the payload");

    origin.stop().await.unwrap();
    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn before_request_hook_rewrites_the_outbound_request() {
    let origin = echo_origin().await;
    let proxy = started().await;

    let config = PassthroughConfig::default()
        .with_target(origin.url().unwrap())
        .with_before_request(|mut req| async move {
            req.headers.remove("x-token");
            req.headers.push("x-token", "rewritten");
            req.body = bytes::Bytes::from_static(b"replaced");
            Ok(req)
        });
    proxy.any_request().then_passthrough_with(config).unwrap();

    let client = reqwest::Client::new();
    let response = client
        .post(proxy.url_for("/p").unwrap())
        .header("x-token", "original")
        .body("original body")
        .send()
        .await
        .unwrap();

    assert_eq!(response.headers()["x-echo-token"], "rewritten");
    assert_eq!(response.text().await.unwrap(), "replaced");

    origin.stop().await.unwrap();
    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn before_response_hook_rewrites_the_relayed_response() {
    let origin = started().await;
    origin.get("/data").then_reply(200, "lowercase").unwrap();

    let proxy = started().await;
    let config = PassthroughConfig::default()
        .with_target(origin.url().unwrap())
        .with_before_response(|mut resp| async move {
            let body = String::from_utf8_lossy(&resp.body).to_uppercase();
            resp.body = body.into();
            resp.headers.push("x-rewritten", "yes");
            Ok(resp)
        });
    proxy.any_request().then_passthrough_with(config).unwrap();

    let response = reqwest::get(proxy.url_for("/data").unwrap()).await.unwrap();
    assert_eq!(response.headers()["x-rewritten"], "yes");
    assert_eq!(response.text().await.unwrap(), "LOWERCASE");

    origin.stop().await.unwrap();
    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn failing_hook_becomes_a_502() {
    let origin = started().await;
    origin.get("/x").then_reply(200, "never seen").unwrap();

    let proxy = started().await;
    let config = PassthroughConfig::default()
        .with_target(origin.url().unwrap())
        .with_before_request(|_req| async move { anyhow::bail!("hook exploded") });
    proxy.any_request().then_passthrough_with(config).unwrap();

    let response = reqwest::get(proxy.url_for("/x").unwrap()).await.unwrap();
    assert_eq!(response.status(), 502);

    origin.stop().await.unwrap();
    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn unreachable_upstream_becomes_a_502() {
    let proxy = started().await;
    // Port 9 (discard) is essentially never listening.
    proxy
        .any_request()
        .then_forward_to("http://127.0.0.1:9")
        .unwrap();

    let response = reqwest::get(proxy.url_for("/x").unwrap()).await.unwrap();
    assert_eq!(response.status(), 502);

    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn oversized_body_still_forwarded_whole() {
    let origin = echo_origin().await;
    let proxy = MockServer::new(MockServerOptions {
        max_body_size: 4,
        ..Default::default()
    })
    .unwrap();
    proxy.start(None).await.unwrap();
    proxy
        .any_request()
        .then_forward_to(origin.url().unwrap())
        .unwrap();

    let payload = "a body far larger than four bytes";
    let client = reqwest::Client::new();
    let response = client
        .post(proxy.url_for("/upload").unwrap())
        .body(payload)
        .send()
        .await
        .unwrap();

    // The capture cap affects matching, not what reaches the origin.
    assert_eq!(response.text().await.unwrap(), payload);

    origin.stop().await.unwrap();
    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn servers_do_not_cross_talk() {
    let one = started().await;
    let two = started().await;
    one.get("/who").then_reply(200, "one").unwrap();
    two.get("/who").then_reply(200, "two").unwrap();

    let from_one = reqwest::get(one.url_for("/who").unwrap())
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let from_two = reqwest::get(two.url_for("/who").unwrap())
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(from_one, "one");
    assert_eq!(from_two, "two");

    one.stop().await.unwrap();
    two.stop().await.unwrap();
}
