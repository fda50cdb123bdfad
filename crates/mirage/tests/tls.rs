//! HTTPS termination, CONNECT-proxy MITM, and TLS error reporting.

use std::time::Duration;

use mirage::{generate_ca, EventKind, HttpsOptions, MockServer, MockServerOptions, ServerEvent};

fn https_options() -> (MockServerOptions, String) {
    let (cert_pem, key_pem) = generate_ca("mirage test CA").unwrap();
    let options = MockServerOptions {
        https: Some(HttpsOptions::from_pem(key_pem, cert_pem.clone())),
        ..Default::default()
    };
    (options, cert_pem)
}

fn trusting_client(ca_pem: &str) -> reqwest::Client {
    reqwest::Client::builder()
        .add_root_certificate(reqwest::Certificate::from_pem(ca_pem.as_bytes()).unwrap())
        .build()
        .unwrap()
}

#[tokio::test]
async fn direct_https_with_minted_certificate() {
    let (options, ca_pem) = https_options();
    let server = MockServer::new(options).unwrap();
    server.start(None).await.unwrap();
    server.get("/secure").then_reply(200, "over tls").unwrap();

    let client = trusting_client(&ca_pem);
    let response = client
        .get(server.url_for("/secure").unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "over tls");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn connect_proxy_mitm_serves_mocked_https_origin() {
    let (options, ca_pem) = https_options();
    let server = MockServer::new(options).unwrap();
    server.start(None).await.unwrap();
    server
        .get("https://example.test/")
        .then_reply(200, "ok")
        .unwrap();

    // The client never resolves example.test: it CONNECTs through the mock
    // server, which answers the TLS handshake with a leaf minted for the
    // requested SNI.
    let proxy_url = format!("http://localhost:{}", server.port().unwrap());
    let client = reqwest::Client::builder()
        .add_root_certificate(reqwest::Certificate::from_pem(ca_pem.as_bytes()).unwrap())
        .proxy(reqwest::Proxy::all(&proxy_url).unwrap())
        .build()
        .unwrap();

    let response = client.get("https://example.test/").send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "ok");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn untrusting_client_fails_the_handshake_and_event_fires() {
    let (options, _ca_pem) = https_options();
    let server = MockServer::new(options).unwrap();
    let mut tls_errors = server.subscribe(EventKind::TlsClientError);
    server.start(None).await.unwrap();
    server.get("/secure").then_reply(200, "over tls").unwrap();

    // Default trust store does not contain the test CA.
    let client = reqwest::Client::new();
    let result = client
        .get(server.url_for("/secure").unwrap())
        .send()
        .await;
    assert!(result.is_err());

    let event = tokio::time::timeout(Duration::from_secs(2), tls_errors.recv())
        .await
        .ok()
        .flatten();
    match event {
        Some(ServerEvent::TlsClientError(e)) => {
            assert_eq!(e.sni.as_deref(), Some("localhost"));
        }
        other => panic!("expected tls-client-error, got {other:?}"),
    }

    server.stop().await.unwrap();
}

#[tokio::test]
async fn zero_byte_tls_connection_fires_tls_client_error() {
    let (options, _ca_pem) = https_options();
    let server = MockServer::new(options).unwrap();
    let mut tls_errors = server.subscribe(EventKind::TlsClientError);
    server.start(None).await.unwrap();

    // Connect and immediately hang up without a ClientHello.
    let addr = format!("127.0.0.1:{}", server.port().unwrap());
    let stream = tokio::net::TcpStream::connect(&addr).await.unwrap();
    drop(stream);

    let event = tokio::time::timeout(Duration::from_secs(2), tls_errors.recv())
        .await
        .ok()
        .flatten();
    assert!(
        matches!(event, Some(ServerEvent::TlsClientError(_))),
        "got {event:?}"
    );

    server.stop().await.unwrap();
}

#[tokio::test]
async fn both_inline_and_path_material_is_rejected() {
    let (cert_pem, key_pem) = generate_ca("dup ca").unwrap();
    let result = MockServer::new(MockServerOptions {
        https: Some(HttpsOptions {
            key: Some(key_pem),
            key_path: Some("ca.key".into()),
            cert: Some(cert_pem),
            cert_path: None,
        }),
        ..Default::default()
    });
    assert!(matches!(result, Err(mirage::MockError::Config(_))));
}
