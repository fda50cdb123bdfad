//! HTTP/2 offer policy on plaintext connections, driven with a raw TCP
//! client speaking the prior-knowledge preface.

use std::time::Duration;

use mirage::{Http2Mode, MockServer, MockServerOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const H2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
// An empty SETTINGS frame, sent by every h2 client right after the preface.
const H2_CLIENT_SETTINGS: &[u8] = &[0, 0, 0, 4, 0, 0, 0, 0, 0];

async fn speak_h2_preface(server: &MockServer) -> Vec<u8> {
    let addr = format!("127.0.0.1:{}", server.port().unwrap());
    let mut stream = TcpStream::connect(&addr).await.unwrap();
    stream.write_all(H2_PREFACE).await.unwrap();
    stream.write_all(H2_CLIENT_SETTINGS).await.unwrap();
    stream.flush().await.unwrap();

    let mut collected = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => collected.extend_from_slice(&buf[..n]),
            Ok(Err(_)) => break,
        }
    }
    collected
}

/// First wire bytes of an h2 server are a SETTINGS frame (type 0x04).
fn is_h2_settings(bytes: &[u8]) -> bool {
    bytes.len() >= 9 && bytes[3] == 0x04
}

#[tokio::test]
async fn fallback_without_https_refuses_plain_h2_prior_knowledge() {
    // Default options: no HTTPS, http2 = Fallback, which must behave as
    // Disabled on plain connections.
    let server = MockServer::new(MockServerOptions::default()).unwrap();
    server.start(None).await.unwrap();
    server.any_request().then_reply(200, "ok").unwrap();

    let reply = speak_h2_preface(&server).await;
    assert!(
        !is_h2_settings(&reply),
        "plain connection negotiated h2 under Fallback without HTTPS: {reply:?}"
    );
    // The HTTP/1.1 parser either rejects the preface outright or closes.
    assert!(
        reply.is_empty() || reply.starts_with(b"HTTP/1.1"),
        "unexpected reply to h2 preface: {reply:?}"
    );

    server.stop().await.unwrap();
}

#[tokio::test]
async fn disabled_mode_refuses_plain_h2_prior_knowledge() {
    let server = MockServer::new(MockServerOptions {
        http2: Http2Mode::Disabled,
        ..Default::default()
    })
    .unwrap();
    server.start(None).await.unwrap();

    let reply = speak_h2_preface(&server).await;
    assert!(!is_h2_settings(&reply), "got h2 SETTINGS under Disabled: {reply:?}");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn enabled_mode_accepts_plain_h2_prior_knowledge() {
    let server = MockServer::new(MockServerOptions {
        http2: Http2Mode::Enabled,
        ..Default::default()
    })
    .unwrap();
    server.start(None).await.unwrap();

    let reply = speak_h2_preface(&server).await;
    assert!(
        is_h2_settings(&reply),
        "expected an h2 SETTINGS frame under Enabled: {reply:?}"
    );

    server.stop().await.unwrap();
}
