//! mirage is a programmable HTTP/HTTPS/WebSocket mock server and
//! intercepting proxy for test suites.
//!
//! A test configures rules before (or while) the server runs; each incoming
//! request is matched against those rules in declaration order and the first
//! match with remaining capacity decides the response: a canned reply, a
//! user callback, a streamed body, a file, a held or dropped socket, or a
//! proxied exchange with the real origin. Lifecycle events fan out to
//! subscribers without ever blocking request handling.
//!
//! ```no_run
//! use mirage::{MockServer, MockServerOptions};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let server = MockServer::new(MockServerOptions::default())?;
//! server.start(None).await?;
//!
//! let endpoint = server.get("/hello").then_reply(200, "world")?;
//!
//! let body = reqwest::get(server.url_for("/hello")?).await?.text().await?;
//! assert_eq!(body, "world");
//! assert_eq!(endpoint.request_count(), 1);
//!
//! server.stop().await?;
//! # Ok(())
//! # }
//! ```

mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod matcher;
pub mod request;
pub mod rule;
pub mod server;
pub mod tls;

pub use config::{CorsOptions, Http2Mode, HttpsOptions, MockServerOptions, PortSpec};
pub use error::{MockError, Result};
pub use events::{
    AbortEvent, ClientErrorEvent, EventKind, EventSubscription, RequestEvent,
    RequestInitiatedEvent, ResponseEvent, ServerEvent, TlsClientErrorEvent,
};
pub use matcher::{HeaderValueMatch, RequestMatcher};
pub use request::{
    CapturedBody, Exchange, HeaderList, MockResponse, ParsedRequest, Protocol, Scheme,
};
pub use rule::{
    CompletionLimit, HandlerAction, MockedEndpoint, PassthroughConfig, PassthroughRequest,
    PassthroughResponse, RequestRuleBuilder, Rule, RuleId, RuleProtocol, WsHandlerAction,
    WsPassthroughConfig, WsRuleBuilder,
};
pub use server::{IntoUrlMatcher, MockServer, ProxyEnv, ServerStatus};
pub use tls::{generate_ca, CertificateAuthority};
