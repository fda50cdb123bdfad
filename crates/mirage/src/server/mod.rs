//! Server façade and lifecycle.
//!
//! [`MockServer`] owns the rule store, event bus, certificate authority and
//! passthrough client, and drives the listener. Multiple servers coexist
//! without cross-talk: every piece of state is per-instance.

mod cors;
mod executor;
mod listener;
mod service;
mod websocket;

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::Method;
use parking_lot::Mutex;
use regex::Regex;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::client::PassthroughClient;
use crate::config::{MockServerOptions, PortSpec};
use crate::error::{MockError, Result};
use crate::events::{EventBus, EventKind, EventSubscription, ServerEvent};
use crate::matcher::RequestMatcher;
use crate::request::Scheme;
use crate::rule::{
    MockedEndpoint, RequestRuleBuilder, Rule, RuleProtocol, RuleStore, WsRuleBuilder,
};
use crate::tls::CertificateAuthority;

/// Proxy environment variables pointing at this server, for handing to
/// subprocesses under test.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyEnv {
    pub http_proxy: String,
    pub https_proxy: String,
}

impl ProxyEnv {
    /// `(name, value)` pairs ready for `Command::envs`.
    pub fn vars(&self) -> [(&'static str, String); 2] {
        [
            ("HTTP_PROXY", self.http_proxy.clone()),
            ("HTTPS_PROXY", self.https_proxy.clone()),
        ]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct Lifecycle {
    status: ServerStatus,
    port: Option<u16>,
    shutdown: Option<broadcast::Sender<()>>,
    accept_task: Option<JoinHandle<()>>,
}

pub(crate) struct ServerInner {
    pub(crate) options: MockServerOptions,
    pub(crate) store: RuleStore,
    pub(crate) events: Arc<EventBus>,
    pub(crate) ca: Option<Arc<CertificateAuthority>>,
    pub(crate) passthrough: PassthroughClient,
    pub(crate) next_request_id: AtomicU64,
    pub(crate) debug: AtomicBool,
    pub(crate) active_connections: AtomicUsize,
    lifecycle: Mutex<Lifecycle>,
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        self.events.close();
        if let Some(task) = self.lifecycle.lock().accept_task.take() {
            task.abort();
        }
    }
}

/// A programmable HTTP/HTTPS/WebSocket mock server and intercepting proxy.
#[derive(Clone)]
pub struct MockServer {
    inner: Arc<ServerInner>,
}

impl MockServer {
    pub fn new(options: MockServerOptions) -> Result<Self> {
        options.validate()?;
        crate::tls::init_crypto();

        let ca = match &options.https {
            Some(https) => Some(Arc::new(CertificateAuthority::from_options(https)?)),
            None => None,
        };
        let debug = AtomicBool::new(options.debug);

        Ok(Self {
            inner: Arc::new(ServerInner {
                options,
                store: RuleStore::new(),
                events: Arc::new(EventBus::new()),
                ca,
                passthrough: PassthroughClient::new(),
                next_request_id: AtomicU64::new(0),
                debug,
                active_connections: AtomicUsize::new(0),
                lifecycle: Mutex::new(Lifecycle {
                    status: ServerStatus::Stopped,
                    port: None,
                    shutdown: None,
                    accept_task: None,
                }),
            }),
        })
    }

    // ----- lifecycle -----

    /// Bind and start serving. Fails if the server is already running or no
    /// port in the requested spec could be bound. `None` binds an ephemeral
    /// port.
    pub async fn start(&self, port: impl Into<Option<PortSpec>>) -> Result<()> {
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            match lifecycle.status {
                ServerStatus::Stopped => lifecycle.status = ServerStatus::Starting,
                _ => return Err(MockError::AlreadyRunning),
            }
        }

        let (listener, port) = match bind_listener(port.into()).await {
            Ok(bound) => bound,
            Err(e) => {
                self.inner.lifecycle.lock().status = ServerStatus::Stopped;
                return Err(e);
            }
        };

        let (shutdown_tx, _) = broadcast::channel(1);
        let accept_task = tokio::spawn(listener::accept_loop(
            listener,
            Arc::clone(&self.inner),
            shutdown_tx.clone(),
        ));

        let mut lifecycle = self.inner.lifecycle.lock();
        lifecycle.status = ServerStatus::Running;
        lifecycle.port = Some(port);
        lifecycle.shutdown = Some(shutdown_tx);
        lifecycle.accept_task = Some(accept_task);
        info!(port, https = self.inner.ca.is_some(), "mock server listening");
        Ok(())
    }

    /// Signal shutdown, wait up to the configured grace window for in-flight
    /// exchanges to drain, then hard-close what remains.
    pub async fn stop(&self) -> Result<()> {
        let (shutdown, accept_task) = {
            let mut lifecycle = self.inner.lifecycle.lock();
            if lifecycle.status != ServerStatus::Running {
                return Err(MockError::NotRunning);
            }
            lifecycle.status = ServerStatus::Stopping;
            (lifecycle.shutdown.take(), lifecycle.accept_task.take())
        };

        if let Some(tx) = &shutdown {
            let _ = tx.send(());
        }

        let deadline = Instant::now() + self.inner.options.shutdown_grace;
        while self.inner.active_connections.load(Ordering::SeqCst) > 0
            && Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        if let Some(task) = accept_task {
            task.abort();
            let _ = task.await;
        }

        let mut lifecycle = self.inner.lifecycle.lock();
        lifecycle.status = ServerStatus::Stopped;
        lifecycle.port = None;
        info!("mock server stopped");
        Ok(())
    }

    /// Remove every rule (both protocols and the fallback) and zero all
    /// endpoint counters. Live connections and the certificate cache are
    /// untouched.
    pub fn reset(&self) {
        self.inner.store.reset();
        debug!("rules and counters reset");
    }

    pub fn status(&self) -> ServerStatus {
        self.inner.lifecycle.lock().status
    }

    /// Turn on verbose per-exchange logging for this instance.
    pub fn enable_debug(&self) {
        self.inner.debug.store(true, Ordering::SeqCst);
        info!("debug logging enabled");
    }

    // ----- accessors -----

    fn require_running(&self) -> Result<u16> {
        let lifecycle = self.inner.lifecycle.lock();
        match (lifecycle.status, lifecycle.port) {
            (ServerStatus::Running, Some(port)) => Ok(port),
            _ => Err(MockError::NotRunning),
        }
    }

    pub fn port(&self) -> Result<u16> {
        self.require_running()
    }

    /// Base URL of the running server, e.g. `http://localhost:8080`.
    pub fn url(&self) -> Result<String> {
        let port = self.require_running()?;
        let scheme = if self.inner.ca.is_some() {
            Scheme::Https
        } else {
            Scheme::Http
        };
        Ok(format!("{}://localhost:{}", scheme.as_str(), port))
    }

    /// `url() + path`, without any normalization.
    pub fn url_for(&self, path: &str) -> Result<String> {
        Ok(format!("{}{}", self.url()?, path))
    }

    pub fn proxy_env(&self) -> Result<ProxyEnv> {
        let url = self.url()?;
        Ok(ProxyEnv {
            http_proxy: url.clone(),
            https_proxy: url,
        })
    }

    /// The CA certificate clients must trust when HTTPS is configured.
    pub fn ca_cert_pem(&self) -> Option<&str> {
        self.inner.ca.as_ref().map(|ca| ca.ca_cert_pem())
    }

    // ----- rule registration -----

    fn verb(&self, method: Method, url: impl IntoUrlMatcher) -> RequestRuleBuilder<'_> {
        let mut matchers = vec![RequestMatcher::Method(method)];
        if let Some(url) = url.into_url_matcher() {
            matchers.push(url);
        }
        RequestRuleBuilder::new(self, matchers)
    }

    pub fn get(&self, url: impl IntoUrlMatcher) -> RequestRuleBuilder<'_> {
        self.verb(Method::GET, url)
    }

    pub fn post(&self, url: impl IntoUrlMatcher) -> RequestRuleBuilder<'_> {
        self.verb(Method::POST, url)
    }

    pub fn put(&self, url: impl IntoUrlMatcher) -> RequestRuleBuilder<'_> {
        self.verb(Method::PUT, url)
    }

    pub fn delete(&self, url: impl IntoUrlMatcher) -> RequestRuleBuilder<'_> {
        self.verb(Method::DELETE, url)
    }

    pub fn patch(&self, url: impl IntoUrlMatcher) -> RequestRuleBuilder<'_> {
        self.verb(Method::PATCH, url)
    }

    pub fn head(&self, url: impl IntoUrlMatcher) -> RequestRuleBuilder<'_> {
        self.verb(Method::HEAD, url)
    }

    /// Match preflight-style `OPTIONS` requests. Registration through this
    /// builder fails when automatic CORS handling is enabled.
    pub fn options(&self, url: impl IntoUrlMatcher) -> RequestRuleBuilder<'_> {
        self.verb(Method::OPTIONS, url)
    }

    /// Match every HTTP request regardless of method or URL.
    pub fn any_request(&self) -> RequestRuleBuilder<'_> {
        RequestRuleBuilder::new(self, Vec::new())
    }

    /// Register the fallback rule, used only when no ordinary rule matches
    /// with remaining capacity.
    pub fn unmatched_request(&self) -> RequestRuleBuilder<'_> {
        RequestRuleBuilder::fallback(self)
    }

    /// Match every WebSocket upgrade.
    pub fn any_websocket(&self) -> WsRuleBuilder<'_> {
        WsRuleBuilder::new(self, Vec::new())
    }

    /// Append pre-built HTTP rules, in order.
    pub fn add_request_rules(&self, rules: Vec<Rule>) -> Result<Vec<MockedEndpoint>> {
        self.check_mutable()?;
        rules
            .into_iter()
            .map(|rule| self.register_http_rule(rule, false))
            .collect()
    }

    /// Atomically replace the HTTP rule list. WebSocket rules and the
    /// fallback rule are left untouched.
    pub fn set_request_rules(&self, rules: Vec<Rule>) -> Result<Vec<MockedEndpoint>> {
        self.check_mutable()?;
        for rule in &rules {
            self.validate_http_rule(rule)?;
        }
        let entries = self.inner.store.set(RuleProtocol::Http, rules);
        Ok(entries.into_iter().map(MockedEndpoint::new).collect())
    }

    pub fn add_websocket_rules(&self, rules: Vec<Rule>) -> Result<Vec<MockedEndpoint>> {
        self.check_mutable()?;
        rules
            .into_iter()
            .map(|rule| self.register_ws_rule(rule))
            .collect()
    }

    /// Atomically replace the WebSocket rule list. HTTP rules are left
    /// untouched.
    pub fn set_websocket_rules(&self, rules: Vec<Rule>) -> Result<Vec<MockedEndpoint>> {
        self.check_mutable()?;
        for rule in &rules {
            if rule.protocol != RuleProtocol::WebSocket {
                return Err(MockError::Config(
                    "set_websocket_rules given a non-WebSocket rule".into(),
                ));
            }
        }
        let entries = self.inner.store.set(RuleProtocol::WebSocket, rules);
        Ok(entries.into_iter().map(MockedEndpoint::new).collect())
    }

    #[deprecated(note = "use add_request_rules")]
    pub fn add_rule(&self, rule: Rule) -> Result<MockedEndpoint> {
        let mut endpoints = self.add_request_rules(vec![rule])?;
        Ok(endpoints.remove(0))
    }

    #[deprecated(note = "use add_request_rules")]
    pub fn add_rules(&self, rules: Vec<Rule>) -> Result<Vec<MockedEndpoint>> {
        self.add_request_rules(rules)
    }

    #[deprecated(note = "use set_request_rules")]
    pub fn set_rule(&self, rule: Rule) -> Result<MockedEndpoint> {
        let mut endpoints = self.set_request_rules(vec![rule])?;
        Ok(endpoints.remove(0))
    }

    #[deprecated(note = "use set_request_rules")]
    pub fn set_rules(&self, rules: Vec<Rule>) -> Result<Vec<MockedEndpoint>> {
        self.set_request_rules(rules)
    }

    /// Handles for every currently registered rule.
    pub fn mocked_endpoints(&self) -> Vec<MockedEndpoint> {
        let snapshot = self.inner.store.snapshot();
        snapshot
            .http
            .iter()
            .chain(snapshot.ws.iter())
            .chain(snapshot.fallback.iter())
            .cloned()
            .map(MockedEndpoint::new)
            .collect()
    }

    /// Endpoints that still expect traffic.
    pub fn pending_endpoints(&self) -> Vec<MockedEndpoint> {
        self.mocked_endpoints()
            .into_iter()
            .filter(MockedEndpoint::is_pending)
            .collect()
    }

    // ----- events -----

    /// Subscribe to one lifecycle event kind. Once this returns, every
    /// subsequently emitted event of that kind is delivered.
    pub fn subscribe(&self, kind: EventKind) -> EventSubscription {
        self.inner.events.subscribe(kind)
    }

    /// Callback-style subscription; the callback runs on a background task.
    pub fn on_event<F>(&self, kind: EventKind, mut callback: F)
    where
        F: FnMut(ServerEvent) + Send + 'static,
    {
        let mut subscription = self.subscribe(kind);
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                callback(event);
            }
        });
    }

    // ----- internals shared with the builders -----

    fn check_mutable(&self) -> Result<()> {
        match self.inner.lifecycle.lock().status {
            ServerStatus::Running | ServerStatus::Stopped => Ok(()),
            status => Err(MockError::Config(format!(
                "rules cannot be changed while the server is {status:?}"
            ))),
        }
    }

    fn validate_http_rule(&self, rule: &Rule) -> Result<()> {
        if rule.protocol != RuleProtocol::Http {
            return Err(MockError::Config(
                "an HTTP rule list was given a non-HTTP rule".into(),
            ));
        }
        if self.inner.options.cors.is_some() && mentions_method(&rule.matcher, &Method::OPTIONS) {
            return Err(MockError::Config(
                "OPTIONS rules cannot be registered while automatic CORS handling is enabled"
                    .into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn register_http_rule(&self, rule: Rule, fallback: bool) -> Result<MockedEndpoint> {
        self.check_mutable()?;
        self.validate_http_rule(&rule)?;
        let entry = if fallback {
            self.inner.store.set_fallback(rule)?
        } else {
            self.inner.store.add(rule)
        };
        Ok(MockedEndpoint::new(entry))
    }

    pub(crate) fn register_ws_rule(&self, rule: Rule) -> Result<MockedEndpoint> {
        self.check_mutable()?;
        if rule.protocol != RuleProtocol::WebSocket {
            return Err(MockError::Config(
                "a WebSocket rule list was given a non-WebSocket rule".into(),
            ));
        }
        Ok(MockedEndpoint::new(self.inner.store.add(rule)))
    }
}

impl fmt::Debug for MockServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lifecycle = self.inner.lifecycle.lock();
        f.debug_struct("MockServer")
            .field("status", &lifecycle.status)
            .field("port", &lifecycle.port)
            .field("https", &self.inner.ca.is_some())
            .finish()
    }
}

/// URL argument accepted by the verb helpers: a path/URL string, a regex,
/// or `()` for "any URL".
pub trait IntoUrlMatcher {
    fn into_url_matcher(self) -> Option<RequestMatcher>;
}

impl IntoUrlMatcher for &str {
    fn into_url_matcher(self) -> Option<RequestMatcher> {
        Some(RequestMatcher::Url(self.to_string()))
    }
}

impl IntoUrlMatcher for String {
    fn into_url_matcher(self) -> Option<RequestMatcher> {
        Some(RequestMatcher::Url(self))
    }
}

impl IntoUrlMatcher for Regex {
    fn into_url_matcher(self) -> Option<RequestMatcher> {
        Some(RequestMatcher::UrlRegex(self))
    }
}

impl IntoUrlMatcher for () {
    fn into_url_matcher(self) -> Option<RequestMatcher> {
        None
    }
}

fn mentions_method(matcher: &RequestMatcher, method: &Method) -> bool {
    match matcher {
        RequestMatcher::Method(m) => m == method,
        RequestMatcher::All(children) | RequestMatcher::Any(children) => {
            children.iter().any(|m| mentions_method(m, method))
        }
        _ => false,
    }
}

async fn bind_listener(spec: Option<PortSpec>) -> Result<(TcpListener, u16)> {
    let bind = |port: u16| async move {
        TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], port))).await
    };
    match spec {
        None => {
            let listener = bind(0).await.map_err(|e| MockError::Bind { port: 0, source: e })?;
            let port = listener.local_addr()?.port();
            Ok((listener, port))
        }
        Some(PortSpec::Exact(port)) => {
            let listener = bind(port)
                .await
                .map_err(|e| MockError::Bind { port, source: e })?;
            Ok((listener, port))
        }
        Some(PortSpec::Range { start, end }) => {
            for port in start..=end {
                if let Ok(listener) = bind(port).await {
                    return Ok((listener, port));
                }
            }
            Err(MockError::PortRangeExhausted { start, end })
        }
    }
}
