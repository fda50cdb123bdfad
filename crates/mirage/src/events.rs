//! Lifecycle event distribution.
//!
//! Subscribers register per event kind; delivery is asynchronous and never
//! blocks request handling. Each subscriber owns a FIFO queue with a soft
//! cap: past the cap the oldest event is dropped and a warning is logged
//! once per subscriber. Per request, events arrive in the order
//! `request-initiated` → (`request` | terminal) → terminal, with at most
//! one terminal event.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::warn;

use crate::request::{MockResponse, ParsedRequest};
use crate::rule::RuleId;

/// Soft cap on a subscriber's queue before oldest-drop kicks in.
const QUEUE_SOFT_CAP: usize = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    RequestInitiated,
    Request,
    Response,
    Abort,
    TlsClientError,
    ClientError,
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "request-initiated" => Ok(EventKind::RequestInitiated),
            "request" => Ok(EventKind::Request),
            "response" => Ok(EventKind::Response),
            "abort" => Ok(EventKind::Abort),
            "tls-client-error" => Ok(EventKind::TlsClientError),
            // Deprecated spelling, kept for backward compatibility.
            "tlsClientError" => Ok(EventKind::TlsClientError),
            "client-error" => Ok(EventKind::ClientError),
            other => Err(format!("unknown event kind: {other}")),
        }
    }
}

/// Emitted as soon as the request head has been parsed, before the body has
/// been read. The carried request has an empty body.
#[derive(Clone, Debug)]
pub struct RequestInitiatedEvent {
    pub request: ParsedRequest,
}

/// Emitted once the body has been read and the request is fully parsed.
#[derive(Clone, Debug)]
pub struct RequestEvent {
    pub request: ParsedRequest,
}

/// The success terminal: emitted before the response bytes are flushed.
#[derive(Clone, Debug)]
pub struct ResponseEvent {
    pub request_id: u64,
    pub rule_id: Option<RuleId>,
    pub response: MockResponse,
}

#[derive(Clone, Debug)]
pub struct AbortEvent {
    pub request_id: Option<u64>,
    pub reason: String,
}

#[derive(Clone, Debug)]
pub struct ClientErrorEvent {
    pub remote_addr: Option<SocketAddr>,
    pub message: String,
}

#[derive(Clone, Debug)]
pub struct TlsClientErrorEvent {
    pub remote_addr: Option<SocketAddr>,
    /// SNI presented by the client, when the handshake got that far.
    pub sni: Option<String>,
    pub message: String,
}

#[derive(Clone, Debug)]
pub enum ServerEvent {
    RequestInitiated(RequestInitiatedEvent),
    Request(RequestEvent),
    Response(ResponseEvent),
    Abort(AbortEvent),
    TlsClientError(TlsClientErrorEvent),
    ClientError(ClientErrorEvent),
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ServerEvent::RequestInitiated(_) => EventKind::RequestInitiated,
            ServerEvent::Request(_) => EventKind::Request,
            ServerEvent::Response(_) => EventKind::Response,
            ServerEvent::Abort(_) => EventKind::Abort,
            ServerEvent::TlsClientError(_) => EventKind::TlsClientError,
            ServerEvent::ClientError(_) => EventKind::ClientError,
        }
    }
}

struct SubscriberQueue {
    events: Mutex<VecDeque<ServerEvent>>,
    notify: Notify,
    overflow_warned: AtomicBool,
    closed: AtomicBool,
}

impl SubscriberQueue {
    fn push(&self, event: ServerEvent) {
        {
            let mut events = self.events.lock();
            if events.len() >= QUEUE_SOFT_CAP {
                events.pop_front();
                if !self.overflow_warned.swap(true, Ordering::Relaxed) {
                    warn!(
                        "event subscriber queue exceeded {} entries, dropping oldest",
                        QUEUE_SOFT_CAP
                    );
                }
            }
            events.push_back(event);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

/// Receiving end of a subscription. Dropping it detaches the subscriber.
pub struct EventSubscription {
    queue: Arc<SubscriberQueue>,
}

impl EventSubscription {
    /// Wait for the next event. Returns `None` once the server has shut the
    /// bus down and the queue has drained.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        loop {
            let notified = self.queue.notify.notified();
            if let Some(event) = self.queue.events.lock().pop_front() {
                return Some(event);
            }
            if self.queue.closed.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }

    pub fn try_recv(&mut self) -> Option<ServerEvent> {
        self.queue.events.lock().pop_front()
    }
}

/// Multiplexes lifecycle events to per-kind subscriber lists.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<(EventKind, Arc<SubscriberQueue>)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. By the time this returns the subscription is
    /// globally visible: any event emitted afterwards is delivered.
    pub fn subscribe(&self, kind: EventKind) -> EventSubscription {
        let queue = Arc::new(SubscriberQueue {
            events: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            overflow_warned: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.subscribers.write().push((kind, Arc::clone(&queue)));
        EventSubscription { queue }
    }

    pub fn emit(&self, event: ServerEvent) {
        let kind = event.kind();
        let subscribers = self.subscribers.read();
        let mut matching = subscribers.iter().filter(|(k, _)| *k == kind).peekable();
        if matching.peek().is_none() {
            return;
        }
        for (_, queue) in matching {
            queue.push(event.clone());
        }
    }

    /// Close every subscription; pending queued events remain readable.
    pub fn close(&self) {
        for (_, queue) in self.subscribers.read().iter() {
            queue.close();
        }
    }
}

/// Per-request emission guard enforcing at-most-once phase semantics: one
/// `request-initiated`, one `request`, one terminal.
pub(crate) struct EventSequence {
    bus: Arc<EventBus>,
    request_sent: AtomicBool,
    terminal_sent: AtomicBool,
}

impl EventSequence {
    pub(crate) fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            request_sent: AtomicBool::new(false),
            terminal_sent: AtomicBool::new(false),
        }
    }

    pub(crate) fn request_initiated(&self, request: ParsedRequest) {
        self.bus
            .emit(ServerEvent::RequestInitiated(RequestInitiatedEvent {
                request,
            }));
    }

    pub(crate) fn request(&self, request: ParsedRequest) {
        if !self.request_sent.swap(true, Ordering::SeqCst) {
            self.bus.emit(ServerEvent::Request(RequestEvent { request }));
        }
    }

    pub(crate) fn response(
        &self,
        request_id: u64,
        rule_id: Option<RuleId>,
        response: MockResponse,
    ) {
        if !self.terminal_sent.swap(true, Ordering::SeqCst) {
            self.bus.emit(ServerEvent::Response(ResponseEvent {
                request_id,
                rule_id,
                response,
            }));
        }
    }

    pub(crate) fn abort(&self, request_id: Option<u64>, reason: impl Into<String>) {
        if !self.terminal_sent.swap(true, Ordering::SeqCst) {
            self.bus.emit(ServerEvent::Abort(AbortEvent {
                request_id,
                reason: reason.into(),
            }));
        }
    }

    pub(crate) fn client_error(&self, remote_addr: Option<SocketAddr>, message: impl Into<String>) {
        if !self.terminal_sent.swap(true, Ordering::SeqCst) {
            self.bus.emit(ServerEvent::ClientError(ClientErrorEvent {
                remote_addr,
                message: message.into(),
            }));
        }
    }
}
