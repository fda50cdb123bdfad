//! TCP accept loop and connection classification.
//!
//! Every connection (initial TCP or a CONNECT tunnel looping back) goes
//! through the same steps: read one byte, rewind, and decide. A TLS
//! ClientHello gets terminated with a certificate minted for its SNI, and
//! everything else is served as HTTP (h2 by ALPN or prior knowledge,
//! otherwise HTTP/1.1).

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, error, info, warn};

use super::service;
use crate::config::Http2Mode;
use crate::events::{ServerEvent, TlsClientErrorEvent};
use crate::request::Scheme;
use crate::server::ServerInner;
use crate::tls::CertificateAuthority;

/// Shared per-connection context, cloned into the request service.
#[derive(Clone)]
pub(crate) struct ConnCtx {
    pub server: Arc<ServerInner>,
    pub remote_addr: SocketAddr,
    pub scheme: Scheme,
    /// `host:port` from an enclosing CONNECT, if any.
    pub tunnel_target: Option<(String, u16)>,
    pub sni: Option<String>,
    pub reset_handle: Option<Arc<ResetHandle>>,
    pub shutdown: broadcast::Sender<()>,
}

/// Keeps a dup of the accepted socket so a reset-connection rule can arm
/// `SO_LINGER(0)` before hyper drops the stream, turning the close into an
/// RST.
pub(crate) struct ResetHandle {
    #[cfg(unix)]
    fd: std::os::fd::OwnedFd,
}

impl ResetHandle {
    fn dup(stream: &TcpStream) -> Option<Arc<Self>> {
        #[cfg(unix)]
        {
            use std::os::fd::AsFd;
            stream
                .as_fd()
                .try_clone_to_owned()
                .ok()
                .map(|fd| Arc::new(Self { fd }))
        }
        #[cfg(not(unix))]
        {
            let _ = stream;
            None
        }
    }

    pub(crate) fn arm(&self) {
        #[cfg(unix)]
        {
            let sock = socket2::SockRef::from(&self.fd);
            if let Err(e) = sock.set_linger(Some(Duration::from_secs(0))) {
                warn!("failed to arm connection reset: {e}");
            }
        }
    }
}

struct ConnGuard(Arc<ServerInner>);

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.active_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) async fn accept_loop(
    listener: TcpListener,
    server: Arc<ServerInner>,
    shutdown: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown.subscribe();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, remote_addr)) => {
                        debug!(%remote_addr, "new connection");
                        let _ = stream.set_nodelay(true);
                        let reset_handle = ResetHandle::dup(&stream);
                        server.active_connections.fetch_add(1, Ordering::SeqCst);
                        let ctx = ConnCtx {
                            server: Arc::clone(&server),
                            remote_addr,
                            scheme: Scheme::Http,
                            tunnel_target: None,
                            sni: None,
                            reset_handle,
                            shutdown: shutdown.clone(),
                        };
                        tokio::spawn(async move {
                            let _guard = ConnGuard(Arc::clone(&ctx.server));
                            if let Err(e) = handle_connection(stream, ctx).await {
                                debug!(%remote_addr, "connection ended with error: {e:#}");
                            }
                        });
                    }
                    Err(e) => {
                        // One bad accept must not kill the listener.
                        error!("accept error: {e}");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("listener shutting down");
                break;
            }
        }
    }
}

/// Classify and serve one stream. Generic so CONNECT tunnels can loop back
/// into it with the upgraded inner stream.
///
/// Returns a boxed future rather than being an `async fn`: this function is
/// (indirectly, via CONNECT tunnels) recursive, and rustc cannot resolve the
/// hidden type of a recursive `-> impl Future` opaque type.
pub(crate) fn handle_connection<S>(
    mut stream: S,
    ctx: ConnCtx,
) -> Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    Box::pin(async move {
        let mut first = [0u8; 1];
        let n = stream.read(&mut first).await?;
        if n == 0 {
            // The peer connected and went away without a single byte. With TLS
            // configured this is reported as a TLS client error, SNI unknown.
            if ctx.server.ca.is_some() {
                ctx.server.events.emit(ServerEvent::TlsClientError(TlsClientErrorEvent {
                    remote_addr: Some(ctx.remote_addr),
                    sni: ctx.sni.clone(),
                    message: "connection closed before any data was sent".into(),
                }));
            } else {
                ctx.server.events.emit(ServerEvent::ClientError(
                    crate::events::ClientErrorEvent {
                        remote_addr: Some(ctx.remote_addr),
                        message: "connection closed before a request line was sent".into(),
                    },
                ));
            }
            return Ok(());
        }

        let rewound = Rewind::new(Bytes::copy_from_slice(&first[..n]), stream);

        // 0x16 = TLS handshake record.
        if first[0] == 0x16 {
            match ctx.server.ca.clone() {
                Some(ca) => return terminate_tls(rewound, ca, ctx).await,
                None => {
                    ctx.server.events.emit(ServerEvent::TlsClientError(TlsClientErrorEvent {
                        remote_addr: Some(ctx.remote_addr),
                        sni: None,
                        message: "TLS ClientHello received but HTTPS is not configured".into(),
                    }));
                    return Ok(());
                }
            }
        }

        serve_http(rewound, ctx).await
    })
}

async fn terminate_tls<S>(
    stream: S,
    ca: Arc<CertificateAuthority>,
    mut ctx: ConnCtx,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let tls_error = |ctx: &ConnCtx, sni: Option<String>, message: String| {
        ctx.server.events.emit(ServerEvent::TlsClientError(TlsClientErrorEvent {
            remote_addr: Some(ctx.remote_addr),
            sni,
            message,
        }));
    };

    let start = match LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream).await {
        Ok(start) => start,
        Err(e) => {
            tls_error(&ctx, None, format!("TLS handshake failed: {e}"));
            return Ok(());
        }
    };

    let (sni, client_alpn) = {
        let hello = start.client_hello();
        let sni = hello.server_name().map(str::to_string);
        let alpn: Vec<Vec<u8>> = hello
            .alpn()
            .map(|protos| protos.map(<[u8]>::to_vec).collect())
            .unwrap_or_default();
        (sni, alpn)
    };

    // SNI drives certificate selection; CONNECT targets cover clients that
    // send none.
    let host = sni
        .clone()
        .or_else(|| ctx.tunnel_target.as_ref().map(|(host, _)| host.clone()))
        .unwrap_or_else(|| "localhost".to_string());

    let offer = alpn_offer(ctx.server.options.http2, &client_alpn);
    let config = match ca.server_config_for(&host, offer) {
        Ok(config) => config,
        Err(e) => {
            tls_error(&ctx, sni, format!("no certificate available for {host}: {e}"));
            return Ok(());
        }
    };

    let tls_stream = match start.into_stream(config).await {
        Ok(tls_stream) => tls_stream,
        Err(e) => {
            tls_error(&ctx, sni, format!("TLS handshake failed: {e}"));
            return Ok(());
        }
    };

    debug!(%host, alpn_h2 = tls_stream.get_ref().1.alpn_protocol() == Some(b"h2"), "TLS established");
    ctx.scheme = Scheme::Https;
    ctx.sni = sni;
    serve_http(tls_stream, ctx).await
}

/// Which protocols to offer in the ALPN extension.
fn alpn_offer(mode: Http2Mode, client_alpn: &[Vec<u8>]) -> Vec<Vec<u8>> {
    let h1 = b"http/1.1".to_vec();
    let h2 = b"h2".to_vec();
    match mode {
        Http2Mode::Enabled => vec![h2, h1],
        Http2Mode::Disabled => vec![h1],
        Http2Mode::Fallback => {
            let client_has_h1 = client_alpn.iter().any(|p| p.as_slice() == b"http/1.1");
            if client_alpn.is_empty() || client_has_h1 {
                vec![h1]
            } else {
                vec![h2, h1]
            }
        }
    }
}

async fn serve_http<S>(io: S, ctx: ConnCtx) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut shutdown_rx = ctx.shutdown.subscribe();
    let grace = ctx.server.options.shutdown_grace;
    let events = Arc::clone(&ctx.server.events);
    let remote_addr = ctx.remote_addr;
    // Without HTTPS configured, `Fallback` behaves as `Disabled`: plain
    // connections must not be offered h2, including via prior knowledge.
    let h1_only = match ctx.server.options.http2 {
        Http2Mode::Disabled => true,
        Http2Mode::Fallback => ctx.server.ca.is_none(),
        Http2Mode::Enabled => false,
    };

    let service_ctx = ctx.clone();
    let service = service_fn(move |req| {
        let ctx = service_ctx.clone();
        async move { service::handle_request(ctx, req).await }
    });

    let report = |result: Result<(), Box<dyn std::error::Error + Send + Sync>>| {
        if let Err(e) = result {
            if service::is_terminal_action(e.as_ref()) {
                // A close/reset rule ended the connection on purpose.
                return;
            }
            events.emit(ServerEvent::ClientError(crate::events::ClientErrorEvent {
                remote_addr: Some(remote_addr),
                message: format!("connection error: {e}"),
            }));
        }
    };

    if h1_only {
        let conn = hyper::server::conn::http1::Builder::new()
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades();
        tokio::pin!(conn);
        tokio::select! {
            result = conn.as_mut() => report(result.map_err(Into::into)),
            _ = shutdown_rx.recv() => {
                conn.as_mut().graceful_shutdown();
                let _ = tokio::time::timeout(grace, conn.as_mut()).await;
            }
        }
    } else {
        let builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
        let conn = builder.serve_connection_with_upgrades(TokioIo::new(io), service);
        tokio::pin!(conn);
        tokio::select! {
            result = conn.as_mut() => report(result),
            _ = shutdown_rx.recv() => {
                conn.as_mut().graceful_shutdown();
                let _ = tokio::time::timeout(grace, conn.as_mut()).await;
            }
        }
    }
    Ok(())
}

/// Raw CONNECT tunnel for servers without HTTPS interception: bytes are
/// copied to the origin untouched.
pub(crate) async fn tunnel_raw<S>(mut client: S, mut upstream: TcpStream) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((sent, received)) => {
            debug!(sent, received, "tunnel closed");
            Ok(())
        }
        Err(e) => {
            debug!("tunnel error: {e}");
            Ok(())
        }
    }
}

/// A stream with a buffered prefix that is replayed before the inner
/// stream's own bytes, so connection classification can read ahead.
pub(crate) struct Rewind<S> {
    prefix: Option<Bytes>,
    inner: S,
}

impl<S> Rewind<S> {
    pub(crate) fn new(prefix: Bytes, inner: S) -> Self {
        Self {
            prefix: (!prefix.is_empty()).then_some(prefix),
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if let Some(mut prefix) = self.prefix.take() {
            let n = prefix.len().min(buf.remaining());
            buf.put_slice(&prefix.split_to(n));
            if !prefix.is_empty() {
                self.prefix = Some(prefix);
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
