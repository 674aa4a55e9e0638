//! HTTP and HTTPS listeners for the job API.
//!
//! Both protocols share one accept loop. Every connection carries the same
//! bounds: a TLS handshake deadline, a header read timeout for HTTP/1 and an
//! idle timeout after which the connection is shut down gracefully.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use jobservice_config::HttpsConfig;

/// Bound on the TLS handshake and on reading a request's headers.
pub const READ_TIMEOUT: Duration = Duration::from_secs(15);
/// A connection with no bytes moving either way for this long is closed.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct ConnectionLimits {
    read: Duration,
    idle: Duration,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            read: READ_TIMEOUT,
            idle: IDLE_TIMEOUT,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid tls material in {path}: {reason}")]
    Tls { path: String, reason: String },

    #[error("server i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

/// Serve plain HTTP until `shutdown` fires; in-flight requests finish first.
pub async fn serve_http(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    info!(addr = %listener.local_addr()?, "job service listening (http)");
    serve(listener, app, None, ConnectionLimits::default(), shutdown).await;
    info!("http listener stopped");
    Ok(())
}

/// Load the PEM certificate chain and private key named by the config.
pub fn tls_config(https: &HttpsConfig) -> Result<Arc<ServerConfig>, ServerError> {
    let certs = load_certs(Path::new(&https.cert))?;
    let key = load_key(Path::new(&https.key))?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls {
            path: https.cert.clone(),
            reason: e.to_string(),
        })?;
    Ok(Arc::new(config))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let certs = CertificateDer::pem_file_iter(path)
        .and_then(|iter| iter.collect::<Result<Vec<_>, _>>())
        .map_err(|e| ServerError::Tls {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
    if certs.is_empty() {
        return Err(ServerError::Tls {
            path: path.display().to_string(),
            reason: "no certificates found".to_string(),
        });
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
    PrivateKeyDer::from_pem_file(path).map_err(|e| ServerError::Tls {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Serve HTTPS until `shutdown` fires; in-flight requests finish first.
pub async fn serve_https(
    listener: TcpListener,
    app: Router,
    tls: Arc<ServerConfig>,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    info!(addr = %listener.local_addr()?, "job service listening (https)");
    let acceptor = TlsAcceptor::from(tls);
    serve(listener, app, Some(acceptor), ConnectionLimits::default(), shutdown).await;
    info!("https listener stopped");
    Ok(())
}

async fn serve(
    listener: TcpListener,
    app: Router,
    tls: Option<TlsAcceptor>,
    limits: ConnectionLimits,
    shutdown: CancellationToken,
) {
    let connections = TaskTracker::new();

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };

        let app = app.clone();
        let tls = tls.clone();
        let shutdown = shutdown.clone();
        connections.spawn(async move {
            let Some(acceptor) = tls else {
                serve_connection(stream, peer, app, limits, shutdown).await;
                return;
            };
            match tokio::time::timeout(limits.read, acceptor.accept(stream)).await {
                Ok(Ok(stream)) => serve_connection(stream, peer, app, limits, shutdown).await,
                Ok(Err(e)) => debug!(%peer, error = %e, "tls handshake failed"),
                Err(_) => debug!(%peer, "tls handshake timed out"),
            }
        });
    }

    connections.close();
    connections.wait().await;
}

async fn serve_connection<S>(
    stream: S,
    peer: SocketAddr,
    app: Router,
    limits: ConnectionLimits,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let stream = ActivityStream::new(stream);
    let activity = stream.activity();

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(limits.read);
    builder.http2().timer(TokioTimer::new());

    let conn = builder.serve_connection(TokioIo::new(stream), TowerToHyperService::new(app));
    tokio::pin!(conn);

    let mut draining = false;
    loop {
        let idle_deadline = activity.last() + limits.idle;
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!(%peer, error = %e, "connection closed with error");
                }
                break;
            }
            _ = shutdown.cancelled(), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
            _ = tokio::time::sleep_until(idle_deadline), if !draining => {
                if activity.last().elapsed() >= limits.idle {
                    debug!(%peer, "closing idle connection");
                    draining = true;
                    conn.as_mut().graceful_shutdown();
                }
            }
        }
    }
}

/// Time of the last byte read from or written to a connection.
#[derive(Debug, Clone)]
struct Activity(Arc<Mutex<Instant>>);

impl Activity {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    fn touch(&self) {
        *self.0.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }

    fn last(&self) -> Instant {
        *self.0.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Stream wrapper recording I/O progress into an [`Activity`].
struct ActivityStream<S> {
    inner: S,
    activity: Activity,
}

impl<S> ActivityStream<S> {
    fn new(inner: S) -> Self {
        Self {
            inner,
            activity: Activity::new(),
        }
    }

    fn activity(&self) -> Activity {
        self.activity.clone()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ActivityStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let polled = Pin::new(&mut this.inner).poll_read(cx, buf);
        if matches!(polled, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            this.activity.touch();
        }
        polled
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ActivityStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_write(cx, buf);
        if matches!(polled, Poll::Ready(Ok(n)) if n > 0) {
            this.activity.touch();
        }
        polled
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_write_vectored(cx, bufs);
        if matches!(polled, Poll::Ready(Ok(n)) if n > 0) {
            this.activity.touch();
        }
        polled
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_certificate_file_is_a_tls_error() {
        let https = HttpsConfig {
            cert: "/nonexistent/server.crt".to_string(),
            key: "/nonexistent/server.key".to_string(),
        };
        let err = tls_config(&https).unwrap_err();
        assert!(matches!(err, ServerError::Tls { ref path, .. } if path.ends_with("server.crt")));
    }

    #[test]
    fn empty_pem_yields_no_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("empty.crt");
        std::fs::write(&cert, b"").unwrap();
        let err = load_certs(&cert).unwrap_err();
        assert!(err.to_string().contains("no certificates"));
    }

    fn short_limits() -> ConnectionLimits {
        ConnectionLimits {
            read: Duration::from_millis(300),
            idle: Duration::from_millis(300),
        }
    }

    async fn spawn_server(
        tls: Option<TlsAcceptor>,
        limits: ConnectionLimits,
    ) -> (SocketAddr, CancellationToken, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/ping", axum::routing::get(|| async { "pong" }));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(serve(listener, app, tls, limits, shutdown.clone()));
        (addr, shutdown, handle)
    }

    async fn read_to_close(stream: &mut tokio::net::TcpStream) -> Vec<u8> {
        use tokio::io::AsyncReadExt;
        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut received))
            .await
            .expect("server should close the connection")
            .unwrap_or_default();
        received
    }

    #[tokio::test]
    async fn silent_connection_is_closed() {
        let (addr, shutdown, handle) = spawn_server(None, short_limits()).await;

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        read_to_close(&mut stream).await;

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn idle_keep_alive_connection_is_closed_after_a_response() {
        use tokio::io::AsyncWriteExt;

        let (addr, shutdown, handle) = spawn_server(None, short_limits()).await;

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /ping HTTP/1.1\r\nhost: localhost\r\n\r\n")
            .await
            .unwrap();
        let received = read_to_close(&mut stream).await;
        let text = String::from_utf8_lossy(&received);
        assert!(text.starts_with("HTTP/1.1 200"), "unexpected response: {text}");
        assert!(text.ends_with("pong"));

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn stalled_tls_handshake_is_dropped() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let resolver = Arc::new(rustls::server::ResolvesServerCertUsingSni::new());
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        let acceptor = TlsAcceptor::from(Arc::new(config));
        let (addr, shutdown, handle) = spawn_server(Some(acceptor), short_limits()).await;

        // Connect but never send a ClientHello.
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let received = read_to_close(&mut stream).await;
        assert!(received.is_empty());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn activity_tracks_reads_and_writes() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (client, server) = tokio::io::duplex(64);
        let mut wrapped = ActivityStream::new(server);
        let activity = wrapped.activity();
        let start = activity.last();

        tokio::time::sleep(Duration::from_millis(20)).await;
        wrapped.write_all(b"hello").await.unwrap();
        let after_write = activity.last();
        assert!(after_write > start);

        let mut client = client;
        client.write_all(b"x").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut byte = [0u8; 1];
        wrapped.read_exact(&mut byte).await.unwrap();
        assert!(activity.last() > after_write);
    }
}
