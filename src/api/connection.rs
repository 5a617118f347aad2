//! HTTP/2 session lifecycle management.
//!
//! One multiplexed session per client instance, created lazily and
//! re-established after the peer drops it. The spawned connection driver
//! is the single observer of session closure: when it finishes, the
//! closed flag flips and the next caller triggers a fresh handshake.
//! Optional keep-alive sends a PING on a fixed interval while the session
//! stays open; a generation counter cancels stale timers when the session
//! is replaced or keep-alive is disabled.

use crate::error::GatewayError;
use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use h2::client::SendRequest;
use h2::{Ping, PingPong};
use log::{debug, info, warn};
use rustls::pki_types::ServerName;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use url::Url;

/// A live multiplexed session. Cheap to clone; all clones share the
/// stream multiplexer and the closed flag.
#[derive(Clone)]
pub struct Http2Session {
    sender: SendRequest<Bytes>,
    closed: Arc<AtomicBool>,
    ping: Arc<Mutex<Option<PingPong>>>,
}

impl Http2Session {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stream handle for one request. The caller borrows the session for
    /// the duration of one send; errors on the stream mean the attempt
    /// failed, not that the handle can be retried in place.
    pub fn sender(&self) -> SendRequest<Bytes> {
        self.sender.clone()
    }

    /// Send one liveness PING. Returns false when the peer is gone.
    async fn ping(&self) -> bool {
        let mut guard = self.ping.lock().await;
        match guard.as_mut() {
            Some(ping_pong) => ping_pong.ping(Ping::opaque()).await.is_ok(),
            None => false,
        }
    }
}

/// Where the session connects to.
#[derive(Debug, Clone)]
struct Endpoint {
    tls: bool,
    host: String,
    port: u16,
    /// `scheme://authority`, prepended to request paths.
    origin: String,
}

impl Endpoint {
    fn parse(host: &str) -> Result<Self, GatewayError> {
        let url = Url::parse(host)
            .map_err(|e| GatewayError::Config(format!("invalid host '{host}': {e}")))?;
        let tls = match url.scheme() {
            "https" => true,
            "http" => false,
            other => {
                return Err(GatewayError::Config(format!(
                    "unsupported scheme '{other}' in host '{host}'"
                )))
            }
        };
        let hostname = url
            .host_str()
            .ok_or_else(|| GatewayError::Config(format!("host '{host}' has no authority")))?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(if tls { 443 } else { 80 });
        let origin = match url.port() {
            Some(p) => format!("{}://{}:{}", url.scheme(), hostname, p),
            None => format!("{}://{}", url.scheme(), hostname),
        };
        Ok(Endpoint {
            tls,
            host: hostname,
            port,
            origin,
        })
    }
}

/// Owns the session slot. All senders go through [`ensure_session`];
/// nothing else creates or clears connections.
///
/// [`ensure_session`]: ConnectionManager::ensure_session
pub struct ConnectionManager {
    endpoint: Endpoint,
    session: Mutex<Option<Http2Session>>,
    tls_config: Option<Arc<rustls::ClientConfig>>,
    connect_retry_delay: Duration,
    keep_alive: AtomicBool,
    keep_alive_interval: Duration,
    keep_alive_gen: Arc<AtomicU64>,
    dropped: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        host: &str,
        keep_alive: bool,
        keep_alive_interval: Duration,
        connect_retry_delay: Duration,
    ) -> Result<Arc<Self>, GatewayError> {
        let endpoint = Endpoint::parse(host)?;
        let tls_config = endpoint.tls.then(|| {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let mut config = rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            config.alpn_protocols = vec![b"h2".to_vec()];
            Arc::new(config)
        });
        Ok(Arc::new(ConnectionManager {
            endpoint,
            session: Mutex::new(None),
            tls_config,
            connect_retry_delay,
            keep_alive: AtomicBool::new(keep_alive),
            keep_alive_interval,
            keep_alive_gen: Arc::new(AtomicU64::new(0)),
            dropped: AtomicU64::new(0),
        }))
    }

    /// `scheme://authority` for building request URIs.
    pub fn origin(&self) -> &str {
        &self.endpoint.origin
    }

    /// Sessions lost to peer resets or idle timeouts so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    pub async fn is_connected(&self) -> bool {
        matches!(&*self.session.lock().await, Some(s) if !s.is_closed())
    }

    /// Return a live session, reusing the held one when it is still open,
    /// otherwise establishing a new one with up to `max_attempts` tries
    /// spaced by the connect-retry delay.
    pub async fn ensure_session(
        self: &Arc<Self>,
        max_attempts: u32,
    ) -> Result<Http2Session, GatewayError> {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_ref() {
            if !session.is_closed() {
                let session = session.clone();
                self.restart_keep_alive(&session);
                return Ok(session);
            }
            self.dropped.fetch_add(1, Ordering::SeqCst);
            debug!(
                "Session to {} dropped (total {}), reconnecting",
                self.endpoint.origin,
                self.dropped()
            );
            *slot = None;
        }

        let max_attempts = max_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=max_attempts {
            match self.establish().await {
                Ok(session) => {
                    info!("Connected to {} (attempt {})", self.endpoint.origin, attempt);
                    *slot = Some(session.clone());
                    self.restart_keep_alive(&session);
                    return Ok(session);
                }
                Err(e) => {
                    warn!(
                        "Connect to {} failed (attempt {}/{}): {e:#}",
                        self.endpoint.origin, attempt, max_attempts
                    );
                    last_error = Some(e);
                    if attempt < max_attempts {
                        tokio::time::sleep(self.connect_retry_delay).await;
                    }
                }
            }
        }
        Err(GatewayError::Connection(format!(
            "{} unreachable after {} attempts: {:#}",
            self.endpoint.origin,
            max_attempts,
            last_error.unwrap_or_else(|| anyhow!("no attempts made"))
        )))
    }

    /// One TCP (+TLS) connect followed by the HTTP/2 handshake. The
    /// connection driver runs until the session dies, then flips the
    /// closed flag.
    async fn establish(&self) -> Result<Http2Session> {
        let tcp = TcpStream::connect((self.endpoint.host.as_str(), self.endpoint.port))
            .await
            .with_context(|| format!("tcp connect to {}:{}", self.endpoint.host, self.endpoint.port))?;
        tcp.set_nodelay(true).ok();

        let closed = Arc::new(AtomicBool::new(false));
        if let Some(tls_config) = &self.tls_config {
            let server_name = ServerName::try_from(self.endpoint.host.clone())
                .map_err(|e| anyhow!("invalid server name '{}': {e}", self.endpoint.host))?;
            let tls = TlsConnector::from(tls_config.clone())
                .connect(server_name, tcp)
                .await
                .context("tls handshake")?;
            let (sender, mut connection) = h2::client::handshake(tls).await.context("h2 handshake")?;
            let ping = connection.ping_pong();
            Self::spawn_driver(connection, closed.clone(), self.endpoint.origin.clone());
            Ok(Http2Session {
                sender,
                closed,
                ping: Arc::new(Mutex::new(ping)),
            })
        } else {
            let (sender, mut connection) = h2::client::handshake(tcp).await.context("h2 handshake")?;
            let ping = connection.ping_pong();
            Self::spawn_driver(connection, closed.clone(), self.endpoint.origin.clone());
            Ok(Http2Session {
                sender,
                closed,
                ping: Arc::new(Mutex::new(ping)),
            })
        }
    }

    fn spawn_driver<T>(connection: h2::client::Connection<T, Bytes>, closed: Arc<AtomicBool>, origin: String)
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("Session to {origin} ended with error: {e}");
            } else {
                debug!("Session to {origin} closed");
            }
            closed.store(true, Ordering::SeqCst);
        });
    }

    /// Enable or disable keep-alive. Disabling cancels the running timer
    /// immediately; enabling takes effect the next time a session is
    /// established or reused.
    pub fn set_keep_alive(&self, enabled: bool) {
        self.keep_alive.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.keep_alive_gen.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// (Re)arm the keep-alive timer for `session`. The previous timer, if
    /// any, notices the generation bump and exits.
    fn restart_keep_alive(&self, session: &Http2Session) {
        if !self.keep_alive.load(Ordering::SeqCst) {
            return;
        }
        let generation = self.keep_alive_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let generations = self.keep_alive_gen.clone();
        let interval = self.keep_alive_interval;
        let session = session.clone();
        let origin = self.endpoint.origin.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if generations.load(Ordering::SeqCst) != generation || session.is_closed() {
                    return;
                }
                debug!("PING {origin}");
                if !session.ping().await {
                    return;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse_https_default_port() {
        let ep = Endpoint::parse("https://api.trongrid.io").unwrap();
        assert!(ep.tls);
        assert_eq!(ep.host, "api.trongrid.io");
        assert_eq!(ep.port, 443);
        assert_eq!(ep.origin, "https://api.trongrid.io");
    }

    #[test]
    fn test_endpoint_parse_http_explicit_port() {
        let ep = Endpoint::parse("http://127.0.0.1:8090").unwrap();
        assert!(!ep.tls);
        assert_eq!(ep.port, 8090);
        assert_eq!(ep.origin, "http://127.0.0.1:8090");
    }

    #[test]
    fn test_endpoint_parse_rejects_other_schemes() {
        assert!(Endpoint::parse("ftp://example.com").is_err());
        assert!(Endpoint::parse("not a url").is_err());
    }

    #[tokio::test]
    async fn test_ensure_session_fails_after_bounded_attempts() {
        // Nothing listens on this port; every attempt must fail fast.
        let manager = ConnectionManager::new(
            "http://127.0.0.1:9",
            false,
            Duration::from_secs(10),
            Duration::from_millis(10),
        )
        .unwrap();
        let start = std::time::Instant::now();
        let err = match manager.ensure_session(3).await {
            Ok(_) => panic!("connect to a dead port succeeded"),
            Err(e) => e,
        };
        assert!(matches!(err, GatewayError::Connection(_)));
        // Two inter-attempt delays of 10ms each.
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(manager.dropped(), 0);
        assert!(!manager.is_connected().await);
    }
}
