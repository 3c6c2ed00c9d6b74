//! DNS-over-HTTPS upstream (RFC 8484)
//!
//! Queries are POSTed verbatim as `application/dns-message` bodies. The
//! connect step is ours rather than an HTTP client's: the TCP socket is
//! dialed at a bootstrap-chosen address, TLS (1.2/1.3, `webpki` roots) is
//! layered with SNI and certificate verification against the URL's
//! hostname, and HTTP/2 is hand-shaken on top. That is what lets a `DoH`
//! host be reached by name while the host's own DNS points at this process.
//!
//! One multiplexed connection is pooled per provider and replaced when it
//! closes or outlives the idle lifetime. Switching providers invalidates
//! the pooled entry so a changed bootstrap list takes effect.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{header, Method, Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http2::{self, SendRequest};
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::bootstrap::BootstrapResolver;
use crate::dns::error::{DnsError, DnsResult};
use crate::dns::wire;
use crate::settings::{Provider, ProviderKind};

/// Media type for DNS wire format over HTTPS
const DOH_CONTENT_TYPE: &str = "application/dns-message";

/// End-to-end timeout for one `DoH` request
pub const DOH_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-candidate TCP+TLS connect timeout
const DOH_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Idle lifetime after which a pooled connection is replaced
pub const POOL_IDLE_LIFETIME: Duration = Duration::from_secs(600);

/// A pooled HTTP/2 connection to one provider
struct PooledConn {
    sender: SendRequest<Full<Bytes>>,
    last_used: Instant,
}

/// `DoH` client with per-provider connection pooling
pub struct DohClient {
    /// Hostname resolution that avoids the loopback forwarder
    bootstrap: Arc<BootstrapResolver>,

    /// TLS client configuration (ALPN h2, webpki roots)
    tls: TlsConnector,

    /// provider id → live connection
    pool: Mutex<HashMap<Uuid, PooledConn>>,
}

impl std::fmt::Debug for DohClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DohClient")
            .field("pooled", &self.pool.lock().len())
            .finish_non_exhaustive()
    }
}

impl DohClient {
    /// Create a client sharing the given bootstrap resolver
    #[must_use]
    pub fn new(bootstrap: Arc<BootstrapResolver>) -> Self {
        let root_store =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let mut tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        tls_config.alpn_protocols = vec![b"h2".to_vec()];

        Self {
            bootstrap,
            tls: TlsConnector::from(Arc::new(tls_config)),
            pool: Mutex::new(HashMap::new()),
        }
    }

    /// Drop the pooled connection for a provider
    ///
    /// Called when the active provider changes so the next query dials with
    /// the new provider's bootstrap list.
    pub fn invalidate(&self, provider_id: Uuid) {
        if self.pool.lock().remove(&provider_id).is_some() {
            debug!(provider_id = %provider_id, "DoH connection invalidated");
        }
    }

    /// POST `query` to the provider's endpoint, returning the answer bytes
    ///
    /// # Errors
    ///
    /// Returns `DnsError::ConfigError` for non-`DoH` providers or malformed
    /// URLs, `DnsError::BootstrapError` when the host cannot be resolved,
    /// and `DnsError::UpstreamError`/`TimeoutError` for transport failures.
    pub async fn query(&self, provider: &Provider, query: &[u8]) -> DnsResult<Vec<u8>> {
        let ProviderKind::DoH { url, bootstrap_ips } = &provider.kind else {
            return Err(DnsError::config(format!(
                "provider '{}' is not a DoH provider",
                provider.name
            )));
        };

        let uri: Uri = url
            .parse()
            .map_err(|e| DnsError::config(format!("invalid DoH URL '{url}': {e}")))?;
        if uri.scheme_str() != Some("https") {
            return Err(DnsError::config(format!(
                "DoH URL must use the https scheme: {url}"
            )));
        }
        let host = uri
            .host()
            .ok_or_else(|| DnsError::config(format!("DoH URL has no host: {url}")))?
            .to_string();
        let port = uri.port_u16().unwrap_or(443);

        // Reuse the pooled connection when it is still alive and young
        // enough; otherwise dial fresh.
        let pooled = {
            let mut pool = self.pool.lock();
            match pool.get_mut(&provider.id) {
                Some(conn)
                    if !conn.sender.is_closed()
                        && conn.last_used.elapsed() < POOL_IDLE_LIFETIME =>
                {
                    conn.last_used = Instant::now();
                    Some(conn.sender.clone())
                }
                _ => None,
            }
        };

        if let Some(sender) = pooled {
            match self.send(sender, &uri, url, query).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_recoverable() => {
                    // Stale multiplexed connection; dial once more fresh.
                    debug!(provider = %provider.name, error = %e, "pooled DoH connection failed, redialing");
                    self.invalidate(provider.id);
                }
                Err(e) => return Err(e),
            }
        }

        let sender = self
            .connect(&host, port, bootstrap_ips)
            .await?;
        self.pool.lock().insert(
            provider.id,
            PooledConn {
                sender: sender.clone(),
                last_used: Instant::now(),
            },
        );

        self.send(sender, &uri, url, query).await
    }

    /// Dial the endpoint: bootstrap candidates → TCP → TLS → HTTP/2
    async fn connect(
        &self,
        host: &str,
        port: u16,
        bootstrap_ips: &[IpAddr],
    ) -> DnsResult<SendRequest<Full<Bytes>>> {
        let candidates = self.bootstrap.resolve(host, bootstrap_ips).await?;

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| DnsError::config(format!("invalid TLS server name '{host}': {e}")))?;

        let mut last_error = None;
        for ip in candidates {
            match self.connect_one(ip, port, server_name.clone()).await {
                Ok(sender) => {
                    debug!(host, ip = %ip, "DoH connection established");
                    return Ok(sender);
                }
                Err(e) => {
                    trace!(host, ip = %ip, error = %e, "DoH dial failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| DnsError::bootstrap(host, "no candidate address to dial")))
    }

    /// One candidate address end to end
    async fn connect_one(
        &self,
        ip: IpAddr,
        port: u16,
        server_name: ServerName<'static>,
    ) -> DnsResult<SendRequest<Full<Bytes>>> {
        let tcp = timeout(DOH_CONNECT_TIMEOUT, TcpStream::connect((ip, port)))
            .await
            .map_err(|_| DnsError::timeout(format!("TCP connect to {ip}:{port}"), DOH_CONNECT_TIMEOUT))?
            .map_err(|e| DnsError::network_io(format!("TCP connect to {ip}:{port} failed"), e))?;
        tcp.set_nodelay(true)
            .map_err(|e| DnsError::network_io("failed to set TCP_NODELAY", e))?;

        let tls = timeout(DOH_CONNECT_TIMEOUT, self.tls.connect(server_name, tcp))
            .await
            .map_err(|_| DnsError::timeout(format!("TLS handshake with {ip}:{port}"), DOH_CONNECT_TIMEOUT))?
            .map_err(|e| DnsError::network_io(format!("TLS handshake with {ip}:{port} failed"), e))?;

        let (sender, connection) = http2::handshake(TokioExecutor::new(), TokioIo::new(tls))
            .await
            .map_err(|e| {
                DnsError::upstream(format!("{ip}:{port}"), format!("HTTP/2 handshake failed: {e}"))
            })?;

        // The connection future owns the socket; it resolves when the peer
        // goes away, at which point the pooled sender reports closed.
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "DoH connection terminated");
            }
        });

        Ok(sender)
    }

    /// Send one request over an established connection
    async fn send(
        &self,
        mut sender: SendRequest<Full<Bytes>>,
        uri: &Uri,
        url: &str,
        query: &[u8],
    ) -> DnsResult<Vec<u8>> {
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri.clone())
            .header(header::CONTENT_TYPE, DOH_CONTENT_TYPE)
            .header(header::ACCEPT, DOH_CONTENT_TYPE)
            .header(header::CONTENT_LENGTH, query.len())
            .body(Full::new(Bytes::copy_from_slice(query)))
            .map_err(|e| DnsError::internal(format!("failed to build DoH request: {e}")))?;

        let response = timeout(DOH_REQUEST_TIMEOUT, async {
            sender
                .ready()
                .await
                .map_err(|e| DnsError::upstream(url, format!("connection not ready: {e}")))?;
            sender
                .send_request(request)
                .await
                .map_err(|e| DnsError::upstream(url, format!("DoH request failed: {e}")))
        })
        .await
        .map_err(|_| DnsError::timeout(format!("DoH request to {url}"), DOH_REQUEST_TIMEOUT))??;

        let status = response.status();
        if !status.is_success() {
            return Err(DnsError::upstream(url, format!("HTTP {status}")));
        }

        if let Some(content_type) = response.headers().get(header::CONTENT_TYPE) {
            let ct = content_type.to_str().unwrap_or("");
            if !ct.starts_with(DOH_CONTENT_TYPE) {
                warn!(url, content_type = ct, "unexpected DoH Content-Type");
            }
        }

        let body = timeout(DOH_REQUEST_TIMEOUT, response.into_body().collect())
            .await
            .map_err(|_| DnsError::timeout(format!("DoH response body from {url}"), DOH_REQUEST_TIMEOUT))?
            .map_err(|e| DnsError::upstream(url, format!("failed to read response body: {e}")))?
            .to_bytes();

        if body.len() > wire::MAX_TCP_MESSAGE_SIZE {
            return Err(DnsError::parse(format!(
                "DoH response too large: {} bytes (max {})",
                body.len(),
                wire::MAX_TCP_MESSAGE_SIZE
            )));
        }
        if body.len() < wire::MIN_MESSAGE_SIZE {
            return Err(DnsError::upstream(url, format!("short DoH response: {} bytes", body.len())));
        }

        Ok(body.to_vec())
    }
}
