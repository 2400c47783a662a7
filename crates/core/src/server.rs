use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::error::{Result, StreamError};
use crate::media_session::{MediaSession, MediaSessionRegistry};
use crate::protocol::auth::Authenticator;
use crate::session::SessionManager;
use crate::transport::http::TunnelRegistry;
use crate::transport::tcp;

/// Server-level configuration used by protocol handlers.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Public host advertised in URLs and the SDP `o=` line.
    /// When `None`, host is inferred from request URI/client address.
    pub public_host: Option<String>,
    /// Credential gate; `None` means unauthenticated access.
    pub auth: Option<Authenticator>,
}

/// State shared by every connection of one server.
#[derive(Clone)]
pub(crate) struct ServerState {
    pub sessions: SessionManager,
    pub media: MediaSessionRegistry,
    pub config: Arc<ServerConfig>,
    pub tunnels: TunnelRegistry,
}

/// RTSP front-end.
///
/// Listens for control connections, advertises registered media sessions
/// and, once [`enable_http_tunnel`](Self::enable_http_tunnel) succeeds,
/// also accepts tunneled clients on a dedicated HTTP port.
pub struct StreamingServer {
    listener: TcpListener,
    http_listener: Option<TcpListener>,
    state: ServerState,
}

impl StreamingServer {
    /// Bind the RTSP listener on `port` (all interfaces).
    pub async fn create(port: u16, config: ServerConfig) -> Result<Self> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| StreamError::transport_setup(format!("RTSP listener on port {port}"), e))?;
        let local = listener.local_addr()?;
        tracing::info!(addr = %local, auth = config.auth.is_some(), "RTSP server listening");
        Ok(Self {
            listener,
            http_listener: None,
            state: ServerState {
                sessions: SessionManager::new(),
                media: MediaSessionRegistry::new(),
                config: Arc::new(config),
                tunnels: TunnelRegistry::new(),
            },
        })
    }

    pub fn add_session(&self, session: MediaSession) -> Arc<MediaSession> {
        self.state.media.add(session)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn session_manager(&self) -> &SessionManager {
        &self.state.sessions
    }

    pub fn config(&self) -> Arc<ServerConfig> {
        self.state.config.clone()
    }

    /// URL clients use to reach `session`: `rtsp://<host>:<port>/<name>`.
    pub fn rtsp_url(&self, session: &MediaSession) -> String {
        let host = self
            .state
            .config
            .public_host
            .clone()
            .unwrap_or_else(|| local_address().to_string());
        let port = self.listener.local_addr().map(|a| a.port()).unwrap_or_default();
        format!("rtsp://{}:{}{}", host, port, session.path())
    }

    /// Start accepting RTSP-over-HTTP tunnels on `port`. Returns whether
    /// the port could be bound.
    pub async fn enable_http_tunnel(&mut self, port: u16) -> bool {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                tracing::info!(port, "RTSP-over-HTTP tunneling enabled");
                self.http_listener = Some(listener);
                true
            }
            Err(e) => {
                tracing::warn!(port, error = %e, "could not enable RTSP-over-HTTP tunneling");
                false
            }
        }
    }

    pub fn http_tunnel_port(&self) -> Option<u16> {
        self.http_listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
            .map(|a| a.port())
    }

    /// Accept connections until an accept fails on either listener.
    pub async fn run(self) -> Result<()> {
        let Self {
            listener,
            http_listener,
            state,
        } = self;
        let Some(http) = http_listener else {
            return accept_loop(listener, state, "RTSP").await;
        };
        tokio::select! {
            result = accept_loop(listener, state.clone(), "RTSP") => result,
            result = accept_loop(http, state, "HTTP") => result,
        }
    }
}

async fn accept_loop(listener: TcpListener, state: ServerState, kind: &'static str) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::trace!(%peer, kind, "accepted connection");
                tokio::spawn(tcp::handle_connection(stream, state.clone()));
            }
            Err(e) if is_transient(&e) => {
                tracing::warn!(kind, error = %e, "accept error");
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
            Err(e) => {
                tracing::error!(kind, error = %e, "accept loop failed");
                return Err(e.into());
            }
        }
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    // EMFILE: out of descriptors until some connection closes
    matches!(
        e.kind(),
        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::Interrupted | ErrorKind::WouldBlock
    ) || e.raw_os_error() == Some(24)
}

/// Address of the interface that routes outwards, or loopback.
fn local_address() -> IpAddr {
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .ok()
        .filter(|ip| !ip.is_unspecified())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn url_uses_public_host_and_bound_port() {
        let config = ServerConfig {
            public_host: Some("cam.local".to_string()),
            auth: None,
        };
        let server = StreamingServer::create(0, config).await.unwrap();
        let port = server.local_addr().unwrap().port();
        let session = server.add_session(MediaSession::new("live", "Live"));
        assert_eq!(server.rtsp_url(&session), format!("rtsp://cam.local:{port}/live"));
        assert!(server.http_tunnel_port().is_none());
    }

    #[tokio::test]
    async fn tunnel_port_reported_after_enable() {
        let mut server = StreamingServer::create(0, ServerConfig::default()).await.unwrap();
        assert!(server.enable_http_tunnel(0).await);
        assert!(server.http_tunnel_port().is_some_and(|p| p != 0));
    }

    #[tokio::test]
    async fn run_serves_both_listeners() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpStream;

        let mut server = StreamingServer::create(0, ServerConfig::default()).await.unwrap();
        assert!(server.enable_http_tunnel(0).await);
        let rtsp_port = server.local_addr().unwrap().port();
        let http_port = server.http_tunnel_port().unwrap();
        let running = tokio::spawn(server.run());

        for port in [rtsp_port, http_port] {
            let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            conn.write_all(b"OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\n").await.unwrap();
            let mut reply = vec![0u8; 512];
            let n = conn.read(&mut reply).await.unwrap();
            assert!(reply[..n].starts_with(b"RTSP/1.0 200 OK\r\n"), "port {port}");
        }
        assert!(!running.is_finished());
        running.abort();
    }

    #[tokio::test]
    async fn bind_conflict_is_transport_setup_failure() {
        let first = StreamingServer::create(0, ServerConfig::default()).await.unwrap();
        let port = first.local_addr().unwrap().port();
        let err = StreamingServer::create(port, ServerConfig::default()).await.err().unwrap();
        assert!(matches!(err, StreamError::TransportSetup { .. }));
    }

    #[test]
    fn local_address_is_not_unspecified() {
        assert!(!local_address().is_unspecified());
    }
}
