//! Destination connector.
//!
//! Opens the upstream TCP connection for an authenticated tunnel request.
//! Hostnames go through the system resolver; IP literals connect directly.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::error::{ConnectErrorKind, Result, TunnelError};
use crate::types::Addr;

/// Default destination connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens destination connections for tunnel sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `addr`.
    ///
    /// Every failure is reported as [`TunnelError::DestinationUnreachable`].
    async fn connect(&self, addr: &Addr) -> Result<TcpStream>;
}

/// Options for creating a Direct connector.
#[derive(Debug, Clone, Default)]
pub struct DirectOptions {
    /// Bind IPv4 address for outgoing connections
    pub bind_ip4: Option<Ipv4Addr>,
    /// Bind IPv6 address for outgoing connections
    pub bind_ip6: Option<Ipv6Addr>,
    /// TCP keepalive idle time for destination sockets
    pub keepalive: Option<Duration>,
    /// Connection timeout
    pub timeout: Option<Duration>,
}

/// Connector that dials the destination from the local network.
#[derive(Debug, Clone)]
pub struct DirectConnector {
    bind_ip4: Option<Ipv4Addr>,
    bind_ip6: Option<Ipv6Addr>,
    keepalive: Option<Duration>,
    timeout: Duration,
}

impl DirectConnector {
    /// Create a new Direct connector with default settings.
    pub fn new() -> Self {
        Self {
            bind_ip4: None,
            bind_ip6: None,
            keepalive: None,
            timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Create a new Direct connector with the given options.
    pub fn with_options(opts: DirectOptions) -> Self {
        Self {
            bind_ip4: opts.bind_ip4,
            bind_ip6: opts.bind_ip6,
            keepalive: opts.keepalive,
            timeout: opts.timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
        }
    }

    /// Set connection timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Resolve the host into candidate socket addresses.
    async fn resolve(&self, addr: &Addr) -> Result<Vec<SocketAddr>> {
        if let Ok(ip) = addr.host.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, addr.port)]);
        }

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((addr.host.as_str(), addr.port))
            .await
            .map_err(|e| TunnelError::DestinationUnreachable {
                kind: ConnectErrorKind::DnsFailed,
                message: format!("Failed to resolve host: {}", e),
            })?
            .collect();

        if addrs.is_empty() {
            return Err(TunnelError::DestinationUnreachable {
                kind: ConnectErrorKind::DnsFailed,
                message: "no address found".to_string(),
            });
        }
        Ok(addrs)
    }

    /// Get the bind IP for the given target IP.
    fn get_bind_ip(&self, target: &IpAddr) -> Option<IpAddr> {
        match target {
            IpAddr::V4(_) => self.bind_ip4.map(IpAddr::V4),
            IpAddr::V6(_) => self.bind_ip6.map(IpAddr::V6),
        }
    }

    /// Create a TCP socket2::Socket bound to the configured egress address.
    fn create_bound_socket(&self, bind_ip: IpAddr) -> std::io::Result<socket2::Socket> {
        let domain = match bind_ip {
            IpAddr::V4(_) => socket2::Domain::IPV4,
            IpAddr::V6(_) => socket2::Domain::IPV6,
        };
        let socket =
            socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
        socket.bind(&SocketAddr::new(bind_ip, 0).into())?;
        socket.set_nonblocking(true)?;
        Ok(socket)
    }

    /// Dial TCP to a specific socket address.
    async fn dial_ip(&self, target: SocketAddr) -> std::io::Result<TcpStream> {
        let stream = match self.get_bind_ip(&target.ip()) {
            Some(bind_ip) => {
                let socket = self.create_bound_socket(bind_ip)?;
                let std_stream: std::net::TcpStream = socket.into();
                let tokio_socket = tokio::net::TcpSocket::from_std_stream(std_stream);
                tokio_socket.connect(target).await?
            }
            None => TcpStream::connect(target).await?,
        };

        stream.set_nodelay(true).ok();
        if let Some(idle) = self.keepalive {
            let keepalive = socket2::TcpKeepalive::new().with_time(idle);
            socket2::SockRef::from(&stream)
                .set_tcp_keepalive(&keepalive)
                .ok();
        }
        Ok(stream)
    }

    /// Try each candidate in order, returning the first success or the last error.
    async fn dial_any(&self, candidates: Vec<SocketAddr>) -> Result<TcpStream> {
        let mut last_error = None;
        for target in candidates {
            match self.dial_ip(target).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    tracing::debug!(%target, error = %e, "destination candidate failed");
                    last_error = Some(e);
                }
            }
        }

        let error = last_error
            .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address"));
        Err(TunnelError::DestinationUnreachable {
            kind: ConnectErrorKind::from_io(&error),
            message: format!("Failed to connect: {}", error),
        })
    }
}

impl Default for DirectConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for DirectConnector {
    async fn connect(&self, addr: &Addr) -> Result<TcpStream> {
        let attempt = async {
            let candidates = self.resolve(addr).await?;
            self.dial_any(candidates).await
        };

        tokio::time::timeout(self.timeout, attempt)
            .await
            .map_err(|_| TunnelError::DestinationUnreachable {
                kind: ConnectErrorKind::Timeout,
                message: "Connection timeout".to_string(),
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_ip_literal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let connector = DirectConnector::new();
        let stream = connector.connect(&Addr::new("127.0.0.1", port)).await;
        assert!(stream.is_ok());
        let (_accepted, _) = listener.accept().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_localhost_name() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let connector = DirectConnector::new();
        let result = connector.connect(&Addr::new("localhost", port)).await;
        assert!(result.is_ok(), "got: {:?}", result.err());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let connector = DirectConnector::new();
        let result = connector.connect(&Addr::new("127.0.0.1", port)).await;
        match result {
            Err(TunnelError::DestinationUnreachable { kind, .. }) => {
                assert_eq!(kind, ConnectErrorKind::Refused)
            }
            other => panic!("expected DestinationUnreachable, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_connect_unresolvable_host() {
        let connector = DirectConnector::new().with_timeout(Duration::from_secs(5));
        let result = connector.connect(&Addr::new("does-not-exist.invalid", 80)).await;
        match result {
            Err(TunnelError::DestinationUnreachable { kind, .. }) => {
                assert!(matches!(
                    kind,
                    ConnectErrorKind::DnsFailed | ConnectErrorKind::Timeout
                ))
            }
            other => panic!("expected DestinationUnreachable, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_connect_with_bind_ip4() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let connector = DirectConnector::with_options(DirectOptions {
            bind_ip4: Some(Ipv4Addr::LOCALHOST),
            keepalive: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let stream = connector.connect(&Addr::new("127.0.0.1", port)).await.unwrap();
        assert_eq!(
            stream.local_addr().unwrap().ip(),
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        );
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_connect_timeout_when_backlog_full() {
        use socket2::{Domain, Protocol, Socket, Type};

        // A listener that never accepts and has no room left in its queue
        // drops further SYNs, so the next connect hangs.
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        socket.bind(&bind.into()).unwrap();
        socket.listen(0).unwrap();
        let addr = socket.local_addr().unwrap().as_socket().unwrap();

        let mut fillers = Vec::new();
        for _ in 0..3 {
            let attempt = TcpStream::connect(addr);
            if let Ok(Ok(stream)) = tokio::time::timeout(Duration::from_millis(200), attempt).await
            {
                fillers.push(stream);
            }
        }

        let connector = DirectConnector::new().with_timeout(Duration::from_millis(300));
        let started = tokio::time::Instant::now();
        let result = connector.connect(&Addr::new("127.0.0.1", addr.port())).await;
        match result {
            Err(TunnelError::DestinationUnreachable { kind, message }) => {
                assert_eq!(kind, ConnectErrorKind::Timeout);
                assert_eq!(message, "Connection timeout");
            }
            other => panic!("expected a timeout, got {:?}", other.map(|_| ())),
        }
        assert!(started.elapsed() < Duration::from_secs(2));
        drop(fillers);
    }

    #[test]
    fn test_default_timeout() {
        assert_eq!(DirectConnector::new().timeout(), DEFAULT_CONNECT_TIMEOUT);
        let opts = DirectOptions {
            timeout: Some(Duration::from_secs(3)),
            ..Default::default()
        };
        assert_eq!(
            DirectConnector::with_options(opts).timeout(),
            Duration::from_secs(3)
        );
    }
}
