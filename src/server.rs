//! Listener setup and accept loops.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinSet;

use crate::config::ServerConfig;
use crate::credential::CredentialStore;
use crate::error::{Result, TunnelError};
use crate::session::{serve_connection, ListenerKind, SessionContext};
use crate::status::ServiceInfo;

/// Pause after a failed accept.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// A configured but not yet bound proxy server.
pub struct Server {
    config: ServerConfig,
    ctx: Arc<SessionContext>,
}

impl Server {
    /// Create a server using a direct connector built from `config`.
    pub fn new(config: ServerConfig, credentials: CredentialStore) -> Result<Self> {
        config.validate()?;
        let ctx = SessionContext::from_config(&config, credentials);
        Ok(Self {
            config,
            ctx: Arc::new(ctx),
        })
    }

    /// Create a server with a caller-built session context.
    pub fn with_context(config: ServerConfig, ctx: SessionContext) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ctx: Arc::new(ctx),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Advertised service tuple for subscription generators.
    pub fn service_info(&self) -> ServiceInfo {
        self.ctx.status.service_info(&self.ctx.credentials)
    }

    /// Bind every configured listener.
    pub async fn bind(self) -> Result<BoundServer> {
        let mut targets = vec![
            (ListenerKind::Http, self.config.http_addr),
            (ListenerKind::Socks5, self.config.socks5_addr),
        ];
        if let Some(mixed) = self.config.mixed_addr {
            targets.push((ListenerKind::Mixed, mixed));
        }

        let mut listeners = Vec::with_capacity(targets.len());
        for (kind, addr) in targets {
            let listener = TcpListener::bind(addr).await.map_err(|e| {
                TunnelError::IoError(std::io::Error::new(
                    e.kind(),
                    format!("Failed to bind {} listener on {}: {}", kind, addr, e),
                ))
            })?;
            let local = listener.local_addr()?;
            tracing::info!(listener = %kind, addr = %local, "listening");
            listeners.push((kind, local, listener));
        }

        Ok(BoundServer {
            listeners,
            ctx: self.ctx,
        })
    }
}

/// A server whose listeners are bound and ready to accept.
pub struct BoundServer {
    listeners: Vec<(ListenerKind, SocketAddr, TcpListener)>,
    ctx: Arc<SessionContext>,
}

impl BoundServer {
    /// Local address of the listener of the given kind.
    pub fn local_addr(&self, kind: ListenerKind) -> Option<SocketAddr> {
        self.listeners
            .iter()
            .find(|(k, _, _)| *k == kind)
            .map(|(_, addr, _)| *addr)
    }

    /// Accept connections on every listener.
    ///
    /// Runs until the returned future is dropped; dropping it stops all
    /// accept loops but leaves already spawned sessions running.
    pub async fn serve(self) -> Result<()> {
        let mut loops = JoinSet::new();
        for (kind, _, listener) in self.listeners {
            loops.spawn(accept_loop(kind, listener, Arc::clone(&self.ctx)));
        }

        while let Some(result) = loops.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "accept loop terminated");
            }
        }
        Ok(())
    }
}

async fn accept_loop(kind: ListenerKind, listener: TcpListener, ctx: Arc<SessionContext>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                stream.set_nodelay(true).ok();
                tracing::trace!(listener = %kind, %peer, "accepted connection");
                tokio::spawn(serve_connection(Arc::clone(&ctx), kind, stream, peer));
            }
            Err(e) => {
                tracing::warn!(listener = %kind, error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::Credential;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn local_config() -> ServerConfig {
        ServerConfig::new()
            .with_http_addr("127.0.0.1:0".parse().unwrap())
            .with_socks5_addr("127.0.0.1:0".parse().unwrap())
    }

    fn credentials() -> CredentialStore {
        CredentialStore::new(Credential::fixed("user", "pass"))
    }

    #[tokio::test]
    async fn test_bind_reports_addresses() {
        let server = Server::new(local_config(), credentials()).unwrap();
        let bound = server.bind().await.unwrap();
        assert!(bound.local_addr(ListenerKind::Http).is_some());
        assert!(bound.local_addr(ListenerKind::Socks5).is_some());
        assert!(bound.local_addr(ListenerKind::Mixed).is_none());
        assert_ne!(
            bound.local_addr(ListenerKind::Http),
            bound.local_addr(ListenerKind::Socks5)
        );
    }

    #[tokio::test]
    async fn test_bind_conflict_fails() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = local_config().with_http_addr(taken.local_addr().unwrap());
        let server = Server::new(config, credentials()).unwrap();
        assert!(server.bind().await.is_err());
    }

    #[tokio::test]
    async fn test_serve_answers_status() {
        let server = Server::new(local_config(), credentials()).unwrap();
        let bound = server.bind().await.unwrap();
        let http = bound.local_addr(ListenerKind::Http).unwrap();
        let handle = tokio::spawn(bound.serve());

        let mut stream = TcpStream::connect(http).await.unwrap();
        stream
            .write_all(b"GET /status HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));

        handle.abort();
    }

    #[test]
    fn test_service_info() {
        let config = local_config()
            .with_server_domain("proxy.example.com")
            .with_external_port(443);
        let server = Server::new(config, credentials()).unwrap();
        let info = server.service_info();
        assert_eq!(info.server_domain, "proxy.example.com");
        assert_eq!(info.external_port, 443);
        assert_eq!(info.username, "user");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = local_config().with_connect_timeout(Duration::ZERO);
        assert!(Server::new(config, credentials()).is_err());
    }
}
