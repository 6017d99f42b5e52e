//! Tunnel session supervisor.
//!
//! One session per accepted connection: handshake, destination connect, then
//! relay. A session owns both of its sockets; every exit path drops them
//! exactly once and nothing is retried.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::Instrument;

use crate::config::ServerConfig;
use crate::connector::{Connector, DirectConnector};
use crate::credential::CredentialStore;
use crate::error::{Result, Stage, TunnelError, TunnelErrorKind};
use crate::http::{self, PrefixedStream, Rejection, CONNECTION_ESTABLISHED};
use crate::relay::{relay, RelayOutcome, RelayStats};
use crate::socks5::{
    self, Command, Handshake, SOCKS5_REP_COMMAND_NOT_SUPPORTED, SOCKS5_REP_GENERAL_FAILURE,
    SOCKS5_REP_SUCCESS, SOCKS5_VERSION,
};
use crate::status::StatusTracker;
use crate::types::Addr;

/// Upper bound on draining a rejected client before the socket is dropped.
pub const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Which listener accepted a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    Http,
    Socks5,
    /// Sniffs the first byte to pick a protocol
    Mixed,
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerKind::Http => f.write_str("http"),
            ListenerKind::Socks5 => f.write_str("socks5"),
            ListenerKind::Mixed => f.write_str("mixed"),
        }
    }
}

/// State shared by every session.
pub struct SessionContext {
    pub credentials: CredentialStore,
    pub connector: Arc<dyn Connector>,
    pub status: Arc<StatusTracker>,
    pub handshake_timeout: Duration,
    pub expose_credentials: bool,
}

impl SessionContext {
    pub fn new(credentials: CredentialStore, connector: Arc<dyn Connector>) -> Self {
        Self {
            credentials,
            connector,
            status: Arc::new(StatusTracker::new(crate::config::DEFAULT_SERVER_DOMAIN, 0)),
            handshake_timeout: crate::config::DEFAULT_HANDSHAKE_TIMEOUT,
            expose_credentials: false,
        }
    }

    /// Build a context from config with a [`DirectConnector`].
    pub fn from_config(config: &ServerConfig, credentials: CredentialStore) -> Self {
        Self {
            credentials,
            connector: Arc::new(DirectConnector::with_options(config.connector_options())),
            status: Arc::new(StatusTracker::new(
                config.server_domain.clone(),
                config.external_port,
            )),
            handshake_timeout: config.handshake_timeout,
            expose_credentials: config.expose_credentials,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_expose_credentials(mut self, expose: bool) -> Self {
        self.expose_credentials = expose;
        self
    }
}

/// How a session that did not fail ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Tunnel established and relayed until one side closed
    Relayed {
        destination: Addr,
        client_to_destination: u64,
        destination_to_client: u64,
    },
    /// A status route was answered on the HTTP listener
    StatusServed,
    /// UDP ASSOCIATE was acknowledged and the connection closed
    UdpAssociateClosed,
}

/// Run one session to completion, logging its result.
pub async fn serve_connection<S>(
    ctx: Arc<SessionContext>,
    kind: ListenerKind,
    stream: S,
    peer: SocketAddr,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let span = tracing::info_span!("session", listener = %kind, peer = %peer);
    async move {
        match run_session(&ctx, kind, stream).await {
            Ok(outcome) => tracing::debug!(?outcome, "session finished"),
            Err(e) => log_failure(&e),
        }
    }
    .instrument(span)
    .await
}

/// Drive a session and return how it ended.
pub async fn run_session<S>(
    ctx: &SessionContext,
    kind: ListenerKind,
    stream: S,
) -> Result<SessionOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match kind {
        ListenerKind::Socks5 => run_socks5(ctx, stream).await,
        ListenerKind::Http => run_http(ctx, stream).await,
        ListenerKind::Mixed => run_mixed(ctx, stream).await,
    }
}

async fn run_mixed<S>(ctx: &SessionContext, mut stream: S) -> Result<SessionOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut first = [0u8; 1];
    let n = tokio::time::timeout(ctx.handshake_timeout, stream.read(&mut first))
        .await
        .map_err(|_| TunnelError::HandshakeTimeout)??;
    if n == 0 {
        return Err(TunnelError::PeerDisconnected {
            stage: Stage::Greeting,
        });
    }

    let stream = PrefixedStream::new(stream, first.to_vec());
    if first[0] == SOCKS5_VERSION {
        tracing::debug!("mixed listener detected socks5");
        run_socks5(ctx, stream).await
    } else {
        tracing::debug!("mixed listener detected http");
        run_http(ctx, stream).await
    }
}

async fn run_socks5<S>(ctx: &SessionContext, mut stream: S) -> Result<SessionOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let negotiated = {
        let mut handshake = Handshake::new(&mut stream, &ctx.credentials);
        match tokio::time::timeout(ctx.handshake_timeout, handshake.run()).await {
            Ok(result) => result,
            Err(_) => Err(TunnelError::HandshakeTimeout),
        }
    };
    let request = match negotiated {
        Ok(request) => request,
        Err(e) => return Err(close_after(&mut stream, e).await),
    };

    let destination = request.request.destination;
    match request.command {
        Command::Connect => {
            tracing::debug!(%destination, "socks5 connect");
            let upstream = match ctx.connector.connect(&destination).await {
                Ok(upstream) => upstream,
                Err(e) => {
                    let _ = socks5::send_reply(&mut stream, SOCKS5_REP_GENERAL_FAILURE).await;
                    return Err(close_after(&mut stream, e).await);
                }
            };
            socks5::send_reply(&mut stream, SOCKS5_REP_SUCCESS).await?;
            finish_relay(destination, stream, upstream).await
        }
        Command::UdpAssociate => {
            socks5::send_reply(&mut stream, SOCKS5_REP_SUCCESS).await?;
            tracing::debug!("udp associate acknowledged without relay");
            close_gracefully(&mut stream).await;
            Ok(SessionOutcome::UdpAssociateClosed)
        }
        Command::Unsupported(cmd) => {
            let _ = socks5::send_reply(&mut stream, SOCKS5_REP_COMMAND_NOT_SUPPORTED).await;
            let message = format!("unsupported command {:#04x}", cmd);
            let e = TunnelError::protocol(Stage::Request, message);
            Err(close_after(&mut stream, e).await)
        }
    }
}

async fn run_http<S>(ctx: &SessionContext, stream: S) -> Result<SessionOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(stream);
    let read = tokio::time::timeout(ctx.handshake_timeout, http::read_head(&mut reader)).await;
    let head = match read {
        Err(_) => return Err(close_after(&mut reader, TunnelError::HandshakeTimeout).await),
        Ok(Err(e)) => {
            if e.kind() == TunnelErrorKind::ProtocolViolation {
                let response = Rejection::MalformedRequest.response();
                let _ = write_response(reader.get_mut(), &response).await;
            }
            return Err(close_after(&mut reader, e).await);
        }
        Ok(Ok(head)) => head,
    };

    if !head.is_connect() {
        let response = ctx.status.respond(&head, &ctx.credentials, ctx.expose_credentials);
        write_response(reader.get_mut(), &response).await?;
        tracing::debug!(method = %head.method, path = %head.path(), "status route served");
        close_gracefully(&mut reader).await;
        return Ok(SessionOutcome::StatusServed);
    }

    let request = match http::authorize_connect(&head, &ctx.credentials) {
        Ok(request) => request,
        Err(rejection) => {
            let _ = write_response(reader.get_mut(), &rejection.response()).await;
            return Err(close_after(&mut reader, rejection.into_error()).await);
        }
    };

    let destination = request.destination;
    tracing::debug!(%destination, "http connect");
    let upstream = match ctx.connector.connect(&destination).await {
        Ok(upstream) => upstream,
        Err(e) => {
            let message = match &e {
                TunnelError::DestinationUnreachable { message, .. } => message.clone(),
                other => other.to_string(),
            };
            let _ = write_response(reader.get_mut(), &http::bad_gateway(&message)).await;
            return Err(close_after(&mut reader, e).await);
        }
    };

    write_response(reader.get_mut(), CONNECTION_ESTABLISHED).await?;
    let client = PrefixedStream::from_buf_reader(reader);
    finish_relay(destination, client, upstream).await
}

async fn finish_relay<C, D>(destination: Addr, client: C, upstream: D) -> Result<SessionOutcome>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    D: AsyncRead + AsyncWrite + Send + 'static,
{
    let RelayStats {
        client_to_destination,
        destination_to_client,
        outcome,
    } = relay(client, upstream).await;

    tracing::debug!(
        %destination,
        client_to_destination,
        destination_to_client,
        "relay finished"
    );

    match outcome {
        RelayOutcome::Fault { direction, error } => {
            tracing::debug!(%direction, "relay fault");
            Err(TunnelError::RelayFault(error))
        }
        RelayOutcome::ClientClosed | RelayOutcome::DestinationClosed => {
            Ok(SessionOutcome::Relayed {
                destination,
                client_to_destination,
                destination_to_client,
            })
        }
    }
}

async fn write_response<W>(writer: &mut W, response: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(response).await?;
    writer.flush().await
}

/// Close a rejected client without a reset, then hand back the error.
async fn close_after<S>(stream: &mut S, error: TunnelError) -> TunnelError
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if error.kind() != TunnelErrorKind::PeerDisconnected {
        close_gracefully(stream).await;
    }
    error
}

/// Send FIN, then discard whatever the client still has in flight for up to
/// [`CLOSE_DRAIN_TIMEOUT`]. Dropping a socket with unread input makes the
/// kernel answer with RST, which can destroy a reply the client has not read.
async fn close_gracefully<S>(stream: &mut S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _ = stream.shutdown().await;
    let mut scratch = [0u8; 1024];
    let drain = async {
        while let Ok(n) = stream.read(&mut scratch).await {
            if n == 0 {
                break;
            }
        }
    };
    let _ = tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, drain).await;
}

fn log_failure(error: &TunnelError) {
    match error.kind() {
        TunnelErrorKind::PeerDisconnected | TunnelErrorKind::HandshakeTimeout => {
            tracing::debug!(error = %error, "session closed during handshake")
        }
        kind => tracing::warn!(?kind, error = %error, "session failed"),
    }
}
