use std::fmt;

use thiserror::Error;

/// Handshake stage at which a session failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// SOCKS5 version/method negotiation
    Greeting,
    /// SOCKS5 username/password sub-negotiation
    Authentication,
    /// SOCKS5 connect request
    Request,
    /// HTTP request line and headers
    HttpHead,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Greeting => "greeting",
            Stage::Authentication => "authentication",
            Stage::Request => "request",
            Stage::HttpHead => "http-head",
        };
        f.write_str(name)
    }
}

/// Classifies destination connection errors for programmatic matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectErrorKind {
    /// Connect attempt did not finish within the timeout
    Timeout,
    /// Destination actively refused the connection
    Refused,
    /// DNS resolution failed or returned no address
    DnsFailed,
    /// Any other socket error
    Other,
}

impl ConnectErrorKind {
    /// Classify an I/O error returned by a connect attempt.
    pub fn from_io(error: &std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::TimedOut => ConnectErrorKind::Timeout,
            std::io::ErrorKind::ConnectionRefused => ConnectErrorKind::Refused,
            _ => ConnectErrorKind::Other,
        }
    }
}

/// Coarse failure classes, one per way a session can end badly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelErrorKind {
    ProtocolViolation,
    AuthenticationFailure,
    DestinationUnreachable,
    RelayFault,
    PeerDisconnected,
    HandshakeTimeout,
    Config,
    Io,
}

/// Tunnel error types
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Protocol violation during {stage}: {message}")]
    ProtocolViolation { stage: Stage, message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailure { message: String },

    #[error("Destination unreachable: {message}")]
    DestinationUnreachable {
        kind: ConnectErrorKind,
        message: String,
    },

    #[error("Relay fault: {0}")]
    RelayFault(#[source] std::io::Error),

    #[error("Peer disconnected during {stage}")]
    PeerDisconnected { stage: Stage },

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl TunnelError {
    pub(crate) fn protocol(stage: Stage, message: impl Into<String>) -> Self {
        TunnelError::ProtocolViolation {
            stage,
            message: message.into(),
        }
    }

    pub(crate) fn auth(message: impl Into<String>) -> Self {
        TunnelError::AuthenticationFailure {
            message: message.into(),
        }
    }

    /// Map a read error during a handshake stage, turning EOF into a disconnect.
    pub(crate) fn from_read(stage: Stage, error: std::io::Error) -> Self {
        if error.kind() == std::io::ErrorKind::UnexpectedEof {
            TunnelError::PeerDisconnected { stage }
        } else {
            TunnelError::IoError(error)
        }
    }

    pub fn kind(&self) -> TunnelErrorKind {
        match self {
            TunnelError::ProtocolViolation { .. } => TunnelErrorKind::ProtocolViolation,
            TunnelError::AuthenticationFailure { .. } => TunnelErrorKind::AuthenticationFailure,
            TunnelError::DestinationUnreachable { .. } => TunnelErrorKind::DestinationUnreachable,
            TunnelError::RelayFault(_) => TunnelErrorKind::RelayFault,
            TunnelError::PeerDisconnected { .. } => TunnelErrorKind::PeerDisconnected,
            TunnelError::HandshakeTimeout => TunnelErrorKind::HandshakeTimeout,
            TunnelError::ConfigError(_) => TunnelErrorKind::Config,
            TunnelError::IoError(_) => TunnelErrorKind::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;
