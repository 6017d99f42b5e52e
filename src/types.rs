use std::fmt;
use std::net::SocketAddr;

/// Tunnel protocol a client negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    HttpConnect,
    Socks5,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::HttpConnect => f.write_str("http-connect"),
            Protocol::Socks5 => f.write_str("socks5"),
        }
    }
}

/// Destination address as sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addr {
    /// Hostname or IP address literal
    pub host: String,
    /// Port number
    pub port: u16,
}

impl Addr {
    /// Create a new Addr
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Create an Addr from a SocketAddr.
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Username/password pair offered by a client.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthPair {
    pub username: Vec<u8>,
    pub password: Vec<u8>,
}

impl AuthPair {
    pub fn new(username: impl Into<Vec<u8>>, password: impl Into<Vec<u8>>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for AuthPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthPair")
            .field("username", &String::from_utf8_lossy(&self.username))
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A fully parsed, authenticated request to open a tunnel.
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    pub protocol: Protocol,
    pub destination: Addr,
    pub auth: AuthPair,
}
