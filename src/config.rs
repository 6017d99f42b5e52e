//! Server configuration.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use crate::connector::{DirectOptions, DEFAULT_CONNECT_TIMEOUT};
use crate::error::{Result, TunnelError};

/// Default HTTP CONNECT port
pub const DEFAULT_HTTP_PORT: u16 = 8080;
/// Default SOCKS5 port
pub const DEFAULT_SOCKS5_PORT: u16 = 1080;
/// Default limit on the handshake phase of a session
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// Advertised domain when none is configured
pub const DEFAULT_SERVER_DOMAIN: &str = "localhost";

/// Listener addresses, timeouts and advertised service details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// HTTP CONNECT listener
    pub http_addr: SocketAddr,
    /// SOCKS5 listener
    pub socks5_addr: SocketAddr,
    /// Optional listener that accepts both protocols
    pub mixed_addr: Option<SocketAddr>,
    /// Destination connect timeout
    pub connect_timeout: Duration,
    /// Limit on reading the client handshake
    pub handshake_timeout: Duration,
    /// TCP keepalive idle time for destination sockets
    pub keepalive: Option<Duration>,
    /// Local IPv4 address for outbound destination sockets
    pub bind_ip4: Option<Ipv4Addr>,
    /// Local IPv6 address for outbound destination sockets
    pub bind_ip6: Option<Ipv6Addr>,
    /// Public hostname advertised in status documents
    pub server_domain: String,
    /// Public port advertised in status documents
    pub external_port: u16,
    /// Serve `GET /api/credentials`
    pub expose_credentials: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        Self {
            http_addr: SocketAddr::new(any, DEFAULT_HTTP_PORT),
            socks5_addr: SocketAddr::new(any, DEFAULT_SOCKS5_PORT),
            mixed_addr: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            keepalive: None,
            bind_ip4: None,
            bind_ip6: None,
            server_domain: DEFAULT_SERVER_DOMAIN.to_string(),
            external_port: DEFAULT_HTTP_PORT,
            expose_credentials: false,
        }
    }
}

impl ServerConfig {
    /// Create a new config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_http_addr(mut self, addr: SocketAddr) -> Self {
        self.http_addr = addr;
        self
    }

    pub fn with_socks5_addr(mut self, addr: SocketAddr) -> Self {
        self.socks5_addr = addr;
        self
    }

    pub fn with_mixed_addr(mut self, addr: Option<SocketAddr>) -> Self {
        self.mixed_addr = addr;
        self
    }

    /// Set destination connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Bind outbound IPv4 connections to this local address.
    pub fn with_bind_ip4(mut self, ip: Option<Ipv4Addr>) -> Self {
        self.bind_ip4 = ip;
        self
    }

    /// Bind outbound IPv6 connections to this local address.
    pub fn with_bind_ip6(mut self, ip: Option<Ipv6Addr>) -> Self {
        self.bind_ip6 = ip;
        self
    }

    pub fn with_server_domain(mut self, domain: impl Into<String>) -> Self {
        self.server_domain = domain.into();
        self
    }

    pub fn with_external_port(mut self, port: u16) -> Self {
        self.external_port = port;
        self
    }

    pub fn with_expose_credentials(mut self, expose: bool) -> Self {
        self.expose_credentials = expose;
        self
    }

    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from a key lookup. Unset or empty keys keep defaults.
    ///
    /// Only parse errors are reported here; call [`ServerConfig::validate`]
    /// once every other override has been applied.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        let listen_ip = match get("LISTEN_ADDR") {
            Some(v) => parse_value::<IpAddr>("LISTEN_ADDR", &v)?,
            None => config.http_addr.ip(),
        };

        let http_port = match (get("HTTP_PORT"), get("PORT")) {
            (Some(v), _) => parse_value::<u16>("HTTP_PORT", &v)?,
            (None, Some(v)) => parse_value::<u16>("PORT", &v)?,
            (None, None) => DEFAULT_HTTP_PORT,
        };
        config.http_addr = SocketAddr::new(listen_ip, http_port);

        let socks5_port = match get("SOCKS5_PORT") {
            Some(v) => parse_value::<u16>("SOCKS5_PORT", &v)?,
            None => DEFAULT_SOCKS5_PORT,
        };
        config.socks5_addr = SocketAddr::new(listen_ip, socks5_port);

        if let Some(v) = get("MIXED_PORT") {
            let port = parse_value::<u16>("MIXED_PORT", &v)?;
            config.mixed_addr = Some(SocketAddr::new(listen_ip, port));
        }

        if let Some(v) = get("CONNECT_TIMEOUT_SECS") {
            config.connect_timeout = Duration::from_secs(parse_value("CONNECT_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("HANDSHAKE_TIMEOUT_SECS") {
            config.handshake_timeout =
                Duration::from_secs(parse_value("HANDSHAKE_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("TCP_KEEPALIVE_SECS") {
            config.keepalive = Some(Duration::from_secs(parse_value("TCP_KEEPALIVE_SECS", &v)?));
        }
        if let Some(v) = get("BIND_IP4") {
            config.bind_ip4 = Some(parse_value("BIND_IP4", &v)?);
        }
        if let Some(v) = get("BIND_IP6") {
            config.bind_ip6 = Some(parse_value("BIND_IP6", &v)?);
        }

        if let Some(v) = get("RENDER_EXTERNAL_HOSTNAME") {
            config.server_domain = v.trim().to_string();
        }
        config.external_port = match get("EXTERNAL_PORT") {
            Some(v) => parse_value("EXTERNAL_PORT", &v)?,
            None => http_port,
        };

        if let Some(v) = get("EXPOSE_CREDENTIALS") {
            config.expose_credentials = parse_bool("EXPOSE_CREDENTIALS", &v)?;
        }

        Ok(config)
    }

    /// Check the config for values that cannot work together.
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout.is_zero() {
            return Err(TunnelError::ConfigError(
                "connect timeout must be greater than zero".to_string(),
            ));
        }
        if self.handshake_timeout.is_zero() {
            return Err(TunnelError::ConfigError(
                "handshake timeout must be greater than zero".to_string(),
            ));
        }
        if self.server_domain.is_empty() {
            return Err(TunnelError::ConfigError(
                "server domain must not be empty".to_string(),
            ));
        }

        let mut addrs = vec![("http", self.http_addr), ("socks5", self.socks5_addr)];
        if let Some(mixed) = self.mixed_addr {
            addrs.push(("mixed", mixed));
        }
        for (i, (name, addr)) in addrs.iter().enumerate() {
            if addr.port() == 0 {
                continue;
            }
            if let Some((other, _)) = addrs[i + 1..].iter().find(|(_, a)| a == addr) {
                return Err(TunnelError::ConfigError(format!(
                    "{} and {} listeners share address {}",
                    name, other, addr
                )));
            }
        }
        Ok(())
    }

    /// Connector options derived from this config.
    pub fn connector_options(&self) -> DirectOptions {
        DirectOptions {
            bind_ip4: self.bind_ip4,
            bind_ip6: self.bind_ip6,
            keepalive: self.keepalive,
            timeout: Some(self.connect_timeout),
        }
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| TunnelError::ConfigError(format!("Invalid {} '{}': {}", key, value, e)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(TunnelError::ConfigError(format!(
            "Invalid {} '{}': expected a boolean",
            key, value
        ))),
    }
}
