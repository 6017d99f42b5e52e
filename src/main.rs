//! Gated Tunnel binary
//!
//! Reads configuration from the environment, lets command-line flags
//! override it, and serves until Ctrl-C.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use gated_tunnel::{Credential, CredentialStore, Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address all listeners bind to
    #[arg(long)]
    listen_addr: Option<IpAddr>,

    /// Port for the HTTP CONNECT listener
    #[arg(long)]
    http_port: Option<u16>,

    /// Port for the SOCKS5 listener
    #[arg(long)]
    socks5_port: Option<u16>,

    /// Port for a listener that accepts both protocols
    #[arg(long)]
    mixed_port: Option<u16>,

    /// Proxy username; generated when unset
    #[arg(short, long, env = "PROXY_USERNAME", hide_env_values = true)]
    username: Option<String>,

    /// Proxy password; generated when unset
    #[arg(short = 'P', long, env = "PROXY_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Destination connect timeout in seconds
    #[arg(long)]
    connect_timeout: Option<u64>,

    /// Client handshake timeout in seconds
    #[arg(long)]
    handshake_timeout: Option<u64>,

    /// Local IPv4 address for outbound connections
    #[arg(long)]
    bind_ip4: Option<Ipv4Addr>,

    /// Local IPv6 address for outbound connections
    #[arg(long)]
    bind_ip6: Option<Ipv6Addr>,

    /// Public hostname advertised by the status routes
    #[arg(long)]
    server_domain: Option<String>,

    /// Public port advertised by the status routes
    #[arg(long)]
    external_port: Option<u16>,

    /// Serve GET /api/credentials
    #[arg(long)]
    expose_credentials: bool,
}

impl Cli {
    fn apply(&self, mut config: ServerConfig) -> ServerConfig {
        if let Some(ip) = self.listen_addr {
            config.http_addr.set_ip(ip);
            config.socks5_addr.set_ip(ip);
            if let Some(mixed) = config.mixed_addr.as_mut() {
                mixed.set_ip(ip);
            }
        }
        if let Some(port) = self.http_port {
            config.http_addr.set_port(port);
        }
        if let Some(port) = self.socks5_port {
            config.socks5_addr.set_port(port);
        }
        if let Some(port) = self.mixed_port {
            let ip = config.http_addr.ip();
            config.mixed_addr = Some(SocketAddr::new(ip, port));
        }
        if let Some(secs) = self.connect_timeout {
            config = config.with_connect_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.handshake_timeout {
            config = config.with_handshake_timeout(Duration::from_secs(secs));
        }
        if self.bind_ip4.is_some() {
            config = config.with_bind_ip4(self.bind_ip4);
        }
        if self.bind_ip6.is_some() {
            config = config.with_bind_ip6(self.bind_ip6);
        }
        if let Some(domain) = &self.server_domain {
            config = config.with_server_domain(domain.clone());
        }
        if let Some(port) = self.external_port {
            config = config.with_external_port(port);
        }
        if self.expose_credentials {
            config = config.with_expose_credentials(true);
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let config = cli.apply(ServerConfig::from_env().context("invalid environment configuration")?);

    let credentials = CredentialStore::new(Credential::resolve(
        cli.username.clone(),
        cli.password.clone(),
    ));

    let server = Server::new(config, credentials).context("invalid configuration")?;
    let info = server.service_info();
    tracing::info!(
        server = %info.server_domain,
        port = info.external_port,
        "service advertised"
    );

    let bound = server.bind().await?;

    tokio::select! {
        result = bound.serve() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
    }

    Ok(())
}
