//! Gated Tunnel - an authenticated HTTP CONNECT and SOCKS5 proxy for Rust
//!
//! This library accepts client connections, authenticates them against a
//! single username/password pair and relays bytes to the requested
//! destination:
//! - HTTP CONNECT with `Basic` credentials
//! - SOCKS5 (RFC 1928) with username/password sub-negotiation (RFC 1929)
//! - Optional mixed listener that serves both protocols on one port
//! - Unauthenticated status routes for keep-warm pingers
//!
//! # Example
//!
//! ```rust,no_run
//! use gated_tunnel::{Credential, CredentialStore, Server, ServerConfig};
//!
//! # async fn run() -> gated_tunnel::Result<()> {
//! let config = ServerConfig::from_env()?;
//! let credentials = CredentialStore::new(Credential::from_env());
//!
//! let server = Server::new(config, credentials)?;
//! println!("{:?}", server.service_info());
//!
//! server.bind().await?.serve().await
//! # }
//! ```
//!
//! # Session flow
//!
//! Each accepted connection runs handshake, destination connect and relay in
//! order. Credentials are checked before any destination socket is opened,
//! and no byte is relayed before the destination connect succeeds.
//!
//! | Step | HTTP CONNECT | SOCKS5 |
//! |------|--------------|--------|
//! | Auth failure | `401` | `01 01` |
//! | Malformed input | `400` | silent close |
//! | Connect failure | `502` | `05 01 ...` |
//! | Established | `200 Connection Established` | `05 00 ...` |

pub mod config;
pub mod connector;
pub mod credential;
pub mod error;
pub mod http;
pub mod relay;
pub mod server;
pub mod session;
pub mod socks5;
pub mod status;
pub mod types;

// Re-export commonly used items
pub use config::ServerConfig;
pub use connector::{Connector, DirectConnector, DirectOptions, DEFAULT_CONNECT_TIMEOUT};
pub use credential::{Credential, CredentialSource, CredentialStore};
pub use error::{ConnectErrorKind, Result, Stage, TunnelError, TunnelErrorKind};
pub use relay::{relay, RelayOutcome, RelayStats};
pub use server::{BoundServer, Server};
pub use session::{ListenerKind, SessionContext, SessionOutcome};
pub use status::{ServiceInfo, StatusTracker};
pub use types::{Addr, AuthPair, Protocol, TunnelRequest};
