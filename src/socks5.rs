//! SOCKS5 handshake engine.
//!
//! Server side of RFC 1928 with the RFC 1929 username/password method. The
//! negotiation is an explicit state machine; any invalid input moves it to
//! [`NegotiationState::Rejected`] and the caller closes the connection.

use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::credential::CredentialStore;
use crate::error::{Result, Stage, TunnelError};
use crate::types::{Addr, AuthPair, Protocol, TunnelRequest};

pub const SOCKS5_VERSION: u8 = 0x05;
pub const SOCKS5_AUTH_VERSION: u8 = 0x01;

pub const SOCKS5_AUTH_PASSWORD: u8 = 0x02;
pub const SOCKS5_AUTH_NO_ACCEPTABLE: u8 = 0xFF;

pub const SOCKS5_AUTH_STATUS_SUCCESS: u8 = 0x00;
pub const SOCKS5_AUTH_STATUS_FAILURE: u8 = 0x01;

pub const SOCKS5_CMD_CONNECT: u8 = 0x01;
pub const SOCKS5_CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const SOCKS5_ATYP_IPV4: u8 = 0x01;
pub const SOCKS5_ATYP_DOMAIN: u8 = 0x03;
pub const SOCKS5_ATYP_IPV6: u8 = 0x04;

pub const SOCKS5_REP_SUCCESS: u8 = 0x00;
pub const SOCKS5_REP_GENERAL_FAILURE: u8 = 0x01;
pub const SOCKS5_REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// Build a reply frame with an all-zero IPv4 bound address.
pub const fn reply_frame(rep: u8) -> [u8; 10] {
    [SOCKS5_VERSION, rep, 0x00, SOCKS5_ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}

/// Reply sent after a successful CONNECT or an acknowledged UDP ASSOCIATE.
pub const SUCCESS_REPLY: [u8; 10] = reply_frame(SOCKS5_REP_SUCCESS);

/// Negotiation progress for a single client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationState {
    AwaitingGreeting,
    AwaitingAuthMethodList { n_methods: u8 },
    AwaitingAuthCredentials,
    AwaitingConnectRequest { auth: AuthPair },
    Established,
    Rejected,
}

/// Command requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    UdpAssociate,
    Unsupported(u8),
}

impl From<u8> for Command {
    fn from(value: u8) -> Self {
        match value {
            SOCKS5_CMD_CONNECT => Command::Connect,
            SOCKS5_CMD_UDP_ASSOCIATE => Command::UdpAssociate,
            other => Command::Unsupported(other),
        }
    }
}

/// Result of a completed SOCKS5 handshake.
#[derive(Debug, Clone)]
pub struct Socks5Request {
    pub command: Command,
    pub request: TunnelRequest,
}

/// Drives the SOCKS5 negotiation over one client stream.
pub struct Handshake<'a, S> {
    stream: &'a mut S,
    credentials: &'a CredentialStore,
    state: NegotiationState,
}

impl<'a, S> Handshake<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: &'a mut S, credentials: &'a CredentialStore) -> Self {
        Self {
            stream,
            credentials,
            state: NegotiationState::AwaitingGreeting,
        }
    }

    pub fn state(&self) -> &NegotiationState {
        &self.state
    }

    /// Run the negotiation up to and including the connect request.
    ///
    /// Replies for method selection and sub-negotiation are written here;
    /// the final reply depends on the command and is left to the caller.
    pub async fn run(&mut self) -> Result<Socks5Request> {
        let result = self.drive().await;
        self.state = match result {
            Ok(_) => NegotiationState::Established,
            Err(_) => NegotiationState::Rejected,
        };
        result
    }

    async fn drive(&mut self) -> Result<Socks5Request> {
        loop {
            let state = std::mem::replace(&mut self.state, NegotiationState::Rejected);
            self.state = match state {
                NegotiationState::AwaitingGreeting => self.greeting().await?,
                NegotiationState::AwaitingAuthMethodList { n_methods } => {
                    self.method_selection(n_methods).await?
                }
                NegotiationState::AwaitingAuthCredentials => self.sub_negotiation().await?,
                NegotiationState::AwaitingConnectRequest { auth } => {
                    return self.connect_request(auth).await;
                }
                NegotiationState::Established | NegotiationState::Rejected => {
                    return Err(TunnelError::protocol(
                        Stage::Request,
                        "negotiation already finished",
                    ));
                }
            };
        }
    }

    async fn greeting(&mut self) -> Result<NegotiationState> {
        let mut header = [0u8; 2];
        self.read_exact(Stage::Greeting, &mut header).await?;

        if header[0] != SOCKS5_VERSION {
            return Err(TunnelError::protocol(
                Stage::Greeting,
                format!("unsupported SOCKS version {}", header[0]),
            ));
        }

        Ok(NegotiationState::AwaitingAuthMethodList {
            n_methods: header[1],
        })
    }

    async fn method_selection(&mut self, n_methods: u8) -> Result<NegotiationState> {
        let mut methods = vec![0u8; n_methods as usize];
        self.read_exact(Stage::Greeting, &mut methods).await?;

        if !methods.contains(&SOCKS5_AUTH_PASSWORD) {
            self.write(&[SOCKS5_VERSION, SOCKS5_AUTH_NO_ACCEPTABLE]).await?;
            return Err(TunnelError::auth("no acceptable authentication method"));
        }

        self.write(&[SOCKS5_VERSION, SOCKS5_AUTH_PASSWORD]).await?;
        Ok(NegotiationState::AwaitingAuthCredentials)
    }

    async fn sub_negotiation(&mut self) -> Result<NegotiationState> {
        let mut header = [0u8; 2];
        self.read_exact(Stage::Authentication, &mut header).await?;

        if header[0] != SOCKS5_AUTH_VERSION {
            return Err(TunnelError::protocol(
                Stage::Authentication,
                format!("unsupported auth version {}", header[0]),
            ));
        }

        let mut username = vec![0u8; header[1] as usize];
        self.read_exact(Stage::Authentication, &mut username).await?;

        let mut password_len = [0u8; 1];
        self.read_exact(Stage::Authentication, &mut password_len).await?;
        let mut password = vec![0u8; password_len[0] as usize];
        self.read_exact(Stage::Authentication, &mut password).await?;

        if !self.credentials.verify(&username, &password) {
            self.write(&[SOCKS5_AUTH_VERSION, SOCKS5_AUTH_STATUS_FAILURE])
                .await?;
            return Err(TunnelError::auth("invalid credentials"));
        }

        self.write(&[SOCKS5_AUTH_VERSION, SOCKS5_AUTH_STATUS_SUCCESS])
            .await?;
        Ok(NegotiationState::AwaitingConnectRequest {
            auth: AuthPair::new(username, password),
        })
    }

    async fn connect_request(&mut self, auth: AuthPair) -> Result<Socks5Request> {
        let mut header = [0u8; 4];
        self.read_exact(Stage::Request, &mut header).await?;

        if header[0] != SOCKS5_VERSION {
            return Err(TunnelError::protocol(
                Stage::Request,
                format!("unsupported SOCKS version {}", header[0]),
            ));
        }

        let destination = read_address(&mut *self.stream, header[3]).await?;

        Ok(Socks5Request {
            command: Command::from(header[1]),
            request: TunnelRequest {
                protocol: Protocol::Socks5,
                destination,
                auth,
            },
        })
    }

    async fn read_exact(&mut self, stage: Stage, buf: &mut [u8]) -> Result<()> {
        self.stream
            .read_exact(buf)
            .await
            .map(|_| ())
            .map_err(|e| TunnelError::from_read(stage, e))
    }

    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.stream.write_all(buf).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

/// Read a SOCKS5 address of type `atyp` followed by a big-endian port.
pub async fn read_address<R>(reader: &mut R, atyp: u8) -> Result<Addr>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let read_err = |e| TunnelError::from_read(Stage::Request, e);

    let host = match atyp {
        SOCKS5_ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            reader.read_exact(&mut octets).await.map_err(read_err)?;
            Ipv4Addr::from(octets).to_string()
        }
        SOCKS5_ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            reader.read_exact(&mut octets).await.map_err(read_err)?;
            Ipv6Addr::from(octets).to_string()
        }
        SOCKS5_ATYP_DOMAIN => {
            let len = reader.read_u8().await.map_err(read_err)? as usize;
            if len == 0 {
                return Err(TunnelError::protocol(Stage::Request, "empty domain name"));
            }
            let mut domain = vec![0u8; len];
            reader.read_exact(&mut domain).await.map_err(read_err)?;
            String::from_utf8(domain).map_err(|_| {
                TunnelError::protocol(Stage::Request, "domain name is not valid UTF-8")
            })?
        }
        other => {
            return Err(TunnelError::protocol(
                Stage::Request,
                format!("unsupported address type {}", other),
            ));
        }
    };

    let port = reader.read_u16().await.map_err(read_err)?;
    Ok(Addr::new(host, port))
}

/// Write a reply frame carrying `rep`.
pub async fn send_reply<W>(writer: &mut W, rep: u8) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&reply_frame(rep)).await?;
    writer.flush().await
}
