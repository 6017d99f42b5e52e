//! HTTP CONNECT handshake engine.
//!
//! Reads an HTTP/1.x request head, checks `Basic` credentials and resolves
//! the destination from the `Host` header. After a successful CONNECT the
//! connection carries opaque bytes only; nothing past the head is parsed.

use std::net::Ipv6Addr;
use std::pin::Pin;
use std::task::{Context, Poll};

use base64::Engine;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, BufReader, ReadBuf,
};

use crate::credential::CredentialStore;
use crate::error::{Result, Stage, TunnelError};
use crate::types::{Addr, AuthPair, Protocol, TunnelRequest};

/// Upper bound on the request line plus headers.
pub const MAX_HEAD_BYTES: usize = 8 * 1024;
/// Upper bound on the number of header lines.
pub const MAX_HEADER_LINES: usize = 100;
/// Port used when the `Host` header carries none.
pub const DEFAULT_CONNECT_PORT: u16 = 443;
/// Realm advertised in authentication challenges.
pub const AUTH_REALM: &str = "Proxy Service";

/// Response line written once the destination is connected.
pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Parsed request line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Get the first header named `name`, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Request path without any query string.
    pub fn path(&self) -> &str {
        self.target
            .split(|c: char| c == '?' || c == '#')
            .next()
            .unwrap_or("")
    }
}

/// Read a request head terminated by an empty line.
pub async fn read_head<R>(reader: &mut R) -> Result<RequestHead>
where
    R: AsyncBufRead + Unpin,
{
    let mut budget = MAX_HEAD_BYTES;

    let request_line = read_line(reader, &mut budget).await?;
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() != 3 || !parts[2].starts_with("HTTP/") {
        return Err(TunnelError::protocol(Stage::HttpHead, "malformed request line"));
    }

    let mut headers = Vec::new();
    loop {
        let line = read_line(reader, &mut budget).await?;
        if line.is_empty() {
            break;
        }
        if headers.len() == MAX_HEADER_LINES {
            return Err(TunnelError::protocol(Stage::HttpHead, "too many headers"));
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| TunnelError::protocol(Stage::HttpHead, "malformed header line"))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(RequestHead {
        method: parts[0].to_string(),
        target: parts[1].to_string(),
        version: parts[2].to_string(),
        headers,
    })
}

/// Read one CRLF- or LF-terminated line, charging it against `budget`.
async fn read_line<R>(reader: &mut R, budget: &mut usize) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    if *budget == 0 {
        return Err(TunnelError::protocol(Stage::HttpHead, "request head too large"));
    }

    let mut line = String::new();
    let n = (&mut *reader)
        .take(*budget as u64)
        .read_line(&mut line)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::InvalidData => {
                TunnelError::protocol(Stage::HttpHead, "request head is not valid UTF-8")
            }
            _ => TunnelError::from_read(Stage::HttpHead, e),
        })?;

    if n == 0 {
        return Err(TunnelError::PeerDisconnected {
            stage: Stage::HttpHead,
        });
    }
    if !line.ends_with('\n') {
        return Err(if n == *budget {
            TunnelError::protocol(Stage::HttpHead, "request head too large")
        } else {
            TunnelError::PeerDisconnected {
                stage: Stage::HttpHead,
            }
        });
    }

    *budget -= n;
    let trimmed = line.trim_end_matches(['\r', '\n']).len();
    line.truncate(trimmed);
    Ok(line)
}

/// Reasons a CONNECT request is refused before any destination is dialed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// No `Basic` credentials were offered
    MissingCredentials,
    /// Credentials were not valid base64 `user:pass`
    MalformedCredentials,
    /// Credentials did not match
    InvalidCredentials,
    /// No `Host` header
    MissingHost,
    /// `Host` header could not be parsed
    InvalidHost,
    /// Request head could not be parsed
    MalformedRequest,
}

impl Rejection {
    pub fn status(&self) -> (u16, &'static str) {
        match self {
            Rejection::MissingCredentials
            | Rejection::MalformedCredentials
            | Rejection::InvalidCredentials => (401, "Unauthorized"),
            Rejection::MissingHost | Rejection::InvalidHost | Rejection::MalformedRequest => {
                (400, "Bad Request")
            }
        }
    }

    fn message(&self) -> &'static str {
        match self {
            Rejection::MissingCredentials => "Proxy authentication required",
            Rejection::MalformedCredentials => "Invalid authentication format",
            Rejection::InvalidCredentials => "Invalid credentials",
            Rejection::MissingHost => "Missing Host header",
            Rejection::InvalidHost => "Invalid Host header",
            Rejection::MalformedRequest => "Malformed request",
        }
    }

    /// Full HTTP response for this rejection.
    pub fn response(&self) -> Vec<u8> {
        let (code, reason) = self.status();
        let challenge = format!("Basic realm=\"{}\"", AUTH_REALM);
        let mut headers = Vec::new();
        if code == 401 {
            headers.push(("WWW-Authenticate", challenge.as_str()));
            headers.push(("Proxy-Authenticate", challenge.as_str()));
        }
        response(code, reason, "text/plain; charset=utf-8", &headers, self.message())
    }

    pub fn into_error(self) -> TunnelError {
        match self {
            Rejection::MissingCredentials
            | Rejection::MalformedCredentials
            | Rejection::InvalidCredentials => TunnelError::auth(self.message()),
            _ => TunnelError::protocol(Stage::HttpHead, self.message()),
        }
    }
}

/// Validate a CONNECT request head and extract the tunnel request.
///
/// Credentials are checked before the `Host` header is looked at.
pub fn authorize_connect(
    head: &RequestHead,
    credentials: &CredentialStore,
) -> std::result::Result<TunnelRequest, Rejection> {
    let header = head
        .header("Proxy-Authorization")
        .or_else(|| head.header("Authorization"))
        .ok_or(Rejection::MissingCredentials)?;

    let auth = parse_basic_auth(header)?;
    if !credentials.verify(&auth.username, &auth.password) {
        return Err(Rejection::InvalidCredentials);
    }

    let host = head.header("Host").ok_or(Rejection::MissingHost)?;
    let destination = parse_host(host)?;

    Ok(TunnelRequest {
        protocol: Protocol::HttpConnect,
        destination,
        auth,
    })
}

/// Decode a `Basic <base64(user:pass)>` header value.
pub fn parse_basic_auth(value: &str) -> std::result::Result<AuthPair, Rejection> {
    let (scheme, encoded) = value
        .trim()
        .split_once(' ')
        .ok_or(Rejection::MissingCredentials)?;
    if !scheme.eq_ignore_ascii_case("Basic") {
        return Err(Rejection::MissingCredentials);
    }

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| Rejection::MalformedCredentials)?;
    let colon = decoded
        .iter()
        .position(|&b| b == b':')
        .ok_or(Rejection::MalformedCredentials)?;

    Ok(AuthPair::new(&decoded[..colon], &decoded[colon + 1..]))
}

/// Parse `host[:port]`, including bracketed IPv6 literals.
pub fn parse_host(value: &str) -> std::result::Result<Addr, Rejection> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Rejection::InvalidHost);
    }

    let (host, port) = if let Some(rest) = value.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or(Rejection::InvalidHost)?;
        let port = match after {
            "" => None,
            p => Some(p.strip_prefix(':').ok_or(Rejection::InvalidHost)?),
        };
        (host, port)
    } else if value.parse::<Ipv6Addr>().is_ok() {
        (value, None)
    } else {
        match value.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (value, None),
        }
    };

    if host.is_empty() {
        return Err(Rejection::InvalidHost);
    }

    let port = match port {
        Some(p) => p.parse::<u16>().map_err(|_| Rejection::InvalidHost)?,
        None => DEFAULT_CONNECT_PORT,
    };

    Ok(Addr::new(host, port))
}

/// Build a complete `Connection: close` response.
pub fn response(
    code: u16,
    reason: &str,
    content_type: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {} {}\r\n", code, reason);
    for (name, value) in headers {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    out.push_str(&format!(
        "Content-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        content_type,
        body.len()
    ));
    out.push_str(body);
    out.into_bytes()
}

/// `502 Bad Gateway` carrying the connector's error text.
pub fn bad_gateway(message: &str) -> Vec<u8> {
    response(502, "Bad Gateway", "text/plain; charset=utf-8", &[], message)
}

/// Stream that replays bytes buffered during the handshake before reading
/// from the socket again.
pub struct PrefixedStream<S> {
    inner: S,
    prefix: Vec<u8>,
    pos: usize,
}

impl<S> PrefixedStream<S> {
    pub fn new(inner: S, prefix: Vec<u8>) -> Self {
        Self {
            inner,
            prefix,
            pos: 0,
        }
    }

    /// Take over a handshake reader, keeping whatever it had buffered.
    pub fn from_buf_reader(reader: BufReader<S>) -> Self
    where
        S: AsyncRead,
    {
        let prefix = reader.buffer().to_vec();
        Self::new(reader.into_inner(), prefix)
    }

    pub fn buffered(&self) -> &[u8] {
        &self.prefix[self.pos..]
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.pos < self.prefix.len() {
            let remaining = &self.prefix[self.pos..];
            let to_copy = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..to_copy]);
            self.pos += to_copy;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
