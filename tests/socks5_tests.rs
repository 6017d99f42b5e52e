//! End-to-end SOCKS5 tests against a bound server and a local echo destination

use std::net::SocketAddr;
use std::time::Duration;

use gated_tunnel::{Credential, CredentialStore, ListenerKind, Server, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn start_proxy(config: ServerConfig) -> (SocketAddr, Option<SocketAddr>) {
    let credentials = CredentialStore::new(Credential::fixed("user", "pass"));
    let bound = Server::new(config, credentials)
        .unwrap()
        .bind()
        .await
        .unwrap();
    let socks5 = bound.local_addr(ListenerKind::Socks5).unwrap();
    let mixed = bound.local_addr(ListenerKind::Mixed);
    tokio::spawn(bound.serve());
    (socks5, mixed)
}

fn local_config() -> ServerConfig {
    ServerConfig::new()
        .with_http_addr("127.0.0.1:0".parse().unwrap())
        .with_socks5_addr("127.0.0.1:0".parse().unwrap())
        .with_connect_timeout(Duration::from_secs(3))
}

async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = socket.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

/// Greeting plus sub-negotiation, asserting both replies.
async fn authenticate(stream: &mut TcpStream, username: &[u8], password: &[u8]) -> [u8; 2] {
    stream.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x02]);

    let mut frame = vec![0x01, username.len() as u8];
    frame.extend_from_slice(username);
    frame.push(password.len() as u8);
    frame.extend_from_slice(password);
    stream.write_all(&frame).await.unwrap();
    stream.read_exact(&mut reply).await.unwrap();
    reply
}

fn connect_domain(host: &str, port: u16) -> Vec<u8> {
    let mut frame = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    frame.extend_from_slice(host.as_bytes());
    frame.extend_from_slice(&port.to_be_bytes());
    frame
}

#[tokio::test]
async fn test_socks5_tunnel_by_domain() {
    let echo = echo_server().await;
    let (proxy, _) = start_proxy(local_config()).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    assert_eq!(authenticate(&mut client, b"user", b"pass").await, [0x01, 0x00]);

    client
        .write_all(&connect_domain("localhost", echo.port()))
        .await
        .unwrap();
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

    let payload: Vec<u8> = (0..=255u8).cycle().take(50_000).collect();
    let (mut reader, mut writer) = client.into_split();
    let expected = payload.clone();
    let send = tokio::spawn(async move {
        writer.write_all(&payload).await.unwrap();
        writer
    });

    let mut received = vec![0u8; expected.len()];
    reader.read_exact(&mut received).await.unwrap();
    assert_eq!(received, expected);
    send.await.unwrap();
}

#[tokio::test]
async fn test_socks5_wrong_password_closes() {
    let (proxy, _) = start_proxy(local_config()).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    assert_eq!(authenticate(&mut client, b"user", b"nope").await, [0x01, 0x01]);

    let mut rest = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
        .await
        .expect("connection was not closed")
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_socks5_no_acceptable_method() {
    let (proxy, _) = start_proxy(local_config()).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, vec![0x05, 0xFF]);
}

#[tokio::test]
async fn test_socks5_wrong_version_silent_close() {
    let (proxy, _) = start_proxy(local_config()).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.unwrap();
    assert!(reply.is_empty());
}

#[tokio::test]
async fn test_socks5_auth_failure_with_pipelined_request_closes_cleanly() {
    let (proxy, _) = start_proxy(local_config()).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x02]);

    let mut frame = vec![0x01, 0x04];
    frame.extend_from_slice(b"user");
    frame.push(0x04);
    frame.extend_from_slice(b"nope");
    frame.extend_from_slice(&connect_domain("example.com", 443));
    client.write_all(&frame).await.unwrap();

    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
        .await
        .expect("connection was not closed")
        .unwrap();
    assert_eq!(rest, vec![0x01, 0x01]);
}

#[tokio::test]
async fn test_socks5_connect_refused() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let (proxy, _) = start_proxy(local_config()).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    assert_eq!(authenticate(&mut client, b"user", b"pass").await, [0x01, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&port.to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, vec![0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
}

#[tokio::test]
async fn test_mixed_port_serves_socks5() {
    let echo = echo_server().await;
    let config = local_config().with_mixed_addr(Some("127.0.0.1:0".parse().unwrap()));
    let (_, mixed) = start_proxy(config).await;

    let mut client = TcpStream::connect(mixed.unwrap()).await.unwrap();
    assert_eq!(authenticate(&mut client, b"user", b"pass").await, [0x01, 0x00]);
    client
        .write_all(&connect_domain("127.0.0.1", echo.port()))
        .await
        .unwrap();
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00);

    client.write_all(b"mixed").await.unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"mixed");
}

#[tokio::test]
async fn test_destination_close_closes_client() {
    // Destination that sends a greeting and hangs up
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        socket.write_all(b"bye").await.unwrap();
    });

    let (proxy, _) = start_proxy(local_config()).await;
    let mut client = TcpStream::connect(proxy).await.unwrap();
    assert_eq!(authenticate(&mut client, b"user", b"pass").await, [0x01, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&port.to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
        .await
        .expect("client was not closed")
        .unwrap();
    assert_eq!(&rest[10..], b"bye");
}
