//! Relay engine.
//!
//! Copies bytes in both directions between two established streams. The
//! two directions run as separate tasks; when either finishes, the other is
//! cancelled and both streams are dropped, so neither socket is left
//! half-open.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinError;

/// Per-direction copy buffer size.
pub const RELAY_BUFFER_SIZE: usize = 4096;

/// Relay direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToDestination,
    DestinationToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToDestination => f.write_str("client->destination"),
            Direction::DestinationToClient => f.write_str("destination->client"),
        }
    }
}

/// How a relay ended.
#[derive(Debug)]
pub enum RelayOutcome {
    /// The client closed its side first
    ClientClosed,
    /// The destination closed its side first
    DestinationClosed,
    /// A read or write failed
    Fault {
        direction: Direction,
        error: std::io::Error,
    },
}

/// Byte counts and termination reason of a finished relay.
#[derive(Debug)]
pub struct RelayStats {
    pub client_to_destination: u64,
    pub destination_to_client: u64,
    pub outcome: RelayOutcome,
}

impl RelayStats {
    pub fn is_fault(&self) -> bool {
        matches!(self.outcome, RelayOutcome::Fault { .. })
    }
}

/// Relay bytes between `client` and `destination` until either side closes
/// or errors.
///
/// Both streams are owned by the relay and dropped before it returns.
pub async fn relay<C, D>(client: C, destination: D) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    D: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (dest_read, dest_write) = tokio::io::split(destination);

    let sent = Arc::new(AtomicU64::new(0));
    let received = Arc::new(AtomicU64::new(0));

    let mut upstream = tokio::spawn(copy_one_way(client_read, dest_write, Arc::clone(&sent)));
    let mut downstream = tokio::spawn(copy_one_way(
        dest_read,
        client_write,
        Arc::clone(&received),
    ));

    let outcome = tokio::select! {
        result = &mut upstream => {
            downstream.abort();
            let _ = downstream.await;
            outcome_of(result, Direction::ClientToDestination)
        }
        result = &mut downstream => {
            upstream.abort();
            let _ = upstream.await;
            outcome_of(result, Direction::DestinationToClient)
        }
    };

    RelayStats {
        client_to_destination: sent.load(Ordering::Relaxed),
        destination_to_client: received.load(Ordering::Relaxed),
        outcome,
    }
}

async fn copy_one_way<R, W>(
    mut reader: R,
    mut writer: W,
    counter: Arc<AtomicU64>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
    // Best effort; the peer may already be gone.
    let _ = writer.shutdown().await;
    Ok(())
}

fn outcome_of(
    result: Result<std::io::Result<()>, JoinError>,
    direction: Direction,
) -> RelayOutcome {
    match result {
        Ok(Ok(())) => match direction {
            Direction::ClientToDestination => RelayOutcome::ClientClosed,
            Direction::DestinationToClient => RelayOutcome::DestinationClosed,
        },
        Ok(Err(error)) => RelayOutcome::Fault { direction, error },
        Err(join_error) => RelayOutcome::Fault {
            direction,
            error: std::io::Error::new(std::io::ErrorKind::Other, join_error.to_string()),
        },
    }
}
