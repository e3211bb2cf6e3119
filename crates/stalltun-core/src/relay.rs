//! Duplex relay between the two legs of a session.
//!
//! Each direction runs in its own spawned task. A task reads a chunk, waits on
//! its direction's [`StallGate`], then writes the chunk to the other leg. The
//! stall sits between read and write, so a peer can have its bytes accepted
//! by the tunnel and still never see them forwarded.

use crate::gate::StallGate;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::debug;

/// Direction of travel through the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Client to server (local leg to remote leg), gated by the write gate.
    Upstream,
    /// Server to client (remote leg to local leg), gated by the read gate.
    Downstream,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Upstream => "upstream",
            Direction::Downstream => "downstream",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two gates of a tunnel. They outlive individual sessions.
#[derive(Debug, Clone, Default)]
pub struct Gates {
    /// Holds server→client traffic.
    pub read: Arc<StallGate>,
    /// Holds client→server traffic.
    pub write: Arc<StallGate>,
}

impl Gates {
    pub fn new() -> Self {
        Self::default()
    }

    /// The gate that holds traffic travelling in `direction`.
    pub fn for_direction(&self, direction: Direction) -> &Arc<StallGate> {
        match direction {
            Direction::Upstream => &self.write,
            Direction::Downstream => &self.read,
        }
    }
}

/// Byte counts of a finished session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    /// Session number, counted from 1 per tunnel.
    pub id: u64,
    /// Bytes forwarded client to server.
    pub bytes_up: u64,
    /// Bytes forwarded server to client.
    pub bytes_down: u64,
}

/// Resolves once shutdown has been requested or the sender is gone.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Relay between `local` and `remote` until both directions have ended.
///
/// Both legs are closed when this returns.
///
/// # Arguments
///
/// * `id` - Session number, used in log events and the summary.
/// * `local` - Connection accepted from the client.
/// * `remote` - Connection dialed to the upstream.
/// * `gates` - The tunnel's gates; each direction waits on its own.
/// * `shutdown` - Tunnel shutdown signal; cancels both directions.
/// * `buffer_size` - Largest chunk read before it is forwarded.
pub(crate) async fn run_session(
    id: u64,
    local: TcpStream,
    remote: TcpStream,
    gates: &Gates,
    shutdown: &watch::Receiver<bool>,
    buffer_size: usize,
) -> SessionSummary {
    let (local_rd, local_wr) = local.into_split();
    let (remote_rd, remote_wr) = remote.into_split();

    let up = tokio::spawn(pump(
        id,
        Direction::Upstream,
        local_rd,
        remote_wr,
        gates.for_direction(Direction::Upstream).clone(),
        shutdown.clone(),
        buffer_size,
    ));
    let down = tokio::spawn(pump(
        id,
        Direction::Downstream,
        remote_rd,
        local_wr,
        gates.for_direction(Direction::Downstream).clone(),
        shutdown.clone(),
        buffer_size,
    ));

    let (up, down) = tokio::join!(up, down);
    SessionSummary {
        id,
        bytes_up: up.unwrap_or_default(),
        bytes_down: down.unwrap_or_default(),
    }
}

/// Copy `reader` into `writer` one chunk at a time, consulting `gate` before
/// each write. Returns the number of bytes forwarded.
///
/// Read and write failures end the copy quietly. On end of stream the writer
/// is shut down so the far peer sees EOF; on shutdown both sides are simply
/// dropped.
///
/// # Arguments
///
/// * `session` - Session number for log events.
/// * `direction` - Which way the bytes travel.
/// * `reader` - Source half; its end of stream ends the copy.
/// * `writer` - Destination half; shut down on end of stream.
/// * `gate` - Consulted after every read, before the chunk is written.
/// * `shutdown` - Cancels the copy at a read, a gate wait or a write.
/// * `buffer_size` - Size of the transfer buffer.
pub(crate) async fn pump<R, W>(
    session: u64,
    direction: Direction,
    mut reader: R,
    mut writer: W,
    gate: Arc<StallGate>,
    mut shutdown: watch::Receiver<bool>,
    buffer_size: usize,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let mut total: u64 = 0;

    loop {
        let n = tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => {
                debug!(session, %direction, "relay cancelled");
                return total;
            }
            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    debug!(session, %direction, "peer closed");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!(session, %direction, error = %e, "read failed");
                    break;
                }
            }
        };
        debug!(session, %direction, bytes = n, "read chunk");

        let written = tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => {
                debug!(session, %direction, "relay cancelled");
                return total;
            }
            result = async {
                if gate.is_armed() {
                    debug!(session, %direction, "stalled");
                }
                gate.check_and_wait().await;
                writer.write_all(&buf[..n]).await
            } => result,
        };
        if let Err(e) = written {
            debug!(session, %direction, error = %e, "write failed");
            break;
        }
        total += n as u64;
        debug!(session, %direction, bytes = n, "forwarded chunk");
    }

    let _ = writer.shutdown().await;
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::time::timeout;

    const SHORT: Duration = Duration::from_millis(100);
    const LONG: Duration = Duration::from_secs(2);

    #[test]
    fn gates_map_directions() {
        let gates = Gates::new();
        assert!(Arc::ptr_eq(gates.for_direction(Direction::Upstream), &gates.write));
        assert!(Arc::ptr_eq(gates.for_direction(Direction::Downstream), &gates.read));
        assert_eq!(Direction::Downstream.to_string(), "downstream");
    }

    #[tokio::test]
    async fn pump_forwards_in_order_and_propagates_eof() {
        let (mut src_peer, src) = duplex(64);
        let (dst, mut dst_peer) = duplex(64);
        let (_tx, rx) = watch::channel(false);
        let task = tokio::spawn(pump(
            1,
            Direction::Upstream,
            src,
            dst,
            Arc::new(StallGate::new()),
            rx,
            16,
        ));

        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let writer = {
            let payload = payload.clone();
            tokio::spawn(async move {
                src_peer.write_all(&payload).await.unwrap();
                // Dropping closes the source.
            })
        };

        let mut received = Vec::new();
        timeout(LONG, dst_peer.read_to_end(&mut received))
            .await
            .expect("eof propagated")
            .unwrap();
        writer.await.unwrap();

        assert_eq!(received, payload);
        assert_eq!(task.await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn pump_holds_chunk_while_gate_armed() {
        let (mut src_peer, src) = duplex(64);
        let (dst, mut dst_peer) = duplex(64);
        let (_tx, rx) = watch::channel(false);
        let gate = Arc::new(StallGate::new());
        gate.lock();
        let _task = tokio::spawn(pump(
            1,
            Direction::Downstream,
            src,
            dst,
            gate.clone(),
            rx,
            64,
        ));

        src_peer.write_all(b"held").await.unwrap();
        let mut buf = [0u8; 4];
        assert!(timeout(SHORT, dst_peer.read_exact(&mut buf)).await.is_err());

        gate.unlock();
        timeout(LONG, dst_peer.read_exact(&mut buf))
            .await
            .expect("released after unlock")
            .unwrap();
        assert_eq!(&buf, b"held");
    }

    #[tokio::test]
    async fn shutdown_cancels_stalled_pump() {
        let (mut src_peer, src) = duplex(64);
        let (dst, _dst_peer) = duplex(64);
        let (tx, rx) = watch::channel(false);
        let gate = Arc::new(StallGate::new());
        gate.lock();
        let task = tokio::spawn(pump(1, Direction::Upstream, src, dst, gate.clone(), rx, 64));

        src_peer.write_all(b"never").await.unwrap();
        tokio::time::sleep(SHORT).await;
        assert!(!task.is_finished());

        tx.send_replace(true);
        let forwarded = timeout(LONG, task).await.expect("pump exits").unwrap();
        assert_eq!(forwarded, 0);
        // The gate itself is left as the control surface set it.
        assert!(gate.is_armed());
    }

    #[tokio::test]
    async fn dropped_shutdown_sender_cancels_pump() {
        let (_src_peer, src) = duplex(64);
        let (dst, _dst_peer) = duplex(64);
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(pump(
            1,
            Direction::Upstream,
            src,
            dst,
            Arc::new(StallGate::new()),
            rx,
            64,
        ));
        drop(tx);
        timeout(LONG, task).await.expect("pump exits").unwrap();
    }
}
