//! Session acceptor and control surface.
//!
//! A [`Tunnel`] binds a local listener and runs a background accept loop.
//! Sessions are served one at a time: accept a client, dial the fixed remote
//! address, relay until both directions end, then accept the next client.
//!
//! # State machine
//!
//! ```text
//! Accepting → Dialing → Relaying → Accepting ...
//!     │          │
//!     └──error───┴──→ Stopped (error latched, listener dropped)
//! any ──close()──→ Stopped
//! ```
//!
//! Accept and dial failures are fatal and are reported by [`Tunnel::close`].
//! I/O failures inside a session only end that session.
//!
//! Dropping a `Tunnel` without calling [`Tunnel::close`] still stops the
//! background loop and any live session, but does not wait for them.

use crate::config::TunnelConfig;
use crate::error::{TunnelError, TunnelResult};
use crate::latch::ErrorLatch;
use crate::relay::{self, Gates};
use serde::Serialize;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Snapshot of the session currently being relayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// Sequence number, starting at 1.
    pub id: u64,
    /// Address of the accepted client.
    pub client_addr: SocketAddr,
    /// Resolved address of the dialed upstream, if the OS reported one.
    pub upstream_addr: Option<SocketAddr>,
}

/// Serializable view of a tunnel, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelStatus {
    /// Address clients connect to, as returned by [`Tunnel::addr`].
    pub listen_addr: String,
    /// Upstream every session is dialed to.
    pub remote_addr: String,
    /// `false` once the accept loop has exited.
    pub running: bool,
    /// Server→client traffic is held.
    pub read_locked: bool,
    /// Client→server traffic is held.
    pub write_locked: bool,
    pub sessions_started: u64,
    /// The session being relayed, if any.
    pub session: Option<SessionInfo>,
    /// The fatal accept or dial error, once one has been latched.
    pub error: Option<String>,
}

/// State shared between the control surface and the accept loop.
#[derive(Debug)]
struct Shared {
    /// First fatal error of the accept loop.
    latch: ErrorLatch,
    /// Written by the accept loop only; read by the control surface.
    session: std::sync::Mutex<Option<SessionInfo>>,
    sessions_started: AtomicU64,
    /// Flipped to `true` by the accept loop as its last action.
    exited: watch::Sender<bool>,
}

impl Shared {
    fn set_session(&self, info: Option<SessionInfo>) {
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = info;
    }

    fn session(&self) -> Option<SessionInfo> {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// A stallable TCP relay between a local listener and one fixed upstream.
#[derive(Debug)]
pub struct Tunnel {
    /// Bound listener address, with the OS-assigned port.
    local_addr: SocketAddr,
    remote_addr: String,
    /// Shared with every session; they persist across sessions.
    gates: Gates,
    shared: Arc<Shared>,
    /// Set by [`Tunnel::close`]. Dropping it also stops the loop.
    shutdown: watch::Sender<bool>,
    /// Held across the join in [`Tunnel::close`] so concurrent callers wait
    /// for the same exit.
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Tunnel {
    /// Listen on an ephemeral loopback port and relay to `remote_addr`.
    ///
    /// # Errors
    ///
    /// See [`Tunnel::start`].
    pub async fn bind(remote_addr: impl Into<String>) -> TunnelResult<Self> {
        Self::start(TunnelConfig::new(remote_addr)).await
    }

    /// Bind the listener and spawn the accept loop.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Arguments
    ///
    /// * `config` - Listen address, upstream address, buffer size and the
    ///   optional connect timeout. Validated before anything is bound.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Config`] for an invalid configuration and
    /// [`TunnelError::Bind`] if the listener cannot be created. Nothing is
    /// left running in either case.
    pub async fn start(config: TunnelConfig) -> TunnelResult<Self> {
        config.validate()?;

        let bind_err = |e: io::Error| TunnelError::Bind {
            addr: config.listen_addr.to_string(),
            source: Arc::new(e),
        };
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        info!(addr = %local_addr, remote = %config.remote_addr, "tunnel listening");

        let gates = Gates::new();
        let shared = Arc::new(Shared {
            latch: ErrorLatch::new(),
            session: std::sync::Mutex::new(None),
            sessions_started: AtomicU64::new(0),
            exited: watch::Sender::new(false),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);

        let remote_addr = config.remote_addr.clone();
        let task = tokio::spawn(accept_loop(
            listener,
            config,
            gates.clone(),
            shared.clone(),
            shutdown_rx,
        ));

        Ok(Self {
            local_addr,
            remote_addr,
            gates,
            shared,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `host:port` clients should connect to. An unspecified bind address is
    /// reported as the loopback address of the same family.
    pub fn addr(&self) -> String {
        let mut addr = self.local_addr;
        if addr.ip().is_unspecified() {
            match addr {
                SocketAddr::V4(_) => addr.set_ip(Ipv4Addr::LOCALHOST.into()),
                SocketAddr::V6(_) => addr.set_ip(Ipv6Addr::LOCALHOST.into()),
            }
        }
        addr.to_string()
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Hold server→client traffic, starting with the next chunk.
    pub fn lock_read(&self) {
        debug!("read locked");
        self.gates.read.lock();
    }

    /// Release server→client traffic. No-op if not locked.
    pub fn unlock_read(&self) {
        debug!("read unlocked");
        self.gates.read.unlock();
    }

    /// Hold client→server traffic, starting with the next chunk.
    pub fn lock_write(&self) {
        debug!("write locked");
        self.gates.write.lock();
    }

    /// Release client→server traffic. No-op if not locked.
    pub fn unlock_write(&self) {
        debug!("write unlocked");
        self.gates.write.unlock();
    }

    /// The session being relayed right now, if any.
    pub fn session(&self) -> Option<SessionInfo> {
        self.shared.session()
    }

    /// Number of sessions established so far.
    pub fn sessions_started(&self) -> u64 {
        self.shared.sessions_started.load(Ordering::Relaxed)
    }

    /// Whether the accept loop is still running.
    pub fn is_running(&self) -> bool {
        !*self.shared.exited.borrow()
    }

    /// Resolves once the accept loop has exited, whether through
    /// [`Tunnel::close`] or a fatal accept or dial error. Does not stop the
    /// loop itself.
    pub async fn stopped(&self) {
        let mut exited = self.shared.exited.subscribe();
        let _ = exited.wait_for(|done| *done).await;
    }

    pub fn status(&self) -> TunnelStatus {
        TunnelStatus {
            listen_addr: self.addr(),
            remote_addr: self.remote_addr.clone(),
            running: self.is_running(),
            read_locked: self.gates.read.is_armed(),
            write_locked: self.gates.write.is_armed(),
            sessions_started: self.sessions_started(),
            session: self.session(),
            error: self.shared.latch.get().map(|e| e.to_string()),
        }
    }

    /// Stop the tunnel and wait for the accept loop to exit.
    ///
    /// Stops a pending accept or dial and cancels the live session, closing
    /// both of its legs. Safe to call concurrently and repeatedly; every call
    /// returns the same result.
    ///
    /// # Errors
    ///
    /// Returns the accept or dial error that stopped the loop, if one was
    /// recorded before the loop observed the shutdown.
    pub async fn close(&self) -> TunnelResult<()> {
        self.shutdown.send_replace(true);

        let mut task = self.task.lock().await;
        // Cleared only after the join completes, so a close future dropped
        // mid-join leaves the handle for the next caller.
        if let Some(handle) = task.as_mut() {
            if let Err(e) = handle.await {
                warn!(error = %e, "accept loop panicked");
            }
            *task = None;
            info!(addr = %self.local_addr, "tunnel closed");
        }
        drop(task);

        match self.shared.latch.get() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

async fn dial(config: &TunnelConfig) -> io::Result<TcpStream> {
    let connect = TcpStream::connect(config.remote_addr.as_str());
    let stream = match config.connect_timeout() {
        Some(limit) => tokio::time::timeout(limit, connect)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??,
        None => connect.await?,
    };
    Ok(stream)
}

/// Accept, dial, relay; repeat until shutdown or a fatal error.
async fn accept_loop(
    listener: TcpListener,
    config: TunnelConfig,
    gates: Gates,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = relay::stopped(&mut shutdown) => break,
            result = listener.accept() => result,
        };
        let (local, client_addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed, tunnel stopping");
                shared.latch.set(TunnelError::Accept(Arc::new(e)));
                break;
            }
        };
        debug!(client = %client_addr, remote = %config.remote_addr, "accepted local, dialing remote");

        let dialed = tokio::select! {
            biased;
            _ = relay::stopped(&mut shutdown) => break,
            result = dial(&config) => result,
        };
        let remote = match dialed {
            Ok(stream) => stream,
            Err(e) => {
                warn!(remote = %config.remote_addr, error = %e, "dial failed, tunnel stopping");
                shared.latch.set(TunnelError::Dial {
                    addr: config.remote_addr.clone(),
                    source: Arc::new(e),
                });
                break;
            }
        };
        let _ = local.set_nodelay(true);
        let _ = remote.set_nodelay(true);

        let id = shared.sessions_started.fetch_add(1, Ordering::Relaxed) + 1;
        let info = SessionInfo {
            id,
            client_addr,
            upstream_addr: remote.peer_addr().ok(),
        };
        info!(session = id, client = %client_addr, remote = %config.remote_addr, "session established");
        shared.set_session(Some(info));

        let summary =
            relay::run_session(id, local, remote, &gates, &shutdown, config.buffer_size).await;

        shared.set_session(None);
        info!(
            session = id,
            bytes_up = summary.bytes_up,
            bytes_down = summary.bytes_down,
            "session ended"
        );
    }

    debug!("accept loop ended");
    shared.exited.send_replace(true);
}
