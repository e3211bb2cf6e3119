//! stalltun-core: TCP relay with controllable stalls, for exercising timeouts.
//!
//! Provides a [`Tunnel`] that sits between a client and a real server and can
//! hold back traffic in either direction on demand, plus [`TimeoutStream`], a
//! stream wrapper that arms a deadline on every write and clears the read
//! deadline after every read.

pub mod config;
pub mod error;
pub mod gate;
pub mod latch;
pub mod relay;
pub mod timeout;
pub mod tunnel;

// Re-export commonly used items at crate root.
pub use config::TunnelConfig;
pub use error::{TunnelError, TunnelResult};
pub use gate::StallGate;
pub use relay::{Direction, SessionSummary};
pub use timeout::TimeoutStream;
pub use tunnel::{SessionInfo, Tunnel, TunnelStatus};
