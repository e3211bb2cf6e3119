use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Errors produced by the tunnel.
///
/// I/O sources are kept behind an `Arc` so that a latched error can be handed
/// out to every caller of [`crate::Tunnel::close`].
#[derive(Debug, Clone, Error)]
pub enum TunnelError {
    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("accept: {0}")]
    Accept(#[source] Arc<io::Error>),

    #[error("dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("invalid config: {0}")]
    Config(String),
}

impl TunnelError {
    /// The [`io::ErrorKind`] of the underlying socket error, if any.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            TunnelError::Bind { source, .. } | TunnelError::Dial { source, .. } => {
                Some(source.kind())
            }
            TunnelError::Accept(source) => Some(source.kind()),
            TunnelError::Config(_) => None,
        }
    }
}

pub type TunnelResult<T> = Result<T, TunnelError>;
