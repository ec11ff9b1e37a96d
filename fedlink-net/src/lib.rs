//! # FedLink Network
//!
//! Connection plumbing for FedLink.
//!
//! This crate provides:
//! - The `RendezvousStore` key-value abstraction with memory and file stores
//! - The 2-party `PairTransport` abstraction with an in-memory pair
//! - Control blob and payload envelope codecs
//! - The `Pipe` push/pull/zombie/offline handshake
//! - `FedContext`, the process-wide registry of transport groups

pub mod context;
pub mod pipe;
pub mod protocol;
pub mod store;
pub mod traits;

mod mock;
pub use mock::MemoryTransport;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::context::*;
    pub use crate::pipe::*;
    pub use crate::protocol::*;
    pub use crate::store::*;
    pub use crate::traits::*;
    pub use crate::MemoryTransport;
}

pub use store::StoreError;

/// Result type for network operations
pub type Result<T> = core::result::Result<T, Error>;

/// Network error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The peer is offline or did not answer before the deadline
    #[error("connection lost with {peer}: {reason}")]
    ConnectionLost { peer: String, reason: &'static str },
    /// Rendezvous store failure
    #[error("rendezvous store: {0}")]
    Store(#[from] StoreError),
    /// Transport failure
    #[error("transport: {0}")]
    Transport(String),
    /// Payload transfer attempted over a group that is not point-to-point
    #[error("pipe requires a 2-member group, got {size}")]
    NotPointToPoint { size: usize },
    /// Control blob or envelope could not be encoded/decoded
    #[error("codec: {0}")]
    Codec(String),
    /// `resolve_hang_up` called with nothing pending
    #[error("no transfer is hung up")]
    NoHangUp,
    /// Group properties could not be turned into links
    #[error("cannot connect {0}")]
    NotConnected(String),
    #[error(transparent)]
    Core(#[from] fedlink_core::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<postcard::Error> for Error {
    fn from(e: postcard::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl Error {
    pub(crate) fn lost(peer: &str, reason: &'static str) -> Self {
        Error::ConnectionLost {
            peer: peer.to_string(),
            reason,
        }
    }

    /// Whether this error means the peer should be treated as gone
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Error::ConnectionLost { .. })
    }
}
