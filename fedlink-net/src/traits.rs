//! Transport traits and types
//!
//! A pipe moves payloads over a transport group of exactly two members: the
//! leader at local rank 0 and the follower at local rank 1.

use std::sync::Arc;

use crate::store::RendezvousStore;
use crate::Result;

/// Point-to-point payload transport
#[async_trait::async_trait]
pub trait PairTransport: Send + Sync {
    /// Number of members in the transport group
    fn group_size(&self) -> usize;

    /// Local rank of this end
    fn rank(&self) -> usize;

    /// Send a payload to the member at `dest_rank`
    async fn push(&self, payload: Vec<u8>, dest_rank: usize) -> Result<()>;

    /// Receive the next payload (blocking until available)
    async fn pull(&self) -> Result<Vec<u8>>;
}

/// Everything a pipe needs to reach one peer.
#[derive(Clone)]
pub struct Link {
    pub store: Arc<dyn RendezvousStore>,
    pub transport: Arc<dyn PairTransport>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("group_size", &self.transport.group_size())
            .field("rank", &self.transport.rank())
            .finish()
    }
}
