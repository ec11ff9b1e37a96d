//! In-memory transport
//!
//! Connected pairs of channel ends, used by the in-process hub and tests.

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::traits::PairTransport;
use crate::{Error, Result};

/// One end of an in-memory point-to-point transport
#[derive(Debug)]
pub struct MemoryTransport {
    rank: usize,
    peer_rank: usize,
    group_size: usize,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl MemoryTransport {
    /// Create a connected pair: (rank 0, rank 1)
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (
            Self {
                rank: 0,
                peer_rank: 1,
                group_size: 2,
                tx: tx_b,
                rx: Mutex::new(rx_a),
            },
            Self {
                rank: 1,
                peer_rank: 0,
                group_size: 2,
                tx: tx_a,
                rx: Mutex::new(rx_b),
            },
        )
    }

    /// Override the reported group size
    pub fn with_group_size(mut self, size: usize) -> Self {
        self.group_size = size;
        self
    }
}

#[async_trait]
impl PairTransport for MemoryTransport {
    fn group_size(&self) -> usize {
        self.group_size
    }

    fn rank(&self) -> usize {
        self.rank
    }

    async fn push(&self, payload: Vec<u8>, dest_rank: usize) -> Result<()> {
        if dest_rank != self.peer_rank {
            return Err(Error::Transport(format!(
                "rank {dest_rank} is not a member of this pair"
            )));
        }
        self.tx
            .send(payload)
            .map_err(|_| Error::Transport("peer end dropped".into()))
    }

    async fn pull(&self) -> Result<Vec<u8>> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| Error::Transport("peer end dropped".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_delivers_in_order() {
        let (a, b) = MemoryTransport::pair();
        a.push(vec![1], 1).await.unwrap();
        a.push(vec![2], 1).await.unwrap();
        assert_eq!(b.pull().await.unwrap(), vec![1]);
        assert_eq!(b.pull().await.unwrap(), vec![2]);

        b.push(vec![3], 0).await.unwrap();
        assert_eq!(a.pull().await.unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn push_to_foreign_rank_fails() {
        let (a, _b) = MemoryTransport::pair();
        assert!(matches!(a.push(vec![], 5).await, Err(Error::Transport(_))));
    }

    #[tokio::test]
    async fn pull_fails_once_peer_is_dropped() {
        let (a, b) = MemoryTransport::pair();
        drop(b);
        assert!(a.pull().await.is_err());
    }
}
