//! In-memory replicator: direct fan-out to peer routers.
//!
//! Test-only in spirit - it simulates a cluster inside one process by
//! calling peer Router methods directly, continuing past any failing peer.

use crate::error::ReplicationError;
use crate::router::Router;
use crate::state::{Channel, MsgEntry};
use crate::sync::Replicator;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

/// Replicator that applies mutations straight onto peer routers.
#[derive(Default)]
pub struct MemoryReplicator {
    peers: Mutex<Vec<Arc<Router>>>,
}

impl MemoryReplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer router; added after construction because routers
    /// and replicators reference each other.
    pub fn add_peer(&self, peer: Arc<Router>) {
        self.peers.lock().push(peer);
    }

    fn peers(&self) -> Vec<Arc<Router>> {
        self.peers.lock().clone()
    }
}

#[async_trait]
impl Replicator for MemoryReplicator {
    async fn replicate_entry(
        &self,
        channel: &Channel,
        entry: &MsgEntry,
    ) -> Result<(), ReplicationError> {
        for peer in self.peers() {
            // Entry replication can outrun channel replication; the
            // piggybacked metadata closes that race.
            peer.create_if_not_exists(channel.metadata());
            if let Err(e) = peer.replicate_entry(&channel.id, entry.clone()) {
                warn!(channel = %channel.id, error = %e, "peer rejected replicated entry");
            }
        }
        Ok(())
    }

    async fn replicate_channel(&self, channel: &Channel) -> Result<(), ReplicationError> {
        for peer in self.peers() {
            peer.create_if_not_exists(channel.metadata());
        }
        Ok(())
    }

    async fn replicate_cleanup(&self, process_id: &str) -> Result<(), ReplicationError> {
        for peer in self.peers() {
            peer.apply_cleanup(process_id);
        }
        Ok(())
    }

    async fn replicate_executor_assignment(
        &self,
        process_id: &str,
        executor_id: &str,
    ) -> Result<(), ReplicationError> {
        for peer in self.peers() {
            peer.apply_executor_assignment(process_id, executor_id);
        }
        Ok(())
    }
}
