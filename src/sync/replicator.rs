//! The Replicator trait and the single-node no-op variant.

use crate::error::ReplicationError;
use crate::state::{Channel, MsgEntry};
use async_trait::async_trait;

/// Propagates Router mutations to peer routers.
///
/// All methods are fire-and-forget from the Router's point of view:
/// failures are logged at the replication boundary and never surfaced to
/// the caller that performed the local mutation. Channel arguments carry
/// metadata only, never the log.
#[async_trait]
pub trait Replicator: Send + Sync {
    /// Propagate an appended entry, piggybacking its channel's metadata.
    async fn replicate_entry(&self, channel: &Channel, entry: &MsgEntry)
        -> Result<(), ReplicationError>;

    /// Propagate newly created channel metadata.
    async fn replicate_channel(&self, channel: &Channel) -> Result<(), ReplicationError>;

    /// Propagate the teardown of every channel of a process.
    async fn replicate_cleanup(&self, process_id: &str) -> Result<(), ReplicationError>;

    /// Propagate a process-wide executor assignment.
    async fn replicate_executor_assignment(
        &self,
        process_id: &str,
        executor_id: &str,
    ) -> Result<(), ReplicationError>;
}

/// Replicator for single-node deployments: every propagation succeeds by
/// doing nothing.
pub struct NoopReplicator;

#[async_trait]
impl Replicator for NoopReplicator {
    async fn replicate_entry(
        &self,
        _channel: &Channel,
        _entry: &MsgEntry,
    ) -> Result<(), ReplicationError> {
        Ok(())
    }

    async fn replicate_channel(&self, _channel: &Channel) -> Result<(), ReplicationError> {
        Ok(())
    }

    async fn replicate_cleanup(&self, _process_id: &str) -> Result<(), ReplicationError> {
        Ok(())
    }

    async fn replicate_executor_assignment(
        &self,
        _process_id: &str,
        _executor_id: &str,
    ) -> Result<(), ReplicationError> {
        Ok(())
    }
}
