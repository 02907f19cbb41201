//! The Router - single-node authority over all channels.
//!
//! Owns the channel table and every channel's log in place, guarded by one
//! primary lock; the subscriber registry lives behind its own lock so
//! notification fan-out never blocks log mutation. Every local mutation is
//! handed to the configured [`Replicator`] after the primary lock is
//! released, on a background task by default.

mod subscribers;

use crate::config::ChannelsConfig;
use crate::error::{RouterError, RouterResult};
use crate::metrics;
use crate::state::{merge_order, now_micros, Channel, ChannelId, EntryKind, MsgEntry, ProcessId, ProcessManifest};
use crate::sync::Replicator;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use subscribers::SubscriberRegistry;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Channel table and process index, guarded together by the primary lock.
#[derive(Default)]
struct RouterState {
    channels: HashMap<ChannelId, Channel>,
    by_process: HashMap<ProcessId, Vec<ChannelId>>,
}

/// Single-node authority owning all channels of this node.
///
/// Independently constructible; multiple routers can coexist in one
/// process, which is how the in-memory replicator simulates a cluster.
pub struct Router {
    state: RwLock<RouterState>,
    subscribers: SubscriberRegistry,
    replicator: Arc<dyn Replicator>,
    synchronous_replication: bool,
}

/// A replication unit handed off after the primary lock is released.
enum ReplicationTask {
    Entry { channel: Channel, entry: MsgEntry },
    Channel(Channel),
    Cleanup(ProcessId),
    Executor { process_id: ProcessId, executor_id: String },
}

impl ReplicationTask {
    async fn run(self, replicator: &dyn Replicator) {
        let result = match &self {
            Self::Entry { channel, entry } => replicator.replicate_entry(channel, entry).await,
            Self::Channel(channel) => replicator.replicate_channel(channel).await,
            Self::Cleanup(process_id) => replicator.replicate_cleanup(process_id).await,
            Self::Executor { process_id, executor_id } => {
                replicator
                    .replicate_executor_assignment(process_id, executor_id)
                    .await
            }
        };
        if let Err(e) = result {
            metrics::record_replication_error(e.error_code());
            warn!(error = %e, "replication failed");
        }
    }
}

impl Router {
    pub fn new(config: &ChannelsConfig, replicator: Arc<dyn Replicator>) -> Self {
        Self {
            state: RwLock::new(RouterState::default()),
            subscribers: SubscriberRegistry::new(config.subscriber_queue_capacity),
            replicator,
            synchronous_replication: config.synchronous_replication,
        }
    }

    /// Insert a new channel and replicate its metadata.
    ///
    /// Fails with [`RouterError::ChannelExists`] if the id is taken. The
    /// log is never shipped to peers, only the metadata.
    pub async fn create(&self, channel: Channel) -> RouterResult<()> {
        let meta = {
            let mut state = self.state.write();
            if state.channels.contains_key(&channel.id) {
                return Err(RouterError::ChannelExists);
            }
            let meta = channel.metadata();
            state
                .by_process
                .entry(channel.process_id.clone())
                .or_default()
                .push(channel.id.clone());
            state.channels.insert(channel.id.clone(), channel);
            metrics::set_active_channels(state.channels.len() as i64);
            meta
        };
        debug!(channel = %meta.id, process = %meta.process_id, "channel created");
        self.replicate(ReplicationTask::Channel(meta)).await;
        Ok(())
    }

    /// Insert a channel if absent; success either way.
    ///
    /// This is the inbound-replication and lazy-creation path, so it never
    /// re-triggers replication. Returns whether a channel was inserted.
    pub fn create_if_not_exists(&self, channel: Channel) -> bool {
        let mut state = self.state.write();
        if state.channels.contains_key(&channel.id) {
            return false;
        }
        state
            .by_process
            .entry(channel.process_id.clone())
            .or_default()
            .push(channel.id.clone());
        debug!(channel = %channel.id, process = %channel.process_id, "channel created on demand");
        state.channels.insert(channel.id.clone(), channel);
        metrics::set_active_channels(state.channels.len() as i64);
        true
    }

    /// Look up a channel by id.
    pub fn get(&self, channel_id: &str) -> RouterResult<Channel> {
        self.state
            .read()
            .channels
            .get(channel_id)
            .cloned()
            .ok_or(RouterError::ChannelNotFound)
    }

    /// Look up a channel by its process and declared name.
    pub fn get_by_process_and_name(&self, process_id: &str, name: &str) -> RouterResult<Channel> {
        let state = self.state.read();
        let ids = state
            .by_process
            .get(process_id)
            .ok_or(RouterError::ChannelNotFound)?;
        ids.iter()
            .filter_map(|id| state.channels.get(id))
            .find(|c| c.name == name)
            .cloned()
            .ok_or(RouterError::ChannelNotFound)
    }

    /// All channels belonging to a process.
    pub fn channels_by_process(&self, process_id: &str) -> Vec<Channel> {
        let state = self.state.read();
        state
            .by_process
            .get(process_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.channels.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Create a declared channel on first access if it is absent.
    ///
    /// Covers the race where a caller reaches this node before the
    /// channel-creation broadcast does: every node derives the same id from
    /// the manifest, so the lazily created replica converges with the
    /// declared one. Fails with [`RouterError::ChannelNotFound`] when the
    /// name is not declared in the manifest.
    pub fn ensure_channel(&self, manifest: &ProcessManifest, name: &str) -> RouterResult<Channel> {
        if !manifest.channel_names.iter().any(|n| n == name) {
            return Err(RouterError::ChannelNotFound);
        }
        let mut channel = Channel::new(
            manifest.process_id.clone(),
            name.to_string(),
            manifest.submitter_id.clone(),
        );
        if let Some(executor_id) = &manifest.executor_id {
            channel.executor_id = executor_id.clone();
        }
        let id = channel.id.clone();
        self.create_if_not_exists(channel);
        self.get(&id)
    }

    /// Append an entry on behalf of an authorized sender.
    pub async fn append(
        &self,
        channel_id: &str,
        sender_id: &str,
        sequence: u64,
        in_reply_to: u64,
        payload: Vec<u8>,
    ) -> RouterResult<()> {
        self.append_typed(channel_id, sender_id, sequence, in_reply_to, payload, EntryKind::Data)
            .await
    }

    /// Append with an explicit stream-framing tag (end/error markers).
    ///
    /// Authorizes the sender, stamps a receive-time timestamp, restores the
    /// merged log order, pushes to local subscribers, and replicates
    /// asynchronously. A duplicate (sender, sequence) pair is an idempotent
    /// success.
    pub async fn append_typed(
        &self,
        channel_id: &str,
        sender_id: &str,
        sequence: u64,
        in_reply_to: u64,
        payload: Vec<u8>,
        kind: EntryKind,
    ) -> RouterResult<()> {
        let (meta, entry) = {
            let mut state = self.state.write();
            let channel = state
                .channels
                .get_mut(channel_id)
                .ok_or(RouterError::ChannelNotFound)?;
            if !channel.authorized(sender_id) {
                return Err(RouterError::Unauthorized);
            }
            if channel.contains(sender_id, sequence) {
                debug!(channel = %channel_id, sender = %sender_id, sequence, "duplicate append ignored");
                return Ok(());
            }
            let entry = MsgEntry {
                sequence,
                in_reply_to,
                timestamp: now_micros(),
                sender_id: sender_id.to_string(),
                payload,
                kind,
            };
            channel.log.push(entry.clone());
            merge_order(&mut channel.log);
            channel.sequence = channel.sequence.max(sequence);
            (channel.metadata(), entry)
        };

        metrics::record_append();
        self.subscribers.fan_out(channel_id, &entry);
        self.replicate(ReplicationTask::Entry { channel: meta, entry }).await;
        Ok(())
    }

    /// Read the merged log starting at position `after_index`.
    ///
    /// `after_index` is a position in the merged log, not a per-sender
    /// sequence number, and can shift retroactively when a concurrently
    /// replicated entry sorts earlier than already-read ones. `limit` of 0
    /// means unlimited. Past the end an empty slice is returned, never an
    /// error.
    pub fn read_after(
        &self,
        channel_id: &str,
        caller_id: &str,
        after_index: usize,
        limit: usize,
    ) -> RouterResult<Vec<MsgEntry>> {
        let state = self.state.read();
        let channel = state
            .channels
            .get(channel_id)
            .ok_or(RouterError::ChannelNotFound)?;
        if !channel.authorized(caller_id) {
            return Err(RouterError::Unauthorized);
        }
        if after_index >= channel.log.len() {
            return Ok(Vec::new());
        }
        let slice = &channel.log[after_index..];
        let take = if limit == 0 { slice.len() } else { limit.min(slice.len()) };
        Ok(slice[..take].to_vec())
    }

    /// Assign the executor of a single channel.
    ///
    /// Authorization is retroactive: the executor may append and read
    /// immediately. Local only; process-wide assignment is the replicating
    /// variant.
    pub fn set_executor_id(&self, channel_id: &str, executor_id: &str) -> RouterResult<()> {
        let mut state = self.state.write();
        let channel = state
            .channels
            .get_mut(channel_id)
            .ok_or(RouterError::ChannelNotFound)?;
        channel.executor_id = executor_id.to_string();
        Ok(())
    }

    /// Assign the executor of every channel of a process and replicate the
    /// assignment once for the whole process.
    pub async fn set_executor_id_for_process(&self, process_id: &str, executor_id: &str) {
        self.apply_executor_assignment(process_id, executor_id);
        self.replicate(ReplicationTask::Executor {
            process_id: process_id.to_string(),
            executor_id: executor_id.to_string(),
        })
        .await;
    }

    /// Inbound variant of the process-wide executor assignment.
    ///
    /// Applies locally without re-replicating, so a broadcast is never
    /// re-broadcast. A process with no local channels is a no-op.
    pub fn apply_executor_assignment(&self, process_id: &str, executor_id: &str) {
        let mut state = self.state.write();
        let Some(ids) = state.by_process.get(process_id).cloned() else {
            return;
        };
        for id in ids {
            if let Some(channel) = state.channels.get_mut(&id) {
                channel.executor_id = executor_id.to_string();
            }
        }
        debug!(process = %process_id, executor = %executor_id, "executor assigned");
    }

    /// Delete every channel of a process, close all their subscriber
    /// queues, and replicate the cleanup.
    ///
    /// Local state is fully removed before the cleanup is replicated, so
    /// no local reader can observe a half-torn-down channel.
    pub async fn cleanup_process(&self, process_id: &str) {
        self.apply_cleanup(process_id);
        self.replicate(ReplicationTask::Cleanup(process_id.to_string())).await;
    }

    /// Inbound variant of process cleanup: apply locally, never replicate.
    ///
    /// Removing an already-absent process is a no-op, which makes cleanup
    /// broadcasts idempotent.
    pub fn apply_cleanup(&self, process_id: &str) {
        let removed: Vec<ChannelId> = {
            let mut state = self.state.write();
            let ids = state.by_process.remove(process_id).unwrap_or_default();
            for id in &ids {
                state.channels.remove(id);
            }
            metrics::set_active_channels(state.channels.len() as i64);
            ids
        };
        for id in &removed {
            self.subscribers.remove_channel(id);
        }
        if !removed.is_empty() {
            debug!(process = %process_id, channels = removed.len(), "process cleaned up");
        }
    }

    /// Apply an entry replicated from a peer.
    ///
    /// Idempotent: a duplicate (sender, sequence) pair is silently ignored.
    /// The carried timestamp is kept as-is; only first-hand appends stamp
    /// local receive time. Fails with [`RouterError::ChannelNotFound`] when
    /// the channel is unknown - the relay ensures the channel exists first.
    pub fn replicate_entry(&self, channel_id: &str, entry: MsgEntry) -> RouterResult<()> {
        {
            let mut state = self.state.write();
            let channel = state
                .channels
                .get_mut(channel_id)
                .ok_or(RouterError::ChannelNotFound)?;
            if channel.contains(&entry.sender_id, entry.sequence) {
                return Ok(());
            }
            channel.sequence = channel.sequence.max(entry.sequence);
            channel.log.push(entry.clone());
            merge_order(&mut channel.log);
        }
        self.subscribers.fan_out(channel_id, &entry);
        Ok(())
    }

    /// Register a bounded delivery queue for an authorized caller.
    ///
    /// Both local appends and inbound replication push into the queue. A
    /// full queue drops new entries for this subscriber only; queue closure
    /// (on cleanup or unsubscribe) is the cancellation signal.
    pub fn subscribe(&self, channel_id: &str, caller_id: &str) -> RouterResult<mpsc::Receiver<MsgEntry>> {
        {
            let state = self.state.read();
            let channel = state
                .channels
                .get(channel_id)
                .ok_or(RouterError::ChannelNotFound)?;
            if !channel.authorized(caller_id) {
                return Err(RouterError::Unauthorized);
            }
        }
        Ok(self.subscribers.register(channel_id, caller_id))
    }

    /// Remove and close a caller's delivery queue; returns whether one existed.
    pub fn unsubscribe(&self, channel_id: &str, caller_id: &str) -> bool {
        self.subscribers.remove(channel_id, caller_id)
    }

    /// Hand a replication task off, inline in synchronous mode, to a
    /// background task otherwise. All locks are released by the time this
    /// runs.
    async fn replicate(&self, task: ReplicationTask) {
        if self.synchronous_replication {
            task.run(self.replicator.as_ref()).await;
        } else {
            let replicator = Arc::clone(&self.replicator);
            tokio::spawn(async move {
                task.run(replicator.as_ref()).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::NoopReplicator;

    fn sync_router() -> Router {
        let config = ChannelsConfig {
            synchronous_replication: true,
            ..ChannelsConfig::default()
        };
        Router::new(&config, Arc::new(NoopReplicator))
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_id() {
        let router = sync_router();
        router.create(Channel::new("p1", "main", "alice")).await.unwrap();
        let err = router
            .create(Channel::new("p1", "main", "alice"))
            .await
            .unwrap_err();
        assert_eq!(err, RouterError::ChannelExists);
    }

    #[tokio::test]
    async fn test_create_if_not_exists_is_idempotent() {
        let router = sync_router();
        assert!(router.create_if_not_exists(Channel::new("p1", "main", "alice")));
        assert!(!router.create_if_not_exists(Channel::new("p1", "main", "alice")));
    }

    #[tokio::test]
    async fn test_lookups() {
        let router = sync_router();
        router.create(Channel::new("p1", "main", "alice")).await.unwrap();
        router.create(Channel::new("p1", "logs", "alice")).await.unwrap();

        assert_eq!(router.get("p1/main").unwrap().name, "main");
        assert_eq!(
            router.get_by_process_and_name("p1", "logs").unwrap().id,
            "p1/logs"
        );
        assert_eq!(router.channels_by_process("p1").len(), 2);
        assert_eq!(router.get("p1/other").unwrap_err(), RouterError::ChannelNotFound);
        assert_eq!(
            router.get_by_process_and_name("p2", "main").unwrap_err(),
            RouterError::ChannelNotFound
        );
        assert!(router.channels_by_process("p2").is_empty());
    }

    #[tokio::test]
    async fn test_append_authorization() {
        let router = sync_router();
        router.create(Channel::new("p1", "main", "alice")).await.unwrap();

        router.append("p1/main", "alice", 1, 0, b"hi".to_vec()).await.unwrap();
        let err = router
            .append("p1/main", "bob", 1, 0, b"nope".to_vec())
            .await
            .unwrap_err();
        assert_eq!(err, RouterError::Unauthorized);

        router.set_executor_id("p1/main", "bob").unwrap();
        router.append("p1/main", "bob", 1, 1, b"now".to_vec()).await.unwrap();
    }

    #[tokio::test]
    async fn test_append_reorders_per_sender() {
        let router = sync_router();
        router.create(Channel::new("p1", "main", "alice")).await.unwrap();

        for seq in [3u64, 1, 2] {
            router
                .append("p1/main", "alice", seq, 0, format!("m{seq}").into_bytes())
                .await
                .unwrap();
        }
        let log = router.read_after("p1/main", "alice", 0, 0).unwrap();
        let seqs: Vec<u64> = log.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_duplicate_append_is_idempotent() {
        let router = sync_router();
        router.create(Channel::new("p1", "main", "alice")).await.unwrap();

        router.append("p1/main", "alice", 1, 0, b"one".to_vec()).await.unwrap();
        router.append("p1/main", "alice", 1, 0, b"dup".to_vec()).await.unwrap();
        let log = router.read_after("p1/main", "alice", 0, 0).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].payload, b"one");
    }

    #[tokio::test]
    async fn test_read_after_position_and_limit() {
        let router = sync_router();
        router.create(Channel::new("p1", "main", "alice")).await.unwrap();
        for seq in 1..=5u64 {
            router.append("p1/main", "alice", seq, 0, Vec::new()).await.unwrap();
        }

        assert_eq!(router.read_after("p1/main", "alice", 0, 0).unwrap().len(), 5);
        assert_eq!(router.read_after("p1/main", "alice", 2, 0).unwrap().len(), 3);
        assert_eq!(router.read_after("p1/main", "alice", 0, 2).unwrap().len(), 2);
        assert!(router.read_after("p1/main", "alice", 9, 0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replicate_entry_dedups() {
        let router = sync_router();
        router.create_if_not_exists(Channel::new("p1", "main", "alice"));

        let entry = MsgEntry {
            sequence: 1,
            in_reply_to: 0,
            timestamp: 42,
            sender_id: "alice".to_string(),
            payload: b"remote".to_vec(),
            kind: EntryKind::Data,
        };
        router.replicate_entry("p1/main", entry.clone()).unwrap();
        router.replicate_entry("p1/main", entry).unwrap();

        let log = router.read_after("p1/main", "alice", 0, 0).unwrap();
        assert_eq!(log.len(), 1);
        // Carried timestamp is preserved, not restamped.
        assert_eq!(log[0].timestamp, 42);
    }

    #[tokio::test]
    async fn test_replicate_entry_unknown_channel() {
        let router = sync_router();
        let entry = MsgEntry {
            sequence: 1,
            in_reply_to: 0,
            timestamp: 1,
            sender_id: "alice".to_string(),
            payload: Vec::new(),
            kind: EntryKind::Data,
        };
        assert_eq!(
            router.replicate_entry("p1/main", entry).unwrap_err(),
            RouterError::ChannelNotFound
        );
    }

    #[tokio::test]
    async fn test_cleanup_process_removes_and_closes() {
        let router = sync_router();
        router.create(Channel::new("p1", "main", "alice")).await.unwrap();
        router.create(Channel::new("p1", "logs", "alice")).await.unwrap();
        let mut rx = router.subscribe("p1/main", "alice").unwrap();

        router.cleanup_process("p1").await;

        assert_eq!(router.get("p1/main").unwrap_err(), RouterError::ChannelNotFound);
        assert_eq!(router.get("p1/logs").unwrap_err(), RouterError::ChannelNotFound);
        assert!(rx.recv().await.is_none());

        // Cleaning an absent process is a no-op.
        router.cleanup_process("p1").await;
    }

    #[tokio::test]
    async fn test_subscribe_requires_authorization() {
        let router = sync_router();
        router.create(Channel::new("p1", "main", "alice")).await.unwrap();

        assert!(router.subscribe("p1/main", "alice").is_ok());
        assert_eq!(
            router.subscribe("p1/main", "bob").unwrap_err(),
            RouterError::Unauthorized
        );
        assert_eq!(
            router.subscribe("p1/none", "alice").unwrap_err(),
            RouterError::ChannelNotFound
        );
    }

    #[tokio::test]
    async fn test_subscriber_receives_appends_and_replicated_entries() {
        let router = sync_router();
        router.create(Channel::new("p1", "main", "alice")).await.unwrap();
        let mut rx = router.subscribe("p1/main", "alice").unwrap();

        router.append("p1/main", "alice", 1, 0, b"local".to_vec()).await.unwrap();
        router
            .replicate_entry(
                "p1/main",
                MsgEntry {
                    sequence: 1,
                    in_reply_to: 0,
                    timestamp: 7,
                    sender_id: "bob".to_string(),
                    payload: b"remote".to_vec(),
                    kind: EntryKind::Data,
                },
            )
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().payload, b"local");
        assert_eq!(rx.recv().await.unwrap().payload, b"remote");
    }

    #[tokio::test]
    async fn test_ensure_channel_declared_only() {
        let router = sync_router();
        let manifest = ProcessManifest {
            process_id: "p1".to_string(),
            channel_names: vec!["main".to_string()],
            submitter_id: "alice".to_string(),
            executor_id: Some("bob".to_string()),
        };

        let chan = router.ensure_channel(&manifest, "main").unwrap();
        assert_eq!(chan.id, "p1/main");
        assert_eq!(chan.executor_id, "bob");

        // Second ensure returns the existing channel untouched.
        let again = router.ensure_channel(&manifest, "main").unwrap();
        assert_eq!(again.id, chan.id);

        assert_eq!(
            router.ensure_channel(&manifest, "undeclared").unwrap_err(),
            RouterError::ChannelNotFound
        );
    }

    #[tokio::test]
    async fn test_executor_assignment_for_process() {
        let router = sync_router();
        router.create(Channel::new("p1", "main", "alice")).await.unwrap();
        router.create(Channel::new("p1", "logs", "alice")).await.unwrap();

        router.set_executor_id_for_process("p1", "exec-7").await;
        assert_eq!(router.get("p1/main").unwrap().executor_id, "exec-7");
        assert_eq!(router.get("p1/logs").unwrap().executor_id, "exec-7");

        // Unknown process is a no-op.
        router.set_executor_id_for_process("p2", "exec-7").await;
    }
}
