//! SharedMem - lower-level broadcast plus active-process tracking.
//!
//! Used where a full indexed log is unnecessary: entries are broadcast to
//! the cluster and consumed from a bounded receive buffer, while an
//! in-memory active-set records which processes have traffic. An external
//! periodic sweeper diffs the active-set against the authoritative store
//! and evicts stale processes.

use crate::error::ReplicationError;
use crate::metrics;
use crate::state::MsgEntry;
use crate::sync::ClusterTransport;
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Wire envelope for SharedMem broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedEnvelope {
    #[serde(rename = "processid")]
    pub process_id: String,
    #[serde(rename = "channelname")]
    pub channel_name: String,
    pub entry: MsgEntry,
}

/// Broadcast primitive with liveness tracking and a bounded receive buffer.
pub struct SharedMem {
    transport: Arc<dyn ClusterTransport>,
    active: DashSet<String>,
    rx: Mutex<mpsc::Receiver<SharedEnvelope>>,
    // Taken exactly once by close(); a dropped sender closes the receive path.
    tx: parking_lot::Mutex<Option<mpsc::Sender<SharedEnvelope>>>,
}

impl SharedMem {
    pub fn new(transport: Arc<dyn ClusterTransport>, buffer_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer_capacity);
        Self {
            transport,
            active: DashSet::new(),
            rx: Mutex::new(rx),
            tx: parking_lot::Mutex::new(Some(tx)),
        }
    }

    /// Broadcast an entry for a process channel and record the process as
    /// active.
    pub async fn broadcast(
        &self,
        process_id: &str,
        channel_name: &str,
        entry: MsgEntry,
    ) -> Result<(), ReplicationError> {
        let envelope = SharedEnvelope {
            process_id: process_id.to_string(),
            channel_name: channel_name.to_string(),
            entry,
        };
        let data = serde_json::to_vec(&envelope)?;
        self.transport.broadcast(data).await?;
        self.active.insert(process_id.to_string());
        Ok(())
    }

    /// Ingest one broadcast payload from the network.
    ///
    /// Never blocks the receive path: a full buffer drops the message. A
    /// decoded envelope still marks its process active even when dropped.
    pub fn handle_incoming(&self, data: &[u8]) {
        let envelope: SharedEnvelope = match serde_json::from_slice(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "dropping malformed shared-mem message");
                return;
            }
        };
        self.active.insert(envelope.process_id.clone());

        let tx = self.tx.lock().clone();
        let Some(tx) = tx else {
            debug!("shared-mem closed, dropping message");
            return;
        };
        match tx.try_send(envelope) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                metrics::record_shared_mem_drop();
                warn!(process = %envelope.process_id, "receive buffer full, message dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Receive the next buffered envelope.
    ///
    /// Cancel-safe; returns `None` once closed and drained. Wrap in
    /// `tokio::select!` or use [`recv_timeout`](Self::recv_timeout) for a
    /// bounded wait.
    pub async fn recv(&self) -> Option<SharedEnvelope> {
        self.rx.lock().await.recv().await
    }

    /// Receive with a deadline; `None` on timeout or once closed.
    pub async fn recv_timeout(&self, timeout: Duration) -> Option<SharedEnvelope> {
        tokio::time::timeout(timeout, self.recv()).await.ok().flatten()
    }

    /// Forget a terminated process.
    pub fn close_process(&self, process_id: &str) {
        self.active.remove(process_id);
    }

    /// Snapshot of processes seen since the last reconciliation.
    pub fn active_processes(&self) -> Vec<String> {
        self.active.iter().map(|p| p.key().clone()).collect()
    }

    pub fn active_process_count(&self) -> usize {
        self.active.len()
    }

    /// Close the receive path. Idempotent; buffered envelopes stay
    /// readable until drained.
    pub fn close(&self) {
        if self.tx.lock().take().is_some() {
            debug!("shared-mem closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::state::EntryKind;
    use async_trait::async_trait;

    #[derive(Default)]
    struct RecordingTransport {
        sent: parking_lot::Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl ClusterTransport for RecordingTransport {
        async fn broadcast(&self, data: Vec<u8>) -> Result<(), TransportError> {
            self.sent.lock().push(data);
            Ok(())
        }
    }

    fn entry(sequence: u64) -> MsgEntry {
        MsgEntry {
            sequence,
            in_reply_to: 0,
            timestamp: sequence as i64,
            sender_id: "alice".to_string(),
            payload: b"x".to_vec(),
            kind: EntryKind::Data,
        }
    }

    fn envelope_bytes(process_id: &str, sequence: u64) -> Vec<u8> {
        serde_json::to_vec(&SharedEnvelope {
            process_id: process_id.to_string(),
            channel_name: "main".to_string(),
            entry: entry(sequence),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_broadcast_marks_active() {
        let transport = Arc::new(RecordingTransport::default());
        let mem = SharedMem::new(transport.clone(), 8);

        mem.broadcast("p1", "main", entry(1)).await.unwrap();
        assert_eq!(mem.active_process_count(), 1);
        assert_eq!(mem.active_processes(), vec!["p1".to_string()]);
        assert_eq!(transport.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_incoming_round_trip() {
        let mem = SharedMem::new(Arc::new(RecordingTransport::default()), 8);

        mem.handle_incoming(&envelope_bytes("p1", 1));
        let got = mem.recv().await.unwrap();
        assert_eq!(got.process_id, "p1");
        assert_eq!(got.entry.sequence, 1);
        assert!(mem.active_processes().contains(&"p1".to_string()));
    }

    #[tokio::test]
    async fn test_full_buffer_drops_silently() {
        let mem = SharedMem::new(Arc::new(RecordingTransport::default()), 2);

        for seq in 1..=5 {
            mem.handle_incoming(&envelope_bytes("p1", seq));
        }
        assert_eq!(mem.recv().await.unwrap().entry.sequence, 1);
        assert_eq!(mem.recv().await.unwrap().entry.sequence, 2);
        assert!(mem.recv_timeout(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_input_is_dropped() {
        let mem = SharedMem::new(Arc::new(RecordingTransport::default()), 8);
        mem.handle_incoming(b"not json");
        assert_eq!(mem.active_process_count(), 0);
        assert!(mem.recv_timeout(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_drains() {
        let mem = SharedMem::new(Arc::new(RecordingTransport::default()), 8);
        mem.handle_incoming(&envelope_bytes("p1", 1));

        mem.close();
        mem.close();

        // Buffered message survives the close, then the stream ends.
        assert_eq!(mem.recv().await.unwrap().entry.sequence, 1);
        assert!(mem.recv().await.is_none());

        // Ingest after close is a silent drop.
        mem.handle_incoming(&envelope_bytes("p2", 2));
        assert!(mem.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_process_reconciliation() {
        let mem = SharedMem::new(Arc::new(RecordingTransport::default()), 8);
        mem.handle_incoming(&envelope_bytes("p1", 1));
        mem.handle_incoming(&envelope_bytes("p2", 1));
        assert_eq!(mem.active_process_count(), 2);

        mem.close_process("p1");
        assert_eq!(mem.active_processes(), vec!["p2".to_string()]);
        mem.close_process("p1");
        assert_eq!(mem.active_process_count(), 1);
    }
}
