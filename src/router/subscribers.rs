//! Subscriber registry and push delivery.
//!
//! Delivery queues are bounded; a full queue drops the new entry for that
//! one subscriber so a slow reader can never block a writer. The registry
//! has its own lock, independent of the channel table, so fan-out and log
//! mutation never contend.

use crate::metrics;
use crate::state::{ChannelId, MsgEntry};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// One registered delivery queue.
struct SubscriberSlot {
    id: Uuid,
    caller_id: String,
    tx: mpsc::Sender<MsgEntry>,
}

/// Registry of delivery queues, keyed by channel id.
///
/// At most one queue per (channel, caller): re-subscribing replaces the
/// previous queue, closing it.
pub(crate) struct SubscriberRegistry {
    slots: Mutex<HashMap<ChannelId, Vec<SubscriberSlot>>>,
    capacity: usize,
}

impl SubscriberRegistry {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Register a queue for `caller_id` on `channel_id`.
    ///
    /// Replaces (and thereby closes) any existing queue for the same caller.
    pub(crate) fn register(&self, channel_id: &str, caller_id: &str) -> mpsc::Receiver<MsgEntry> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let slot = SubscriberSlot {
            id: Uuid::new_v4(),
            caller_id: caller_id.to_string(),
            tx,
        };
        debug!(channel = %channel_id, caller = %caller_id, subscription = %slot.id, "subscriber registered");

        let mut slots = self.slots.lock();
        let entries = slots.entry(channel_id.to_string()).or_default();
        entries.retain(|s| s.caller_id != caller_id);
        entries.push(slot);
        rx
    }

    /// Remove the queue for `caller_id` on `channel_id`, closing it.
    pub(crate) fn remove(&self, channel_id: &str, caller_id: &str) -> bool {
        let mut slots = self.slots.lock();
        let Some(entries) = slots.get_mut(channel_id) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|s| s.caller_id != caller_id);
        let removed = entries.len() < before;
        if entries.is_empty() {
            slots.remove(channel_id);
        }
        removed
    }

    /// Drop every queue registered on `channel_id`, closing them all.
    pub(crate) fn remove_channel(&self, channel_id: &str) {
        if let Some(entries) = self.slots.lock().remove(channel_id) {
            debug!(channel = %channel_id, subscribers = entries.len(), "subscriber queues closed");
        }
    }

    /// Push `entry` to every queue on `channel_id` without blocking.
    ///
    /// A full queue drops the entry for that subscriber only; a closed
    /// queue (receiver gone) is pruned.
    pub(crate) fn fan_out(&self, channel_id: &str, entry: &MsgEntry) {
        let mut slots = self.slots.lock();
        let Some(entries) = slots.get_mut(channel_id) else {
            return;
        };
        entries.retain(|slot| match slot.tx.try_send(entry.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::record_subscriber_drop();
                warn!(
                    channel = %channel_id,
                    caller = %slot.caller_id,
                    subscription = %slot.id,
                    "subscriber queue full, entry dropped"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if entries.is_empty() {
            slots.remove(channel_id);
        }
    }
}
