//! Channel and message-log types.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique process identifier, assigned by the orchestrator.
pub type ProcessId = String;

/// Unique channel identifier, derived from process id and channel name.
pub type ChannelId = String;

/// Stream-framing tag for a log entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Ordinary payload-bearing entry.
    #[default]
    Data,
    /// The sender will write no further entries on this channel.
    End,
    /// The sender aborted its stream.
    Error,
}

impl EntryKind {
    fn is_data(&self) -> bool {
        matches!(self, Self::Data)
    }
}

/// A single entry in a channel's log.
///
/// Sequence numbers are caller-assigned and strictly increasing *per
/// sender*; they are not unique across senders. The timestamp is stamped by
/// the node that first receives the entry and only breaks ties between
/// senders, it is not a distributed clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgEntry {
    pub sequence: u64,
    /// Causal back-reference to a sequence number of the other party.
    #[serde(rename = "inreplyto", default, skip_serializing_if = "is_zero")]
    pub in_reply_to: u64,
    /// Receive-time in UTC microseconds.
    pub timestamp: i64,
    #[serde(rename = "senderid")]
    pub sender_id: String,
    #[serde(default)]
    pub payload: Vec<u8>,
    #[serde(default, skip_serializing_if = "EntryKind::is_data")]
    pub kind: EntryKind,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

/// A named, process-scoped message log with exactly two authorized parties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    #[serde(rename = "processid")]
    pub process_id: ProcessId,
    pub name: String,
    #[serde(rename = "submitterid")]
    pub submitter_id: String,
    /// Empty until the orchestrator schedules the process.
    #[serde(rename = "executorid", default)]
    pub executor_id: String,
    /// Highest sequence number observed on this channel.
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub log: Vec<MsgEntry>,
}

impl Channel {
    /// Create a channel with a deterministically derived id.
    pub fn new(
        process_id: impl Into<ProcessId>,
        name: impl Into<String>,
        submitter_id: impl Into<String>,
    ) -> Self {
        let process_id = process_id.into();
        let name = name.into();
        Self {
            id: Self::derive_id(&process_id, &name),
            process_id,
            name,
            submitter_id: submitter_id.into(),
            executor_id: String::new(),
            sequence: 0,
            log: Vec::new(),
        }
    }

    /// Derive the cluster-wide channel id from process id and name.
    ///
    /// Every node derives the same id without coordination, which is what
    /// lets lazily created replicas converge on the same channel.
    pub fn derive_id(process_id: &str, name: &str) -> ChannelId {
        format!("{process_id}/{name}")
    }

    /// Clone of this channel without its log, for shipping to peers.
    pub fn metadata(&self) -> Channel {
        Channel {
            id: self.id.clone(),
            process_id: self.process_id.clone(),
            name: self.name.clone(),
            submitter_id: self.submitter_id.clone(),
            executor_id: self.executor_id.clone(),
            sequence: self.sequence,
            log: Vec::new(),
        }
    }

    /// Whether `caller_id` is one of the two authorized parties.
    pub fn authorized(&self, caller_id: &str) -> bool {
        caller_id == self.submitter_id
            || (!self.executor_id.is_empty() && caller_id == self.executor_id)
    }

    /// Whether the log already holds an entry from `sender_id` with `sequence`.
    pub fn contains(&self, sender_id: &str, sequence: u64) -> bool {
        self.log
            .iter()
            .any(|e| e.sender_id == sender_id && e.sequence == sequence)
    }
}

/// Per-process channel declaration supplied by the orchestrator.
///
/// Carries everything needed to construct and authorize the process's
/// channels: the declared names, the submitter, and (once scheduled) the
/// assigned executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessManifest {
    #[serde(rename = "processid")]
    pub process_id: ProcessId,
    #[serde(rename = "channelnames", default)]
    pub channel_names: Vec<String>,
    #[serde(rename = "submitterid")]
    pub submitter_id: String,
    #[serde(rename = "executorid", default)]
    pub executor_id: Option<String>,
}

/// Current wall-clock time in UTC microseconds.
pub(crate) fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

/// Re-establish the merged log order in place.
///
/// Invariant: each sender's entries appear in ascending sequence order,
/// and cross-sender positions follow ascending receive timestamp. The
/// procedure is a stable sort by (timestamp, sender, sequence) followed by
/// rewriting each sender's slots with that sender's entries sorted by
/// sequence, which repairs inversions where a higher sequence carries an
/// earlier timestamp.
pub(crate) fn merge_order(log: &mut [MsgEntry]) {
    log.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.sender_id.cmp(&b.sender_id))
            .then_with(|| a.sequence.cmp(&b.sequence))
    });

    let mut by_sender: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, entry) in log.iter().enumerate() {
        by_sender.entry(entry.sender_id.clone()).or_default().push(i);
    }
    for positions in by_sender.into_values() {
        if positions.len() < 2 {
            continue;
        }
        let mut entries: Vec<MsgEntry> = positions.iter().map(|&i| log[i].clone()).collect();
        entries.sort_by_key(|e| e.sequence);
        for (&i, entry) in positions.iter().zip(entries) {
            log[i] = entry;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(sender: &str, sequence: u64, timestamp: i64) -> MsgEntry {
        MsgEntry {
            sequence,
            in_reply_to: 0,
            timestamp,
            sender_id: sender.to_string(),
            payload: Vec::new(),
            kind: EntryKind::Data,
        }
    }

    #[test]
    fn test_derive_id_is_deterministic() {
        assert_eq!(Channel::derive_id("p1", "stdout"), "p1/stdout");
        let a = Channel::new("p1", "stdout", "alice");
        let b = Channel::new("p1", "stdout", "alice");
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_authorized_parties() {
        let mut chan = Channel::new("p1", "main", "alice");
        assert!(chan.authorized("alice"));
        assert!(!chan.authorized("bob"));
        // An empty executor id never authorizes the empty string.
        assert!(!chan.authorized(""));

        chan.executor_id = "bob".to_string();
        assert!(chan.authorized("bob"));
        assert!(chan.authorized("alice"));
        assert!(!chan.authorized("mallory"));
    }

    #[test]
    fn test_metadata_strips_log() {
        let mut chan = Channel::new("p1", "main", "alice");
        chan.log.push(entry("alice", 1, 10));
        chan.sequence = 1;
        let meta = chan.metadata();
        assert!(meta.log.is_empty());
        assert_eq!(meta.id, chan.id);
        assert_eq!(meta.sequence, 1);
    }

    #[test]
    fn test_merge_order_per_sender_sequences() {
        // Out-of-order arrival: seq 3, 1, 2 with increasing timestamps.
        let mut log = vec![entry("a", 3, 10), entry("a", 1, 20), entry("a", 2, 30)];
        merge_order(&mut log);
        let seqs: Vec<u64> = log.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_merge_order_cross_sender_by_timestamp() {
        let mut log = vec![entry("exec", 1, 20), entry("user", 1, 10)];
        merge_order(&mut log);
        assert_eq!(log[0].sender_id, "user");
        assert_eq!(log[1].sender_id, "exec");
    }

    #[test]
    fn test_merge_order_interleaved() {
        let mut log = vec![
            entry("user", 2, 40),
            entry("exec", 2, 50),
            entry("user", 1, 10),
            entry("exec", 1, 20),
        ];
        merge_order(&mut log);
        let order: Vec<(String, u64)> = log
            .iter()
            .map(|e| (e.sender_id.clone(), e.sequence))
            .collect();
        assert_eq!(
            order,
            vec![
                ("user".to_string(), 1),
                ("exec".to_string(), 1),
                ("user".to_string(), 2),
                ("exec".to_string(), 2),
            ]
        );
    }

    #[test]
    fn test_entry_json_field_names() {
        let e = MsgEntry {
            sequence: 2,
            in_reply_to: 1,
            timestamp: 123,
            sender_id: "alice".to_string(),
            payload: vec![1, 2],
            kind: EntryKind::Data,
        };
        let v: serde_json::Value = serde_json::to_value(&e).unwrap();
        assert_eq!(v["sequence"], 2);
        assert_eq!(v["inreplyto"], 1);
        assert_eq!(v["senderid"], "alice");
        // Data kind is the default and stays off the wire.
        assert!(v.get("kind").is_none());
    }

    #[test]
    fn test_entry_json_omits_zero_reply() {
        let e = entry("alice", 1, 5);
        let v: serde_json::Value = serde_json::to_value(&e).unwrap();
        assert!(v.get("inreplyto").is_none());

        let back: MsgEntry = serde_json::from_value(v).unwrap();
        assert_eq!(back.in_reply_to, 0);
    }

    #[test]
    fn test_channel_json_field_names() {
        let chan = Channel::new("p1", "main", "alice");
        let v: serde_json::Value = serde_json::to_value(&chan).unwrap();
        assert_eq!(v["id"], "p1/main");
        assert_eq!(v["processid"], "p1");
        assert_eq!(v["submitterid"], "alice");
        assert_eq!(v["executorid"], "");
        assert_eq!(v["sequence"], 0);
        assert!(v["log"].as_array().unwrap().is_empty());
    }
}
