//! Data model for the channel subsystem.
//!
//! Contains the Channel (per-process message log), MsgEntry, and the
//! process manifest supplied by the orchestrator.

mod channel;

pub use channel::{Channel, ChannelId, EntryKind, MsgEntry, ProcessId, ProcessManifest};
pub(crate) use channel::{merge_order, now_micros};
