//! swarm-channels - replicated per-process message channels.
//!
//! The channel subsystem of the Swarm compute orchestrator: submitters and
//! executors exchange messages over per-process, append-only logs with
//! causal per-sender ordering, push-based delivery, and idempotent
//! replication across uncoordinated nodes.
//!
//! # Architecture
//!
//! - [`Router`] is the single-node authority owning all channels:
//!   create/append/read/authorize/cleanup/subscribe.
//! - [`Replicator`] propagates every local mutation to peers. Three
//!   variants: [`NoopReplicator`] (single node), [`MemoryReplicator`]
//!   (direct peer calls, test fan-out), and [`RelayReplicator`] (JSON
//!   envelopes over a cluster broadcast transport).
//! - [`SharedMem`] is a lower-level alternative for cases that need only
//!   broadcast plus liveness tracking, not an indexed log.
//!
//! There is no sequencer, consensus, or durable storage. Replicas converge
//! because every operation is commutative and deduplicated on the
//! (sender, sequence) pair - re-applying a remote mutation is always a
//! no-op after the first application.

pub mod config;
pub mod error;
pub mod metrics;
pub mod router;
pub mod shared_mem;
pub mod state;
pub mod sync;

pub use config::ChannelsConfig;
pub use error::{ReplicationError, RouterError, RouterResult, TransportError};
pub use router::Router;
pub use shared_mem::{SharedEnvelope, SharedMem};
pub use state::{Channel, ChannelId, EntryKind, MsgEntry, ProcessId, ProcessManifest};
pub use sync::{
    ClusterTransport, Envelope, EnvelopeType, InboundMessage, MemoryReplicator, NoopReplicator,
    RelayReplicator, Replicator,
};
