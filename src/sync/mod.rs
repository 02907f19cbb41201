//! Cross-node replication.
//!
//! Every Router mutation is propagated asynchronously through a
//! [`Replicator`]; remote routers apply it idempotently and fan it out to
//! their own local subscribers. Convergence relies entirely on commutative,
//! deduplicated operations - there is no sequencer, consensus, or ordering
//! guarantee between broadcasts.

mod memory;
mod relay;
mod replicator;
mod transport;


pub use memory::MemoryReplicator;
pub use relay::{Envelope, EnvelopeType, RelayReplicator};
pub use replicator::{NoopReplicator, Replicator};
pub use transport::{ClusterTransport, InboundMessage};
