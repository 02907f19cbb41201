//! Channel subsystem configuration.

use serde::Deserialize;

/// Channel subsystem configuration.
///
/// Capacities are hard caps: a full subscriber queue or receive buffer
/// drops new entries rather than blocking a writer or growing without
/// bound.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelsConfig {
    /// Per-subscriber delivery queue capacity (default: 64).
    /// A slow subscriber loses entries past this depth; the canonical log
    /// is unaffected.
    #[serde(default = "default_subscriber_queue_capacity")]
    pub subscriber_queue_capacity: usize,
    /// SharedMem receive buffer capacity (default: 256).
    #[serde(default = "default_shared_mem_buffer_capacity")]
    pub shared_mem_buffer_capacity: usize,
    /// Run replication inline instead of on a background task
    /// (default: false). Only useful for deterministic test assertions.
    #[serde(default)]
    pub synchronous_replication: bool,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            subscriber_queue_capacity: default_subscriber_queue_capacity(),
            shared_mem_buffer_capacity: default_shared_mem_buffer_capacity(),
            synchronous_replication: false,
        }
    }
}

fn default_subscriber_queue_capacity() -> usize {
    64
}

fn default_shared_mem_buffer_capacity() -> usize {
    256
}
