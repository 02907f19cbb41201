//! Prometheus metrics for the channel subsystem.
//!
//! Tracks append throughput, replication traffic by message type, and the
//! drop counters behind the backpressure policy. Helpers are no-ops until
//! `init()` runs, so library users who do not scrape metrics pay nothing.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

/// Total entries appended locally.
pub static ENTRIES_APPENDED: OnceLock<IntCounter> = OnceLock::new();

/// Replication messages sent to peers, by envelope type.
pub static REPLICATION_SENT: OnceLock<IntCounterVec> = OnceLock::new();

/// Inbound replication messages applied, by envelope type.
pub static REPLICATION_APPLIED: OnceLock<IntCounterVec> = OnceLock::new();

/// Replication failures, by stage (encode, transport, ...).
pub static REPLICATION_ERRORS: OnceLock<IntCounterVec> = OnceLock::new();

/// Entries dropped because a subscriber queue was full.
pub static SUBSCRIBER_DROPPED: OnceLock<IntCounter> = OnceLock::new();

/// SharedMem messages dropped because the receive buffer was full.
pub static SHARED_MEM_DROPPED: OnceLock<IntCounter> = OnceLock::new();

/// Channels currently held by the local router.
pub static ACTIVE_CHANNELS: OnceLock<IntGauge> = OnceLock::new();

/// Initialize the Prometheus metrics registry.
///
/// Must be called once at startup before any metrics are recorded.
pub fn init() {
    let r = registry();

    // Helper macro to register metric
    macro_rules! register {
        ($metric:ident, $init:expr) => {
            let m = $init.expect(concat!(stringify!($metric), " creation failed"));
            if let Err(e) = r.register(Box::new(m.clone())) {
                tracing::warn!(error = %e, concat!("Failed to register metric ", stringify!($metric)));
            }
            let _ = $metric.set(m);
        };
    }

    register!(
        ENTRIES_APPENDED,
        IntCounter::new("swarm_channel_entries_appended_total", "Entries appended locally")
    );
    register!(
        REPLICATION_SENT,
        IntCounterVec::new(
            Opts::new("swarm_replication_sent_total", "Replication messages sent to peers"),
            &["type"]
        )
    );
    register!(
        REPLICATION_APPLIED,
        IntCounterVec::new(
            Opts::new("swarm_replication_applied_total", "Inbound replication messages applied"),
            &["type"]
        )
    );
    register!(
        REPLICATION_ERRORS,
        IntCounterVec::new(
            Opts::new("swarm_replication_errors_total", "Replication failures by stage"),
            &["stage"]
        )
    );
    register!(
        SUBSCRIBER_DROPPED,
        IntCounter::new(
            "swarm_subscriber_dropped_total",
            "Entries dropped on full subscriber queues"
        )
    );
    register!(
        SHARED_MEM_DROPPED,
        IntCounter::new(
            "swarm_shared_mem_dropped_total",
            "SharedMem messages dropped on a full receive buffer"
        )
    );
    register!(
        ACTIVE_CHANNELS,
        IntGauge::new("swarm_active_channels", "Channels held by the local router")
    );
}

/// Gather all metrics and encode them in Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode Prometheus metrics");
        return String::new();
    }
    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Prometheus metrics were not valid UTF-8");
            String::new()
        }
    }
}

/// Record a locally appended entry.
#[inline]
pub fn record_append() {
    if let Some(c) = ENTRIES_APPENDED.get() {
        c.inc();
    }
}

/// Record an outbound replication message.
#[inline]
pub fn record_replication_sent(kind: &str) {
    if let Some(c) = REPLICATION_SENT.get() {
        c.with_label_values(&[kind]).inc();
    }
}

/// Record an applied inbound replication message.
#[inline]
pub fn record_replication_applied(kind: &str) {
    if let Some(c) = REPLICATION_APPLIED.get() {
        c.with_label_values(&[kind]).inc();
    }
}

/// Record a replication failure.
#[inline]
pub fn record_replication_error(stage: &str) {
    if let Some(c) = REPLICATION_ERRORS.get() {
        c.with_label_values(&[stage]).inc();
    }
}

/// Record an entry dropped on a full subscriber queue.
#[inline]
pub fn record_subscriber_drop() {
    if let Some(c) = SUBSCRIBER_DROPPED.get() {
        c.inc();
    }
}

/// Record a SharedMem message dropped on a full receive buffer.
#[inline]
pub fn record_shared_mem_drop() {
    if let Some(c) = SHARED_MEM_DROPPED.get() {
        c.inc();
    }
}

/// Update the active-channels gauge.
#[inline]
pub fn set_active_channels(count: i64) {
    if let Some(g) = ACTIVE_CHANNELS.get() {
        g.set(count);
    }
}
