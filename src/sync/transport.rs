//! Cluster broadcast transport boundary.
//!
//! The real transport lives outside this crate. Its contract: best-effort,
//! unordered, at-least-once unicast-to-all; inbound units carry an optional
//! completion handle that must be signaled once processing finishes so the
//! transport stops retrying.

use crate::error::TransportError;
use async_trait::async_trait;
use tokio::sync::oneshot;

/// Outbound half of the cluster broadcast transport.
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Broadcast an opaque payload to all live peers.
    async fn broadcast(&self, data: Vec<u8>) -> Result<(), TransportError>;
}

/// One inbound unit from the transport.
#[derive(Debug)]
pub struct InboundMessage {
    pub data: Vec<u8>,
    /// Completion handle; signaled after handling, successful or not.
    pub done: Option<oneshot::Sender<()>>,
}

impl InboundMessage {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, done: None }
    }

    pub fn with_done(data: Vec<u8>, done: oneshot::Sender<()>) -> Self {
        Self { data, done: Some(done) }
    }
}
