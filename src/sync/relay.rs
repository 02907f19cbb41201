//! Relay-based replication over the cluster broadcast transport.
//!
//! Outbound: mutations become JSON envelopes broadcast to all peers.
//! Inbound: envelopes are dispatched by type and applied idempotently;
//! the completion handle is always signaled, even for garbage, so the
//! transport never retries forever.
//!
//! Channel creation and entry replication are independent, unordered
//! broadcasts, so every entry envelope piggybacks its channel's metadata
//! instead of relying on an ordering guarantee between the two.

use crate::error::ReplicationError;
use crate::metrics;
use crate::router::Router;
use crate::state::{Channel, MsgEntry};
use crate::sync::{ClusterTransport, InboundMessage, Replicator};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Replication message type on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    ReplicateEntry,
    ReplicateChannel,
    ReplicateCleanup,
    ReplicateExecutor,
    /// Anything a newer (or broken) peer sent that this node does not
    /// understand. Logged and dropped, never serialized.
    #[serde(other)]
    Unknown,
}

impl EnvelopeType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::ReplicateEntry => "replicate_entry",
            Self::ReplicateChannel => "replicate_channel",
            Self::ReplicateCleanup => "replicate_cleanup",
            Self::ReplicateExecutor => "replicate_executor",
            Self::Unknown => "unknown",
        }
    }
}

/// Wire envelope carried as the opaque payload of the broadcast transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    #[serde(rename = "channelid", default, skip_serializing_if = "String::is_empty")]
    pub channel_id: String,
    #[serde(rename = "processid", default, skip_serializing_if = "String::is_empty")]
    pub process_id: String,
    #[serde(rename = "executorid", default, skip_serializing_if = "String::is_empty")]
    pub executor_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<MsgEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<Channel>,
}

impl Envelope {
    fn empty(kind: EnvelopeType) -> Self {
        Self {
            kind,
            channel_id: String::new(),
            process_id: String::new(),
            executor_id: String::new(),
            entry: None,
            channel: None,
        }
    }
}

/// Production replicator: serializes envelopes onto the cluster transport
/// and applies inbound envelopes onto the local router.
pub struct RelayReplicator {
    transport: Arc<dyn ClusterTransport>,
    router: OnceLock<Weak<Router>>,
}

impl RelayReplicator {
    pub fn new(transport: Arc<dyn ClusterTransport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            router: OnceLock::new(),
        })
    }

    /// Attach the local router that inbound envelopes are applied to.
    ///
    /// Done after construction because the router holds this replicator.
    pub fn attach(&self, router: &Arc<Router>) {
        let _ = self.router.set(Arc::downgrade(router));
    }

    fn router(&self) -> Option<Arc<Router>> {
        self.router.get().and_then(Weak::upgrade)
    }

    async fn send(&self, envelope: Envelope) -> Result<(), ReplicationError> {
        let kind = envelope.kind.as_str();
        let data = serde_json::to_vec(&envelope)?;
        self.transport.broadcast(data).await?;
        metrics::record_replication_sent(kind);
        Ok(())
    }

    /// Handle one inbound transport unit.
    ///
    /// Always signals the completion handle afterwards, whether or not the
    /// envelope was usable.
    pub async fn handle_incoming(&self, message: InboundMessage) {
        match serde_json::from_slice::<Envelope>(&message.data) {
            Ok(envelope) => self.dispatch(envelope),
            Err(e) => {
                metrics::record_replication_error("decode");
                error!(error = %e, "dropping malformed replication message");
            }
        }
        if let Some(done) = message.done {
            let _ = done.send(());
        }
    }

    /// Drain the inbound stream until the transport closes it.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<InboundMessage>) {
        while let Some(message) = inbound.recv().await {
            self.handle_incoming(message).await;
        }
        debug!("inbound replication stream closed");
    }

    fn dispatch(&self, envelope: Envelope) {
        let Some(router) = self.router() else {
            warn!("no router attached, dropping replication message");
            return;
        };
        let kind = envelope.kind;
        match kind {
            EnvelopeType::ReplicateEntry => {
                let mut channel_id = envelope.channel_id;
                // The channel broadcast may not have arrived yet; the
                // piggybacked metadata closes that race.
                if let Some(channel) = envelope.channel {
                    if channel_id.is_empty() {
                        channel_id = channel.id.clone();
                    }
                    router.create_if_not_exists(channel.metadata());
                }
                let Some(entry) = envelope.entry else {
                    warn!(channel = %channel_id, "entry envelope without entry");
                    return;
                };
                if let Err(e) = router.replicate_entry(&channel_id, entry) {
                    warn!(channel = %channel_id, error = %e, "replicated entry rejected");
                    return;
                }
            }
            EnvelopeType::ReplicateChannel => {
                let Some(channel) = envelope.channel else {
                    warn!("channel envelope without channel");
                    return;
                };
                router.create_if_not_exists(channel.metadata());
            }
            EnvelopeType::ReplicateCleanup => {
                router.apply_cleanup(&envelope.process_id);
            }
            EnvelopeType::ReplicateExecutor => {
                router.apply_executor_assignment(&envelope.process_id, &envelope.executor_id);
            }
            EnvelopeType::Unknown => {
                warn!("dropping replication message of unknown type");
                return;
            }
        }
        metrics::record_replication_applied(kind.as_str());
    }
}

#[async_trait]
impl Replicator for RelayReplicator {
    async fn replicate_entry(
        &self,
        channel: &Channel,
        entry: &MsgEntry,
    ) -> Result<(), ReplicationError> {
        let envelope = Envelope {
            channel_id: channel.id.clone(),
            entry: Some(entry.clone()),
            channel: Some(channel.metadata()),
            ..Envelope::empty(EnvelopeType::ReplicateEntry)
        };
        self.send(envelope).await
    }

    async fn replicate_channel(&self, channel: &Channel) -> Result<(), ReplicationError> {
        let envelope = Envelope {
            channel_id: channel.id.clone(),
            channel: Some(channel.metadata()),
            ..Envelope::empty(EnvelopeType::ReplicateChannel)
        };
        self.send(envelope).await
    }

    async fn replicate_cleanup(&self, process_id: &str) -> Result<(), ReplicationError> {
        let envelope = Envelope {
            process_id: process_id.to_string(),
            ..Envelope::empty(EnvelopeType::ReplicateCleanup)
        };
        self.send(envelope).await
    }

    async fn replicate_executor_assignment(
        &self,
        process_id: &str,
        executor_id: &str,
    ) -> Result<(), ReplicationError> {
        let envelope = Envelope {
            process_id: process_id.to_string(),
            executor_id: executor_id.to_string(),
            ..Envelope::empty(EnvelopeType::ReplicateExecutor)
        };
        self.send(envelope).await
    }
}
