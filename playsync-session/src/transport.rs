//! Broadcast transport seam
//!
//! The real transport (socket layer, relay service) lives outside this
//! crate; the coordinator only needs the small surface below. The
//! [`InProcessHub`] is a loopback implementation wired the same way, used by
//! the integration tests and by embedders running several players in one
//! process.

use async_trait::async_trait;
use tokio::sync::broadcast;

use playsync_common::{Error, EventEnvelope, Result};

/// What a subscriber receives from the transport.
#[derive(Debug, Clone)]
pub enum TransportMessage {
    Event(EventEnvelope),
    /// A peer's connection went away; its state should be reaped.
    PeerLeft { client_id: String },
}

/// Delivery surface the coordinator is built against.
///
/// The transport must deliver every sent envelope to every participant,
/// including the sender. Self-delivery is how a sender applies its own
/// commands, which keeps each peer's ingest path identical.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(&self, envelope: EventEnvelope) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<TransportMessage>;

    /// Connection id once connected; `None` before the handshake completes.
    fn local_client_id(&self) -> Option<String>;

    /// Resolves with the connection id as soon as the transport is usable.
    async fn wait_until_connected(&self) -> Result<String>;
}

/// Loopback broadcast hub connecting any number of in-process participants.
#[derive(Debug)]
pub struct InProcessHub {
    tx: broadcast::Sender<TransportMessage>,
}

impl InProcessHub {
    pub fn new(capacity: usize) -> std::sync::Arc<Self> {
        let (tx, _) = broadcast::channel(capacity);
        std::sync::Arc::new(Self { tx })
    }

    /// Attach a participant under the given connection id.
    pub fn connect(
        self: &std::sync::Arc<Self>,
        client_id: impl Into<String>,
    ) -> std::sync::Arc<HubConnection> {
        std::sync::Arc::new(HubConnection {
            tx: self.tx.clone(),
            client_id: client_id.into(),
        })
    }
}

/// One participant's handle onto an [`InProcessHub`].
#[derive(Debug)]
pub struct HubConnection {
    tx: broadcast::Sender<TransportMessage>,
    client_id: String,
}

impl HubConnection {
    /// Announce departure to the remaining participants.
    pub fn disconnect(&self) {
        let _ = self.tx.send(TransportMessage::PeerLeft {
            client_id: self.client_id.clone(),
        });
    }
}

#[async_trait]
impl MessageTransport for HubConnection {
    async fn send(&self, envelope: EventEnvelope) -> Result<()> {
        self.tx
            .send(TransportMessage::Event(envelope))
            .map(|_| ())
            .map_err(|_| Error::Transport("hub has no connected receivers".to_string()))
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportMessage> {
        self.tx.subscribe()
    }

    fn local_client_id(&self) -> Option<String> {
        Some(self.client_id.clone())
    }

    async fn wait_until_connected(&self) -> Result<String> {
        Ok(self.client_id.clone())
    }
}
