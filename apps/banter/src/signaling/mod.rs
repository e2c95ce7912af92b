//! Client side of the signaling relay: a transport seam so the engine can run
//! over a real WebSocket or an in-memory channel pair in tests.

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use banter_proto::{ClientMessage, ServerMessage};

use crate::error::EngineError;

pub mod ws;

#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send(&self, message: ClientMessage) -> Result<(), EngineError>;
    async fn recv(&self) -> Option<ServerMessage>;
    async fn close(&self);
}

/// In-memory endpoint for tests: the engine talks [`ClientMessage`] out and
/// [`ServerMessage`] in, the test harness holds the far ends.
pub struct ChannelSignaling {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    inbound: AsyncMutex<mpsc::UnboundedReceiver<ServerMessage>>,
}

impl ChannelSignaling {
    pub fn new() -> (
        Self,
        mpsc::UnboundedReceiver<ClientMessage>,
        mpsc::UnboundedSender<ServerMessage>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound: outbound_tx,
                inbound: AsyncMutex::new(inbound_rx),
            },
            outbound_rx,
            inbound_tx,
        )
    }
}

#[async_trait]
impl SignalingTransport for ChannelSignaling {
    async fn send(&self, message: ClientMessage) -> Result<(), EngineError> {
        self.outbound
            .send(message)
            .map_err(|_| EngineError::SignalingClosed)
    }

    async fn recv(&self) -> Option<ServerMessage> {
        self.inbound.lock().await.recv().await
    }

    async fn close(&self) {}
}
