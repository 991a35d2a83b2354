//! Circuit Channel
//!
//! A thin stream-style façade over an established circuit for upper
//! layers: the file chunker writes bytes in, exit plaintext surfaces as
//! events. Open and close events are delivered exactly once.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use veil_signal::CircuitId;

use crate::circuit::{CircuitBuilder, CircuitState};
use crate::error::{CoreError, CoreResult};

/// Channel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

/// Events surfaced to the channel consumer
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The channel is open; emitted exactly once
    Opened,
    /// Plaintext that emerged at the exit
    Message(Bytes),
    /// A send or circuit error
    Error(String),
    /// The channel is closed; emitted exactly once
    Closed,
}

/// Byte-oriented façade over one circuit
pub struct CircuitChannel {
    builder: Arc<CircuitBuilder>,
    circuit_id: CircuitId,
    state: RwLock<ChannelState>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl CircuitChannel {
    /// Create a channel over an existing circuit, plus its event stream
    pub fn new(
        builder: Arc<CircuitBuilder>,
        circuit_id: CircuitId,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                builder,
                circuit_id,
                state: RwLock::new(ChannelState::Connecting),
                events: tx,
            }),
            rx,
        )
    }

    /// Accept the receiving side of an inbound circuit (this node is
    /// its exit). The channel starts out open; sends are rejected since
    /// the circuit is not ours to write.
    pub fn accept(
        builder: Arc<CircuitBuilder>,
        circuit_id: CircuitId,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(ChannelEvent::Opened);
        (
            Arc::new(Self {
                builder,
                circuit_id,
                state: RwLock::new(ChannelState::Open),
                events: tx,
            }),
            rx,
        )
    }

    /// The underlying circuit id
    pub fn circuit_id(&self) -> CircuitId {
        self.circuit_id
    }

    /// Current channel state
    pub async fn state(&self) -> ChannelState {
        *self.state.read().await
    }

    /// Open the channel iff the underlying circuit is ready
    pub async fn connect(&self) -> CoreResult<()> {
        let mut state = self.state.write().await;
        match *state {
            ChannelState::Connecting => {}
            ChannelState::Open => return Ok(()),
            ChannelState::Closed => return Err(CoreError::CircuitClosed(self.circuit_id)),
        }

        if self.builder.state(self.circuit_id).await == Some(CircuitState::Ready) {
            *state = ChannelState::Open;
            let _ = self.events.send(ChannelEvent::Opened);
            debug!(circuit = self.circuit_id, "Channel open");
            Ok(())
        } else {
            *state = ChannelState::Closed;
            let _ = self.events.send(ChannelEvent::Closed);
            Err(CoreError::CircuitNotReady(self.circuit_id))
        }
    }

    /// Send opaque bytes through the circuit
    pub async fn send(&self, data: &[u8]) -> CoreResult<()> {
        match *self.state.read().await {
            ChannelState::Open => {}
            ChannelState::Closed => return Err(CoreError::CircuitClosed(self.circuit_id)),
            ChannelState::Connecting => return Err(CoreError::CircuitNotReady(self.circuit_id)),
        }
        match self.builder.send(self.circuit_id, data).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = self.events.send(ChannelEvent::Error(e.to_string()));
                Err(e)
            }
        }
    }

    /// Send UTF-8 text (encoded before forwarding)
    pub async fn send_text(&self, text: &str) -> CoreResult<()> {
        self.send(text.as_bytes()).await
    }

    /// Called by the lower layer when plaintext emerges at the exit
    pub async fn deliver(&self, data: Bytes) {
        if *self.state.read().await == ChannelState::Open {
            let _ = self.events.send(ChannelEvent::Message(data));
        }
    }

    /// Close the channel and the underlying circuit; idempotent
    pub async fn close(&self) -> CoreResult<()> {
        {
            let mut state = self.state.write().await;
            if *state == ChannelState::Closed {
                return Ok(());
            }
            *state = ChannelState::Closed;
        }
        self.builder.close(self.circuit_id).await?;
        let _ = self.events.send(ChannelEvent::Closed);
        debug!(circuit = self.circuit_id, "Channel closed");
        Ok(())
    }
}
