//! Protocol-engine boundary
//!
//! The AMQP frame codec, TLS, and SASL live in an external engine consumed
//! through the traits in this module. The engine hands back a command
//! handle ([`EngineClient`]) and an event stream ([`EngineEvents`]); all
//! link and delivery state transitions arrive as [`EngineEvent`]s on the
//! stream, which is polled by a single task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::protocol::WireMessage;

/// Errors surfaced by the protocol engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Encode buffer too small: {capacity} bytes")]
    BufferOverflow { capacity: usize },
    #[error("Decode failed: {0}")]
    DecodeFailed(String),
    #[error("Link not attached: {0}")]
    LinkNotAttached(String),
    #[error("Engine I/O error")]
    Io(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Engine closed")]
    Closed,
}

/// Options for establishing one engine connection.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub hostname: String,
    pub port: u16,
    /// AMQP container id, unique per connection attempt.
    pub container_id: String,
    pub idle_timeout: Duration,
}

/// Handle to one AMQP session begun on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u32);

/// Sender or receiver role of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Sender,
    Receiver,
}

/// Everything needed to attach one link.
#[derive(Debug, Clone)]
pub struct LinkSpec {
    pub name: String,
    pub address: String,
    pub role: LinkRole,
    /// Link properties advertised to the service (API version, client
    /// version, channel correlation id, model id).
    pub properties: HashMap<String, String>,
}

/// Settlement outcome reported back to the service for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Accepted,
    Released,
    Rejected,
}

/// Events emitted by the engine's dispatch loop.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Transport established, sessions may be begun.
    ConnectionInit,
    /// TLS/SASL complete.
    ConnectionBound,
    LinkInit {
        name: String,
    },
    /// Remote attached its end of the link.
    LinkRemoteOpen {
        name: String,
    },
    LinkRemoteClose {
        name: String,
        condition: Option<String>,
    },
    /// Sender link received credit.
    LinkFlow {
        name: String,
        credit: u32,
    },
    /// Inbound transfer on a receiver link.
    Delivery {
        link_name: String,
        delivery_id: u64,
        payload: Bytes,
    },
    /// Remote settled one of our outbound transfers.
    Disposition {
        link_name: String,
        delivery_tag: Vec<u8>,
        accepted: bool,
    },
    ConnectionRemoteClose {
        condition: Option<String>,
    },
    TransportError {
        message: String,
    },
}

/// Command surface of a connected engine.
///
/// Commands enqueue onto the engine's own loop and return immediately; the
/// results arrive as [`EngineEvent`]s.
pub trait EngineClient: Send + Sync {
    /// Begin a new session on the connection.
    fn begin_session(&self) -> Result<SessionHandle, EngineError>;

    /// Attach a link on the given session.
    fn attach_link(&self, session: SessionHandle, spec: &LinkSpec) -> Result<(), EngineError>;

    /// Detach a link by name.
    fn detach_link(&self, link_name: &str) -> Result<(), EngineError>;

    /// Transfer payload bytes on a sender link under the given delivery tag.
    fn transfer(
        &self,
        link_name: &str,
        delivery_tag: &[u8],
        payload: &[u8],
    ) -> Result<(), EngineError>;

    /// Settle an inbound delivery with the given outcome.
    fn disposition(&self, delivery_id: u64, outcome: DeliveryOutcome) -> Result<(), EngineError>;

    /// Encode a wire message into the buffer, returning the encoded length.
    ///
    /// Returns [`EngineError::BufferOverflow`] when the buffer is too
    /// small; callers grow the buffer and retry.
    fn encode_message(&self, message: &WireMessage, buffer: &mut [u8]) -> Result<usize, EngineError>;

    /// Decode a received payload into a wire message.
    fn decode_message(&self, payload: &[u8]) -> Result<WireMessage, EngineError>;

    /// Close the connection.
    fn close(&self) -> Result<(), EngineError>;
}

/// Event stream of a connected engine. Owned and polled by exactly one task.
#[async_trait]
pub trait EngineEvents: Send {
    /// Next engine event, or `None` once the engine has shut down.
    async fn next_event(&mut self) -> Option<EngineEvent>;
}

/// Factory establishing engine connections.
#[async_trait]
pub trait EngineConnector: Send + Sync {
    async fn connect(
        &self,
        options: &EngineOptions,
    ) -> Result<(Arc<dyn EngineClient>, Box<dyn EngineEvents>), EngineError>;
}

/// Encode a message through the engine, growing the buffer on overflow.
///
/// Starts at 1 KiB and doubles until the message fits; overflow is handled
/// here and never surfaced to callers.
pub fn encode_with_growth(
    engine: &dyn EngineClient,
    message: &WireMessage,
) -> Result<Vec<u8>, EngineError> {
    let mut buffer = vec![0u8; 1024];
    loop {
        match engine.encode_message(message, &mut buffer) {
            Ok(length) => {
                buffer.truncate(length);
                return Ok(buffer);
            }
            Err(EngineError::BufferOverflow { .. }) => {
                let grown = buffer.len() * 2;
                buffer = vec![0u8; grown];
            }
            Err(other) => return Err(other),
        }
    }
}
