//! Transport layer for device-to-hub communication
//!
//! This module provides the transport abstraction and the AMQP 1.0
//! implementation used for telemetry, twin, and direct-method traffic.

use crate::protocol::{DomainMessage, StatusCallback};

pub mod amqp;

/// Transport trait for hub communication
///
/// An abstraction over the AMQP transport to enable dependency injection
/// and testing against fakes.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Connect, authenticate, and open every expected link, bounded by the
    /// configured open timeout.
    async fn open(&self) -> Result<(), amqp::TransportError>;

    /// Close links and the connection; pending messages fail with
    /// `CancelledOnClose`.
    async fn close(&self);

    /// Queue a message; its callback fires exactly once with the terminal
    /// status.
    fn add_message(
        &self,
        message: DomainMessage,
        device_id: &str,
        callback: Option<StatusCallback>,
    );

    /// Drain the outbound queue onto the wire.
    async fn send_messages(&self) -> Result<(), amqp::TransportError>;

    /// Hand the next received message to its registered callback; returns
    /// whether one was handled.
    async fn handle_message(&self) -> Result<bool, amqp::TransportError>;

    /// Fire pending terminal-status callbacks on the caller's task.
    fn invoke_callbacks(&self);

    /// Current connection state.
    fn connection_state(&self) -> amqp::ConnectionState;

    /// Whether the connection is beyond recovery.
    fn is_permanently_disconnected(&self) -> bool {
        matches!(
            self.connection_state(),
            amqp::ConnectionState::PermanentlyDisconnected(_)
        )
    }

    /// Whether nothing is queued, in flight, or awaiting a callback.
    fn is_empty(&self) -> bool;
}

#[async_trait::async_trait]
impl Transport for amqp::AmqpTransport {
    async fn open(&self) -> Result<(), amqp::TransportError> {
        AmqpTransport::open(self).await
    }

    async fn close(&self) {
        AmqpTransport::close(self).await;
    }

    fn add_message(
        &self,
        message: DomainMessage,
        device_id: &str,
        callback: Option<StatusCallback>,
    ) {
        AmqpTransport::add_message(self, message, device_id, callback);
    }

    async fn send_messages(&self) -> Result<(), amqp::TransportError> {
        AmqpTransport::send_messages(self).await
    }

    async fn handle_message(&self) -> Result<bool, amqp::TransportError> {
        AmqpTransport::handle_message(self).await
    }

    fn invoke_callbacks(&self) {
        AmqpTransport::invoke_callbacks(self);
    }

    fn connection_state(&self) -> amqp::ConnectionState {
        AmqpTransport::connection_state(self)
    }

    fn is_empty(&self) -> bool {
        AmqpTransport::is_empty(self)
    }
}

use amqp::AmqpTransport;

/// Type alias for the AMQP transport
pub type HubTransport = amqp::AmqpTransport;

// Re-exported so transport consumers need only this module for
// connection monitoring.
pub use crate::protocol::{ConnectionStateCallback, ConnectionStatusEvent};
