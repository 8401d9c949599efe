//! Pure connection state management for the AMQP transport
//!
//! This module contains pure functions and types for connection state,
//! reconnection policy, and engine option construction. Nothing here does
//! I/O, which keeps the reconnection decision logic directly testable.

use std::time::Duration;

use thiserror::Error;

use crate::config::{DeviceConfig, TransportSection};
use crate::engine::{EngineError, EngineOptions};
use crate::error::AuthError;

/// Connection state for the AMQP transport
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - attempting to connect
    Connecting,
    /// Connected, authenticated, and ready for operations
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// Attempting to reconnect (attempt count)
    Reconnecting(u32),
    /// Permanently disconnected - fatal error or max attempts exceeded
    PermanentlyDisconnected(String),
}

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// First backoff delay in milliseconds
    pub base_delay_ms: u64,
    /// Backoff ceiling in milliseconds
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            base_delay_ms: 100,
            max_delay_ms: 30_000,
        }
    }
}

impl From<&crate::config::ReconnectSection> for ReconnectConfig {
    fn from(section: &crate::config::ReconnectSection) -> Self {
        Self {
            max_attempts: section.max_attempts,
            base_delay_ms: section.base_delay_ms,
            max_delay_ms: section.max_delay_ms,
        }
    }
}

impl ReconnectConfig {
    /// Exponential backoff delay for the given attempt, capped at the
    /// ceiling. Attempt numbering starts at 1.
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(32);
        self.base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms)
    }

    /// Advance the attempt counter, wrapping to zero before overflow.
    pub fn next_attempt(attempt: u32) -> u32 {
        if attempt == u32::MAX {
            0
        } else {
            attempt + 1
        }
    }
}

/// Outcome of one reconnection decision.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectionDecision {
    /// Reconnect after the given backoff delay.
    Proceed { attempt: u32, delay_ms: u64 },
    /// Shutdown was requested, stop reconnecting.
    AbortShutdownRequested,
    /// Configured attempt limit reached.
    AbortMaxAttemptsExceeded,
}

/// Decide whether to reconnect for the given attempt number.
pub fn should_attempt_reconnection(
    config: &ReconnectConfig,
    attempt: u32,
    shutdown_requested: bool,
) -> ReconnectionDecision {
    if shutdown_requested {
        return ReconnectionDecision::AbortShutdownRequested;
    }
    if let Some(max) = config.max_attempts {
        if attempt > max {
            return ReconnectionDecision::AbortMaxAttemptsExceeded;
        }
    }
    ReconnectionDecision::Proceed {
        attempt,
        delay_ms: config.calculate_backoff_delay(attempt),
    }
}

/// Remote close conditions that must never trigger reconnection.
pub fn is_fatal_condition(condition: &str) -> bool {
    matches!(
        condition,
        "amqp:unauthorized-access" | "amqp:not-allowed" | "amqp:decode-error"
    )
}

/// AMQP transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Timed out waiting for {operation} after {waited_ms} ms")]
    WaitTimeout {
        operation: &'static str,
        waited_ms: u64,
    },
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Send failed for device {device_id}")]
    SendFailed { device_id: String },
    #[error("Link {link_name} is not open")]
    LinkNotOpen { link_name: String },
    #[error("Message conversion failed: {0}")]
    Conversion(String),
    #[error("Device session already registered: {device_id}")]
    DuplicateDevice { device_id: String },
    #[error("Protocol engine error")]
    Engine(#[from] EngineError),
    #[error("Authentication failed")]
    Auth(#[from] AuthError),
    #[error("Transport closed")]
    Closed,
}

impl TransportError {
    /// Whether this error should be retried by the reconnection loop.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Auth(auth) => auth.is_retryable(),
            TransportError::Closed => false,
            TransportError::ConnectionFailed(_)
            | TransportError::WaitTimeout { .. }
            | TransportError::NotConnected { .. }
            | TransportError::SendFailed { .. }
            | TransportError::LinkNotOpen { .. }
            | TransportError::Engine(_) => true,
            TransportError::Conversion(_) => false,
            TransportError::DuplicateDevice { .. } => false,
        }
    }
}

/// Build engine options for one connection attempt.
///
/// The container id carries a timestamp so each attempt is distinguishable
/// on the service side.
pub fn configure_engine_options(
    device: &DeviceConfig,
    transport: &TransportSection,
) -> EngineOptions {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    EngineOptions {
        hostname: device.hostname.clone(),
        port: transport.port,
        container_id: format!("{}-{timestamp}", device.device_id),
        idle_timeout: transport.idle_timeout(),
    }
}

/// Interruptible sleep used for backoff delays in the supervisor loop.
///
/// Returns true if the sleep completed, false if shutdown was signaled.
pub async fn interruptible_sleep(
    delay: Duration,
    shutdown: &mut tokio::sync::watch::Receiver<bool>,
) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.wait_for(|requested| *requested) => false,
    }
}
