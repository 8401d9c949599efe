//! hublink - AMQP 1.0 transport core for IoT device-to-hub messaging
//!
//! # Overview
//!
//! This crate provides the transport layer an IoT device client sits on:
//! - One AMQP connection multiplexing any number of device sessions
//! - Claims-based-security (CBS) authentication with proactive SAS token
//!   renewal, or X.509 sessions authenticated at the TLS layer
//! - Telemetry, device-twin, and direct-method link pairs per device
//! - Queues bridging application tasks to a single supervisor task, with
//!   exactly-once terminal-status callbacks per outbound message
//! - Automatic reconnection with exponential backoff; in-flight messages
//!   are requeued across reconnects
//!
//! The AMQP frame codec itself lives behind the [`engine`] traits; the
//! in-process loopback engine in [`testing`] implements them for tests.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hublink::config::HubConfig;
//! use hublink::protocol::DomainMessage;
//! use hublink::testing::LoopbackConnector;
//! use hublink::transport::amqp::AmqpTransport;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config: HubConfig = toml::from_str(
//!         r#"
//! [device]
//! hostname = "contoso.azure-devices.net"
//! device_id = "thermostat-01"
//! sas_token_env = "HUB_SAS_TOKEN"
//! "#,
//!     )?;
//!
//!     let transport = AmqpTransport::new(&config, Arc::new(LoopbackConnector::default()))?;
//!     transport.open().await?;
//!
//!     transport.add_message(
//!         DomainMessage::telemetry(r#"{"temperature": 21.5}"#),
//!         "thermostat-01",
//!         None,
//!     );
//!     transport.send_messages().await?;
//!
//!     transport.close().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use config::{DeviceConfig, HubConfig};
pub use error::{HublinkError, HublinkResult};
pub use protocol::{
    ConnectionStatusEvent, DomainMessage, IncomingDisposition, OperationType, TerminalStatus,
    TwinOperation,
};
pub use transport::amqp::{AmqpTransport, ConnectionState, TransportError};
pub use transport::{HubTransport, Transport};
