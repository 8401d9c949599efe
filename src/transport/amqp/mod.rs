//! AMQP 1.0 transport implementation
//!
//! One connection carries every multiplexed device session. The module
//! splits along the lifecycle: [`connection`] holds pure state and policy,
//! [`auth`] the CBS handshake, [`links`] the per-operation link pairs and
//! message converters, [`device_session`] and [`session_manager`] the
//! routing layers, [`queues`] the application/reactor hand-off, and
//! [`client`] the supervisor task behind [`AmqpTransport`].

pub mod auth;
pub mod client;
pub mod connection;
pub mod device_session;
pub mod links;
pub mod queues;
pub mod session_manager;

pub use auth::{renewal_period, AuthOutcome, CbsAuthenticator};
pub use client::AmqpTransport;
pub use connection::{ConnectionState, ReconnectConfig, TransportError};
pub use device_session::{AuthenticationState, DeviceSession};
pub use links::{LinkHandler, SendResult, SENTINEL_DELIVERY_TAG};
pub use queues::{OutboundPacket, ReceivedEnvelope, TransportQueues};
pub use session_manager::SessionManager;
