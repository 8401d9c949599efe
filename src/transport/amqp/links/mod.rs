//! Link handlers for the per-operation sender/receiver pairs
//!
//! Each operation type (telemetry, twin, methods) owns one sender/receiver
//! link pair. The [`LinkHandler`] trait is the capability surface the
//! session layer drives: open/close, remote-event routing, send with
//! delivery-tag assignment, and the domain⇄wire converters. Variants are
//! selected by [`OperationType`], not by inheritance.

pub mod methods;
pub mod telemetry;
pub mod twin;

pub use methods::MethodsLinkHandler;
pub use telemetry::TelemetryLinkHandler;
pub use twin::TwinLinkHandler;

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::config::DeviceConfig;
use crate::engine::{encode_with_growth, EngineClient, LinkRole, LinkSpec, SessionHandle};
use crate::protocol::{
    is_reserved_property, strip_app_property_prefix, DomainMessage, OperationType, PropertyValue,
    WireBody, WireMessage, API_VERSION, API_VERSION_KEY, CHANNEL_CORRELATION_ID_KEY,
    CLIENT_VERSION_KEY, INPUT_NAME_ANNOTATION, MODEL_ID_KEY,
};
use crate::transport::amqp::connection::TransportError;

/// Reserved tag value meaning "send failed"; never assigned to a delivery.
pub const SENTINEL_DELIVERY_TAG: i64 = -1;

/// Per-sender-link delivery tag counter.
///
/// Each sender link owns its own source; tags are unique within the link's
/// outstanding deliveries and wrap to zero before they could overflow or
/// go negative.
#[derive(Debug, Default)]
pub struct DeliveryTagSource {
    next: i64,
}

impl DeliveryTagSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next tag and advance the counter.
    pub fn next_tag(&mut self) -> i64 {
        let tag = self.next;
        self.next = if self.next == i64::MAX || self.next < 0 {
            0
        } else {
            self.next + 1
        };
        tag
    }
}

/// Link lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Unknown,
    Closed,
    Opening,
    Opened,
}

/// One sender/receiver link pair and its lifecycle state.
#[derive(Debug)]
pub struct LinkPair {
    pub sender_name: String,
    pub receiver_name: String,
    pub sender_address: String,
    pub receiver_address: String,
    pub sender_state: LinkState,
    pub receiver_state: LinkState,
    pub properties: HashMap<String, String>,
}

impl LinkPair {
    pub fn new(
        sender_name: String,
        receiver_name: String,
        sender_address: String,
        receiver_address: String,
        properties: HashMap<String, String>,
    ) -> Self {
        Self {
            sender_name,
            receiver_name,
            sender_address,
            receiver_address,
            sender_state: LinkState::Unknown,
            receiver_state: LinkState::Unknown,
            properties,
        }
    }

    /// A pair is open only once both sides reach Opened.
    pub fn is_open(&self) -> bool {
        self.sender_state == LinkState::Opened && self.receiver_state == LinkState::Opened
    }

    pub fn owns(&self, link_name: &str) -> bool {
        link_name == self.sender_name || link_name == self.receiver_name
    }

    /// Attach both links if they are not already opening or open. Idempotent.
    pub fn open(
        &mut self,
        engine: &dyn EngineClient,
        session: SessionHandle,
    ) -> Result<(), TransportError> {
        if !matches!(self.sender_state, LinkState::Opening | LinkState::Opened) {
            engine.attach_link(
                session,
                &LinkSpec {
                    name: self.sender_name.clone(),
                    address: self.sender_address.clone(),
                    role: LinkRole::Sender,
                    properties: self.properties.clone(),
                },
            )?;
            self.sender_state = LinkState::Opening;
        }
        if !matches!(self.receiver_state, LinkState::Opening | LinkState::Opened) {
            engine.attach_link(
                session,
                &LinkSpec {
                    name: self.receiver_name.clone(),
                    address: self.receiver_address.clone(),
                    role: LinkRole::Receiver,
                    properties: self.properties.clone(),
                },
            )?;
            self.receiver_state = LinkState::Opening;
        }
        Ok(())
    }

    /// Detach both links. Idempotent.
    pub fn close(&mut self, engine: &dyn EngineClient) -> Result<(), TransportError> {
        if matches!(self.sender_state, LinkState::Opening | LinkState::Opened) {
            engine.detach_link(&self.sender_name)?;
        }
        self.sender_state = LinkState::Closed;
        if matches!(self.receiver_state, LinkState::Opening | LinkState::Opened) {
            engine.detach_link(&self.receiver_name)?;
        }
        self.receiver_state = LinkState::Closed;
        Ok(())
    }

    /// Mark a link opened after the remote attach; returns whether the
    /// event belonged to this pair.
    pub fn on_remote_open(&mut self, link_name: &str) -> bool {
        if link_name == self.sender_name {
            self.sender_state = LinkState::Opened;
            true
        } else if link_name == self.receiver_name {
            self.receiver_state = LinkState::Opened;
            true
        } else {
            false
        }
    }

    /// Mark a link closed after a remote detach; returns whether the event
    /// belonged to this pair.
    pub fn on_remote_close(&mut self, link_name: &str) -> bool {
        if link_name == self.sender_name {
            self.sender_state = LinkState::Closed;
            true
        } else if link_name == self.receiver_name {
            self.receiver_state = LinkState::Closed;
            true
        } else {
            false
        }
    }
}

/// Link properties advertised to the service on every worker link.
pub fn worker_link_properties(
    device: &DeviceConfig,
    correlation_prefix: Option<&str>,
) -> HashMap<String, String> {
    let mut properties = HashMap::new();
    properties.insert(API_VERSION_KEY.to_string(), API_VERSION.to_string());
    properties.insert(CLIENT_VERSION_KEY.to_string(), device.user_agent.clone());
    if let Some(prefix) = correlation_prefix {
        properties.insert(
            CHANNEL_CORRELATION_ID_KEY.to_string(),
            format!("{prefix}:{}", uuid::Uuid::new_v4()),
        );
    }
    if let Some(model_id) = &device.model_id {
        properties.insert(MODEL_ID_KEY.to_string(), model_id.clone());
    }
    properties
}

/// Result of one send attempt on a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendResult {
    pub accepted: bool,
    pub delivery_tag: i64,
}

impl SendResult {
    pub fn success(delivery_tag: i64) -> Self {
        Self {
            accepted: true,
            delivery_tag,
        }
    }

    pub fn failure() -> Self {
        Self {
            accepted: false,
            delivery_tag: SENTINEL_DELIVERY_TAG,
        }
    }
}

/// Capability surface of one operation-type link pair.
pub trait LinkHandler: Send {
    fn operation(&self) -> OperationType;

    fn pair(&self) -> &LinkPair;

    fn pair_mut(&mut self) -> &mut LinkPair;

    fn tag_source(&mut self) -> &mut DeliveryTagSource;

    /// Convert a domain message into its wire form.
    fn convert_out(&mut self, message: &DomainMessage) -> Result<WireMessage, TransportError>;

    /// Convert a received wire message into its domain form.
    fn convert_in(&mut self, message: &WireMessage) -> Result<DomainMessage, TransportError>;

    /// Attach the pair on the given session. Idempotent.
    fn open(
        &mut self,
        engine: &dyn EngineClient,
        session: SessionHandle,
    ) -> Result<(), TransportError> {
        self.pair_mut().open(engine, session)
    }

    /// Detach the pair. Idempotent.
    fn close(&mut self, engine: &dyn EngineClient) -> Result<(), TransportError> {
        self.pair_mut().close(engine)
    }

    fn owns_link(&self, link_name: &str) -> bool {
        self.pair().owns(link_name)
    }

    fn is_open(&self) -> bool {
        self.pair().is_open()
    }

    /// Remote attach; returns whether the event belonged to this handler.
    /// Variants hook this for open-triggered work (twin auto-subscribe).
    fn on_remote_open(&mut self, link_name: &str, engine: &dyn EngineClient) -> bool {
        let _ = engine;
        self.pair_mut().on_remote_open(link_name)
    }

    /// Remote detach; returns whether the event belonged to this handler.
    fn on_remote_close(&mut self, link_name: &str) -> bool {
        self.pair_mut().on_remote_close(link_name)
    }

    /// Encode and transfer one message, assigning the next delivery tag.
    ///
    /// Returns a failed [`SendResult`] when the pair is not open, the
    /// message encodes to zero bytes, or the engine refuses the transfer.
    fn send_and_get_tag(
        &mut self,
        engine: &dyn EngineClient,
        message: &DomainMessage,
    ) -> SendResult {
        if !self.is_open() {
            debug!(
                link = %self.pair().sender_name,
                "send attempted while link pair not open"
            );
            return SendResult::failure();
        }

        let wire = match self.convert_out(message) {
            Ok(wire) => wire,
            Err(error) => {
                warn!(error = %error, "outbound conversion failed");
                return SendResult::failure();
            }
        };

        let encoded = match encode_with_growth(engine, &wire) {
            Ok(encoded) => encoded,
            Err(error) => {
                warn!(error = %error, "message encoding failed");
                return SendResult::failure();
            }
        };
        if encoded.is_empty() {
            return SendResult::failure();
        }

        let tag = self.tag_source().next_tag();
        let tag_bytes = tag.to_string().into_bytes();
        match engine.transfer(&self.pair().sender_name, &tag_bytes, &encoded) {
            Ok(()) => SendResult::success(tag),
            Err(error) => {
                warn!(error = %error, delivery_tag = tag, "transfer failed");
                SendResult::failure()
            }
        }
    }
}

/// Shared outbound conversion: properties common to every operation type.
pub(crate) fn base_convert_out(message: &DomainMessage) -> WireMessage {
    let mut wire = WireMessage {
        message_id: message.message_id.clone(),
        correlation_id: message.correlation_id.clone(),
        content_type: message.content_type.clone(),
        content_encoding: message.content_encoding.clone(),
        body: if message.body.is_empty() {
            WireBody::Empty
        } else {
            WireBody::Data(message.body.to_vec())
        },
        ..WireMessage::default()
    };
    for (key, value) in &message.properties {
        if !is_reserved_property(key) {
            wire.application_properties
                .insert(key.clone(), PropertyValue::Str(value.clone()));
        }
    }
    wire
}

/// Shared inbound conversion: common fields, non-reserved user properties
/// (inbound prefix stripped), and the module input-name annotation.
pub(crate) fn base_convert_in(wire: &WireMessage, operation: OperationType) -> DomainMessage {
    let mut message = DomainMessage {
        body: wire.body_bytes(),
        content_type: wire.content_type.clone(),
        content_encoding: wire.content_encoding.clone(),
        message_id: wire.message_id.clone(),
        correlation_id: wire.correlation_id.clone(),
        operation,
        ..DomainMessage::default()
    };
    for (key, value) in &wire.application_properties {
        if is_reserved_property(key) {
            continue;
        }
        if let Some(text) = value.as_str() {
            message
                .properties
                .insert(strip_app_property_prefix(key).to_string(), text.to_string());
        }
    }
    if let Some(input) = wire
        .annotations
        .get(INPUT_NAME_ANNOTATION)
        .and_then(|v| v.as_str())
    {
        message.input_name = Some(input.to_string());
    }
    message
}
