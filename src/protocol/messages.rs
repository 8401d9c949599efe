//! Domain and wire message structures for hub communication
//!
//! A [`DomainMessage`] is what the application hands to the transport; a
//! [`WireMessage`] is the engine-facing representation with the AMQP
//! properties, application properties, and annotations that carry protocol
//! semantics. Per-operation converters in the link handlers translate
//! between the two.

use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Application property key carrying the service API version on every link.
pub const API_VERSION_KEY: &str = "com.microsoft:api-version";
/// API version this transport speaks.
pub const API_VERSION: &str = "2018-06-30";
/// Link property identifying the client software to the service.
pub const CLIENT_VERSION_KEY: &str = "com.microsoft:client-version";
/// Link property pairing a sender/receiver link pair on the service side.
pub const CHANNEL_CORRELATION_ID_KEY: &str = "com.microsoft:channel-correlation-id";
/// Link property advertising an IoT Plug and Play model id.
pub const MODEL_ID_KEY: &str = "com.microsoft:model-id";

/// Prefix applied to user properties on some inbound paths.
pub const APP_PROPERTY_PREFIX: &str = "iothub-app-";
/// Message annotation naming the module input a message was routed to.
pub const INPUT_NAME_ANNOTATION: &str = "x-opt-input-name";

/// Application property carrying a direct-method name.
pub const METHOD_NAME_KEY: &str = "IoThub-methodname";
/// Application property carrying a direct-method result status.
pub const METHOD_STATUS_KEY: &str = "IoThub-status";

/// Twin message annotation keys.
pub const TWIN_OPERATION_ANNOTATION: &str = "operation";
pub const TWIN_RESOURCE_ANNOTATION: &str = "resource";
pub const TWIN_STATUS_ANNOTATION: &str = "status";
pub const TWIN_VERSION_ANNOTATION: &str = "version";

/// Twin resource paths.
pub const TWIN_RESOURCE_REPORTED: &str = "/properties/reported";
pub const TWIN_RESOURCE_DESIRED: &str = "/properties/desired";
pub const TWIN_RESOURCE_DESIRED_NOTIFICATIONS: &str = "/notifications/twin/properties/desired";

/// CBS endpoint address and reply-to.
pub const CBS_ADDRESS: &str = "$cbs";
pub const CBS_REPLY_TO: &str = "cbs";
/// CBS application property keys.
pub const CBS_OPERATION_KEY: &str = "operation";
pub const CBS_TYPE_KEY: &str = "type";
pub const CBS_NAME_KEY: &str = "name";
pub const CBS_STATUS_CODE_KEY: &str = "status-code";
pub const CBS_STATUS_DESCRIPTION_KEY: &str = "status-description";
/// CBS application property values for a put-token request.
pub const CBS_PUT_TOKEN_OPERATION: &str = "put-token";
pub const CBS_SAS_TOKEN_TYPE: &str = "servicebus.windows.net:sastoken";

/// Client identification string sent in link properties.
pub fn client_version() -> String {
    format!("hublink/{}", env!("CARGO_PKG_VERSION"))
}

/// Operation types multiplexed over one device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Device-to-cloud events and cloud-to-device messages.
    #[default]
    Telemetry,
    /// Device twin reads, reported-property updates, and desired-property
    /// notifications.
    Twin,
    /// Direct method invocations and responses.
    Methods,
}

/// Twin request kinds tracked in the sender/receiver correlation map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TwinOperation {
    Get,
    Patch,
    Subscribe,
    Unsubscribe,
}

impl TwinOperation {
    /// Wire value for the `operation` message annotation.
    pub fn as_wire(self) -> &'static str {
        match self {
            TwinOperation::Get => "GET",
            TwinOperation::Patch => "PATCH",
            TwinOperation::Subscribe => "PUT",
            TwinOperation::Unsubscribe => "DELETE",
        }
    }
}

/// Message handed between the application and the transport.
#[derive(Debug, Clone, Default)]
pub struct DomainMessage {
    /// Payload bytes.
    pub body: Bytes,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    /// Non-reserved user properties, round-tripped through the converters.
    pub properties: HashMap<String, String>,
    /// Which link pair carries this message.
    pub operation: OperationType,
    /// Absolute expiry; expired messages are never transmitted.
    pub expires_at: Option<DateTime<Utc>>,
    /// Module input this message was routed to (inbound only).
    pub input_name: Option<String>,
    /// Direct-method name (methods operation only).
    pub method_name: Option<String>,
    /// Direct-method result status (methods operation only).
    pub method_status: Option<i32>,
    /// Requested twin operation (twin operation only).
    pub twin_operation: Option<TwinOperation>,
    /// Twin response status from the service.
    pub status: Option<i32>,
    /// Twin property version from the service.
    pub version: Option<i64>,
}

impl DomainMessage {
    /// Create a telemetry message with the given payload.
    pub fn telemetry(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            operation: OperationType::Telemetry,
            ..Self::default()
        }
    }

    /// Create a twin request of the given kind.
    pub fn twin(operation: TwinOperation, body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            operation: OperationType::Twin,
            twin_operation: Some(operation),
            ..Self::default()
        }
    }

    /// Create a direct-method response.
    pub fn method_response(request_id: impl Into<String>, status: i32, body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            operation: OperationType::Methods,
            correlation_id: Some(request_id.into()),
            method_status: Some(status),
            ..Self::default()
        }
    }

    /// Whether the message's absolute expiry has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Property value in wire-message application properties and annotations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyValue {
    Str(String),
    Int(i64),
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(s) => Some(s),
            PropertyValue::Int(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(i) => Some(*i),
            // Some services send numeric properties as strings.
            PropertyValue::Str(s) => s.parse().ok(),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Str(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Str(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        PropertyValue::Int(value as i64)
    }
}

/// Wire message body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireBody {
    #[default]
    Empty,
    /// Binary data section.
    Data(Vec<u8>),
    /// Single AMQP value (used by CBS put-token, which carries the token
    /// as a string value).
    Value(String),
}

/// Engine-facing message representation.
///
/// Field names follow the AMQP properties section; application properties
/// and message annotations are string-keyed maps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub to: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    #[serde(default)]
    pub application_properties: HashMap<String, PropertyValue>,
    #[serde(default)]
    pub annotations: HashMap<String, PropertyValue>,
    #[serde(default)]
    pub body: WireBody,
}

impl WireMessage {
    /// String application property, if present.
    pub fn app_property_str(&self, key: &str) -> Option<&str> {
        self.application_properties.get(key).and_then(|v| v.as_str())
    }

    /// Integer application property, if present.
    pub fn app_property_int(&self, key: &str) -> Option<i64> {
        self.application_properties.get(key).and_then(|v| v.as_int())
    }

    /// Integer message annotation, if present.
    pub fn annotation_int(&self, key: &str) -> Option<i64> {
        self.annotations.get(key).and_then(|v| v.as_int())
    }

    /// Payload bytes regardless of body section kind.
    pub fn body_bytes(&self) -> Bytes {
        match &self.body {
            WireBody::Empty => Bytes::new(),
            WireBody::Data(d) => Bytes::copy_from_slice(d),
            WireBody::Value(v) => Bytes::copy_from_slice(v.as_bytes()),
        }
    }
}

/// Keys that carry protocol semantics and are excluded from user-property
/// round-tripping.
pub fn is_reserved_property(key: &str) -> bool {
    matches!(
        key,
        METHOD_NAME_KEY
            | METHOD_STATUS_KEY
            | CBS_STATUS_CODE_KEY
            | CBS_STATUS_DESCRIPTION_KEY
            | API_VERSION_KEY
            | CLIENT_VERSION_KEY
            | CHANNEL_CORRELATION_ID_KEY
            | MODEL_ID_KEY
    )
}

/// Strip the inbound application-property prefix, if present.
pub fn strip_app_property_prefix(key: &str) -> &str {
    key.strip_prefix(APP_PROPERTY_PREFIX).unwrap_or(key)
}

/// Terminal result reported exactly once for every outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    /// Acknowledged by the service.
    Ok,
    /// Expired before transmission.
    Expired,
    /// Dropped because the transport was closed.
    CancelledOnClose,
    /// Rejected because the device's token expired.
    Unauthorized,
}

/// Callback invoked with the terminal status of one outbound message.
pub type StatusCallback = Box<dyn FnOnce(TerminalStatus) + Send>;

/// Disposition returned by the application for a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingDisposition {
    /// Settle as accepted.
    Complete,
    /// Release back to the service for redelivery.
    Abandon,
    /// Settle as rejected.
    Reject,
}

/// Callback invoked for each received message; returns the disposition to
/// report back to the service.
pub type MessageReceivedCallback = Box<dyn Fn(&DomainMessage) -> IncomingDisposition + Send>;

/// Connection-level events surfaced to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionStatusEvent {
    Established,
    Lost,
    TokenExpired,
    PermanentlyDisconnected(String),
}

/// Callback invoked on connection-level state changes.
pub type ConnectionStateCallback = Box<dyn Fn(ConnectionStatusEvent) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_expiry_check() {
        let now = Utc::now();

        let mut message = DomainMessage::telemetry("payload");
        assert!(!message.is_expired(now));

        message.expires_at = Some(now - Duration::seconds(1));
        assert!(message.is_expired(now));

        message.expires_at = Some(now + Duration::seconds(60));
        assert!(!message.is_expired(now));
    }

    #[test]
    fn test_property_value_coercion() {
        assert_eq!(PropertyValue::Int(200).as_int(), Some(200));
        assert_eq!(PropertyValue::Str("401".to_string()).as_int(), Some(401));
        assert_eq!(PropertyValue::Str("ok".to_string()).as_int(), None);
        assert_eq!(PropertyValue::from("x").as_str(), Some("x"));
    }

    #[test]
    fn test_reserved_properties_excluded() {
        assert!(is_reserved_property(METHOD_NAME_KEY));
        assert!(is_reserved_property(CBS_STATUS_CODE_KEY));
        assert!(!is_reserved_property("customer-key"));
    }

    #[test]
    fn test_app_property_prefix_stripping() {
        assert_eq!(strip_app_property_prefix("iothub-app-severity"), "severity");
        assert_eq!(strip_app_property_prefix("severity"), "severity");
    }

    #[test]
    fn test_twin_operation_wire_values() {
        assert_eq!(TwinOperation::Get.as_wire(), "GET");
        assert_eq!(TwinOperation::Patch.as_wire(), "PATCH");
        assert_eq!(TwinOperation::Subscribe.as_wire(), "PUT");
        assert_eq!(TwinOperation::Unsubscribe.as_wire(), "DELETE");
    }

    #[test]
    fn test_wire_message_body_bytes() {
        let mut wire = WireMessage::default();
        assert!(wire.body_bytes().is_empty());

        wire.body = WireBody::Data(vec![1, 2, 3]);
        assert_eq!(wire.body_bytes().as_ref(), &[1, 2, 3]);

        wire.body = WireBody::Value("token".to_string());
        assert_eq!(wire.body_bytes().as_ref(), b"token");
    }

    #[test]
    fn test_wire_message_serde_round_trip() {
        let mut wire = WireMessage {
            to: Some("$cbs".to_string()),
            message_id: Some("m1".to_string()),
            ..WireMessage::default()
        };
        wire.application_properties
            .insert(CBS_STATUS_CODE_KEY.to_string(), PropertyValue::Int(200));

        let json = serde_json::to_string(&wire).expect("serialize");
        let back: WireMessage = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, wire);
        assert_eq!(back.app_property_int(CBS_STATUS_CODE_KEY), Some(200));
    }
}
