//! Claims-based-security authentication over the shared CBS link pair
//!
//! One CBS session serves every device multiplexed on the connection: a
//! single sender/receiver pair at the `$cbs` endpoint. Put-token requests
//! are correlated to responses through a pending-request table keyed by
//! correlation id; each entry is consumed at most once and swept when a
//! response never arrives. Multiplexed devices authenticate FIFO through a
//! chain so only one put-token is outstanding at the start of multiplexed
//! authentication.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{Credentials, DeviceConfig, SasToken};
use crate::engine::{encode_with_growth, EngineClient, SessionHandle};
use crate::error::AuthError;
use crate::protocol::{
    AddressBuilder, LinkNameBuilder, PropertyValue, WireBody, WireMessage, API_VERSION,
    API_VERSION_KEY, CBS_NAME_KEY, CBS_OPERATION_KEY, CBS_PUT_TOKEN_OPERATION, CBS_REPLY_TO,
    CBS_SAS_TOKEN_TYPE, CBS_STATUS_CODE_KEY, CBS_STATUS_DESCRIPTION_KEY, CBS_TYPE_KEY,
};
use crate::transport::amqp::connection::TransportError;
use crate::transport::amqp::links::{DeliveryTagSource, LinkPair};

/// Fraction of the token lifetime after which renewal is triggered.
pub const RENEWAL_SAFETY_MARGIN: f64 = 0.75;

/// Retry interval after a failed renewal send, instead of the full period.
pub const RENEWAL_RETRY_INTERVAL: Duration = Duration::from_secs(3);

/// How long a put-token request may await its response before being swept.
pub const PENDING_REQUEST_TTL: Duration = Duration::from_secs(60);

/// When to proactively renew a token with the given lifetime.
pub fn renewal_period(token_ttl: Duration) -> Duration {
    token_ttl.mul_f64(RENEWAL_SAFETY_MARGIN)
}

#[derive(Debug)]
struct PendingEntry {
    device_id: String,
    registered_at: Instant,
}

/// Pending put-token requests awaiting their response.
#[derive(Debug)]
pub struct PendingRequests {
    entries: HashMap<String, PendingEntry>,
    ttl: Duration,
}

impl PendingRequests {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    pub fn register(&mut self, correlation_id: String, device_id: String, now: Instant) {
        self.entries.insert(
            correlation_id,
            PendingEntry {
                device_id,
                registered_at: now,
            },
        );
    }

    /// Consume the entry for a correlation id. Each id matches at most once.
    pub fn take(&mut self, correlation_id: &str) -> Option<String> {
        self.entries
            .remove(correlation_id)
            .map(|entry| entry.device_id)
    }

    /// Remove entries older than the TTL, returning (correlation id,
    /// device id) for each so the owner can surface a timeout.
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<(String, String)> {
        let ttl = self.ttl;
        let mut expired = Vec::new();
        self.entries.retain(|correlation, entry| {
            if now.duration_since(entry.registered_at) >= ttl {
                expired.push((correlation.clone(), entry.device_id.clone()));
                false
            } else {
                true
            }
        });
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Result of one CBS response matched against the pending table.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthOutcome {
    pub device_id: String,
    pub status: i32,
    pub description: String,
}

impl AuthOutcome {
    pub fn is_success(&self) -> bool {
        self.status == 200
    }
}

/// The shared CBS authentication handler.
pub struct CbsAuthenticator {
    pair: LinkPair,
    tags: DeliveryTagSource,
    pending: PendingRequests,
    /// Devices waiting for their turn on the shared CBS sender, FIFO.
    chain: VecDeque<String>,
    hostname: String,
}

impl CbsAuthenticator {
    pub fn new(hostname: impl Into<String>, primary_device_id: &str) -> Self {
        let mut properties = HashMap::new();
        properties.insert(API_VERSION_KEY.to_string(), API_VERSION.to_string());
        let pair = LinkPair::new(
            LinkNameBuilder::cbs_sender(primary_device_id),
            LinkNameBuilder::cbs_receiver(primary_device_id),
            AddressBuilder::cbs(),
            AddressBuilder::cbs(),
            properties,
        );
        Self {
            pair,
            tags: DeliveryTagSource::new(),
            pending: PendingRequests::new(PENDING_REQUEST_TTL),
            chain: VecDeque::new(),
            hostname: hostname.into(),
        }
    }

    pub fn open_links(
        &mut self,
        engine: &dyn EngineClient,
        session: SessionHandle,
    ) -> Result<(), TransportError> {
        self.pair.open(engine, session)
    }

    pub fn close_links(&mut self, engine: &dyn EngineClient) -> Result<(), TransportError> {
        self.pending.clear();
        self.chain.clear();
        self.pair.close(engine)
    }

    pub fn is_open(&self) -> bool {
        self.pair.is_open()
    }

    pub fn owns_link(&self, link_name: &str) -> bool {
        self.pair.owns(link_name)
    }

    pub fn receiver_link_name(&self) -> &str {
        &self.pair.receiver_name
    }

    pub fn on_remote_open(&mut self, link_name: &str) -> bool {
        self.pair.on_remote_open(link_name)
    }

    pub fn on_remote_close(&mut self, link_name: &str) -> bool {
        self.pair.on_remote_close(link_name)
    }

    /// Build a put-token request for the device, returning the message and
    /// its correlation id (used as the message id).
    pub fn build_put_token_message(
        &self,
        device: &DeviceConfig,
        token: &SasToken,
    ) -> (WireMessage, String) {
        let correlation_id = Uuid::new_v4().to_string();
        let mut wire = WireMessage {
            to: Some(AddressBuilder::cbs()),
            reply_to: Some(CBS_REPLY_TO.to_string()),
            message_id: Some(correlation_id.clone()),
            body: WireBody::Value(token.token.clone()),
            ..WireMessage::default()
        };
        wire.application_properties.insert(
            CBS_OPERATION_KEY.to_string(),
            PropertyValue::Str(CBS_PUT_TOKEN_OPERATION.to_string()),
        );
        wire.application_properties.insert(
            CBS_TYPE_KEY.to_string(),
            PropertyValue::Str(CBS_SAS_TOKEN_TYPE.to_string()),
        );
        wire.application_properties.insert(
            CBS_NAME_KEY.to_string(),
            PropertyValue::Str(AddressBuilder::token_audience(
                &self.hostname,
                &device.device_id,
                device.module_id.as_deref(),
            )),
        );
        (wire, correlation_id)
    }

    /// Send a put-token request for the device and register the pending
    /// correlation. Returns the correlation id.
    pub fn send_put_token(
        &mut self,
        engine: &dyn EngineClient,
        device: &DeviceConfig,
    ) -> Result<String, TransportError> {
        let provider = match &device.credentials {
            Credentials::Sas(provider) => provider,
            Credentials::X509 => {
                return Err(TransportError::Conversion(
                    "X.509 devices do not use put-token authentication".to_string(),
                ))
            }
        };
        if !self.pair.is_open() {
            return Err(TransportError::LinkNotOpen {
                link_name: self.pair.sender_name.clone(),
            });
        }

        let token = provider
            .current_token()
            .map_err(|e| TransportError::Auth(AuthError::TokenSource(e)))?;
        let (wire, correlation_id) = self.build_put_token_message(device, &token);

        let encoded = encode_with_growth(engine, &wire)?;
        let tag = self.tags.next_tag();
        engine.transfer(&self.pair.sender_name, tag.to_string().as_bytes(), &encoded)?;

        self.pending
            .register(correlation_id.clone(), device.device_id.clone(), Instant::now());
        debug!(
            device_id = %device.device_id,
            correlation_id = %correlation_id,
            "put-token request sent"
        );
        Ok(correlation_id)
    }

    /// Match a CBS response against the pending table.
    ///
    /// Returns `None` for responses whose correlation id is unknown; those
    /// are logged and dropped.
    pub fn handle_response(&mut self, wire: &WireMessage) -> Option<AuthOutcome> {
        let correlation = wire
            .correlation_id
            .as_deref()
            .or(wire.message_id.as_deref())?;
        let device_id = match self.pending.take(correlation) {
            Some(device_id) => device_id,
            None => {
                warn!(correlation_id = %correlation, "CBS response without pending request");
                return None;
            }
        };
        let status = wire
            .app_property_int(CBS_STATUS_CODE_KEY)
            .map(|s| s as i32)
            .unwrap_or(500);
        let description = wire
            .app_property_str(CBS_STATUS_DESCRIPTION_KEY)
            .unwrap_or_default()
            .to_string();
        Some(AuthOutcome {
            device_id,
            status,
            description,
        })
    }

    /// Queue a device behind the in-progress authentication.
    pub fn enqueue_chain(&mut self, device_id: String) {
        self.chain.push_back(device_id);
    }

    /// Consume the next chained device, if any. The chain entry fires once.
    pub fn next_in_chain(&mut self) -> Option<String> {
        self.chain.pop_front()
    }

    pub fn chain_len(&self) -> usize {
        self.chain.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Sweep pending requests that never got a response, surfacing each as
    /// a timed-out outcome.
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<AuthOutcome> {
        self.pending
            .sweep_expired(now)
            .into_iter()
            .map(|(correlation, device_id)| {
                warn!(
                    correlation_id = %correlation,
                    device_id = %device_id,
                    "put-token request expired without a response"
                );
                AuthOutcome {
                    device_id,
                    status: 408,
                    description: "put-token response never arrived".to_string(),
                }
            })
            .collect()
    }
}
