//! Twin link pair: twin reads, reported-property updates, and
//! desired-property notifications
//!
//! Twin responses carry only a correlation id plus status/resource
//! annotations, so the sender and receiver share a correlation map from
//! request id to requested operation kind. Each entry is consumed exactly
//! once by the matching response. On the pair's first successful open the
//! handler issues the one-time subscribe-to-desired-properties request.

use std::collections::HashMap;

use bytes::Bytes;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::DeviceConfig;
use crate::engine::EngineClient;
use crate::protocol::{
    AddressBuilder, DomainMessage, LinkNameBuilder, OperationType, PropertyValue, TwinOperation,
    WireMessage, TWIN_OPERATION_ANNOTATION, TWIN_RESOURCE_ANNOTATION,
    TWIN_RESOURCE_DESIRED_NOTIFICATIONS, TWIN_RESOURCE_REPORTED, TWIN_STATUS_ANNOTATION,
    TWIN_VERSION_ANNOTATION,
};
use crate::transport::amqp::connection::TransportError;

use super::{
    base_convert_in, base_convert_out, worker_link_properties, DeliveryTagSource, LinkHandler,
    LinkPair,
};

/// Handler for the twin sender/receiver pair.
pub struct TwinLinkHandler {
    pair: LinkPair,
    tags: DeliveryTagSource,
    /// Pending request id → requested operation kind, shared by the
    /// sender and receiver sides of the pair.
    correlations: HashMap<String, TwinOperation>,
    desired_subscription_sent: bool,
}

impl TwinLinkHandler {
    pub fn new(device: &DeviceConfig) -> Self {
        let module = device.module_id.as_deref();
        let address = AddressBuilder::twin(&device.device_id, module);
        let pair = LinkPair::new(
            LinkNameBuilder::twin_sender(&device.device_id),
            LinkNameBuilder::twin_receiver(&device.device_id),
            address.clone(),
            address,
            worker_link_properties(device, Some("twin")),
        );
        Self {
            pair,
            tags: DeliveryTagSource::new(),
            correlations: HashMap::new(),
            desired_subscription_sent: false,
        }
    }

    /// Number of requests still awaiting a response.
    pub fn pending_request_count(&self) -> usize {
        self.correlations.len()
    }
}

impl LinkHandler for TwinLinkHandler {
    fn operation(&self) -> OperationType {
        OperationType::Twin
    }

    fn pair(&self) -> &LinkPair {
        &self.pair
    }

    fn pair_mut(&mut self) -> &mut LinkPair {
        &mut self.pair
    }

    fn tag_source(&mut self) -> &mut DeliveryTagSource {
        &mut self.tags
    }

    fn convert_out(&mut self, message: &DomainMessage) -> Result<WireMessage, TransportError> {
        let operation = message.twin_operation.ok_or_else(|| {
            TransportError::Conversion("twin message without an operation kind".to_string())
        })?;

        let mut wire = base_convert_out(message);
        wire.annotations.insert(
            TWIN_OPERATION_ANNOTATION.to_string(),
            PropertyValue::Str(operation.as_wire().to_string()),
        );
        let resource = match operation {
            TwinOperation::Get => None,
            TwinOperation::Patch => Some(TWIN_RESOURCE_REPORTED),
            TwinOperation::Subscribe | TwinOperation::Unsubscribe => {
                Some(TWIN_RESOURCE_DESIRED_NOTIFICATIONS)
            }
        };
        if let Some(resource) = resource {
            wire.annotations.insert(
                TWIN_RESOURCE_ANNOTATION.to_string(),
                PropertyValue::Str(resource.to_string()),
            );
        }
        if let Some(version) = message.version {
            wire.annotations.insert(
                TWIN_VERSION_ANNOTATION.to_string(),
                PropertyValue::Int(version),
            );
        }

        if let Some(correlation) = &message.correlation_id {
            self.correlations.insert(correlation.clone(), operation);
        }
        Ok(wire)
    }

    fn convert_in(&mut self, message: &WireMessage) -> Result<DomainMessage, TransportError> {
        let mut domain = base_convert_in(message, OperationType::Twin);
        domain.status = message
            .annotation_int(TWIN_STATUS_ANNOTATION)
            .map(|s| s as i32);
        domain.version = message.annotation_int(TWIN_VERSION_ANNOTATION);

        // A response resolves its requested operation through the shared
        // correlation map; the entry is consumed here. Messages without a
        // correlation id are desired-property notifications.
        if let Some(correlation) = &domain.correlation_id {
            domain.twin_operation = self.correlations.remove(correlation);
            if domain.twin_operation.is_none() {
                debug!(correlation_id = %correlation, "twin response without pending request");
            }
        }
        Ok(domain)
    }

    fn on_remote_open(&mut self, link_name: &str, engine: &dyn EngineClient) -> bool {
        let owned = self.pair.on_remote_open(link_name);
        if owned && self.pair.is_open() && !self.desired_subscription_sent {
            let mut subscribe = DomainMessage::twin(TwinOperation::Subscribe, Bytes::new());
            subscribe.correlation_id = Some(Uuid::new_v4().to_string());

            let result = self.send_and_get_tag(engine, &subscribe);
            if result.accepted {
                self.desired_subscription_sent = true;
                debug!(delivery_tag = result.delivery_tag, "subscribed to desired properties");
            } else {
                warn!("desired-property subscription send failed, will retry on next open");
            }
        }
        owned
    }
}
