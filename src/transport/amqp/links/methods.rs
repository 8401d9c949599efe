//! Methods link pair: direct-method invocations and responses
//!
//! Inbound invocations carry the method name in a dedicated application
//! property and the request id in the message correlation id. Outbound
//! responses echo the request id and carry the result status.

use crate::config::DeviceConfig;
use crate::protocol::{
    AddressBuilder, DomainMessage, LinkNameBuilder, OperationType, PropertyValue, WireMessage,
    METHOD_NAME_KEY, METHOD_STATUS_KEY,
};
use crate::transport::amqp::connection::TransportError;

use super::{
    base_convert_in, base_convert_out, worker_link_properties, DeliveryTagSource, LinkHandler,
    LinkPair,
};

/// Handler for the direct-methods sender/receiver pair.
pub struct MethodsLinkHandler {
    pair: LinkPair,
    tags: DeliveryTagSource,
}

impl MethodsLinkHandler {
    pub fn new(device: &DeviceConfig) -> Self {
        let module = device.module_id.as_deref();
        let address = AddressBuilder::methods(&device.device_id, module);
        let pair = LinkPair::new(
            LinkNameBuilder::methods_sender(&device.device_id),
            LinkNameBuilder::methods_receiver(&device.device_id),
            address.clone(),
            address,
            worker_link_properties(device, Some("methods")),
        );
        Self {
            pair,
            tags: DeliveryTagSource::new(),
        }
    }
}

impl LinkHandler for MethodsLinkHandler {
    fn operation(&self) -> OperationType {
        OperationType::Methods
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
        if message.correlation_id.is_none() {
            return Err(TransportError::Conversion(
                "method response without a request id".to_string(),
            ));
        }
        let status = message.method_status.ok_or_else(|| {
            TransportError::Conversion("method response without a status".to_string())
        })?;

        let mut wire = base_convert_out(message);
        wire.application_properties
            .insert(METHOD_STATUS_KEY.to_string(), PropertyValue::Int(status as i64));
        Ok(wire)
    }

    fn convert_in(&mut self, message: &WireMessage) -> Result<DomainMessage, TransportError> {
        let mut domain = base_convert_in(message, OperationType::Methods);
        domain.method_name = message
            .app_property_str(METHOD_NAME_KEY)
            .map(|name| name.to_string());
        domain.method_status = message
            .app_property_int(METHOD_STATUS_KEY)
            .map(|status| status as i32);
        Ok(domain)
    }
}
