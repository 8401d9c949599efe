//! Telemetry link pair: device-to-cloud events and cloud-to-device messages

use crate::config::DeviceConfig;
use crate::protocol::{AddressBuilder, DomainMessage, LinkNameBuilder, OperationType, WireMessage};
use crate::transport::amqp::connection::TransportError;

use super::{
    base_convert_in, base_convert_out, worker_link_properties, DeliveryTagSource, LinkHandler,
    LinkPair,
};

/// Handler for the telemetry sender/receiver pair.
pub struct TelemetryLinkHandler {
    pair: LinkPair,
    tags: DeliveryTagSource,
}

impl TelemetryLinkHandler {
    pub fn new(device: &DeviceConfig) -> Self {
        let module = device.module_id.as_deref();
        let pair = LinkPair::new(
            LinkNameBuilder::telemetry_sender(&device.device_id),
            LinkNameBuilder::telemetry_receiver(&device.device_id),
            AddressBuilder::telemetry_events(&device.device_id, module),
            AddressBuilder::telemetry_devicebound(&device.device_id, module),
            worker_link_properties(device, None),
        );
        Self {
            pair,
            tags: DeliveryTagSource::new(),
        }
    }
}

impl LinkHandler for TelemetryLinkHandler {
    fn operation(&self) -> OperationType {
        OperationType::Telemetry
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
        Ok(base_convert_out(message))
    }

    fn convert_in(&mut self, message: &WireMessage) -> Result<DomainMessage, TransportError> {
        Ok(base_convert_in(message, OperationType::Telemetry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;

    fn handler() -> TelemetryLinkHandler {
        let config = HubConfig::test_config();
        let device = DeviceConfig::from_section(&config.device).expect("device");
        TelemetryLinkHandler::new(&device)
    }

    #[test]
    fn test_addresses_and_names() {
        let handler = handler();
        assert_eq!(handler.pair().sender_address, "/devices/test-device/messages/events");
        assert_eq!(
            handler.pair().receiver_address,
            "/devices/test-device/messages/devicebound"
        );
        assert!(handler
            .pair()
            .sender_name
            .starts_with("sender_link_telemetry-test-device-"));
    }

    #[test]
    fn test_round_trip() {
        let mut handler = handler();
        let mut message = DomainMessage::telemetry("temperature=21.5");
        message.message_id = Some("m-1".to_string());
        message
            .properties
            .insert("unit".to_string(), "celsius".to_string());

        let wire = handler.convert_out(&message).expect("convert out");
        let back = handler.convert_in(&wire).expect("convert in");

        assert_eq!(back.operation, OperationType::Telemetry);
        assert_eq!(back.message_id, message.message_id);
        assert_eq!(back.body, message.body);
        assert_eq!(back.properties, message.properties);
    }
}
