//! Endpoint address and link-name construction
//!
//! Addresses follow the per-device templates the hub exposes; module
//! identities insert a `/modules/{module_id}` segment. Link names carry an
//! operation-specific prefix plus the device id plus a random suffix so
//! remote events can be routed back to their owning handler.

use uuid::Uuid;

use crate::protocol::messages::CBS_ADDRESS;

/// Endpoint address construction for the per-device link templates.
pub struct AddressBuilder;

impl AddressBuilder {
    /// Telemetry send address: `/devices/{id}/messages/events`
    pub fn telemetry_events(device_id: &str, module_id: Option<&str>) -> String {
        match module_id {
            Some(module) => format!("/devices/{device_id}/modules/{module}/messages/events"),
            None => format!("/devices/{device_id}/messages/events"),
        }
    }

    /// Telemetry receive address: `/devices/{id}/messages/devicebound`
    ///
    /// Module identities receive on their events address, with routing by
    /// the input-name annotation.
    pub fn telemetry_devicebound(device_id: &str, module_id: Option<&str>) -> String {
        match module_id {
            Some(module) => format!("/devices/{device_id}/modules/{module}/messages/events"),
            None => format!("/devices/{device_id}/messages/devicebound"),
        }
    }

    /// Twin address (shared by sender and receiver): `/devices/{id}/twin`
    pub fn twin(device_id: &str, module_id: Option<&str>) -> String {
        match module_id {
            Some(module) => format!("/devices/{device_id}/modules/{module}/twin"),
            None => format!("/devices/{device_id}/twin"),
        }
    }

    /// Methods address: `/devices/{id}/methods/devicebound`
    pub fn methods(device_id: &str, module_id: Option<&str>) -> String {
        match module_id {
            Some(module) => format!("/devices/{device_id}/modules/{module}/methods/devicebound"),
            None => format!("/devices/{device_id}/methods/devicebound"),
        }
    }

    /// Shared claims-based-security endpoint.
    pub fn cbs() -> String {
        CBS_ADDRESS.to_string()
    }

    /// Target name for a put-token request:
    /// `{host}/devices/{id}[/modules/{module_id}]`
    pub fn token_audience(hostname: &str, device_id: &str, module_id: Option<&str>) -> String {
        match module_id {
            Some(module) => format!("{hostname}/devices/{device_id}/modules/{module}"),
            None => format!("{hostname}/devices/{device_id}"),
        }
    }
}

/// Link-name construction. Names are unique per attach so stale remote
/// events from a previous incarnation never match a live link.
pub struct LinkNameBuilder;

impl LinkNameBuilder {
    pub fn telemetry_sender(device_id: &str) -> String {
        format!("sender_link_telemetry-{device_id}-{}", Uuid::new_v4())
    }

    pub fn telemetry_receiver(device_id: &str) -> String {
        format!("receiver_link_telemetry-{device_id}-{}", Uuid::new_v4())
    }

    pub fn twin_sender(device_id: &str) -> String {
        format!("sender_link_devicetwin-{device_id}-{}", Uuid::new_v4())
    }

    pub fn twin_receiver(device_id: &str) -> String {
        format!("receiver_link_devicetwin-{device_id}-{}", Uuid::new_v4())
    }

    pub fn methods_sender(device_id: &str) -> String {
        format!("sender_link_devicemethods-{device_id}-{}", Uuid::new_v4())
    }

    pub fn methods_receiver(device_id: &str) -> String {
        format!("receiver_link_devicemethods-{device_id}-{}", Uuid::new_v4())
    }

    pub fn cbs_sender(device_id: &str) -> String {
        format!("cbs-sender-{device_id}-{}", Uuid::new_v4())
    }

    pub fn cbs_receiver(device_id: &str) -> String {
        format!("cbs-receiver-{device_id}-{}", Uuid::new_v4())
    }
}
