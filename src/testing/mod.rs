//! Testing utilities: an in-process loopback protocol engine
//!
//! The loopback engine implements the engine boundary without any network.
//! Link attaches are acknowledged immediately, transfers are recorded and
//! optionally auto-settled, and put-token requests on the CBS endpoint get
//! an automatic response with a configurable status code. Tests drive
//! failure paths by injecting events through [`LoopbackHandle`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::engine::{
    DeliveryOutcome, EngineClient, EngineConnector, EngineError, EngineEvent, EngineEvents,
    EngineOptions, LinkRole, LinkSpec, SessionHandle,
};
use crate::protocol::{
    PropertyValue, WireMessage, CBS_ADDRESS, CBS_STATUS_CODE_KEY, CBS_STATUS_DESCRIPTION_KEY,
};

/// Behavior switches for the loopback engine.
#[derive(Debug, Clone)]
pub struct LoopbackSettings {
    /// Acknowledge link attaches with a remote open immediately.
    pub auto_open_links: bool,
    /// Settle every non-CBS transfer as accepted.
    pub auto_accept_sends: bool,
    /// Status code for automatic CBS responses; `None` leaves put-token
    /// requests unanswered.
    pub cbs_status: Option<i32>,
}

impl Default for LoopbackSettings {
    fn default() -> Self {
        Self {
            auto_open_links: true,
            auto_accept_sends: true,
            cbs_status: Some(200),
        }
    }
}

/// One transfer recorded by the loopback engine.
#[derive(Debug, Clone)]
pub struct SentTransfer {
    pub link_name: String,
    pub delivery_tag: Vec<u8>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
struct LinkRecord {
    address: String,
    role: LinkRole,
}

struct LoopbackShared {
    events: mpsc::UnboundedSender<EngineEvent>,
    links: Mutex<HashMap<String, LinkRecord>>,
    transfers: Mutex<Vec<SentTransfer>>,
    dispositions: Mutex<Vec<(u64, DeliveryOutcome)>>,
    settings: Mutex<LoopbackSettings>,
    next_session: AtomicU32,
    next_delivery_id: AtomicU64,
}

impl LoopbackShared {
    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn cbs_receiver_link(&self) -> Option<String> {
        let links = self.links.lock().expect("links lock");
        links
            .iter()
            .find(|(_, record)| record.address == CBS_ADDRESS && record.role == LinkRole::Receiver)
            .map(|(name, _)| name.clone())
    }
}

/// Encode a wire message the way the loopback codec does.
pub fn encode_wire(message: &WireMessage) -> Vec<u8> {
    serde_json::to_vec(message).expect("wire message serializes")
}

/// Client half of one loopback connection.
pub struct LoopbackClient {
    shared: Arc<LoopbackShared>,
}

impl EngineClient for LoopbackClient {
    fn begin_session(&self) -> Result<SessionHandle, EngineError> {
        Ok(SessionHandle(
            self.shared.next_session.fetch_add(1, Ordering::SeqCst),
        ))
    }

    fn attach_link(&self, _session: SessionHandle, spec: &LinkSpec) -> Result<(), EngineError> {
        self.shared.links.lock().expect("links lock").insert(
            spec.name.clone(),
            LinkRecord {
                address: spec.address.clone(),
                role: spec.role,
            },
        );
        self.shared.emit(EngineEvent::LinkInit {
            name: spec.name.clone(),
        });
        if self.shared.settings.lock().expect("settings lock").auto_open_links {
            self.shared.emit(EngineEvent::LinkRemoteOpen {
                name: spec.name.clone(),
            });
        }
        Ok(())
    }

    fn detach_link(&self, link_name: &str) -> Result<(), EngineError> {
        self.shared.links.lock().expect("links lock").remove(link_name);
        Ok(())
    }

    fn transfer(
        &self,
        link_name: &str,
        delivery_tag: &[u8],
        payload: &[u8],
    ) -> Result<(), EngineError> {
        let record = {
            let links = self.shared.links.lock().expect("links lock");
            links
                .get(link_name)
                .cloned()
                .ok_or_else(|| EngineError::LinkNotAttached(link_name.to_string()))?
        };
        self.shared.transfers.lock().expect("transfers lock").push(SentTransfer {
            link_name: link_name.to_string(),
            delivery_tag: delivery_tag.to_vec(),
            payload: payload.to_vec(),
        });

        let settings = self.shared.settings.lock().expect("settings lock").clone();
        if record.address == CBS_ADDRESS {
            if let Some(status) = settings.cbs_status {
                let request = self.decode_message(payload)?;
                let mut response = WireMessage {
                    correlation_id: request.message_id.clone(),
                    ..WireMessage::default()
                };
                response
                    .application_properties
                    .insert(CBS_STATUS_CODE_KEY.to_string(), PropertyValue::Int(status as i64));
                if status != 200 {
                    response.application_properties.insert(
                        CBS_STATUS_DESCRIPTION_KEY.to_string(),
                        PropertyValue::Str("loopback rejection".to_string()),
                    );
                }
                if let Some(receiver) = self.shared.cbs_receiver_link() {
                    let delivery_id = self.shared.next_delivery_id.fetch_add(1, Ordering::SeqCst);
                    self.shared.emit(EngineEvent::Delivery {
                        link_name: receiver,
                        delivery_id,
                        payload: encode_wire(&response).into(),
                    });
                }
            }
        } else if settings.auto_accept_sends {
            self.shared.emit(EngineEvent::Disposition {
                link_name: link_name.to_string(),
                delivery_tag: delivery_tag.to_vec(),
                accepted: true,
            });
        }
        Ok(())
    }

    fn disposition(&self, delivery_id: u64, outcome: DeliveryOutcome) -> Result<(), EngineError> {
        self.shared
            .dispositions
            .lock()
            .expect("dispositions lock")
            .push((delivery_id, outcome));
        Ok(())
    }

    fn encode_message(&self, message: &WireMessage, buffer: &mut [u8]) -> Result<usize, EngineError> {
        let encoded = serde_json::to_vec(message)
            .map_err(|e| EngineError::Io(Box::new(e)))?;
        if encoded.len() > buffer.len() {
            return Err(EngineError::BufferOverflow {
                capacity: buffer.len(),
            });
        }
        buffer[..encoded.len()].copy_from_slice(&encoded);
        Ok(encoded.len())
    }

    fn decode_message(&self, payload: &[u8]) -> Result<WireMessage, EngineError> {
        serde_json::from_slice(payload).map_err(|e| EngineError::DecodeFailed(e.to_string()))
    }

    fn close(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Event stream half of one loopback connection.
pub struct LoopbackEvents {
    receiver: mpsc::UnboundedReceiver<EngineEvent>,
}

#[async_trait]
impl EngineEvents for LoopbackEvents {
    async fn next_event(&mut self) -> Option<EngineEvent> {
        self.receiver.recv().await
    }
}

/// Inspection and fault-injection handle for one loopback connection.
#[derive(Clone)]
pub struct LoopbackHandle {
    shared: Arc<LoopbackShared>,
}

impl LoopbackHandle {
    /// Push an arbitrary event into the stream.
    pub fn inject_event(&self, event: EngineEvent) {
        self.shared.emit(event);
    }

    /// Deliver a wire message on the named receiver link.
    pub fn deliver(&self, link_name: &str, message: &WireMessage) -> u64 {
        let delivery_id = self.shared.next_delivery_id.fetch_add(1, Ordering::SeqCst);
        self.shared.emit(EngineEvent::Delivery {
            link_name: link_name.to_string(),
            delivery_id,
            payload: encode_wire(message).into(),
        });
        delivery_id
    }

    pub fn sent_transfers(&self) -> Vec<SentTransfer> {
        self.shared.transfers.lock().expect("transfers lock").clone()
    }

    /// Transfers on links whose name starts with the prefix.
    pub fn transfers_on(&self, link_prefix: &str) -> Vec<SentTransfer> {
        self.sent_transfers()
            .into_iter()
            .filter(|t| t.link_name.starts_with(link_prefix))
            .collect()
    }

    pub fn dispositions(&self) -> Vec<(u64, DeliveryOutcome)> {
        self.shared.dispositions.lock().expect("dispositions lock").clone()
    }

    pub fn attached_link_names(&self) -> Vec<String> {
        self.shared
            .links
            .lock()
            .expect("links lock")
            .keys()
            .cloned()
            .collect()
    }

    /// Name of the first attached link matching the prefix.
    pub fn link_named(&self, prefix: &str) -> Option<String> {
        self.attached_link_names()
            .into_iter()
            .find(|name| name.starts_with(prefix))
    }

    pub fn set_cbs_status(&self, status: Option<i32>) {
        self.shared.settings.lock().expect("settings lock").cbs_status = status;
    }

    pub fn set_auto_accept_sends(&self, accept: bool) {
        self.shared.settings.lock().expect("settings lock").auto_accept_sends = accept;
    }
}

/// Connector producing loopback connections; scriptable to fail the first
/// N connection attempts for reconnection tests.
pub struct LoopbackConnector {
    settings: LoopbackSettings,
    fail_connects: AtomicU32,
    connects: AtomicU32,
    latest: Mutex<Option<LoopbackHandle>>,
}

impl Default for LoopbackConnector {
    fn default() -> Self {
        Self::new(LoopbackSettings::default())
    }
}

impl LoopbackConnector {
    pub fn new(settings: LoopbackSettings) -> Self {
        Self {
            settings,
            fail_connects: AtomicU32::new(0),
            connects: AtomicU32::new(0),
            latest: Mutex::new(None),
        }
    }

    /// Fail the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.fail_connects.store(count, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Handle to the most recent connection, if any.
    pub fn handle(&self) -> Option<LoopbackHandle> {
        self.latest.lock().expect("latest lock").clone()
    }
}

#[async_trait]
impl EngineConnector for LoopbackConnector {
    async fn connect(
        &self,
        _options: &EngineOptions,
    ) -> Result<(Arc<dyn EngineClient>, Box<dyn EngineEvents>), EngineError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(EngineError::ConnectionFailed(
                "loopback connect scripted to fail".to_string(),
            ));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(LoopbackShared {
            events: events_tx,
            links: Mutex::new(HashMap::new()),
            transfers: Mutex::new(Vec::new()),
            dispositions: Mutex::new(Vec::new()),
            settings: Mutex::new(self.settings.clone()),
            next_session: AtomicU32::new(0),
            next_delivery_id: AtomicU64::new(0),
        });

        shared.emit(EngineEvent::ConnectionInit);
        shared.emit(EngineEvent::ConnectionBound);

        *self.latest.lock().expect("latest lock") = Some(LoopbackHandle {
            shared: shared.clone(),
        });
        Ok((
            Arc::new(LoopbackClient { shared }),
            Box::new(LoopbackEvents {
                receiver: events_rx,
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_emits_init_and_bound() {
        let connector = LoopbackConnector::default();
        let options = EngineOptions {
            hostname: "hub.example.net".to_string(),
            port: 5671,
            container_id: "c-1".to_string(),
            idle_timeout: std::time::Duration::from_secs(230),
        };

        let (_client, mut events) = connector.connect(&options).await.expect("connect");
        assert!(matches!(
            events.next_event().await,
            Some(EngineEvent::ConnectionInit)
        ));
        assert!(matches!(
            events.next_event().await,
            Some(EngineEvent::ConnectionBound)
        ));
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_scripted_connect_failures() {
        let connector = LoopbackConnector::default();
        connector.fail_next_connects(2);
        let options = EngineOptions {
            hostname: "hub.example.net".to_string(),
            port: 5671,
            container_id: "c-1".to_string(),
            idle_timeout: std::time::Duration::from_secs(230),
        };

        assert!(connector.connect(&options).await.is_err());
        assert!(connector.connect(&options).await.is_err());
        assert!(connector.connect(&options).await.is_ok());
    }

    #[tokio::test]
    async fn test_attach_auto_opens_and_transfer_auto_accepts() {
        let connector = LoopbackConnector::default();
        let options = EngineOptions {
            hostname: "h".to_string(),
            port: 5671,
            container_id: "c".to_string(),
            idle_timeout: std::time::Duration::from_secs(230),
        };
        let (client, mut events) = connector.connect(&options).await.expect("connect");
        let session = client.begin_session().expect("session");

        client
            .attach_link(
                session,
                &LinkSpec {
                    name: "sender-1".to_string(),
                    address: "/devices/d/messages/events".to_string(),
                    role: LinkRole::Sender,
                    properties: HashMap::new(),
                },
            )
            .expect("attach");

        // Skip ConnectionInit/ConnectionBound
        events.next_event().await;
        events.next_event().await;
        assert!(matches!(
            events.next_event().await,
            Some(EngineEvent::LinkInit { .. })
        ));
        assert!(matches!(
            events.next_event().await,
            Some(EngineEvent::LinkRemoteOpen { .. })
        ));

        client
            .transfer("sender-1", b"0", &encode_wire(&WireMessage::default()))
            .expect("transfer");
        match events.next_event().await {
            Some(EngineEvent::Disposition {
                link_name,
                delivery_tag,
                accepted,
            }) => {
                assert_eq!(link_name, "sender-1");
                assert_eq!(delivery_tag, b"0".to_vec());
                assert!(accepted);
            }
            other => panic!("expected disposition, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cbs_transfer_gets_automatic_response() {
        let connector = LoopbackConnector::default();
        let options = EngineOptions {
            hostname: "h".to_string(),
            port: 5671,
            container_id: "c".to_string(),
            idle_timeout: std::time::Duration::from_secs(230),
        };
        let (client, mut events) = connector.connect(&options).await.expect("connect");
        let session = client.begin_session().expect("session");

        for (name, role) in [
            ("cbs-sender-1", LinkRole::Sender),
            ("cbs-receiver-1", LinkRole::Receiver),
        ] {
            client
                .attach_link(
                    session,
                    &LinkSpec {
                        name: name.to_string(),
                        address: CBS_ADDRESS.to_string(),
                        role,
                        properties: HashMap::new(),
                    },
                )
                .expect("attach");
        }

        let request = WireMessage {
            message_id: Some("corr-1".to_string()),
            ..WireMessage::default()
        };
        client
            .transfer("cbs-sender-1", b"0", &encode_wire(&request))
            .expect("transfer");

        // Drain until the CBS delivery arrives
        let response = loop {
            match events.next_event().await.expect("event") {
                EngineEvent::Delivery {
                    link_name, payload, ..
                } => {
                    assert_eq!(link_name, "cbs-receiver-1");
                    break client.decode_message(&payload).expect("decode");
                }
                _ => continue,
            }
        };
        assert_eq!(response.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(
            response.app_property_int(CBS_STATUS_CODE_KEY),
            Some(200)
        );
    }
}
