//! Session manager: multiplexes device sessions over one connection
//!
//! The session manager owns every device session plus the shared CBS
//! authenticator, routes engine events to whichever of them owns the
//! affected link, and routes outbound sends to the matching device.
//! Unmatched events are logged and dropped, never fatal.

use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::{Credentials, DeviceConfig};
use crate::engine::{EngineClient, SessionHandle};
use crate::error::AuthError;
use crate::protocol::{DomainMessage, OperationType};
use crate::transport::amqp::auth::{AuthOutcome, CbsAuthenticator};
use crate::transport::amqp::connection::TransportError;
use crate::transport::amqp::device_session::{AuthenticationState, DeviceSession};
use crate::transport::amqp::links::SENTINEL_DELIVERY_TAG;

/// Where an inbound delivery was routed.
pub enum InboundRouting {
    /// A CBS response matched against the pending table.
    CbsResponse(AuthOutcome),
    /// A message for one device's registered callback.
    DeviceMessage {
        device_id: String,
        message: DomainMessage,
    },
    /// Nobody claimed the delivery; logged and dropped.
    Unmatched,
}

/// Result of processing one authentication outcome.
#[derive(Debug)]
pub struct AuthResult {
    pub device_id: String,
    /// Present when authentication failed; the session stays
    /// un-authenticated.
    pub error: Option<AuthError>,
}

pub struct SessionManager {
    devices: Vec<DeviceSession>,
    auth: CbsAuthenticator,
    cbs_session: Option<SessionHandle>,
}

impl SessionManager {
    /// Build a manager for the connection's first device.
    pub fn new(first_device: DeviceConfig) -> Self {
        let auth = CbsAuthenticator::new(first_device.hostname.clone(), &first_device.device_id);
        Self {
            devices: vec![DeviceSession::new(first_device)],
            auth,
            cbs_session: None,
        }
    }

    /// Register an additional multiplexed device session.
    pub fn add_device_session(&mut self, config: DeviceConfig) -> Result<(), TransportError> {
        if self.find_device(&config.device_id).is_some() {
            return Err(TransportError::DuplicateDevice {
                device_id: config.device_id,
            });
        }
        self.devices.push(DeviceSession::new(config));
        Ok(())
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.devices
            .iter()
            .map(|d| d.device_id().to_string())
            .collect()
    }

    pub fn device_mut(&mut self, device_id: &str) -> Option<&mut DeviceSession> {
        self.devices
            .iter_mut()
            .find(|d| d.device_id() == device_id)
    }

    fn find_device(&self, device_id: &str) -> Option<&DeviceSession> {
        self.devices.iter().find(|d| d.device_id() == device_id)
    }

    /// Whether any registered session authenticates over CBS. X.509-only
    /// connections authenticate at the TLS layer and never attach the pair.
    fn needs_cbs(&self) -> bool {
        self.devices
            .iter()
            .any(|d| d.config().credentials.is_sas())
    }

    /// Connection is up: begin the shared CBS session and open its links
    /// before any worker link. A no-op on X.509-only connections.
    pub fn on_connection_init(
        &mut self,
        engine: &dyn EngineClient,
    ) -> Result<(), TransportError> {
        if !self.needs_cbs() {
            return Ok(());
        }
        let session = match self.cbs_session {
            Some(session) => session,
            None => {
                let session = engine.begin_session()?;
                self.cbs_session = Some(session);
                session
            }
        };
        self.auth.open_links(engine, session)
    }

    /// Whether authentication can start: the CBS pair is open, or no
    /// session needs it.
    pub fn is_authentication_opened(&self) -> bool {
        !self.needs_cbs() || self.auth.is_open()
    }

    /// Σ over device sessions of (subscribed operation types × 2).
    pub fn expected_worker_link_count(&self) -> usize {
        self.devices.iter().map(|d| d.expected_link_count()).sum()
    }

    /// Whether the CBS pair (when needed) and every expected worker link
    /// pair is open.
    pub fn all_links_open(&self) -> bool {
        self.is_authentication_opened()
            && self
                .devices
                .iter()
                .all(|d| d.is_authenticated() && d.worker_links_open())
    }

    /// Start authentication for every device on the connection.
    ///
    /// X.509 sessions open their links immediately. SAS sessions move to
    /// Authenticating; the first sends its put-token now and the rest wait
    /// in the FIFO chain so only one request is outstanding on the shared
    /// sender.
    pub fn authenticate_all(&mut self, engine: &dyn EngineClient) -> Result<(), TransportError> {
        let mut sas_waiting: Vec<String> = Vec::new();
        for device in &mut self.devices {
            match device.config().credentials {
                Credentials::X509 => {
                    device.open_links(engine)?;
                }
                Credentials::Sas(_) => {
                    if !device.is_authenticated() {
                        device.set_authentication_state(AuthenticationState::Authenticating);
                        sas_waiting.push(device.device_id().to_string());
                    }
                }
            }
        }

        let mut waiting = sas_waiting.into_iter();
        if let Some(first) = waiting.next() {
            if let Some(config) = self.find_device(&first).map(|d| d.config().clone()) {
                self.auth.send_put_token(engine, &config)?;
            }
        }
        for chained in waiting {
            self.auth.enqueue_chain(chained);
        }
        Ok(())
    }

    /// Resend a put-token for one device (proactive renewal or re-auth).
    pub fn send_put_token_for(
        &mut self,
        engine: &dyn EngineClient,
        device_id: &str,
    ) -> Result<(), TransportError> {
        let config = self
            .find_device(device_id)
            .map(|d| d.config().clone())
            .ok_or_else(|| TransportError::SendFailed {
                device_id: device_id.to_string(),
            })?;
        self.auth.send_put_token(engine, &config)?;
        Ok(())
    }

    /// Apply one authentication outcome: flip the session state, open its
    /// links on success, and fire the next chained device exactly once.
    pub fn handle_auth_outcome(
        &mut self,
        engine: &dyn EngineClient,
        outcome: AuthOutcome,
    ) -> Result<AuthResult, TransportError> {
        let device_id = outcome.device_id.clone();
        let success = outcome.is_success();

        if let Some(device) = self.device_mut(&device_id) {
            if success {
                device.set_authentication_state(AuthenticationState::Authenticated);
                device.open_links(engine)?;
                info!(device_id = %device_id, "device authenticated");
            } else {
                device.set_authentication_state(AuthenticationState::NotAuthenticated);
                warn!(
                    device_id = %device_id,
                    status = outcome.status,
                    "authentication rejected"
                );
            }
        } else {
            warn!(device_id = %device_id, "authentication outcome for unknown device");
        }

        // The chain entry is consumed here and fires exactly once,
        // regardless of the previous device's outcome.
        if let Some(next_id) = self.auth.next_in_chain() {
            let config = self.find_device(&next_id).map(|d| d.config().clone());
            match config {
                Some(config) => {
                    self.auth.send_put_token(engine, &config)?;
                }
                None => warn!(device_id = %next_id, "chained device no longer registered"),
            }
        }

        let error = if success {
            None
        } else {
            Some(AuthError::from_status(outcome.status, outcome.description))
        };
        Ok(AuthResult { device_id, error })
    }

    /// Route a remote link open; returns whether anyone claimed it.
    pub fn on_link_remote_open(&mut self, engine: &dyn EngineClient, link_name: &str) -> bool {
        if self.auth.on_remote_open(link_name) {
            debug!(link_name, "authentication link opened");
            return true;
        }
        for device in &mut self.devices {
            if device.on_link_remote_open(link_name, engine) {
                return true;
            }
        }
        debug!(link_name, "remote open for unknown link");
        false
    }

    /// Route a remote link close; returns whether anyone claimed it.
    pub fn on_link_remote_close(&mut self, link_name: &str) -> bool {
        if self.auth.on_remote_close(link_name) {
            return true;
        }
        for device in &mut self.devices {
            if device.on_link_remote_close(link_name) {
                return true;
            }
        }
        debug!(link_name, "remote close for unknown link");
        false
    }

    /// Route an inbound delivery to the CBS handler or the owning device.
    pub fn handle_delivery(
        &mut self,
        engine: &dyn EngineClient,
        link_name: &str,
        payload: &[u8],
    ) -> InboundRouting {
        if self.auth.owns_link(link_name) {
            let wire = match engine.decode_message(payload) {
                Ok(wire) => wire,
                Err(error) => {
                    warn!(link_name, error = %error, "dropping undecodable CBS delivery");
                    return InboundRouting::Unmatched;
                }
            };
            return match self.auth.handle_response(&wire) {
                Some(outcome) => InboundRouting::CbsResponse(outcome),
                None => InboundRouting::Unmatched,
            };
        }

        for device in &mut self.devices {
            if device.owns_link(link_name) {
                let device_id = device.device_id().to_string();
                return match device.handle_delivery(engine, link_name, payload) {
                    Some(message) => InboundRouting::DeviceMessage { device_id, message },
                    None => InboundRouting::Unmatched,
                };
            }
        }
        debug!(link_name, "delivery on unknown link");
        InboundRouting::Unmatched
    }

    /// Route a send to the owning device session.
    ///
    /// Returns the delivery tag, or the sentinel when no session claims
    /// the device, the session is not authenticated, or the send fails.
    pub fn send(
        &mut self,
        engine: &dyn EngineClient,
        message: &DomainMessage,
        device_id: &str,
    ) -> i64 {
        match self.device_mut(device_id) {
            Some(device) => {
                let result = device.send(engine, message);
                result.delivery_tag
            }
            None => {
                warn!(device_id, "send for unregistered device");
                SENTINEL_DELIVERY_TAG
            }
        }
    }

    /// Sender link name carrying the device's operation. In-flight
    /// deliveries are keyed by it because tags are per link.
    pub fn sender_link_name(&self, device_id: &str, operation: OperationType) -> Option<String> {
        self.find_device(device_id)
            .and_then(|d| d.sender_link_name(operation))
    }

    /// Whether the device's token needs renewal before further sends.
    pub fn token_renewal_necessary(&self, device_id: &str) -> bool {
        self.find_device(device_id)
            .map(|d| d.token_renewal_necessary())
            .unwrap_or(false)
    }

    pub fn is_authenticated(&self, device_id: &str) -> bool {
        self.find_device(device_id)
            .map(|d| d.is_authenticated())
            .unwrap_or(false)
    }

    /// Sweep put-token requests that never got a response.
    pub fn sweep_expired_auth(&mut self, now: Instant) -> Vec<AuthOutcome> {
        self.auth.sweep_expired(now)
    }

    /// Close every link, CBS last. Idempotent.
    pub fn close(&mut self, engine: &dyn EngineClient) -> Result<(), TransportError> {
        for device in &mut self.devices {
            device.close_links(engine)?;
        }
        self.auth.close_links(engine)?;
        self.cbs_session = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, DeviceSection, HubConfig};
    use crate::engine::{EngineClient as _, EngineConnector, EngineEvent, EngineEvents};
    use crate::protocol::OperationType;
    use crate::testing::{LoopbackConnector, LoopbackHandle};
    use std::sync::Arc;

    fn device(id: &str) -> DeviceConfig {
        let section = DeviceSection {
            hostname: "hub.example.net".to_string(),
            device_id: id.to_string(),
            module_id: None,
            sas_token_env: Some("HUBLINK_TEST_SAS".to_string()),
            use_x509: false,
            token_ttl_secs: 3600,
            model_id: None,
            user_agent: crate::protocol::client_version(),
        };
        DeviceConfig::from_section(&section).expect("device")
    }

    struct Fixture {
        manager: SessionManager,
        engine: Arc<dyn crate::engine::EngineClient>,
        events: Box<dyn EngineEvents>,
        handle: LoopbackHandle,
    }

    async fn fixture(manager: SessionManager) -> Fixture {
        let connector = LoopbackConnector::default();
        let options = crate::engine::EngineOptions {
            hostname: "hub.example.net".to_string(),
            port: 5671,
            container_id: "c".to_string(),
            idle_timeout: std::time::Duration::from_secs(230),
        };
        let (engine, events) = connector.connect(&options).await.expect("connect");
        let handle = connector.handle().expect("handle");
        Fixture {
            manager,
            engine,
            events,
            handle,
        }
    }

    /// Drain queued engine events into the manager until the stream is
    /// momentarily empty, collecting CBS outcomes along the way.
    async fn pump(fixture: &mut Fixture) -> Vec<AuthOutcome> {
        let mut outcomes = Vec::new();
        loop {
            let event = tokio::select! {
                event = fixture.events.next_event() => event,
                _ = tokio::time::sleep(std::time::Duration::from_millis(20)) => None,
            };
            let Some(event) = event else { break };
            match event {
                EngineEvent::LinkRemoteOpen { name } => {
                    fixture
                        .manager
                        .on_link_remote_open(fixture.engine.as_ref(), &name);
                }
                EngineEvent::LinkRemoteClose { name, .. } => {
                    fixture.manager.on_link_remote_close(&name);
                }
                EngineEvent::Delivery {
                    link_name, payload, ..
                } => {
                    if let InboundRouting::CbsResponse(outcome) = fixture.manager.handle_delivery(
                        fixture.engine.as_ref(),
                        &link_name,
                        &payload,
                    ) {
                        fixture
                            .manager
                            .handle_auth_outcome(fixture.engine.as_ref(), outcome.clone())
                            .expect("outcome handled");
                        outcomes.push(outcome);
                    }
                }
                _ => {}
            }
        }
        outcomes
    }

    #[test]
    fn test_duplicate_device_rejected() {
        let mut manager = SessionManager::new(device("dev-1"));
        let result = manager.add_device_session(device("dev-1"));
        assert!(matches!(
            result,
            Err(TransportError::DuplicateDevice { .. })
        ));
    }

    #[test]
    fn test_expected_worker_link_count() {
        let mut manager = SessionManager::new(device("dev-1"));
        manager.add_device_session(device("dev-2")).expect("add");
        manager
            .device_mut("dev-1")
            .expect("dev-1")
            .subscribe(OperationType::Twin);

        // dev-1: telemetry + twin = 4 links; dev-2: telemetry = 2 links
        assert_eq!(manager.expected_worker_link_count(), 6);
    }

    #[tokio::test]
    async fn test_cbs_links_open_before_workers() {
        std::env::set_var("HUBLINK_TEST_SAS", "SharedAccessSignature sr=x&sig=y");
        let manager = SessionManager::new(device("dev-cbs-first"));
        let mut fixture = fixture(manager).await;

        fixture
            .manager
            .on_connection_init(fixture.engine.as_ref())
            .expect("init");

        let attached = fixture.handle.attached_link_names();
        assert_eq!(attached.len(), 2);
        assert!(attached.iter().all(|n| n.starts_with("cbs-")));

        pump(&mut fixture).await;
        assert!(fixture.manager.is_authentication_opened());
    }

    #[tokio::test]
    async fn test_authentication_success_opens_worker_links() {
        std::env::set_var("HUBLINK_TEST_SAS", "SharedAccessSignature sr=x&sig=y");
        let manager = SessionManager::new(device("dev-auth-ok"));
        let mut fixture = fixture(manager).await;

        fixture
            .manager
            .on_connection_init(fixture.engine.as_ref())
            .expect("init");
        pump(&mut fixture).await;

        fixture
            .manager
            .authenticate_all(fixture.engine.as_ref())
            .expect("authenticate");
        let outcomes = pump(&mut fixture).await;

        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].is_success());
        assert!(fixture.manager.is_authenticated("dev-auth-ok"));
        assert!(fixture.manager.all_links_open());
    }

    #[tokio::test]
    async fn test_authentication_rejection_keeps_session_closed() {
        std::env::set_var("HUBLINK_TEST_SAS", "SharedAccessSignature sr=x&sig=y");
        let manager = SessionManager::new(device("dev-auth-bad"));
        let mut fixture = fixture(manager).await;
        fixture.handle.set_cbs_status(Some(401));

        fixture
            .manager
            .on_connection_init(fixture.engine.as_ref())
            .expect("init");
        pump(&mut fixture).await;
        fixture
            .manager
            .authenticate_all(fixture.engine.as_ref())
            .expect("authenticate");
        let outcomes = pump(&mut fixture).await;

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, 401);
        assert!(!fixture.manager.is_authenticated("dev-auth-bad"));
        assert!(!fixture.manager.all_links_open());
    }

    #[tokio::test]
    async fn test_multiplexed_authentication_is_fifo_chained() {
        std::env::set_var("HUBLINK_TEST_SAS", "SharedAccessSignature sr=x&sig=y");
        let mut manager = SessionManager::new(device("dev-a"));
        manager.add_device_session(device("dev-b")).expect("add");
        manager.add_device_session(device("dev-c")).expect("add");
        let mut fixture = fixture(manager).await;

        fixture
            .manager
            .on_connection_init(fixture.engine.as_ref())
            .expect("init");
        pump(&mut fixture).await;

        fixture
            .manager
            .authenticate_all(fixture.engine.as_ref())
            .expect("authenticate");
        // Exactly one put-token is outstanding at chain start
        assert_eq!(fixture.handle.transfers_on("cbs-sender-").len(), 1);

        let outcomes = pump(&mut fixture).await;
        assert_eq!(outcomes.len(), 3);
        let order: Vec<&str> = outcomes.iter().map(|o| o.device_id.as_str()).collect();
        assert_eq!(order, vec!["dev-a", "dev-b", "dev-c"]);
        for id in ["dev-a", "dev-b", "dev-c"] {
            assert!(fixture.manager.is_authenticated(id));
        }
    }

    fn x509_device(id: &str) -> DeviceConfig {
        let section = DeviceSection {
            hostname: "hub.example.net".to_string(),
            device_id: id.to_string(),
            module_id: None,
            sas_token_env: None,
            use_x509: true,
            token_ttl_secs: 3600,
            model_id: None,
            user_agent: crate::protocol::client_version(),
        };
        DeviceConfig::from_section(&section).expect("device")
    }

    #[tokio::test]
    async fn test_x509_only_connection_skips_cbs_links() {
        let manager = SessionManager::new(x509_device("dev-x509"));
        let mut fixture = fixture(manager).await;

        fixture
            .manager
            .on_connection_init(fixture.engine.as_ref())
            .expect("init");

        assert!(fixture.handle.attached_link_names().is_empty());
        assert!(fixture.manager.is_authentication_opened());

        fixture
            .manager
            .authenticate_all(fixture.engine.as_ref())
            .expect("authenticate");
        pump(&mut fixture).await;

        let attached = fixture.handle.attached_link_names();
        assert_eq!(attached.len(), 2);
        assert!(attached.iter().all(|n| !n.starts_with("cbs-")));
        assert!(fixture.handle.transfers_on("cbs-sender-").is_empty());
        assert!(fixture.manager.all_links_open());

        fixture
            .manager
            .close(fixture.engine.as_ref())
            .expect("close");
    }

    #[tokio::test]
    async fn test_sas_and_x509_mixed_connection_keeps_cbs() {
        std::env::set_var("HUBLINK_TEST_SAS", "SharedAccessSignature sr=x&sig=y");
        let mut manager = SessionManager::new(x509_device("dev-cert"));
        manager.add_device_session(device("dev-sas")).expect("add");
        let mut fixture = fixture(manager).await;

        fixture
            .manager
            .on_connection_init(fixture.engine.as_ref())
            .expect("init");
        pump(&mut fixture).await;
        fixture
            .manager
            .authenticate_all(fixture.engine.as_ref())
            .expect("authenticate");
        pump(&mut fixture).await;

        // CBS pair plus one telemetry pair per device
        assert_eq!(fixture.handle.attached_link_names().len(), 6);
        assert_eq!(fixture.handle.transfers_on("cbs-sender-").len(), 1);
        assert!(fixture.manager.all_links_open());
    }

    #[tokio::test]
    async fn test_send_returns_sentinel_for_unknown_device() {
        std::env::set_var("HUBLINK_TEST_SAS", "SharedAccessSignature sr=x&sig=y");
        let manager = SessionManager::new(device("dev-send"));
        let mut fixture = fixture(manager).await;

        let tag = fixture.manager.send(
            fixture.engine.as_ref(),
            &crate::protocol::DomainMessage::telemetry("x"),
            "nobody",
        );
        assert_eq!(tag, SENTINEL_DELIVERY_TAG);
    }

    #[tokio::test]
    async fn test_send_after_full_authentication() {
        std::env::set_var("HUBLINK_TEST_SAS", "SharedAccessSignature sr=x&sig=y");
        let manager = SessionManager::new(device("dev-send-ok"));
        let mut fixture = fixture(manager).await;

        fixture
            .manager
            .on_connection_init(fixture.engine.as_ref())
            .expect("init");
        pump(&mut fixture).await;
        fixture
            .manager
            .authenticate_all(fixture.engine.as_ref())
            .expect("authenticate");
        pump(&mut fixture).await;

        let tag = fixture.manager.send(
            fixture.engine.as_ref(),
            &crate::protocol::DomainMessage::telemetry("payload"),
            "dev-send-ok",
        );
        assert_eq!(tag, 0);
        assert_eq!(
            fixture.handle.transfers_on("sender_link_telemetry-").len(),
            1
        );
    }
}
