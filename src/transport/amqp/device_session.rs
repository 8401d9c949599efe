//! Per-device session: link handlers plus authentication state
//!
//! A device session owns the link handlers for the operation types the
//! device subscribed to (telemetry always, twin and methods on demand) and
//! the device's authentication state. Links open only once the session is
//! authenticated; X.509 sessions are authenticated by the connection
//! itself and start that way, SAS sessions start not-authenticated.

use tracing::{debug, warn};

use crate::config::{Credentials, DeviceConfig};
use crate::engine::{EngineClient, SessionHandle};
use crate::protocol::{DomainMessage, OperationType};
use crate::transport::amqp::connection::TransportError;
use crate::transport::amqp::links::{
    LinkHandler, MethodsLinkHandler, SendResult, TelemetryLinkHandler, TwinLinkHandler,
};

/// Authentication state of one device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationState {
    Unknown,
    NotAuthenticated,
    Authenticating,
    Authenticated,
}

/// One device's logical session on the shared connection.
pub struct DeviceSession {
    config: DeviceConfig,
    auth_state: AuthenticationState,
    handlers: Vec<Box<dyn LinkHandler>>,
    session: Option<SessionHandle>,
}

impl DeviceSession {
    pub fn new(config: DeviceConfig) -> Self {
        let auth_state = match config.credentials {
            // X.509 sessions authenticate at the TLS layer and stay there
            Credentials::X509 => AuthenticationState::Authenticated,
            Credentials::Sas(_) => AuthenticationState::NotAuthenticated,
        };
        let handlers: Vec<Box<dyn LinkHandler>> =
            vec![Box::new(TelemetryLinkHandler::new(&config))];
        Self {
            config,
            auth_state,
            handlers,
            session: None,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.config.device_id
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn authentication_state(&self) -> AuthenticationState {
        self.auth_state
    }

    pub fn set_authentication_state(&mut self, state: AuthenticationState) {
        debug!(
            device_id = %self.config.device_id,
            ?state,
            "authentication state changed"
        );
        self.auth_state = state;
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth_state == AuthenticationState::Authenticated
    }

    /// Whether this session's token needs renewal before further sends.
    pub fn token_renewal_necessary(&self) -> bool {
        match &self.config.credentials {
            Credentials::Sas(provider) => provider.is_expired(),
            Credentials::X509 => false,
        }
    }

    /// Add the handler for an operation type, created lazily on first
    /// subscribe. Telemetry is always present.
    pub fn subscribe(&mut self, operation: OperationType) {
        if self.handler_index(operation).is_some() {
            return;
        }
        let handler: Box<dyn LinkHandler> = match operation {
            OperationType::Telemetry => return,
            OperationType::Twin => Box::new(TwinLinkHandler::new(&self.config)),
            OperationType::Methods => Box::new(MethodsLinkHandler::new(&self.config)),
        };
        self.handlers.push(handler);
    }

    pub fn subscribed_operations(&self) -> Vec<OperationType> {
        self.handlers.iter().map(|h| h.operation()).collect()
    }

    /// Links this session contributes once fully open: two per operation.
    pub fn expected_link_count(&self) -> usize {
        self.handlers.len() * 2
    }

    /// Open all handler link pairs. No-op until the session is
    /// authenticated; idempotent afterwards.
    pub fn open_links(&mut self, engine: &dyn EngineClient) -> Result<(), TransportError> {
        if !self.is_authenticated() {
            debug!(
                device_id = %self.config.device_id,
                state = ?self.auth_state,
                "deferring link open until authenticated"
            );
            return Ok(());
        }
        let session = match self.session {
            Some(session) => session,
            None => {
                let session = engine.begin_session()?;
                self.session = Some(session);
                session
            }
        };
        for handler in &mut self.handlers {
            handler.open(engine, session)?;
        }
        Ok(())
    }

    /// Detach every link pair. Idempotent.
    pub fn close_links(&mut self, engine: &dyn EngineClient) -> Result<(), TransportError> {
        for handler in &mut self.handlers {
            handler.close(engine)?;
        }
        self.session = None;
        Ok(())
    }

    pub fn owns_link(&self, link_name: &str) -> bool {
        self.handlers.iter().any(|h| h.owns_link(link_name))
    }

    /// Route a remote link open to its owning handler.
    pub fn on_link_remote_open(&mut self, link_name: &str, engine: &dyn EngineClient) -> bool {
        self.handlers
            .iter_mut()
            .any(|h| h.on_remote_open(link_name, engine))
    }

    /// Route a remote link close to its owning handler.
    pub fn on_link_remote_close(&mut self, link_name: &str) -> bool {
        self.handlers.iter_mut().any(|h| h.on_remote_close(link_name))
    }

    /// Whether every subscribed link pair is fully open.
    pub fn worker_links_open(&self) -> bool {
        self.handlers.iter().all(|h| h.is_open())
    }

    /// Send a message on the handler matching its operation type.
    ///
    /// Fails (sentinel tag) when the session is not authenticated or no
    /// handler carries the operation.
    pub fn send(&mut self, engine: &dyn EngineClient, message: &DomainMessage) -> SendResult {
        if !self.is_authenticated() {
            warn!(
                device_id = %self.config.device_id,
                "send rejected: session not authenticated"
            );
            return SendResult::failure();
        }
        match self.handler_index(message.operation) {
            Some(index) => self.handlers[index].send_and_get_tag(engine, message),
            None => {
                warn!(
                    device_id = %self.config.device_id,
                    operation = ?message.operation,
                    "send rejected: operation not subscribed"
                );
                SendResult::failure()
            }
        }
    }

    /// Decode and convert a delivery on one of this session's receiver
    /// links. Returns `None` when the payload cannot be decoded.
    pub fn handle_delivery(
        &mut self,
        engine: &dyn EngineClient,
        link_name: &str,
        payload: &[u8],
    ) -> Option<DomainMessage> {
        let index = self
            .handlers
            .iter()
            .position(|h| h.owns_link(link_name))?;
        let wire = match engine.decode_message(payload) {
            Ok(wire) => wire,
            Err(error) => {
                warn!(link_name, error = %error, "dropping undecodable delivery");
                return None;
            }
        };
        match self.handlers[index].convert_in(&wire) {
            Ok(message) => Some(message),
            Err(error) => {
                warn!(link_name, error = %error, "dropping unconvertible delivery");
                None
            }
        }
    }

    /// Name of the sender link carrying this operation, if subscribed.
    pub fn sender_link_name(&self, operation: OperationType) -> Option<String> {
        self.handler_index(operation)
            .map(|index| self.handlers[index].pair().sender_name.clone())
    }

    fn handler_index(&self, operation: OperationType) -> Option<usize> {
        self.handlers.iter().position(|h| h.operation() == operation)
    }
}
