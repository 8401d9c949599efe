//! AMQP transport client
//!
//! [`AmqpTransport`] is the application-facing handle. All engine traffic
//! runs on one supervisor task that owns the session manager and the event
//! stream; application tasks reach it through a command channel and the
//! shared queues. The supervisor also runs the reconnection loop: on a
//! retryable failure it tears the connection down, requeues in-flight
//! messages, backs off, and connects again. Fatal conditions move the
//! transport to [`ConnectionState::PermanentlyDisconnected`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::{Credentials, DeviceConfig, HubConfig, TransportSection};
use crate::engine::{DeliveryOutcome, EngineClient, EngineConnector, EngineEvent, EngineEvents};
use crate::error::{sanitize_error_message, HublinkError};
use crate::protocol::{
    ConnectionStateCallback, ConnectionStatusEvent, DomainMessage, IncomingDisposition,
    MessageReceivedCallback, OperationType, StatusCallback, TerminalStatus,
};
use crate::transport::amqp::auth::{renewal_period, RENEWAL_RETRY_INTERVAL};
use crate::transport::amqp::connection::{
    configure_engine_options, interruptible_sleep, is_fatal_condition, should_attempt_reconnection,
    ConnectionState, ReconnectConfig, ReconnectionDecision, TransportError,
};
use crate::transport::amqp::links::SENTINEL_DELIVERY_TAG;
use crate::transport::amqp::queues::{OutboundPacket, ReceivedEnvelope, TransportQueues};
use crate::transport::amqp::session_manager::{AuthResult, InboundRouting, SessionManager};

/// Grace period for the reactor to close links before the task is aborted.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Interval between sweeps of pending put-token requests.
const AUTH_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Renewal period fallback when the token source cannot report a lifetime.
const FALLBACK_TOKEN_TTL: Duration = Duration::from_secs(3600);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Commands sent from application tasks to the supervisor task.
enum ReactorCommand {
    /// Dispatch one packet; replies with the delivery tag, or the sentinel
    /// when the send failed and the packet was requeued.
    Send {
        packet: OutboundPacket,
        reply: oneshot::Sender<i64>,
    },
    /// Settle an inbound delivery with the application's outcome.
    Disposition {
        delivery_id: u64,
        outcome: DeliveryOutcome,
        reply: oneshot::Sender<bool>,
    },
    /// Proactively send a fresh put-token for one device.
    RenewAuthentication {
        device_id: String,
        reply: oneshot::Sender<bool>,
    },
    /// Attach links for a newly subscribed operation.
    Subscribe {
        device_id: String,
        operation: OperationType,
    },
    /// Close links and the connection, then stop.
    Close { reply: oneshot::Sender<()> },
}

/// Why one connection's event loop exited.
enum ConnectionExit {
    Shutdown,
    Fatal(String),
    Retry(String),
}

struct SupervisorContext {
    connector: Arc<dyn EngineConnector>,
    transport: TransportSection,
    reconnect: ReconnectConfig,
    devices: Vec<DeviceConfig>,
    subscriptions: Vec<(String, OperationType)>,
    queues: Arc<TransportQueues>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_callbacks: Arc<Mutex<Vec<ConnectionStateCallback>>>,
    shutdown_rx: watch::Receiver<bool>,
}

/// AMQP transport for one hub connection, multiplexing one or more device
/// sessions.
pub struct AmqpTransport {
    connector: Arc<dyn EngineConnector>,
    transport: TransportSection,
    reconnect: ReconnectConfig,
    devices: Mutex<Vec<DeviceConfig>>,
    subscriptions: Mutex<Vec<(String, OperationType)>>,
    queues: Arc<TransportQueues>,
    message_callbacks: Mutex<HashMap<(String, OperationType), MessageReceivedCallback>>,
    state_callbacks: Arc<Mutex<Vec<ConnectionStateCallback>>>,
    cmd_tx: mpsc::UnboundedSender<ReactorCommand>,
    cmd_rx: Mutex<Option<mpsc::UnboundedReceiver<ReactorCommand>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    renewal_tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl AmqpTransport {
    /// Build a transport for the configured device using the given engine
    /// connector. Nothing connects until [`open`](Self::open).
    pub fn new(
        config: &HubConfig,
        connector: Arc<dyn EngineConnector>,
    ) -> Result<Self, HublinkError> {
        config.validate()?;
        let device = DeviceConfig::from_section(&config.device)?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        Ok(Self {
            connector,
            transport: config.transport.clone(),
            reconnect: ReconnectConfig::from(&config.reconnect),
            devices: Mutex::new(vec![device]),
            subscriptions: Mutex::new(Vec::new()),
            queues: Arc::new(TransportQueues::new()),
            message_callbacks: Mutex::new(HashMap::new()),
            state_callbacks: Arc::new(Mutex::new(Vec::new())),
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
            shutdown_tx,
            shutdown_rx,
            state_tx: Arc::new(state_tx),
            state_rx,
            supervisor: Mutex::new(None),
            renewal_tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Register an additional device session multiplexed on this
    /// connection. Must be called before [`open`](Self::open).
    pub fn add_device(&self, device: DeviceConfig) -> Result<(), TransportError> {
        let mut devices = lock(&self.devices);
        if devices.iter().any(|d| d.device_id == device.device_id) {
            return Err(TransportError::DuplicateDevice {
                device_id: device.device_id,
            });
        }
        devices.push(device);
        Ok(())
    }

    /// Subscribe a device to twin or methods traffic. Idempotent; when the
    /// transport is already connected the links attach immediately.
    pub fn subscribe(&self, device_id: &str, operation: OperationType) {
        let key = (device_id.to_string(), operation);
        let mut subscriptions = lock(&self.subscriptions);
        if !subscriptions.contains(&key) {
            subscriptions.push(key);
        }
        drop(subscriptions);
        let _ = self.cmd_tx.send(ReactorCommand::Subscribe {
            device_id: device_id.to_string(),
            operation,
        });
    }

    /// Register the callback invoked for messages received on the device's
    /// link pair for the operation. Subscribes the operation as a side
    /// effect.
    pub fn register_message_callback(
        &self,
        device_id: &str,
        operation: OperationType,
        callback: MessageReceivedCallback,
    ) {
        self.subscribe(device_id, operation);
        lock(&self.message_callbacks).insert((device_id.to_string(), operation), callback);
    }

    /// Register a callback for connection-level state changes.
    pub fn register_connection_state_callback(&self, callback: ConnectionStateCallback) {
        lock(&self.state_callbacks).push(callback);
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// True when no sends, receipts, or callbacks are pending anywhere.
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Start the supervisor task and wait until the transport is connected,
    /// authenticated, and every expected link is open. Idempotent while
    /// running; fails once the transport has been closed.
    pub async fn open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if lock(&self.supervisor).is_some() {
            return Ok(());
        }
        let cmd_rx = match lock(&self.cmd_rx).take() {
            Some(cmd_rx) => cmd_rx,
            None => return Err(TransportError::Closed),
        };

        let context = SupervisorContext {
            connector: self.connector.clone(),
            transport: self.transport.clone(),
            reconnect: self.reconnect.clone(),
            devices: lock(&self.devices).clone(),
            subscriptions: lock(&self.subscriptions).clone(),
            queues: self.queues.clone(),
            state_tx: self.state_tx.clone(),
            state_callbacks: self.state_callbacks.clone(),
            shutdown_rx: self.shutdown_rx.clone(),
        };
        *lock(&self.supervisor) = Some(tokio::spawn(run_supervisor(context, cmd_rx)));

        let open_timeout = self.transport.open_timeout();
        let mut state_rx = self.state_rx.clone();
        let settled = tokio::time::timeout(
            open_timeout,
            state_rx.wait_for(|state| {
                matches!(
                    state,
                    ConnectionState::Connected | ConnectionState::PermanentlyDisconnected(_)
                )
            }),
        )
        .await
        // Drop the watch guard before awaiting anything else
        .map(|outcome| outcome.map(|state| state.clone()));

        match settled {
            Err(_) => {
                self.close().await;
                Err(TransportError::WaitTimeout {
                    operation: "open",
                    waited_ms: open_timeout.as_millis() as u64,
                })
            }
            Ok(Err(_)) => Err(TransportError::Closed),
            Ok(Ok(state)) => {
                if state == ConnectionState::Connected {
                    self.spawn_renewal_tasks();
                    Ok(())
                } else {
                    Err(TransportError::NotConnected { state })
                }
            }
        }
    }

    /// Close the transport: links detach, the connection closes, and every
    /// still-pending message fails with `CancelledOnClose`. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            self.queues.drain_close();
            self.queues.invoke_callbacks();
            return;
        }
        let _ = self.shutdown_tx.send(true);

        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(ReactorCommand::Close { reply: reply_tx })
            .is_ok()
        {
            let _ = tokio::time::timeout(CLOSE_GRACE, reply_rx).await;
        }

        let supervisor = lock(&self.supervisor).take();
        if let Some(mut handle) = supervisor {
            if tokio::time::timeout(CLOSE_GRACE, &mut handle).await.is_err() {
                warn!("supervisor did not stop within the close grace period");
                handle.abort();
            }
        }
        for task in lock(&self.renewal_tasks).drain(..) {
            task.abort();
        }

        let _ = self
            .state_tx
            .send(ConnectionState::Disconnected("closed by application".to_string()));
        self.queues.drain_close();
        self.queues.invoke_callbacks();
        info!("transport closed");
    }

    /// Queue a message for dispatch by [`send_messages`](Self::send_messages).
    /// The callback fires exactly once with the message's terminal status.
    pub fn add_message(
        &self,
        message: DomainMessage,
        device_id: &str,
        callback: Option<StatusCallback>,
    ) {
        self.queues
            .add_message(OutboundPacket::new(message, device_id.to_string(), callback));
    }

    /// Drain the outbound queue through the reactor.
    ///
    /// Expired messages fail with `Expired` without touching the wire. When
    /// a device's token needs renewal its packet fails with `Unauthorized`,
    /// the message is requeued without the callback, and draining stops
    /// until renewal catches up.
    pub async fn send_messages(&self) -> Result<(), TransportError> {
        while let Some(packet) = self.queues.pop_outbound() {
            if packet.message.is_expired(Utc::now()) {
                debug!(device_id = %packet.device_id, "dropping expired message");
                self.queues.complete(packet, TerminalStatus::Expired);
                continue;
            }
            if self.token_expired(&packet.device_id) {
                warn!(device_id = %packet.device_id, "token expired, deferring sends");
                self.notify_state(ConnectionStatusEvent::TokenExpired);
                let message = packet.message.clone();
                let device_id = packet.device_id.clone();
                self.queues.complete(packet, TerminalStatus::Unauthorized);
                self.queues
                    .requeue_front(OutboundPacket::new(message, device_id, None));
                break;
            }

            let (reply_tx, reply_rx) = oneshot::channel();
            let command = ReactorCommand::Send {
                packet,
                reply: reply_tx,
            };
            if let Err(mpsc::error::SendError(command)) = self.cmd_tx.send(command) {
                if let ReactorCommand::Send { packet, .. } = command {
                    self.queues.requeue_front(packet);
                }
                return Err(TransportError::Closed);
            }
            let tag = reply_rx.await.map_err(|_| TransportError::Closed)?;
            if tag == SENTINEL_DELIVERY_TAG {
                // The reactor requeued the packet; stop draining until the
                // connection recovers.
                break;
            }
        }
        Ok(())
    }

    /// Hand the next received message to its registered callback and settle
    /// it with the callback's disposition. Returns whether a message was
    /// handled.
    pub async fn handle_message(&self) -> Result<bool, TransportError> {
        let Some(envelope) = self.queues.pop_received() else {
            return Ok(false);
        };
        let disposition = {
            let callbacks = lock(&self.message_callbacks);
            match callbacks.get(&(envelope.device_id.clone(), envelope.message.operation)) {
                Some(callback) => callback(&envelope.message),
                None => {
                    warn!(
                        device_id = %envelope.device_id,
                        operation = ?envelope.message.operation,
                        "received message without a registered callback"
                    );
                    IncomingDisposition::Abandon
                }
            }
        };
        let outcome = match disposition {
            IncomingDisposition::Complete => DeliveryOutcome::Accepted,
            IncomingDisposition::Abandon => DeliveryOutcome::Released,
            IncomingDisposition::Reject => DeliveryOutcome::Rejected,
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self
            .cmd_tx
            .send(ReactorCommand::Disposition {
                delivery_id: envelope.delivery_id,
                outcome,
                reply: reply_tx,
            })
            .is_ok();
        if !sent || !reply_rx.await.unwrap_or(false) {
            // The delivery stays unsettled; the service redelivers it.
            warn!(
                delivery_id = envelope.delivery_id,
                "failed to settle delivery"
            );
        }
        Ok(true)
    }

    /// Fire every pending terminal-status callback on the caller's task.
    pub fn invoke_callbacks(&self) {
        self.queues.invoke_callbacks();
    }

    fn token_expired(&self, device_id: &str) -> bool {
        lock(&self.devices)
            .iter()
            .find(|d| d.device_id == device_id)
            .map(|d| match &d.credentials {
                Credentials::Sas(provider) => provider.is_expired(),
                Credentials::X509 => false,
            })
            .unwrap_or(false)
    }

    fn notify_state(&self, event: ConnectionStatusEvent) {
        notify_state(&self.state_callbacks, event);
    }

    /// One renewal task per SAS device, sending a fresh put-token at 75% of
    /// the token lifetime and retrying sooner after a failed send.
    fn spawn_renewal_tasks(&self) {
        let mut tasks = lock(&self.renewal_tasks);
        if !tasks.is_empty() {
            return;
        }
        for device in lock(&self.devices).iter() {
            let Credentials::Sas(provider) = &device.credentials else {
                continue;
            };
            let ttl = provider
                .current_token()
                .map(|token| token.ttl)
                .unwrap_or(FALLBACK_TOKEN_TTL);
            tasks.push(spawn_renewal_task(
                device.device_id.clone(),
                ttl,
                self.cmd_tx.clone(),
                self.shutdown_rx.clone(),
            ));
        }
    }
}

impl Drop for AmqpTransport {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = lock(&self.supervisor).take() {
            handle.abort();
        }
        for task in lock(&self.renewal_tasks).drain(..) {
            task.abort();
        }
    }
}

fn notify_state(callbacks: &Mutex<Vec<ConnectionStateCallback>>, event: ConnectionStatusEvent) {
    for callback in lock(callbacks).iter() {
        callback(event.clone());
    }
}

fn spawn_renewal_task(
    device_id: String,
    token_ttl: Duration,
    cmd_tx: mpsc::UnboundedSender<ReactorCommand>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut delay = renewal_period(token_ttl);
        loop {
            tokio::select! {
                _ = shutdown_rx.wait_for(|requested| *requested) => break,
                _ = tokio::time::sleep(delay) => {}
            }
            let (reply_tx, reply_rx) = oneshot::channel();
            let command = ReactorCommand::RenewAuthentication {
                device_id: device_id.clone(),
                reply: reply_tx,
            };
            if cmd_tx.send(command).is_err() {
                break;
            }
            let renewed = reply_rx.await.unwrap_or(false);
            delay = if renewed {
                debug!(device_id = %device_id, "proactive token renewal sent");
                renewal_period(token_ttl)
            } else {
                warn!(device_id = %device_id, "token renewal failed, retrying soon");
                RENEWAL_RETRY_INTERVAL
            };
        }
    })
}

fn build_manager(context: &SupervisorContext) -> SessionManager {
    let mut devices = context.devices.iter();
    let mut manager = match devices.next() {
        Some(first) => SessionManager::new(first.clone()),
        // Construction always seeds one device; nothing to manage otherwise
        None => unreachable!("transport requires a primary device"),
    };
    for device in devices {
        if let Err(error) = manager.add_device_session(device.clone()) {
            warn!(error = %error, "skipping device session");
        }
    }
    for (device_id, operation) in &context.subscriptions {
        if let Some(device) = manager.device_mut(device_id) {
            device.subscribe(*operation);
        }
    }
    manager
}

fn classify(error: TransportError) -> ConnectionExit {
    let message = sanitize_error_message(&error.to_string());
    if error.is_retryable() {
        ConnectionExit::Retry(message)
    } else {
        ConnectionExit::Fatal(message)
    }
}

async fn run_supervisor(
    mut context: SupervisorContext,
    mut cmd_rx: mpsc::UnboundedReceiver<ReactorCommand>,
) {
    let mut attempt: u32 = 0;
    loop {
        if *context.shutdown_rx.borrow() {
            break;
        }
        let manager = build_manager(&context);
        let options = configure_engine_options(&context.devices[0], &context.transport);

        let span = crate::connection_span!(container_id = %options.container_id);
        let reason = match context.connector.connect(&options).await {
            Ok((engine, events)) => {
                match run_connection(&mut context, manager, engine, events, &mut cmd_rx)
                    .instrument(span)
                    .await
                {
                    ConnectionExit::Shutdown => break,
                    ConnectionExit::Fatal(reason) => {
                        error!(reason = %reason, "fatal transport error");
                        let _ = context
                            .state_tx
                            .send(ConnectionState::PermanentlyDisconnected(reason.clone()));
                        notify_state(
                            &context.state_callbacks,
                            ConnectionStatusEvent::PermanentlyDisconnected(reason),
                        );
                        break;
                    }
                    ConnectionExit::Retry(reason) => reason,
                }
            }
            Err(error) => sanitize_error_message(&error.to_string()),
        };

        let was_connected = *context.state_tx.borrow() == ConnectionState::Connected;
        context.queues.connection_lost();
        if was_connected {
            notify_state(&context.state_callbacks, ConnectionStatusEvent::Lost);
        }
        warn!(reason = %reason, "connection lost");

        attempt = ReconnectConfig::next_attempt(attempt);
        let shutdown_requested = *context.shutdown_rx.borrow();
        match should_attempt_reconnection(&context.reconnect, attempt, shutdown_requested) {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                let _ = context.state_tx.send(ConnectionState::Reconnecting(attempt));
                info!(attempt, delay_ms, "reconnecting after backoff");
                let delay = Duration::from_millis(delay_ms);
                if !interruptible_sleep(delay, &mut context.shutdown_rx).await {
                    break;
                }
            }
            ReconnectionDecision::AbortShutdownRequested => break,
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let reason = "maximum reconnection attempts exceeded".to_string();
                error!("{reason}");
                let _ = context
                    .state_tx
                    .send(ConnectionState::PermanentlyDisconnected(reason.clone()));
                notify_state(
                    &context.state_callbacks,
                    ConnectionStatusEvent::PermanentlyDisconnected(reason),
                );
                break;
            }
        }
    }
    debug!("supervisor stopped");
}

async fn run_connection(
    context: &mut SupervisorContext,
    mut manager: SessionManager,
    engine: Arc<dyn EngineClient>,
    mut events: Box<dyn EngineEvents>,
    cmd_rx: &mut mpsc::UnboundedReceiver<ReactorCommand>,
) -> ConnectionExit {
    let mut established = false;
    let mut auth_started = false;
    let mut sweep = tokio::time::interval(AUTH_SWEEP_INTERVAL);
    let auth_deadline =
        tokio::time::Instant::now() + context.transport.authentication_timeout();
    let mut shutdown_rx = context.shutdown_rx.clone();

    loop {
        let exit: Option<ConnectionExit> = tokio::select! {
            _ = shutdown_rx.wait_for(|requested| *requested) => {
                Some(ConnectionExit::Shutdown)
            }

            _ = tokio::time::sleep_until(auth_deadline), if !established => {
                Some(ConnectionExit::Retry(
                    "links did not open before the authentication timeout".to_string(),
                ))
            }

            _ = sweep.tick() => {
                let mut exit = None;
                for outcome in manager.sweep_expired_auth(Instant::now()) {
                    if let Some(failure) =
                        apply_auth_outcome(&mut manager, engine.as_ref(), outcome)
                    {
                        exit = Some(failure);
                        break;
                    }
                }
                exit
            }

            command = cmd_rx.recv() => match command {
                None => Some(ConnectionExit::Shutdown),
                Some(ReactorCommand::Send { packet, reply }) => {
                    let tag = manager.send(engine.as_ref(), &packet.message, &packet.device_id);
                    // The packet must be tracked before the caller learns
                    // the tag, or an early disposition could miss it
                    if tag == SENTINEL_DELIVERY_TAG {
                        context.queues.requeue_front(packet);
                    } else {
                        let link = manager
                            .sender_link_name(&packet.device_id, packet.message.operation)
                            .unwrap_or_default();
                        context.queues.mark_in_flight(&link, tag, packet);
                    }
                    let _ = reply.send(tag);
                    None
                }
                Some(ReactorCommand::Disposition { delivery_id, outcome, reply }) => {
                    let settled = engine.disposition(delivery_id, outcome).is_ok();
                    let _ = reply.send(settled);
                    None
                }
                Some(ReactorCommand::RenewAuthentication { device_id, reply }) => {
                    let renewed = match manager.send_put_token_for(engine.as_ref(), &device_id) {
                        Ok(()) => true,
                        Err(error) => {
                            warn!(device_id = %device_id, error = %error, "renewal send failed");
                            false
                        }
                    };
                    let _ = reply.send(renewed);
                    None
                }
                Some(ReactorCommand::Subscribe { device_id, operation }) => {
                    match manager.device_mut(&device_id) {
                        Some(device) => {
                            device.subscribe(operation);
                            device.open_links(engine.as_ref()).err().map(classify)
                        }
                        None => {
                            warn!(device_id = %device_id, "subscribe for unknown device");
                            None
                        }
                    }
                }
                Some(ReactorCommand::Close { reply }) => {
                    if let Err(error) = manager.close(engine.as_ref()) {
                        debug!(error = %error, "error while closing links");
                    }
                    if let Err(error) = engine.close() {
                        debug!(error = %error, "error while closing connection");
                    }
                    let _ = reply.send(());
                    Some(ConnectionExit::Shutdown)
                }
            },

            event = events.next_event() => match event {
                None => Some(ConnectionExit::Retry("engine event stream ended".to_string())),
                Some(EngineEvent::ConnectionInit) => {
                    match manager.on_connection_init(engine.as_ref()) {
                        Err(error) => Some(classify(error)),
                        // X.509-only connections have no CBS pair to wait on
                        Ok(()) if !auth_started && manager.is_authentication_opened() => {
                            auth_started = true;
                            manager.authenticate_all(engine.as_ref()).err().map(classify)
                        }
                        Ok(()) => None,
                    }
                }
                Some(EngineEvent::ConnectionBound) => None,
                Some(EngineEvent::LinkInit { name }) => {
                    debug!(link_name = %name, "link initiated");
                    None
                }
                Some(EngineEvent::LinkRemoteOpen { name }) => {
                    manager.on_link_remote_open(engine.as_ref(), &name);
                    if !auth_started && manager.is_authentication_opened() {
                        auth_started = true;
                        manager.authenticate_all(engine.as_ref()).err().map(classify)
                    } else {
                        None
                    }
                }
                Some(EngineEvent::LinkRemoteClose { name, condition }) => {
                    manager.on_link_remote_close(&name);
                    match condition {
                        Some(condition) if is_fatal_condition(&condition) => {
                            Some(ConnectionExit::Fatal(format!(
                                "link {name} closed: {condition}"
                            )))
                        }
                        condition => Some(ConnectionExit::Retry(format!(
                            "link {name} closed remotely: {}",
                            condition.unwrap_or_default()
                        ))),
                    }
                }
                Some(EngineEvent::LinkFlow { name, credit }) => {
                    debug!(link_name = %name, credit, "link credit");
                    None
                }
                Some(EngineEvent::Delivery { link_name, delivery_id, payload }) => {
                    match manager.handle_delivery(engine.as_ref(), &link_name, &payload) {
                        InboundRouting::CbsResponse(outcome) => {
                            if let Err(error) =
                                engine.disposition(delivery_id, DeliveryOutcome::Accepted)
                            {
                                debug!(error = %error, "failed to settle CBS response");
                            }
                            apply_auth_outcome(&mut manager, engine.as_ref(), outcome)
                        }
                        InboundRouting::DeviceMessage { device_id, message } => {
                            context.queues.enqueue_received(ReceivedEnvelope {
                                device_id,
                                delivery_id,
                                message,
                            });
                            None
                        }
                        InboundRouting::Unmatched => {
                            if let Err(error) =
                                engine.disposition(delivery_id, DeliveryOutcome::Released)
                            {
                                debug!(error = %error, "failed to release unmatched delivery");
                            }
                            None
                        }
                    }
                }
                Some(EngineEvent::Disposition { link_name, delivery_tag, accepted }) => {
                    let tag = std::str::from_utf8(&delivery_tag)
                        .ok()
                        .and_then(|s| s.parse::<i64>().ok());
                    match tag {
                        Some(tag) => context.queues.acknowledge(&link_name, tag, accepted),
                        None => warn!(link_name = %link_name, "disposition with unparsable delivery tag"),
                    }
                    None
                }
                Some(EngineEvent::ConnectionRemoteClose { condition }) => {
                    match condition {
                        Some(condition) if is_fatal_condition(&condition) => {
                            Some(ConnectionExit::Fatal(format!(
                                "connection closed: {condition}"
                            )))
                        }
                        condition => Some(ConnectionExit::Retry(format!(
                            "connection closed remotely: {}",
                            condition.unwrap_or_default()
                        ))),
                    }
                }
                Some(EngineEvent::TransportError { message }) => {
                    Some(ConnectionExit::Retry(sanitize_error_message(&message)))
                }
            },
        };

        if let Some(exit) = exit {
            return exit;
        }
        if !established && manager.all_links_open() {
            established = true;
            let _ = context.state_tx.send(ConnectionState::Connected);
            notify_state(&context.state_callbacks, ConnectionStatusEvent::Established);
            info!("transport connected");
        }
    }
}

/// Apply a CBS outcome, escalating non-retryable authentication failures.
fn apply_auth_outcome(
    manager: &mut SessionManager,
    engine: &dyn EngineClient,
    outcome: crate::transport::amqp::auth::AuthOutcome,
) -> Option<ConnectionExit> {
    match manager.handle_auth_outcome(engine, outcome) {
        Ok(AuthResult { error: None, .. }) => None,
        Ok(AuthResult {
            device_id,
            error: Some(error),
        }) => {
            let message = sanitize_error_message(&format!(
                "authentication failed for {device_id}: {error}"
            ));
            if error.is_retryable() {
                Some(ConnectionExit::Retry(message))
            } else {
                Some(ConnectionExit::Fatal(message))
            }
        }
        Err(error) => Some(classify(error)),
    }
}
