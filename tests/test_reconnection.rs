//! Reconnection integration tests
//!
//! Backoff and recovery behavior against the loopback engine: retryable
//! failures reconnect, fatal conditions and exhausted attempts stop the
//! transport permanently.


use std::sync::{Arc, Mutex};

use hublink::engine::EngineEvent;
use hublink::protocol::DomainMessage;
use hublink::testing::LoopbackSettings;
use hublink::transport::amqp::ConnectionState;
use hublink::{ConnectionStatusEvent, TerminalStatus};
use test_helpers::{loopback_transport, loopback_transport_with, test_config, wait_until};

#[tokio::test]
async fn test_remote_close_triggers_reconnect() {
    let (transport, connector) = loopback_transport("reconnect-dev");

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    transport.register_connection_state_callback(Box::new(move |event| {
        sink.lock().unwrap().push(event);
    }));
    transport.open().await.expect("open");

    let handle = connector.handle().expect("handle");
    handle.inject_event(EngineEvent::ConnectionRemoteClose {
        condition: Some("amqp:connection:forced".to_string()),
    });

    assert!(
        wait_until(|| {
            connector.connect_count() >= 2
                && transport.connection_state() == ConnectionState::Connected
        })
        .await
    );

    let seen = events.lock().unwrap().clone();
    assert!(seen.contains(&ConnectionStatusEvent::Lost));
    assert_eq!(
        seen.iter()
            .filter(|e| **e == ConnectionStatusEvent::Established)
            .count(),
        2
    );

    transport.close().await;
}

#[tokio::test]
async fn test_open_retries_failed_connection_attempts() {
    let (transport, connector) = loopback_transport("reconnect-retry");
    connector.fail_next_connects(2);

    transport.open().await.expect("open succeeds after retries");

    assert_eq!(connector.connect_count(), 3);
    assert_eq!(transport.connection_state(), ConnectionState::Connected);
    transport.close().await;
}

#[tokio::test]
async fn test_exhausted_attempts_disconnect_permanently() {
    let mut config = test_config("reconnect-exhausted");
    config.reconnect.max_attempts = Some(2);
    let (transport, connector) =
        loopback_transport_with(config, LoopbackSettings::default());
    connector.fail_next_connects(10);

    let result = transport.open().await;

    assert!(result.is_err());
    assert!(matches!(
        transport.connection_state(),
        ConnectionState::PermanentlyDisconnected(_)
    ));
}

#[tokio::test]
async fn test_fatal_link_close_stops_reconnection() {
    let (transport, connector) = loopback_transport("reconnect-fatal");
    transport.open().await.expect("open");

    let handle = connector.handle().expect("handle");
    let sender = handle
        .link_named("sender_link_telemetry-")
        .expect("telemetry sender");
    handle.inject_event(EngineEvent::LinkRemoteClose {
        name: sender,
        condition: Some("amqp:not-allowed".to_string()),
    });

    assert!(
        wait_until(|| {
            matches!(
                transport.connection_state(),
                ConnectionState::PermanentlyDisconnected(_)
            )
        })
        .await
    );
    assert_eq!(connector.connect_count(), 1);
    transport.close().await;
}

#[tokio::test]
async fn test_queued_message_survives_reconnect() {
    let (transport, connector) = loopback_transport("reconnect-queue");
    transport.open().await.expect("open");

    let handle = connector.handle().expect("handle");
    // Leave the transfer unsettled so the drop catches it in flight
    handle.set_auto_accept_sends(false);

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = statuses.clone();
    transport.add_message(
        DomainMessage::telemetry("survives the drop"),
        "reconnect-queue",
        Some(Box::new(move |status| sink.lock().unwrap().push(status))),
    );
    transport.send_messages().await.expect("send");

    handle.inject_event(EngineEvent::TransportError {
        message: "simulated socket reset".to_string(),
    });
    assert!(
        wait_until(|| {
            connector.connect_count() >= 2
                && transport.connection_state() == ConnectionState::Connected
        })
        .await
    );

    // The fresh connection auto-accepts; the callback still fires once
    transport.send_messages().await.expect("resend");
    assert!(
        wait_until(|| {
            transport.invoke_callbacks();
            !statuses.lock().unwrap().is_empty()
        })
        .await
    );
    assert_eq!(*statuses.lock().unwrap(), vec![TerminalStatus::Ok]);

    transport.close().await;
}
