//! Queues bridging application tasks and the reactor task
//!
//! Four queues carry all cross-task traffic: outbound packets waiting for
//! dispatch, in-flight packets keyed by delivery tag, received messages
//! waiting for the application, and terminal-status callback invocations.
//! Every callback fires exactly once: it travels with its packet until a
//! terminal status is reached, then moves to the callback queue.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::protocol::{DomainMessage, StatusCallback, TerminalStatus};

/// One outbound message plus its routing and completion callback.
pub struct OutboundPacket {
    pub message: DomainMessage,
    pub device_id: String,
    /// Taken when the packet reaches a terminal status. A requeued packet
    /// whose callback already fired carries `None`.
    pub callback: Option<StatusCallback>,
}

impl OutboundPacket {
    pub fn new(message: DomainMessage, device_id: String, callback: Option<StatusCallback>) -> Self {
        Self {
            message,
            device_id,
            callback,
        }
    }
}

/// A callback ready to fire with its terminal status.
pub struct CallbackInvocation {
    pub status: TerminalStatus,
    pub callback: StatusCallback,
}

/// One received message awaiting the application, with the engine delivery
/// id needed to settle it afterwards.
pub struct ReceivedEnvelope {
    pub device_id: String,
    pub delivery_id: u64,
    pub message: DomainMessage,
}

/// Shared transport queues. All methods take `&self`; each queue sits
/// behind its own lock so application tasks and the reactor never contend
/// on more than the queue they touch.
#[derive(Default)]
pub struct TransportQueues {
    outbound: Mutex<VecDeque<OutboundPacket>>,
    /// Keyed by (sender link name, delivery tag): tags are only unique
    /// within one link's outstanding deliveries.
    in_flight: Mutex<HashMap<(String, i64), OutboundPacket>>,
    received: Mutex<VecDeque<ReceivedEnvelope>>,
    callbacks: Mutex<VecDeque<CallbackInvocation>>,
}

// Callback invocation never happens under a lock, so a poisoned mutex
// only means another thread panicked between queue operations. The
// queues themselves stay consistent; continue with the inner value.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl TransportQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a packet for dispatch.
    pub fn add_message(&self, packet: OutboundPacket) {
        lock(&self.outbound).push_back(packet);
    }

    /// Put a packet back at the front so retry order is preserved.
    pub fn requeue_front(&self, packet: OutboundPacket) {
        lock(&self.outbound).push_front(packet);
    }

    pub fn pop_outbound(&self) -> Option<OutboundPacket> {
        lock(&self.outbound).pop_front()
    }

    /// Record a dispatched packet under its link and delivery tag until the
    /// remote settles it.
    pub fn mark_in_flight(&self, link_name: &str, delivery_tag: i64, packet: OutboundPacket) {
        let previous =
            lock(&self.in_flight).insert((link_name.to_string(), delivery_tag), packet);
        if let Some(previous) = previous {
            // A collision means the link's tag source wrapped with an old
            // delivery still unsettled. Settle the older packet rather
            // than lose its callback.
            warn!(link_name, delivery_tag, "delivery tag reused while in flight");
            self.complete(previous, TerminalStatus::Ok);
        }
    }

    /// Settle an in-flight packet. Accepted packets complete with `Ok`;
    /// rejected packets are requeued for another attempt.
    pub fn acknowledge(&self, link_name: &str, delivery_tag: i64, accepted: bool) {
        let packet = lock(&self.in_flight).remove(&(link_name.to_string(), delivery_tag));
        match packet {
            Some(packet) if accepted => self.complete(packet, TerminalStatus::Ok),
            Some(packet) => {
                debug!(link_name, delivery_tag, "delivery rejected, requeueing");
                self.requeue_front(packet);
            }
            None => debug!(link_name, delivery_tag, "disposition for unknown delivery tag"),
        }
    }

    /// The connection dropped: every in-flight packet goes back to the
    /// outbound queue for redelivery after reconnect. Draining the map
    /// makes a second call for the same drop a no-op.
    pub fn connection_lost(&self) {
        let mut in_flight = lock(&self.in_flight);
        if in_flight.is_empty() {
            return;
        }
        let mut packets: Vec<((String, i64), OutboundPacket)> = in_flight.drain().collect();
        drop(in_flight);
        // HashMap drain order is arbitrary; restore dispatch order by tag
        packets.sort_by(|(a, _), (b, _)| a.cmp(b));
        let count = packets.len();
        let mut outbound = lock(&self.outbound);
        for (_, packet) in packets.into_iter().rev() {
            outbound.push_front(packet);
        }
        debug!(count, "requeued in-flight packets after connection loss");
    }

    /// Queue an inbound message for the application to collect.
    pub fn enqueue_received(&self, envelope: ReceivedEnvelope) {
        lock(&self.received).push_back(envelope);
    }

    pub fn pop_received(&self) -> Option<ReceivedEnvelope> {
        lock(&self.received).pop_front()
    }

    /// Push the packet's callback (if still attached) onto the callback
    /// queue with the given terminal status.
    pub fn complete(&self, packet: OutboundPacket, status: TerminalStatus) {
        if let Some(callback) = packet.callback {
            lock(&self.callbacks).push_back(CallbackInvocation { status, callback });
        }
    }

    /// Fail everything still queued or in flight with `CancelledOnClose`.
    /// Used during shutdown; received messages are dropped.
    pub fn drain_close(&self) {
        self.connection_lost();
        let packets: Vec<OutboundPacket> = lock(&self.outbound).drain(..).collect();
        let count = packets.len();
        for packet in packets {
            self.complete(packet, TerminalStatus::CancelledOnClose);
        }
        lock(&self.received).clear();
        if count > 0 {
            debug!(count, "cancelled pending packets on close");
        }
    }

    /// Fire every queued callback on the caller's thread.
    pub fn invoke_callbacks(&self) {
        loop {
            // Drop the lock before invoking; callbacks may re-enter
            let invocation = lock(&self.callbacks).pop_front();
            let Some(invocation) = invocation else { break };
            (invocation.callback)(invocation.status);
        }
    }

    /// True when nothing is pending anywhere: no queued sends, nothing in
    /// flight, no unread messages, no unfired callbacks.
    pub fn is_empty(&self) -> bool {
        lock(&self.outbound).is_empty()
            && lock(&self.in_flight).is_empty()
            && lock(&self.received).is_empty()
            && lock(&self.callbacks).is_empty()
    }

    pub fn outbound_len(&self) -> usize {
        lock(&self.outbound).len()
    }

    pub fn in_flight_len(&self) -> usize {
        lock(&self.in_flight).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn packet(device_id: &str) -> OutboundPacket {
        OutboundPacket::new(
            DomainMessage::telemetry("payload"),
            device_id.to_string(),
            None,
        )
    }

    fn packet_with_callback(
        device_id: &str,
        statuses: &Arc<Mutex<Vec<TerminalStatus>>>,
    ) -> OutboundPacket {
        let statuses = Arc::clone(statuses);
        OutboundPacket::new(
            DomainMessage::telemetry("payload"),
            device_id.to_string(),
            Some(Box::new(move |status| {
                lock(&statuses).push(status);
            })),
        )
    }

    #[test]
    fn test_fifo_order_and_requeue_front() {
        let queues = TransportQueues::new();
        queues.add_message(packet("dev-1"));
        queues.add_message(packet("dev-2"));

        let first = queues.pop_outbound().expect("first");
        assert_eq!(first.device_id, "dev-1");
        queues.requeue_front(first);

        assert_eq!(queues.pop_outbound().expect("again").device_id, "dev-1");
        assert_eq!(queues.pop_outbound().expect("second").device_id, "dev-2");
        assert!(queues.pop_outbound().is_none());
    }

    #[test]
    fn test_acknowledge_accepted_fires_ok_callback() {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let queues = TransportQueues::new();

        queues.mark_in_flight("sender_link_telemetry-dev-1", 7, packet_with_callback("dev-1", &statuses));
        queues.acknowledge("sender_link_telemetry-dev-1", 7, true);
        queues.invoke_callbacks();

        assert_eq!(*lock(&statuses), vec![TerminalStatus::Ok]);
        assert!(queues.is_empty());
    }

    #[test]
    fn test_acknowledge_rejected_requeues_with_callback() {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let queues = TransportQueues::new();

        queues.mark_in_flight("sender_link_telemetry-dev-1", 3, packet_with_callback("dev-1", &statuses));
        queues.acknowledge("sender_link_telemetry-dev-1", 3, false);
        queues.invoke_callbacks();

        // Rejection is not terminal: no callback yet, packet back in line
        assert!(lock(&statuses).is_empty());
        let requeued = queues.pop_outbound().expect("requeued");
        assert!(requeued.callback.is_some());
    }

    #[test]
    fn test_acknowledge_unknown_tag_is_ignored() {
        let queues = TransportQueues::new();
        queues.acknowledge("sender_link_telemetry-dev-1", 42, true);
        assert!(queues.is_empty());
    }

    #[test]
    fn test_connection_lost_requeues_in_dispatch_order() {
        let queues = TransportQueues::new();
        queues.mark_in_flight("link", 2, packet("second"));
        queues.mark_in_flight("link", 1, packet("first"));
        queues.add_message(packet("queued"));

        queues.connection_lost();

        assert_eq!(queues.in_flight_len(), 0);
        assert_eq!(queues.pop_outbound().expect("a").device_id, "first");
        assert_eq!(queues.pop_outbound().expect("b").device_id, "second");
        assert_eq!(queues.pop_outbound().expect("c").device_id, "queued");
    }

    #[test]
    fn test_connection_lost_twice_requeues_once() {
        let queues = TransportQueues::new();
        queues.mark_in_flight("link", 1, packet("dev-1"));

        queues.connection_lost();
        queues.connection_lost();

        assert_eq!(queues.outbound_len(), 1);
    }

    #[test]
    fn test_drain_close_cancels_everything_once() {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let queues = TransportQueues::new();
        queues.add_message(packet_with_callback("dev-1", &statuses));
        queues.mark_in_flight("link", 5, packet_with_callback("dev-1", &statuses));
        queues.enqueue_received(ReceivedEnvelope {
            device_id: "dev-1".to_string(),
            delivery_id: 0,
            message: DomainMessage::telemetry("in"),
        });

        queues.drain_close();
        queues.invoke_callbacks();

        assert_eq!(
            *lock(&statuses),
            vec![
                TerminalStatus::CancelledOnClose,
                TerminalStatus::CancelledOnClose
            ]
        );
        assert!(queues.is_empty());
    }

    #[test]
    fn test_complete_without_callback_is_silent() {
        let queues = TransportQueues::new();
        queues.complete(packet("dev-1"), TerminalStatus::Expired);
        queues.invoke_callbacks();
        assert!(queues.is_empty());
    }

    #[test]
    fn test_received_queue_round_trip() {
        let queues = TransportQueues::new();
        for (device_id, delivery_id) in [("dev-1", 4u64), ("dev-2", 5u64)] {
            queues.enqueue_received(ReceivedEnvelope {
                device_id: device_id.to_string(),
                delivery_id,
                message: DomainMessage::telemetry("m"),
            });
        }

        let first = queues.pop_received().expect("first");
        assert_eq!(first.device_id, "dev-1");
        assert_eq!(first.delivery_id, 4);
        let second = queues.pop_received().expect("second");
        assert_eq!(second.device_id, "dev-2");
        assert!(queues.pop_received().is_none());
    }

    #[test]
    fn test_callbacks_may_reenter_queues() {
        let queues = Arc::new(TransportQueues::new());
        let fired = Arc::new(AtomicUsize::new(0));

        let inner_queues = Arc::clone(&queues);
        let inner_fired = Arc::clone(&fired);
        queues.mark_in_flight(
            "link",
            1,
            OutboundPacket::new(
                DomainMessage::telemetry("outer"),
                "dev-1".to_string(),
                Some(Box::new(move |_| {
                    inner_fired.fetch_add(1, Ordering::SeqCst);
                    inner_queues.add_message(OutboundPacket::new(
                        DomainMessage::telemetry("from-callback"),
                        "dev-1".to_string(),
                        None,
                    ));
                })),
            ),
        );

        queues.acknowledge("link", 1, true);
        queues.invoke_callbacks();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(queues.outbound_len(), 1);
    }
}
