use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::signal::Signal;
use log::{debug, warn};

use crate::credentials::Credential;

// Connectivity lifecycle of the uplink
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectivityState {
    Idle = 0,           // No WiFi credentials or WiFi lost with none known
    WifiBringingUp = 1, // WiFi station started, waiting for an IP
    WifiUp = 2,         // Station has an IP, no broker session
    MqttBringingUp = 3, // Broker session being established
    MqttUp = 4,         // Broker session live, relay may forward
}

impl ConnectivityState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectivityState::WifiBringingUp,
            2 => ConnectivityState::WifiUp,
            3 => ConnectivityState::MqttBringingUp,
            4 => ConnectivityState::MqttUp,
            _ => ConnectivityState::Idle,
        }
    }
}

/// Current connectivity state, readable from any task or callback context.
///
/// Only the orchestrator writes it; the relay reads it before every send.
#[derive(Clone, Debug, Default)]
pub struct ConnectivityCell(Arc<AtomicU8>);

impl ConnectivityCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> ConnectivityState {
        ConnectivityState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ConnectivityState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// True only while the broker session is live
    pub fn is_uplink_ready(&self) -> bool {
        self.get() == ConnectivityState::MqttUp
    }
}

// Events feeding the connectivity orchestrator
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GatewayEvent {
    ProvisioningComplete { net_idx: u16, addr: u16 }, // Node joined a mesh network
    CredentialsReceived(Credential),                  // Validated and persisted credential set
    WifiConnected,                                    // Station got an IP
    WifiDisconnected,                                 // Station lost its association
    MqttConnected,                                    // Broker session established
    MqttDisconnected,                                 // Broker session lost
}

/// Depth past which a backed-up queue is reported
pub const EVENT_QUEUE_WARN_DEPTH: usize = 16;

// Unbounded FIFO with a wake-up signal for its single consumer
// Producers never block or drop, so it is safe to feed from driver callback context
pub struct PendingQueue<T> {
    items: BlockingMutex<CriticalSectionRawMutex, RefCell<VecDeque<T>>>,
    ready: Signal<CriticalSectionRawMutex, ()>,
}

impl<T> PendingQueue<T> {
    pub const fn new() -> Self {
        Self {
            items: BlockingMutex::new(RefCell::new(VecDeque::new())),
            ready: Signal::new(),
        }
    }

    /// Append and wake the consumer. Returns the queue depth after the push.
    pub fn push(&self, item: T) -> usize {
        let depth = self.items.lock(|items| {
            let mut items = items.borrow_mut();
            items.push_back(item);
            items.len()
        });
        self.ready.signal(());
        depth
    }

    /// Append unless an item matching `queued` is already waiting
    pub fn push_unless(&self, item: T, queued: impl Fn(&T) -> bool) -> bool {
        let pushed = self.items.lock(|items| {
            let mut items = items.borrow_mut();
            if items.iter().any(|pending| queued(pending)) {
                return false;
            }
            items.push_back(item);
            true
        });
        if pushed {
            self.ready.signal(());
        }
        pushed
    }

    pub fn try_pop(&self) -> Option<T> {
        self.items.lock(|items| items.borrow_mut().pop_front())
    }

    pub async fn pop(&self) -> T {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            self.ready.wait().await;
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock(|items| items.borrow().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for PendingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

// Event queue shared by the mesh callbacks, the link drivers and the orchestrator
#[derive(Clone, Default)]
pub struct EventBus {
    queue: Arc<PendingQueue<GatewayEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue without blocking. Events are never dropped.
    pub fn publish(&self, event: GatewayEvent) {
        debug!("📨 Gateway event: {:?}", event);
        if self.queue.push(event) == EVENT_QUEUE_WARN_DEPTH {
            warn!(
                "⚠️ Event queue backed up ({} pending)",
                EVENT_QUEUE_WARN_DEPTH
            );
        }
    }

    pub async fn receive(&self) -> GatewayEvent {
        self.queue.pop().await
    }

    pub fn try_receive(&self) -> Option<GatewayEvent> {
        self.queue.try_pop()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_defaults_to_idle() {
        let cell = ConnectivityCell::new();
        assert_eq!(cell.get(), ConnectivityState::Idle);
        assert!(!cell.is_uplink_ready());
    }

    #[test]
    fn test_cell_shared_between_clones() {
        let cell = ConnectivityCell::new();
        let reader = cell.clone();
        cell.set(ConnectivityState::MqttUp);
        assert_eq!(reader.get(), ConnectivityState::MqttUp);
        assert!(reader.is_uplink_ready());

        cell.set(ConnectivityState::WifiUp);
        assert!(!reader.is_uplink_ready());
    }

    #[test]
    fn test_event_bus_fifo() {
        let bus = EventBus::new();
        bus.publish(GatewayEvent::WifiConnected);
        bus.publish(GatewayEvent::MqttConnected);
        assert_eq!(bus.try_receive(), Some(GatewayEvent::WifiConnected));
        assert_eq!(bus.try_receive(), Some(GatewayEvent::MqttConnected));
        assert_eq!(bus.try_receive(), None);
    }

    #[test]
    fn test_event_bus_keeps_every_event_in_a_burst() {
        let bus = EventBus::new();
        bus.publish(GatewayEvent::CredentialsReceived(
            crate::credentials::WifiCredential::new("home", "pw").unwrap().into(),
        ));
        for _ in 0..EVENT_QUEUE_WARN_DEPTH * 2 {
            bus.publish(GatewayEvent::WifiDisconnected);
        }
        bus.publish(GatewayEvent::MqttConnected);
        assert_eq!(bus.pending(), EVENT_QUEUE_WARN_DEPTH * 2 + 2);

        assert!(matches!(
            bus.try_receive(),
            Some(GatewayEvent::CredentialsReceived(_))
        ));
        let mut count = 0;
        while let Some(event) = bus.try_receive() {
            count += 1;
            if count == EVENT_QUEUE_WARN_DEPTH * 2 + 1 {
                assert_eq!(event, GatewayEvent::MqttConnected);
            }
        }
        assert_eq!(count, EVENT_QUEUE_WARN_DEPTH * 2 + 1);
    }

    #[test]
    fn test_pending_queue_wakes_waiting_consumer() {
        let queue = PendingQueue::new();
        queue.push(7u8);
        assert_eq!(embassy_futures::block_on(queue.pop()), 7);
        assert!(queue.is_empty());

        assert!(queue.push_unless(1, |_| false));
        assert!(!queue.push_unless(2, |pending| *pending == 1));
        assert_eq!(queue.len(), 1);
    }
}
