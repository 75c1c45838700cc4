use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

use super::heartbeat::{HeartbeatEvent, HeartbeatPacket, HeartbeatState, HeartbeatTracker};
use crate::client::{ClientDelegate, NetworkClient};
use crate::config::HeartbeatConfig;
use crate::delegate::DelegateRegistry;
use crate::error::{NetworkError, UsageError};
use crate::message::{ClientId, MessageData, MessageReceiver, NetworkMessage, ReceivedMessage};
use crate::scheduler::Updateable;

struct Shared {
    delegates: DelegateRegistry<dyn ClientDelegate>,
    receiver: RefCell<Option<Rc<dyn MessageReceiver>>>,
    tracker: RefCell<HeartbeatTracker>,
    message_type: u8,
}

impl Shared {
    fn notify_error(&self, error: &NetworkError) {
        self.delegates.for_each(|d| d.on_error(error));
    }
}

/// Sits between the wrapped client and the application delegates, answering
/// pings and keeping heartbeat traffic away from the application.
struct Forwarder<C: ?Sized> {
    inner: Weak<C>,
    shared: Rc<Shared>,
}

impl<C: NetworkClient + ?Sized> ClientDelegate for Forwarder<C> {
    fn on_connected(&self) {
        self.shared.tracker.borrow_mut().reset();
        self.shared.delegates.for_each(|d| d.on_connected());
    }

    fn on_disconnected(&self) {
        self.shared.tracker.borrow_mut().reset();
        self.shared.delegates.for_each(|d| d.on_disconnected());
    }

    fn on_message_received(&self, message: &ReceivedMessage) {
        if message.message_type() != self.shared.message_type {
            let receiver = self.shared.receiver.borrow().clone();
            if let Some(receiver) = receiver {
                receiver.on_message_received(message.data(), &mut message.reader());
            }
            self.shared
                .delegates
                .for_each(|d| d.on_message_received(message));
            return;
        }

        match HeartbeatPacket::parse(message.payload()) {
            Ok(HeartbeatPacket::Ping { sequence, .. }) => {
                let Some(inner) = self.inner.upgrade() else {
                    return;
                };
                let data = MessageData::new(self.shared.message_type);
                if let Err(e) = inner.send_message(data, &HeartbeatPacket::Pong { sequence }) {
                    log::debug!("Failed to answer ping {}: {}", sequence, e);
                }
            }
            Ok(HeartbeatPacket::Pong { sequence }) => {
                let latency = self.shared.tracker.borrow_mut().on_pong(sequence);
                if let Some(latency) = latency {
                    log::trace!("Pong {} after {:?}", sequence, latency);
                }
            }
            Err(err) => self.shared.notify_error(&err.into()),
        }
    }

    fn on_error(&self, error: &NetworkError) {
        self.shared.notify_error(error);
    }
}

/// Wraps a client with ping/pong latency measurement and miss detection.
///
/// Every `ping_interval` of scheduler time a ping goes out on the heartbeat
/// message type; the peer's decorator answers it. Reaching the miss threshold
/// reports [`NetworkError::Heartbeat`] once but leaves the connection up.
pub struct StatsClient<C: NetworkClient + ?Sized + 'static> {
    inner: Rc<C>,
    shared: Rc<Shared>,
    forwarder: Rc<Forwarder<C>>,
}

impl<C: NetworkClient + ?Sized + 'static> StatsClient<C> {
    pub fn new(inner: Rc<C>, config: &HeartbeatConfig) -> Self {
        let shared = Rc::new(Shared {
            delegates: DelegateRegistry::new(),
            receiver: RefCell::new(None),
            tracker: RefCell::new(HeartbeatTracker::from_config(config)),
            message_type: config.message_type,
        });
        let forwarder = Rc::new(Forwarder {
            inner: Rc::downgrade(&inner),
            shared: shared.clone(),
        });
        inner.add_delegate(forwarder.clone());

        Self {
            inner,
            shared,
            forwarder,
        }
    }

    pub fn inner(&self) -> &Rc<C> {
        &self.inner
    }

    pub fn heartbeat_state(&self) -> HeartbeatState {
        self.shared.tracker.borrow().state()
    }

    pub fn missed_pings(&self) -> u32 {
        self.shared.tracker.borrow().missed()
    }
}

impl<C: NetworkClient + ?Sized + 'static> Updateable for StatsClient<C> {
    fn update(&self, dt: Duration) {
        self.inner.update(dt);
        if !self.inner.connected() {
            return;
        }

        let events = self.shared.tracker.borrow_mut().advance(dt);
        for event in events {
            match event {
                HeartbeatEvent::SendPing(ping) => {
                    let data = MessageData::new(self.shared.message_type);
                    if let Err(e) = self.inner.send_message(data, &ping) {
                        log::debug!("Failed to send ping: {}", e);
                    }
                }
                HeartbeatEvent::Unhealthy { missed } => {
                    let error = NetworkError::Heartbeat {
                        client_id: self.inner.client_id(),
                        missed,
                    };
                    log::warn!("{}", error);
                    self.shared.notify_error(&error);
                }
            }
        }
    }
}

impl<C: NetworkClient + ?Sized + 'static> NetworkClient for StatsClient<C> {
    fn connect(&self) {
        self.inner.connect();
    }

    fn disconnect(&self) {
        self.inner.disconnect();
    }

    fn connected(&self) -> bool {
        self.inner.connected()
    }

    fn client_id(&self) -> Option<ClientId> {
        self.inner.client_id()
    }

    fn create_message(&self, data: MessageData) -> Result<NetworkMessage<'_>, UsageError> {
        if data.message_type == self.shared.message_type {
            return Err(UsageError::ReservedType(data.message_type));
        }
        self.inner.create_message(data)
    }

    fn add_delegate(&self, delegate: Rc<dyn ClientDelegate>) {
        if self.shared.delegates.add(delegate.clone()) && self.inner.connected() {
            delegate.on_connected();
        }
    }

    fn remove_delegate(&self, delegate: &dyn ClientDelegate) {
        self.shared.delegates.remove(delegate);
    }

    fn register_receiver(&self, receiver: Option<Rc<dyn MessageReceiver>>) {
        *self.shared.receiver.borrow_mut() = receiver;
    }

    /// Round trip of the last answered ping.
    fn latency(&self) -> Option<Duration> {
        self.shared.tracker.borrow().latency()
    }
}

impl<C: NetworkClient + ?Sized + 'static> Drop for StatsClient<C> {
    fn drop(&mut self) {
        self.inner.remove_delegate(&*self.forwarder);
    }
}
