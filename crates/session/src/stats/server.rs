use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};
use std::time::Duration;

use super::heartbeat::{HeartbeatEvent, HeartbeatPacket, HeartbeatState, HeartbeatTracker};
use crate::config::HeartbeatConfig;
use crate::delegate::DelegateRegistry;
use crate::error::{NetworkError, UsageError};
use crate::message::{ClientId, MessageData, MessageReceiver, NetworkMessage, ReceivedMessage};
use crate::scheduler::Updateable;
use crate::server::{NetworkServer, ServerDelegate};

struct Shared {
    delegates: DelegateRegistry<dyn ServerDelegate>,
    receiver: RefCell<Option<Rc<dyn MessageReceiver>>>,
    trackers: RefCell<BTreeMap<ClientId, HeartbeatTracker>>,
    config: HeartbeatConfig,
}

impl Shared {
    fn notify_error(&self, error: &NetworkError) {
        self.delegates.for_each(|d| d.on_error(error));
    }
}

struct Forwarder<S: ?Sized> {
    inner: Weak<S>,
    shared: Rc<Shared>,
}

impl<S: NetworkServer + ?Sized> ServerDelegate for Forwarder<S> {
    fn on_started(&self) {
        self.shared.delegates.for_each(|d| d.on_started());
    }

    fn on_stopped(&self) {
        self.shared.trackers.borrow_mut().clear();
        self.shared.delegates.for_each(|d| d.on_stopped());
    }

    fn on_client_connected(&self, client_id: ClientId) {
        self.shared
            .trackers
            .borrow_mut()
            .insert(client_id, HeartbeatTracker::from_config(&self.shared.config));
        self.shared
            .delegates
            .for_each(|d| d.on_client_connected(client_id));
    }

    fn on_client_disconnected(&self, client_id: ClientId) {
        self.shared.trackers.borrow_mut().remove(&client_id);
        self.shared
            .delegates
            .for_each(|d| d.on_client_disconnected(client_id));
    }

    fn on_message_received(&self, client_id: ClientId, message: &ReceivedMessage) {
        let message_type = self.shared.config.message_type;
        if message.message_type() != message_type {
            let receiver = self.shared.receiver.borrow().clone();
            if let Some(receiver) = receiver {
                receiver.on_message_received(message.data(), &mut message.reader());
            }
            self.shared
                .delegates
                .for_each(|d| d.on_message_received(client_id, message));
            return;
        }

        match HeartbeatPacket::parse(message.payload()) {
            Ok(HeartbeatPacket::Ping { sequence, .. }) => {
                let Some(inner) = self.inner.upgrade() else {
                    return;
                };
                let data = MessageData::new(message_type).to_client(client_id);
                if let Err(e) = inner.send_message(data, &HeartbeatPacket::Pong { sequence }) {
                    log::debug!("Failed to answer client {} ping {}: {}", client_id, sequence, e);
                }
            }
            Ok(HeartbeatPacket::Pong { sequence }) => {
                if let Some(tracker) = self.shared.trackers.borrow_mut().get_mut(&client_id) {
                    tracker.on_pong(sequence);
                }
            }
            Err(err) => self.shared.notify_error(&err.into()),
        }
    }

    fn on_error(&self, error: &NetworkError) {
        self.shared.notify_error(error);
    }
}

/// Server counterpart of [`StatsClient`](super::StatsClient): one heartbeat
/// per connected client.
pub struct StatsServer<S: NetworkServer + ?Sized + 'static> {
    inner: Rc<S>,
    shared: Rc<Shared>,
    forwarder: Rc<Forwarder<S>>,
}

impl<S: NetworkServer + ?Sized + 'static> StatsServer<S> {
    pub fn new(inner: Rc<S>, config: &HeartbeatConfig) -> Self {
        let shared = Rc::new(Shared {
            delegates: DelegateRegistry::new(),
            receiver: RefCell::new(None),
            trackers: RefCell::new(BTreeMap::new()),
            config: *config,
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

    pub fn inner(&self) -> &Rc<S> {
        &self.inner
    }

    pub fn heartbeat_state(&self, client_id: ClientId) -> Option<HeartbeatState> {
        self.shared
            .trackers
            .borrow()
            .get(&client_id)
            .map(HeartbeatTracker::state)
    }

    pub fn missed_pings(&self, client_id: ClientId) -> Option<u32> {
        self.shared
            .trackers
            .borrow()
            .get(&client_id)
            .map(HeartbeatTracker::missed)
    }
}

impl<S: NetworkServer + ?Sized + 'static> Updateable for StatsServer<S> {
    fn update(&self, dt: Duration) {
        self.inner.update(dt);
        if !self.inner.running() {
            return;
        }

        let due: Vec<(ClientId, Vec<HeartbeatEvent>)> = self
            .shared
            .trackers
            .borrow_mut()
            .iter_mut()
            .map(|(&client_id, tracker)| (client_id, tracker.advance(dt)))
            .filter(|(_, events)| !events.is_empty())
            .collect();

        for (client_id, events) in due {
            for event in events {
                match event {
                    HeartbeatEvent::SendPing(ping) => {
                        let data = MessageData::new(self.shared.config.message_type)
                            .to_client(client_id);
                        if let Err(e) = self.inner.send_message(data, &ping) {
                            log::debug!("Failed to ping client {}: {}", client_id, e);
                        }
                    }
                    HeartbeatEvent::Unhealthy { missed } => {
                        let error = NetworkError::Heartbeat {
                            client_id: Some(client_id),
                            missed,
                        };
                        log::warn!("{}", error);
                        self.shared.notify_error(&error);
                    }
                }
            }
        }
    }
}

impl<S: NetworkServer + ?Sized + 'static> NetworkServer for StatsServer<S> {
    fn start(&self) {
        self.inner.start();
    }

    fn stop(&self) {
        self.inner.stop();
    }

    fn running(&self) -> bool {
        self.inner.running()
    }

    fn create_message(&self, data: MessageData) -> Result<NetworkMessage<'_>, UsageError> {
        if data.message_type == self.shared.config.message_type {
            return Err(UsageError::ReservedType(data.message_type));
        }
        self.inner.create_message(data)
    }

    fn add_delegate(&self, delegate: Rc<dyn ServerDelegate>) {
        if self.shared.delegates.add(delegate.clone()) && self.inner.running() {
            delegate.on_started();
        }
    }

    fn remove_delegate(&self, delegate: &dyn ServerDelegate) {
        self.shared.delegates.remove(delegate);
    }

    fn register_receiver(&self, receiver: Option<Rc<dyn MessageReceiver>>) {
        *self.shared.receiver.borrow_mut() = receiver;
    }

    fn connected_clients(&self) -> Vec<ClientId> {
        self.inner.connected_clients()
    }

    fn fail(&self, code: i32, message: &str) {
        self.inner.fail(code, message);
    }

    fn latency(&self, client_id: ClientId) -> Option<Duration> {
        self.shared
            .trackers
            .borrow()
            .get(&client_id)
            .and_then(HeartbeatTracker::latency)
    }
}

impl<S: NetworkServer + ?Sized + 'static> Drop for StatsServer<S> {
    fn drop(&mut self) {
        self.inner.remove_delegate(&*self.forwarder);
    }
}
