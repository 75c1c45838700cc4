use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use crate::connection::ConnectionState;
use crate::delegate::DelegateRegistry;
use crate::error::{NetworkError, UsageError};
use crate::message::{
    ClientId, ControlFrame, Frame, MessageData, MessageReceiver, NetworkMessage,
    NetworkShareable, ReceivedMessage,
};
use crate::scheduler::Updateable;

/// Client-side subscriber. Every callback fires on the thread driving `update`.
pub trait ClientDelegate {
    fn on_connected(&self) {}
    fn on_disconnected(&self) {}
    fn on_message_received(&self, _message: &ReceivedMessage) {}
    fn on_error(&self, _error: &NetworkError) {}
}

/// The client half of a binding.
///
/// `connect` and `disconnect` are idempotent and never block; the outcome of
/// a connection attempt arrives through the delegates during later updates.
pub trait NetworkClient: Updateable {
    fn connect(&self);
    fn disconnect(&self);
    fn connected(&self) -> bool;
    /// Id assigned by the server once the handshake completed.
    fn client_id(&self) -> Option<ClientId>;
    fn create_message(&self, data: MessageData) -> Result<NetworkMessage<'_>, UsageError>;
    /// Adding a delegate while connected immediately replays `on_connected` to it.
    fn add_delegate(&self, delegate: Rc<dyn ClientDelegate>);
    fn remove_delegate(&self, delegate: &dyn ClientDelegate);
    fn register_receiver(&self, receiver: Option<Rc<dyn MessageReceiver>>);

    fn latency(&self) -> Option<Duration> {
        None
    }

    fn send_message(
        &self,
        data: MessageData,
        value: &dyn NetworkShareable,
    ) -> Result<(), UsageError> {
        let mut message = self.create_message(data)?;
        value.serialize(message.writer()?);
        message.send()
    }
}

/// What a binding should do after handing a frame to its hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameAction {
    Continue,
    Disconnect,
}

/// Connection state and event fan-out shared by every client binding.
#[derive(Default)]
pub(crate) struct ClientHub {
    delegates: DelegateRegistry<dyn ClientDelegate>,
    receiver: RefCell<Option<Rc<dyn MessageReceiver>>>,
    state: Cell<ConnectionState>,
    client_id: Cell<Option<ClientId>>,
}

impl ClientHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn connected(&self) -> bool {
        self.state.get() == ConnectionState::Connected
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id.get()
    }

    pub fn add_delegate(&self, delegate: Rc<dyn ClientDelegate>) {
        if self.delegates.add(delegate.clone()) && self.connected() {
            delegate.on_connected();
        }
    }

    pub fn remove_delegate(&self, delegate: &dyn ClientDelegate) {
        self.delegates.remove(delegate);
    }

    pub fn register_receiver(&self, receiver: Option<Rc<dyn MessageReceiver>>) {
        *self.receiver.borrow_mut() = receiver;
    }

    pub fn check_connected(&self) -> Result<(), UsageError> {
        if self.connected() {
            Ok(())
        } else {
            Err(UsageError::NotConnected)
        }
    }

    pub fn begin_connecting(&self) {
        self.state.set(ConnectionState::Connecting);
        self.client_id.set(None);
    }

    pub fn notify_connected(&self, client_id: ClientId) {
        if self.connected() {
            return;
        }
        self.state.set(ConnectionState::Connected);
        self.client_id.set(Some(client_id));
        log::info!("Connected as client {}", client_id);
        self.delegates.for_each(|d| d.on_connected());
    }

    /// Only a connection that reached `Connected` reports `on_disconnected`.
    pub fn notify_disconnected(&self) {
        let was_connected = self.connected();
        self.state.set(ConnectionState::Disconnected);
        self.client_id.set(None);
        if was_connected {
            log::info!("Disconnected");
            self.delegates.for_each(|d| d.on_disconnected());
        }
    }

    pub fn notify_error(&self, error: NetworkError) {
        log::warn!("Client error: {}", error);
        self.delegates.for_each(|d| d.on_error(&error));
    }

    pub fn deliver(&self, message: ReceivedMessage) {
        if !self.connected() {
            log::debug!(
                "Dropping message type {} received while not connected",
                message.message_type()
            );
            return;
        }

        let receiver = self.receiver.borrow().clone();
        if let Some(receiver) = receiver {
            receiver.on_message_received(message.data(), &mut message.reader());
        }
        self.delegates.for_each(|d| d.on_message_received(&message));
    }

    pub fn handle_frame(&self, frame: Frame) -> FrameAction {
        if !frame.is_control() {
            self.deliver(ReceivedMessage::from_frame(frame, None));
            return FrameAction::Continue;
        }

        match ControlFrame::parse(&frame) {
            Ok(ControlFrame::Connect { client_id }) => self.notify_connected(client_id),
            Ok(ControlFrame::Disconnect) => return FrameAction::Disconnect,
            Ok(ControlFrame::Error { code, message }) => {
                self.notify_error(NetworkError::Remote { code, message })
            }
            Err(err) => self.notify_error(err.into()),
        }
        FrameAction::Continue
    }

    pub fn handle_bytes(&self, bytes: &[u8]) -> FrameAction {
        match Frame::decode(bytes) {
            Ok(frame) => self.handle_frame(frame),
            Err(err) => {
                self.notify_error(NetworkError::Protocol(err));
                FrameAction::Continue
            }
        }
    }
}
