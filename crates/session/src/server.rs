use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use crate::client::FrameAction;
use crate::delegate::DelegateRegistry;
use crate::error::{NetworkError, ProtocolError, UsageError};
use crate::message::{
    ClientId, ControlFrame, Frame, MessageData, MessageReceiver, NetworkMessage,
    NetworkShareable, ReceivedMessage,
};
use crate::scheduler::Updateable;

pub trait ServerDelegate {
    fn on_started(&self) {}
    fn on_stopped(&self) {}
    fn on_client_connected(&self, _client_id: ClientId) {}
    fn on_client_disconnected(&self, _client_id: ClientId) {}
    fn on_message_received(&self, _client_id: ClientId, _message: &ReceivedMessage) {}
    fn on_error(&self, _error: &NetworkError) {}
}

/// The server half of a binding.
pub trait NetworkServer: Updateable {
    fn start(&self);
    fn stop(&self);
    fn running(&self) -> bool;
    /// Unicast when `data.client_id` is set, broadcast otherwise. An id that
    /// names no connected client sends to nobody.
    fn create_message(&self, data: MessageData) -> Result<NetworkMessage<'_>, UsageError>;
    /// Adding a delegate while running immediately replays `on_started` to it.
    fn add_delegate(&self, delegate: Rc<dyn ServerDelegate>);
    fn remove_delegate(&self, delegate: &dyn ServerDelegate);
    fn register_receiver(&self, receiver: Option<Rc<dyn MessageReceiver>>);
    fn connected_clients(&self) -> Vec<ClientId>;
    /// Sends an `Error` control frame to every connected client.
    fn fail(&self, code: i32, message: &str);

    fn latency(&self, _client_id: ClientId) -> Option<Duration> {
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

/// Running flag and event fan-out shared by every server binding.
#[derive(Default)]
pub(crate) struct ServerHub {
    delegates: DelegateRegistry<dyn ServerDelegate>,
    receiver: RefCell<Option<Rc<dyn MessageReceiver>>>,
    running: Cell<bool>,
}

impl ServerHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn running(&self) -> bool {
        self.running.get()
    }

    pub fn check_running(&self) -> Result<(), UsageError> {
        if self.running() {
            Ok(())
        } else {
            Err(UsageError::NotRunning)
        }
    }

    pub fn add_delegate(&self, delegate: Rc<dyn ServerDelegate>) {
        if self.delegates.add(delegate.clone()) && self.running() {
            delegate.on_started();
        }
    }

    pub fn remove_delegate(&self, delegate: &dyn ServerDelegate) {
        self.delegates.remove(delegate);
    }

    pub fn register_receiver(&self, receiver: Option<Rc<dyn MessageReceiver>>) {
        *self.receiver.borrow_mut() = receiver;
    }

    pub fn notify_started(&self) {
        if self.running.replace(true) {
            return;
        }
        self.delegates.for_each(|d| d.on_started());
    }

    pub fn notify_stopped(&self) {
        if !self.running.replace(false) {
            return;
        }
        self.delegates.for_each(|d| d.on_stopped());
    }

    pub fn notify_client_connected(&self, client_id: ClientId) {
        log::info!("Client {} connected", client_id);
        self.delegates.for_each(|d| d.on_client_connected(client_id));
    }

    pub fn notify_client_disconnected(&self, client_id: ClientId) {
        log::info!("Client {} disconnected", client_id);
        self.delegates
            .for_each(|d| d.on_client_disconnected(client_id));
    }

    pub fn notify_error(&self, error: NetworkError) {
        log::warn!("Server error: {}", error);
        self.delegates.for_each(|d| d.on_error(&error));
    }

    pub fn deliver(&self, client_id: ClientId, message: ReceivedMessage) {
        let receiver = self.receiver.borrow().clone();
        if let Some(receiver) = receiver {
            receiver.on_message_received(message.data(), &mut message.reader());
        }
        self.delegates
            .for_each(|d| d.on_message_received(client_id, &message));
    }

    pub fn handle_frame(&self, client_id: ClientId, frame: Frame) -> FrameAction {
        if !frame.is_control() {
            self.deliver(client_id, ReceivedMessage::from_frame(frame, Some(client_id)));
            return FrameAction::Continue;
        }

        match ControlFrame::parse(&frame) {
            Ok(ControlFrame::Disconnect) => return FrameAction::Disconnect,
            Ok(ControlFrame::Error { code, message }) => {
                self.notify_error(NetworkError::Remote { code, message })
            }
            Ok(ControlFrame::Connect { .. }) => self.notify_error(
                ProtocolError::UnexpectedControl {
                    message_type: frame.message_type,
                }
                .into(),
            ),
            Err(err) => self.notify_error(err.into()),
        }
        FrameAction::Continue
    }

    pub fn handle_bytes(&self, client_id: ClientId, bytes: &[u8]) -> FrameAction {
        match Frame::decode(bytes) {
            Ok(frame) => self.handle_frame(client_id, frame),
            Err(err) => {
                self.notify_error(NetworkError::Protocol(err));
                FrameAction::Continue
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Writer;

    #[derive(Default)]
    struct Events(RefCell<Vec<String>>);

    impl ServerDelegate for Events {
        fn on_started(&self) {
            self.0.borrow_mut().push("started".into());
        }

        fn on_stopped(&self) {
            self.0.borrow_mut().push("stopped".into());
        }

        fn on_client_connected(&self, client_id: ClientId) {
            self.0.borrow_mut().push(format!("connected {client_id}"));
        }

        fn on_client_disconnected(&self, client_id: ClientId) {
            self.0.borrow_mut().push(format!("disconnected {client_id}"));
        }

        fn on_message_received(&self, client_id: ClientId, message: &ReceivedMessage) {
            self.0.borrow_mut().push(format!(
                "message {} from {} ({:?})",
                message.message_type(),
                client_id,
                message.client_id()
            ));
        }

        fn on_error(&self, error: &NetworkError) {
            self.0.borrow_mut().push(format!("error {error}"));
        }
    }

    #[test]
    fn start_and_stop_fire_once() {
        let hub = ServerHub::new();
        let events = Rc::new(Events::default());
        hub.add_delegate(events.clone());

        hub.notify_started();
        hub.notify_started();
        hub.notify_stopped();
        hub.notify_stopped();

        assert_eq!(*events.0.borrow(), vec!["started", "stopped"]);
    }

    #[test]
    fn late_delegate_gets_started_replay() {
        let hub = ServerHub::new();
        hub.notify_started();

        let late = Rc::new(Events::default());
        hub.add_delegate(late.clone());
        assert_eq!(*late.0.borrow(), vec!["started"]);
    }

    #[test]
    fn messages_carry_sender_id() {
        let hub = ServerHub::new();
        let events = Rc::new(Events::default());
        hub.add_delegate(events.clone());

        let mut writer = Writer::new();
        writer.write_i32(5);
        let bytes = Frame::encode(12, 1, writer.as_bytes());
        assert_eq!(hub.handle_bytes(3, &bytes), FrameAction::Continue);

        assert_eq!(*events.0.borrow(), vec!["message 12 from 3 (Some(3))"]);
    }

    #[test]
    fn client_sent_connect_is_rejected() {
        let hub = ServerHub::new();
        let events = Rc::new(Events::default());
        hub.add_delegate(events.clone());

        let connect = ControlFrame::Connect { client_id: 1 }.encode();
        assert_eq!(hub.handle_bytes(1, &connect), FrameAction::Continue);
        assert_eq!(
            hub.handle_bytes(1, &ControlFrame::Disconnect.encode()),
            FrameAction::Disconnect
        );
        assert_eq!(
            *events.0.borrow(),
            vec!["error protocol error: unexpected control frame of type 0"]
        );
    }

    #[test]
    fn usage_checks_follow_running_flag() {
        let hub = ServerHub::new();
        assert_eq!(hub.check_running(), Err(UsageError::NotRunning));
        hub.notify_started();
        assert_eq!(hub.check_running(), Ok(()));
    }
}
