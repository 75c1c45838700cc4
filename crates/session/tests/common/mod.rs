#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use netsession::{
    ClientDelegate, ClientId, NetworkError, NetworkShareable, ReceivedMessage, ServerDelegate,
    Updateable, Writer,
};

pub const STEP: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    Message { message_type: u8, channel: i32, text: String },
    Error(NetworkError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Started,
    Stopped,
    ClientConnected(ClientId),
    ClientDisconnected(ClientId),
    Message { client_id: ClientId, message_type: u8, text: String },
    Error(NetworkError),
}

fn text_of(message: &ReceivedMessage) -> String {
    message.reader().read_string().unwrap_or_default()
}

#[derive(Default)]
pub struct ClientRecorder {
    pub events: RefCell<Vec<ClientEvent>>,
}

impl ClientRecorder {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ClientEvent> {
        self.events.borrow().clone()
    }

    pub fn count(&self, wanted: &ClientEvent) -> usize {
        self.events.borrow().iter().filter(|e| *e == wanted).count()
    }

    pub fn texts(&self) -> Vec<String> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                ClientEvent::Message { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<NetworkError> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                ClientEvent::Error(err) => Some(err.clone()),
                _ => None,
            })
            .collect()
    }
}

impl ClientDelegate for ClientRecorder {
    fn on_connected(&self) {
        self.events.borrow_mut().push(ClientEvent::Connected);
    }

    fn on_disconnected(&self) {
        self.events.borrow_mut().push(ClientEvent::Disconnected);
    }

    fn on_message_received(&self, message: &ReceivedMessage) {
        self.events.borrow_mut().push(ClientEvent::Message {
            message_type: message.message_type(),
            channel: message.channel(),
            text: text_of(message),
        });
    }

    fn on_error(&self, error: &NetworkError) {
        self.events.borrow_mut().push(ClientEvent::Error(error.clone()));
    }
}

#[derive(Default)]
pub struct ServerRecorder {
    pub events: RefCell<Vec<ServerEvent>>,
}

impl ServerRecorder {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ServerEvent> {
        self.events.borrow().clone()
    }

    pub fn count(&self, wanted: &ServerEvent) -> usize {
        self.events.borrow().iter().filter(|e| *e == wanted).count()
    }

    pub fn texts(&self) -> Vec<(ClientId, String)> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                ServerEvent::Message {
                    client_id, text, ..
                } => Some((*client_id, text.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn connected_ids(&self) -> Vec<ClientId> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                ServerEvent::ClientConnected(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<NetworkError> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                ServerEvent::Error(err) => Some(err.clone()),
                _ => None,
            })
            .collect()
    }
}

impl ServerDelegate for ServerRecorder {
    fn on_started(&self) {
        self.events.borrow_mut().push(ServerEvent::Started);
    }

    fn on_stopped(&self) {
        self.events.borrow_mut().push(ServerEvent::Stopped);
    }

    fn on_client_connected(&self, client_id: ClientId) {
        self.events
            .borrow_mut()
            .push(ServerEvent::ClientConnected(client_id));
    }

    fn on_client_disconnected(&self, client_id: ClientId) {
        self.events
            .borrow_mut()
            .push(ServerEvent::ClientDisconnected(client_id));
    }

    fn on_message_received(&self, client_id: ClientId, message: &ReceivedMessage) {
        self.events.borrow_mut().push(ServerEvent::Message {
            client_id,
            message_type: message.message_type(),
            text: text_of(message),
        });
    }

    fn on_error(&self, error: &NetworkError) {
        self.events.borrow_mut().push(ServerEvent::Error(error.clone()));
    }
}

/// A string payload.
pub struct Text<'a>(pub &'a str);

impl NetworkShareable for Text<'_> {
    fn serialize(&self, writer: &mut Writer) {
        writer.write_string(self.0);
    }
}

/// Updates every participant until `done` holds or `timeout` of wall time passes.
pub fn pump_until(
    participants: &[&dyn Updateable],
    timeout: Duration,
    mut done: impl FnMut() -> bool,
) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        for participant in participants {
            participant.update(STEP);
        }
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

/// Updates every participant a fixed number of times.
pub fn pump(participants: &[&dyn Updateable], rounds: usize) {
    for _ in 0..rounds {
        for participant in participants {
            participant.update(STEP);
        }
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
