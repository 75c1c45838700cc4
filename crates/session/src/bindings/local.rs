//! In-process loopback. Frames still go through the full encode/decode path
//! and are only delivered when the receiving side runs `update`.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::client::{ClientDelegate, ClientHub, FrameAction, NetworkClient};
use crate::connection::{ConnectionManager, ConnectionState, DEFAULT_MAX_CLIENTS};
use crate::error::{CONNECTION_REFUSED, NetworkError, SERVER_FULL, UsageError};
use crate::message::{
    ClientId, ControlFrame, MessageData, MessageReceiver, MessageSink, NetworkMessage,
    check_application_type,
};
use crate::scheduler::Updateable;
use crate::server::{NetworkServer, ServerDelegate, ServerHub};

#[derive(Debug, Default)]
struct LocalPipe {
    to_client: RefCell<VecDeque<Vec<u8>>>,
    to_server: RefCell<VecDeque<Vec<u8>>>,
    client_closed: Cell<bool>,
    server_closed: Cell<bool>,
}

impl LocalPipe {
    fn push_to_client(&self, frame: Vec<u8>) {
        if !self.server_closed.get() {
            self.to_client.borrow_mut().push_back(frame);
        }
    }

    fn push_to_server(&self, frame: Vec<u8>) {
        if !self.client_closed.get() {
            self.to_server.borrow_mut().push_back(frame);
        }
    }

    fn pop_for_client(&self) -> Option<Vec<u8>> {
        self.to_client.borrow_mut().pop_front()
    }

    fn pop_for_server(&self) -> Option<Vec<u8>> {
        self.to_server.borrow_mut().pop_front()
    }

    fn close_from_server(&self) {
        self.push_to_client(ControlFrame::Disconnect.encode());
        self.server_closed.set(true);
    }

    fn close_from_client(&self) {
        self.push_to_server(ControlFrame::Disconnect.encode());
        self.client_closed.set(true);
    }
}

pub struct LocalServer {
    hub: ServerHub,
    pending: RefCell<Vec<(u64, Rc<LocalPipe>)>>,
    connections: RefCell<ConnectionManager<u64, Rc<LocalPipe>>>,
    next_pipe: Cell<u64>,
}

impl LocalServer {
    pub fn new(max_clients: usize) -> Self {
        Self {
            hub: ServerHub::new(),
            pending: RefCell::new(Vec::new()),
            connections: RefCell::new(ConnectionManager::new(max_clients)),
            next_pipe: Cell::new(0),
        }
    }

    fn attach(&self) -> Option<Rc<LocalPipe>> {
        if !self.hub.running() {
            return None;
        }

        let key = self.next_pipe.get();
        self.next_pipe.set(key + 1);
        let pipe = Rc::new(LocalPipe::default());
        self.pending.borrow_mut().push((key, pipe.clone()));
        Some(pipe)
    }

    fn pipe_for(&self, client_id: ClientId) -> Option<Rc<LocalPipe>> {
        self.connections
            .borrow()
            .get(client_id)
            .map(|conn| conn.handle.clone())
    }

    fn accept_pending(&self) {
        let pending = std::mem::take(&mut *self.pending.borrow_mut());
        for (key, pipe) in pending {
            if pipe.client_closed.get() {
                continue;
            }

            let accepted = {
                let mut connections = self.connections.borrow_mut();
                let accepted = connections.accept(key, pipe.clone());
                if let Ok(client_id) = accepted {
                    if let Some(conn) = connections.get_mut(client_id) {
                        conn.state = ConnectionState::Connected;
                    }
                }
                accepted
            };

            match accepted {
                Ok(client_id) => {
                    pipe.push_to_client(ControlFrame::Connect { client_id }.encode());
                    self.hub.notify_client_connected(client_id);
                }
                Err(err) => {
                    log::warn!("Local connection denied: {}", err);
                    pipe.push_to_client(
                        ControlFrame::Error {
                            code: SERVER_FULL,
                            message: err.to_string(),
                        }
                        .encode(),
                    );
                    pipe.close_from_server();
                }
            }
        }
    }

    fn drain_connection(&self, client_id: ClientId) {
        loop {
            let Some(pipe) = self.pipe_for(client_id) else {
                return;
            };

            match pipe.pop_for_server() {
                Some(bytes) => {
                    if self.hub.handle_bytes(client_id, &bytes) == FrameAction::Disconnect {
                        self.drop_connection(client_id);
                        return;
                    }
                }
                None => {
                    if pipe.client_closed.get() {
                        self.drop_connection(client_id);
                    }
                    return;
                }
            }
        }
    }

    fn drop_connection(&self, client_id: ClientId) {
        let removed = self.connections.borrow_mut().remove(client_id);
        if let Some(conn) = removed {
            conn.handle.server_closed.set(true);
            self.hub.notify_client_disconnected(client_id);
        }
    }

    fn send_frame(&self, destination: Option<ClientId>, frame: &[u8]) {
        let pipes: Vec<Rc<LocalPipe>> = {
            let connections = self.connections.borrow();
            match destination {
                Some(client_id) => connections
                    .get(client_id)
                    .filter(|conn| conn.is_connected())
                    .map(|conn| conn.handle.clone())
                    .into_iter()
                    .collect(),
                None => connections
                    .iter()
                    .filter(|conn| conn.is_connected())
                    .map(|conn| conn.handle.clone())
                    .collect(),
            }
        };

        for pipe in pipes {
            pipe.push_to_client(frame.to_vec());
        }
    }
}

impl Default for LocalServer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CLIENTS)
    }
}

impl MessageSink for LocalServer {
    fn transmit(&self, data: &MessageData, frame: Vec<u8>) -> Result<(), UsageError> {
        self.hub.check_running()?;
        self.send_frame(data.client_id, &frame);
        Ok(())
    }
}

impl Updateable for LocalServer {
    fn update(&self, _dt: Duration) {
        if !self.hub.running() {
            return;
        }

        self.accept_pending();
        let ids = self.connections.borrow().ids();
        for client_id in ids {
            self.drain_connection(client_id);
        }
    }
}

impl NetworkServer for LocalServer {
    fn start(&self) {
        if self.hub.running() {
            return;
        }
        log::info!("Local server started");
        self.hub.notify_started();
    }

    fn stop(&self) {
        if !self.hub.running() {
            return;
        }

        for (_, pipe) in self.pending.borrow_mut().drain(..) {
            pipe.close_from_server();
        }
        let closed = self.connections.borrow_mut().drain();
        for conn in &closed {
            conn.handle.close_from_server();
        }

        log::info!("Local server stopped");
        for conn in closed {
            self.hub.notify_client_disconnected(conn.client_id);
        }
        self.hub.notify_stopped();
    }

    fn running(&self) -> bool {
        self.hub.running()
    }

    fn create_message(&self, data: MessageData) -> Result<NetworkMessage<'_>, UsageError> {
        check_application_type(&data)?;
        self.hub.check_running()?;
        Ok(NetworkMessage::new(data, self))
    }

    fn add_delegate(&self, delegate: Rc<dyn ServerDelegate>) {
        self.hub.add_delegate(delegate);
    }

    fn remove_delegate(&self, delegate: &dyn ServerDelegate) {
        self.hub.remove_delegate(delegate);
    }

    fn register_receiver(&self, receiver: Option<Rc<dyn MessageReceiver>>) {
        self.hub.register_receiver(receiver);
    }

    fn connected_clients(&self) -> Vec<ClientId> {
        self.connections.borrow().connected_ids()
    }

    fn fail(&self, code: i32, message: &str) {
        if !self.hub.running() {
            return;
        }
        let frame = ControlFrame::Error {
            code,
            message: message.to_string(),
        }
        .encode();
        self.send_frame(None, &frame);
    }
}

impl Drop for LocalServer {
    fn drop(&mut self) {
        for conn in self.connections.get_mut().iter() {
            conn.handle.server_closed.set(true);
        }
        for (_, pipe) in self.pending.get_mut().iter() {
            pipe.server_closed.set(true);
        }
    }
}

/// Client end of the loopback. Holds only a weak reference to its server.
pub struct LocalClient {
    hub: ClientHub,
    server: Weak<LocalServer>,
    pipe: RefCell<Option<Rc<LocalPipe>>>,
    pending_error: RefCell<Option<NetworkError>>,
}

impl LocalClient {
    pub fn new(server: &Rc<LocalServer>) -> Self {
        Self::with_server(Rc::downgrade(server))
    }

    pub(crate) fn with_server(server: Weak<LocalServer>) -> Self {
        Self {
            hub: ClientHub::new(),
            server,
            pipe: RefCell::new(None),
            pending_error: RefCell::new(None),
        }
    }

    fn current_pipe(&self) -> Option<Rc<LocalPipe>> {
        self.pipe.borrow().clone()
    }

    fn close(&self, reason: Option<NetworkError>) {
        let was_connecting = self.hub.state() == ConnectionState::Connecting;
        self.pipe.borrow_mut().take();
        self.hub.notify_disconnected();
        if let Some(err) = reason {
            self.hub.notify_error(err);
        } else if was_connecting {
            self.hub.notify_error(NetworkError::transport(
                CONNECTION_REFUSED,
                "local server closed the connection",
            ));
        }
    }
}

impl MessageSink for LocalClient {
    fn transmit(&self, _data: &MessageData, frame: Vec<u8>) -> Result<(), UsageError> {
        self.hub.check_connected()?;
        let pipe = self.current_pipe().ok_or(UsageError::NotConnected)?;
        pipe.push_to_server(frame);
        Ok(())
    }
}

impl Updateable for LocalClient {
    fn update(&self, _dt: Duration) {
        let pending_error = self.pending_error.borrow_mut().take();
        if let Some(err) = pending_error {
            self.close(Some(err));
            return;
        }

        let Some(pipe) = self.current_pipe() else {
            return;
        };

        loop {
            let still_current = self
                .current_pipe()
                .is_some_and(|current| Rc::ptr_eq(&current, &pipe));
            if !still_current {
                return;
            }

            match pipe.pop_for_client() {
                Some(bytes) => {
                    if self.hub.handle_bytes(&bytes) == FrameAction::Disconnect {
                        pipe.client_closed.set(true);
                        self.close(None);
                        return;
                    }
                }
                None => {
                    if pipe.server_closed.get() {
                        self.close(None);
                    }
                    return;
                }
            }
        }
    }
}

impl NetworkClient for LocalClient {
    fn connect(&self) {
        if self.hub.state() != ConnectionState::Disconnected {
            return;
        }

        self.hub.begin_connecting();
        match self.server.upgrade().and_then(|server| server.attach()) {
            Some(pipe) => *self.pipe.borrow_mut() = Some(pipe),
            None => {
                *self.pending_error.borrow_mut() = Some(NetworkError::transport(
                    CONNECTION_REFUSED,
                    "local server is not running",
                ));
            }
        }
    }

    fn disconnect(&self) {
        if self.hub.state() == ConnectionState::Disconnected {
            return;
        }

        if let Some(pipe) = self.pipe.borrow_mut().take() {
            pipe.close_from_client();
        }
        self.pending_error.borrow_mut().take();
        self.hub.notify_disconnected();
    }

    fn connected(&self) -> bool {
        self.hub.connected()
    }

    fn client_id(&self) -> Option<ClientId> {
        self.hub.client_id()
    }

    fn create_message(&self, data: MessageData) -> Result<NetworkMessage<'_>, UsageError> {
        check_application_type(&data)?;
        self.hub.check_connected()?;
        Ok(NetworkMessage::new(data, self))
    }

    fn add_delegate(&self, delegate: Rc<dyn ClientDelegate>) {
        self.hub.add_delegate(delegate);
    }

    fn remove_delegate(&self, delegate: &dyn ClientDelegate) {
        self.hub.remove_delegate(delegate);
    }

    fn register_receiver(&self, receiver: Option<Rc<dyn MessageReceiver>>) {
        self.hub.register_receiver(receiver);
    }
}

impl Drop for LocalClient {
    fn drop(&mut self) {
        if let Some(pipe) = self.pipe.get_mut().take() {
            pipe.client_closed.set(true);
        }
    }
}
