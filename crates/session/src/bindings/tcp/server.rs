use std::cell::{Cell, RefCell};
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::rc::Rc;
use std::time::Duration;

use super::stream::{StreamEnd, StreamPeer};
use crate::client::FrameAction;
use crate::config::ServerConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::{NetworkError, SERVER_FULL, UsageError};
use crate::message::{
    ClientId, ControlFrame, MessageData, MessageReceiver, MessageSink, NetworkMessage,
    check_application_type,
};
use crate::scheduler::Updateable;
use crate::server::{NetworkServer, ServerDelegate, ServerHub};

pub struct TcpServer {
    hub: ServerHub,
    bind_addr: String,
    listener: RefCell<Option<TcpListener>>,
    local_addr: Cell<Option<SocketAddr>>,
    connections: RefCell<ConnectionManager<SocketAddr, StreamPeer>>,
}

impl TcpServer {
    pub fn new(bind_addr: impl Into<String>, max_clients: usize) -> Self {
        Self {
            hub: ServerHub::new(),
            bind_addr: bind_addr.into(),
            listener: RefCell::new(None),
            local_addr: Cell::new(None),
            connections: RefCell::new(ConnectionManager::new(max_clients)),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.bind_addr(), config.max_clients)
    }

    /// Address the listener is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get()
    }

    fn accept_incoming(&self) {
        loop {
            let accepted = match self.listener.borrow().as_ref() {
                Some(listener) => listener.accept(),
                None => return,
            };

            match accepted {
                Ok((stream, addr)) => self.admit(stream, addr),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    self.hub.notify_error(e.into());
                    return;
                }
            }
        }
    }

    fn admit(&self, mut stream: TcpStream, addr: SocketAddr) {
        if let Err(err) = self.connections.borrow().check_capacity() {
            log::warn!("Connection denied to {}: {}", addr, err);
            let mut refusal = ControlFrame::Error {
                code: SERVER_FULL,
                message: err.to_string(),
            }
            .encode();
            refusal.extend(ControlFrame::Disconnect.encode());
            let _ = stream.write_all(&refusal);
            return;
        }

        let peer = match StreamPeer::new(stream) {
            Ok(peer) => peer,
            Err(e) => {
                self.hub.notify_error(e.into());
                return;
            }
        };

        let accepted = {
            let mut connections = self.connections.borrow_mut();
            let accepted = connections.accept(addr, peer);
            if let Ok(client_id) = accepted {
                if let Some(conn) = connections.get_mut(client_id) {
                    conn.state = ConnectionState::Connected;
                    conn.handle.queue(&ControlFrame::Connect { client_id }.encode());
                    let _ = conn.handle.flush();
                }
            }
            accepted
        };

        match accepted {
            Ok(client_id) => {
                log::debug!("Accepted {} as client {}", addr, client_id);
                self.hub.notify_client_connected(client_id);
            }
            Err(err) => {
                self.hub
                    .notify_error(NetworkError::transport(SERVER_FULL, err.to_string()))
            }
        }
    }

    fn poll_connection(&self, client_id: ClientId) {
        let (frames, end) = {
            let mut connections = self.connections.borrow_mut();
            let Some(conn) = connections.get_mut(client_id) else {
                return;
            };
            let read = conn.handle.read_available();
            if !read.0.is_empty() {
                conn.touch();
            }
            read
        };

        for frame in frames {
            if self.connections.borrow().get(client_id).is_none() {
                return;
            }
            if self.hub.handle_frame(client_id, frame) == FrameAction::Disconnect {
                self.drop_connection(client_id);
                return;
            }
        }

        if let Some(end) = end {
            if let StreamEnd::Desync(err) = &end {
                log::warn!("Stream from client {} desynchronized: {}", client_id, err);
            }
            if let Some(err) = end.into_error() {
                self.hub.notify_error(err);
            }
            self.drop_connection(client_id);
        }
    }

    fn flush_all(&self) {
        let failed: Vec<(ClientId, StreamEnd)> = self
            .connections
            .borrow_mut()
            .iter_mut()
            .filter_map(|conn| conn.handle.flush().err().map(|end| (conn.client_id, end)))
            .collect();

        for (client_id, end) in failed {
            if let Some(err) = end.into_error() {
                self.hub.notify_error(err);
            }
            self.drop_connection(client_id);
        }
    }

    fn drop_connection(&self, client_id: ClientId) {
        let removed = self.connections.borrow_mut().remove(client_id);
        if let Some(conn) = removed {
            conn.handle.close();
            self.hub.notify_client_disconnected(client_id);
        }
    }

    fn send_frame(&self, destination: Option<ClientId>, frame: &[u8]) {
        let mut connections = self.connections.borrow_mut();
        for conn in connections.iter_mut() {
            let selected = destination.is_none_or(|id| id == conn.client_id);
            if selected && conn.is_connected() {
                conn.handle.queue(frame);
                if let Err(StreamEnd::Io(e)) = conn.handle.flush() {
                    log::debug!("Write to client {} failed: {}", conn.client_id, e);
                }
            }
        }
    }
}

impl MessageSink for TcpServer {
    fn transmit(&self, data: &MessageData, frame: Vec<u8>) -> Result<(), UsageError> {
        self.hub.check_running()?;
        self.send_frame(data.client_id, &frame);
        Ok(())
    }
}

impl Updateable for TcpServer {
    fn update(&self, _dt: Duration) {
        if !self.hub.running() {
            return;
        }

        self.accept_incoming();
        let ids = self.connections.borrow().ids();
        for client_id in ids {
            if !self.hub.running() {
                return;
            }
            self.poll_connection(client_id);
        }
        self.flush_all();
    }
}

impl NetworkServer for TcpServer {
    fn start(&self) {
        if self.hub.running() {
            return;
        }

        let listener = match TcpListener::bind(&self.bind_addr).and_then(|listener| {
            listener.set_nonblocking(true)?;
            Ok(listener)
        }) {
            Ok(listener) => listener,
            Err(e) => {
                log::warn!("Failed to bind {}: {}", self.bind_addr, e);
                self.hub.notify_error(e.into());
                return;
            }
        };

        let local_addr = listener.local_addr().ok();
        self.local_addr.set(local_addr);
        *self.listener.borrow_mut() = Some(listener);
        log::info!("TCP server listening on {:?}", local_addr);
        self.hub.notify_started();
    }

    fn stop(&self) {
        if !self.hub.running() {
            return;
        }

        self.listener.borrow_mut().take();
        self.local_addr.set(None);
        let closed = self.connections.borrow_mut().drain();
        let ids: Vec<ClientId> = closed.iter().map(|conn| conn.client_id).collect();
        for mut conn in closed {
            conn.handle.queue(&ControlFrame::Disconnect.encode());
            conn.handle.close();
        }

        log::info!("TCP server stopped");
        for client_id in ids {
            self.hub.notify_client_disconnected(client_id);
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
