use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::{StreamWriter, TransportRuntime, read_loop, split};
use crate::client::FrameAction;
use crate::config::ServerConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::{NetworkError, SERVER_FULL, UsageError};
use crate::message::{
    ClientId, ControlFrame, Frame, FrameBuffer, MessageData, MessageReceiver, MessageSink,
    NetworkMessage, check_application_type,
};
use crate::scheduler::Updateable;
use crate::server::{NetworkServer, ServerDelegate, ServerHub};

enum ServerEvent {
    Accepted {
        stream_id: u64,
        addr: SocketAddr,
        writer: StreamWriter,
        reader: JoinHandle<()>,
    },
    Bytes {
        stream_id: u64,
        data: Vec<u8>,
    },
    Closed {
        stream_id: u64,
        error: Option<io::Error>,
    },
    AcceptFailed(io::Error),
}

struct StreamPeer {
    writer: StreamWriter,
    reader: JoinHandle<()>,
    frames: FrameBuffer,
}

impl StreamPeer {
    fn close(self) {
        self.writer.close();
        self.reader.abort();
    }
}

struct Listener {
    shutdown: Option<oneshot::Sender<()>>,
    events: UnboundedReceiver<ServerEvent>,
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// TCP server whose sockets are serviced by a [`TransportRuntime`].
pub struct TokioServer {
    hub: ServerHub,
    bind_addr: String,
    runtime: TransportRuntime,
    listener: RefCell<Option<Listener>>,
    local_addr: Cell<Option<SocketAddr>>,
    connections: RefCell<ConnectionManager<u64, StreamPeer>>,
}

impl TokioServer {
    pub fn new(
        bind_addr: impl Into<String>,
        max_clients: usize,
        runtime: TransportRuntime,
    ) -> Self {
        Self {
            hub: ServerHub::new(),
            bind_addr: bind_addr.into(),
            runtime,
            listener: RefCell::new(None),
            local_addr: Cell::new(None),
            connections: RefCell::new(ConnectionManager::new(max_clients)),
        }
    }

    pub fn from_config(config: &ServerConfig, runtime: TransportRuntime) -> Self {
        Self::new(config.bind_addr(), config.max_clients, runtime)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get()
    }

    fn bind(&self) -> io::Result<(std::net::TcpListener, SocketAddr)> {
        let listener = std::net::TcpListener::bind(&self.bind_addr)?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        Ok((listener, addr))
    }

    fn spawn_accept_loop(&self, listener: std::net::TcpListener) -> Listener {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (shutdown, mut shutdown_rx) = oneshot::channel();
        self.runtime.spawn(async move {
            let listener = match TcpListener::from_std(listener) {
                Ok(listener) => listener,
                Err(e) => {
                    let _ = events_tx.send(ServerEvent::AcceptFailed(e));
                    return;
                }
            };

            let mut next_stream_id = 0u64;
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            next_stream_id += 1;
                            let stream_id = next_stream_id;
                            let (reader, writer) = split(stream);

                            let events = events_tx.clone();
                            let reader = tokio::spawn(async move {
                                let error = read_loop(reader, |data| {
                                    events.send(ServerEvent::Bytes { stream_id, data }).is_ok()
                                })
                                .await;
                                let _ = events.send(ServerEvent::Closed { stream_id, error });
                            });

                            let event = ServerEvent::Accepted { stream_id, addr, writer, reader };
                            if events_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            if events_tx.send(ServerEvent::AcceptFailed(e)).is_err() {
                                break;
                            }
                        }
                    },
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Listener {
            shutdown: Some(shutdown),
            events,
        }
    }

    fn handle_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::Accepted {
                stream_id,
                addr,
                writer,
                reader,
            } => self.admit(
                stream_id,
                addr,
                StreamPeer {
                    writer,
                    reader,
                    frames: FrameBuffer::new(),
                },
            ),
            ServerEvent::Bytes { stream_id, data } => self.receive(stream_id, &data),
            ServerEvent::Closed { stream_id, error } => {
                let removed = self.connections.borrow_mut().remove_by_key(&stream_id);
                if let Some(conn) = removed {
                    conn.handle.close();
                    if let Some(e) = error {
                        self.hub.notify_error(e.into());
                    }
                    self.hub.notify_client_disconnected(conn.client_id);
                }
            }
            ServerEvent::AcceptFailed(e) => {
                log::warn!("Accept on {} failed: {}", self.bind_addr, e);
                self.hub.notify_error(e.into());
            }
        }
    }

    fn admit(&self, stream_id: u64, addr: SocketAddr, peer: StreamPeer) {
        if let Err(err) = self.connections.borrow().check_capacity() {
            log::warn!("Connection denied to {}: {}", addr, err);
            let mut refusal = ControlFrame::Error {
                code: SERVER_FULL,
                message: err.to_string(),
            }
            .encode();
            refusal.extend(ControlFrame::Disconnect.encode());
            peer.writer.send(refusal);
            peer.close();
            return;
        }

        let accepted = {
            let mut connections = self.connections.borrow_mut();
            let accepted = connections.accept(stream_id, peer);
            if let Ok(client_id) = accepted {
                if let Some(conn) = connections.get_mut(client_id) {
                    conn.state = ConnectionState::Connected;
                    conn.handle
                        .writer
                        .send(ControlFrame::Connect { client_id }.encode());
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

    fn receive(&self, stream_id: u64, data: &[u8]) {
        let (client_id, frames, desync) = {
            let mut connections = self.connections.borrow_mut();
            let Some(conn) = connections.get_by_key_mut(&stream_id) else {
                return;
            };
            conn.touch();
            conn.handle.frames.extend(data);

            let mut frames: Vec<Frame> = Vec::new();
            let desync = loop {
                match conn.handle.frames.next_frame() {
                    Ok(Some(frame)) => frames.push(frame),
                    Ok(None) => break None,
                    Err(err) => break Some(err),
                }
            };
            (conn.client_id, frames, desync)
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

        if let Some(err) = desync {
            log::warn!("Stream from client {} desynchronized: {}", client_id, err);
            self.hub.notify_error(err.into());
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
        for conn in self.connections.borrow().iter() {
            let selected = destination.is_none_or(|id| id == conn.client_id);
            if selected && conn.is_connected() {
                conn.handle.writer.send(frame.to_vec());
            }
        }
    }
}

impl MessageSink for TokioServer {
    fn transmit(&self, data: &MessageData, frame: Vec<u8>) -> Result<(), UsageError> {
        self.hub.check_running()?;
        self.send_frame(data.client_id, &frame);
        Ok(())
    }
}

impl Updateable for TokioServer {
    fn update(&self, _dt: Duration) {
        while self.hub.running() {
            let event = match self.listener.borrow_mut().as_mut() {
                Some(listener) => listener.events.try_recv(),
                None => return,
            };
            match event {
                Ok(event) => self.handle_event(event),
                Err(_) => return,
            }
        }
    }
}

impl NetworkServer for TokioServer {
    fn start(&self) {
        if self.hub.running() {
            return;
        }

        let (listener, addr) = match self.bind() {
            Ok(bound) => bound,
            Err(e) => {
                log::warn!("Failed to bind {}: {}", self.bind_addr, e);
                self.hub.notify_error(e.into());
                return;
            }
        };

        log::info!("Tokio server listening on {}", addr);
        *self.listener.borrow_mut() = Some(self.spawn_accept_loop(listener));
        self.local_addr.set(Some(addr));
        self.hub.notify_started();
    }

    fn stop(&self) {
        if !self.hub.running() {
            return;
        }

        self.listener.borrow_mut().take();
        self.local_addr.set(None);

        let closed = self.connections.borrow_mut().drain();
        let goodbye = ControlFrame::Disconnect.encode();
        let mut ids = Vec::with_capacity(closed.len());
        for conn in closed {
            conn.handle.writer.send(goodbye.clone());
            conn.handle.close();
            ids.push(conn.client_id);
        }

        log::info!("Tokio server stopped");
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

impl Drop for TokioServer {
    fn drop(&mut self) {
        for conn in self.connections.get_mut().drain() {
            conn.handle.close();
        }
    }
}
