use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;

use super::{StreamWriter, TransportRuntime, read_loop, split};
use crate::client::{ClientDelegate, ClientHub, FrameAction, NetworkClient};
use crate::config::ClientConfig;
use crate::connection::ConnectionState;
use crate::error::{CONNECTION_REFUSED, CONNECTION_TIMED_OUT, NetworkError, UsageError};
use crate::message::{
    ClientId, ControlFrame, FrameBuffer, MessageData, MessageReceiver, MessageSink,
    NetworkMessage, check_application_type,
};
use crate::scheduler::Updateable;

enum ClientEvent {
    Opened(StreamWriter),
    Bytes(Vec<u8>),
    Closed(Option<io::Error>),
    Failed(io::Error),
}

/// One connection attempt and, once open, its stream.
struct Attempt {
    events: UnboundedReceiver<ClientEvent>,
    task: JoinHandle<()>,
    writer: Option<StreamWriter>,
    frames: FrameBuffer,
    started: Instant,
}

impl Attempt {
    fn close(self) {
        if let Some(writer) = &self.writer {
            writer.close();
        }
        self.task.abort();
    }
}

/// TCP client whose socket is serviced by a [`TransportRuntime`].
pub struct TokioClient {
    hub: ClientHub,
    server_addr: String,
    connect_timeout: Duration,
    runtime: TransportRuntime,
    attempt: RefCell<Option<Attempt>>,
    generation: Cell<u64>,
}

impl TokioClient {
    pub fn new(
        server_addr: impl Into<String>,
        connect_timeout: Duration,
        runtime: TransportRuntime,
    ) -> Self {
        Self {
            hub: ClientHub::new(),
            server_addr: server_addr.into(),
            connect_timeout,
            runtime,
            attempt: RefCell::new(None),
            generation: Cell::new(0),
        }
    }

    pub fn from_config(config: &ClientConfig, runtime: TransportRuntime) -> Self {
        Self::new(config.server_addr(), config.connect_timeout(), runtime)
    }

    fn spawn_attempt(&self) -> Attempt {
        let (events_tx, events) = mpsc::unbounded_channel();
        let server_addr = self.server_addr.clone();
        let connect_timeout = self.connect_timeout;

        let task = self.runtime.spawn(async move {
            let connecting = TcpStream::connect(server_addr.as_str());
            let stream = match tokio::time::timeout(connect_timeout, connecting).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    let _ = events_tx.send(ClientEvent::Failed(e));
                    return;
                }
                Err(_) => {
                    let e = io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connecting to {} timed out", server_addr),
                    );
                    let _ = events_tx.send(ClientEvent::Failed(e));
                    return;
                }
            };

            let (reader, writer) = split(stream);
            if events_tx.send(ClientEvent::Opened(writer)).is_err() {
                return;
            }
            let error = read_loop(reader, |data| {
                events_tx.send(ClientEvent::Bytes(data)).is_ok()
            })
            .await;
            let _ = events_tx.send(ClientEvent::Closed(error));
        });

        Attempt {
            events,
            task,
            writer: None,
            frames: FrameBuffer::new(),
            started: Instant::now(),
        }
    }

    fn close(&self, reason: Option<NetworkError>) {
        let was_connecting = self.hub.state() == ConnectionState::Connecting;
        if let Some(attempt) = self.attempt.borrow_mut().take() {
            attempt.close();
        }
        self.generation.set(self.generation.get() + 1);

        self.hub.notify_disconnected();
        match reason {
            Some(err) => self.hub.notify_error(err),
            None if was_connecting => self.hub.notify_error(NetworkError::transport(
                CONNECTION_REFUSED,
                "server closed the connection during handshake",
            )),
            None => {}
        }
    }

    fn handle_event(&self, event: ClientEvent) {
        match event {
            ClientEvent::Opened(writer) => {
                log::debug!("TCP stream open to {}, awaiting handshake", self.server_addr);
                if let Some(attempt) = self.attempt.borrow_mut().as_mut() {
                    attempt.writer = Some(writer);
                }
            }
            ClientEvent::Bytes(data) => self.receive(&data),
            ClientEvent::Closed(error) => self.close(error.map(Into::into)),
            ClientEvent::Failed(e) => {
                log::warn!("Failed to connect to {}: {}", self.server_addr, e);
                self.close(Some(e.into()));
            }
        }
    }

    fn receive(&self, data: &[u8]) {
        let (frames, desync) = {
            let mut attempt = self.attempt.borrow_mut();
            let Some(attempt) = attempt.as_mut() else {
                return;
            };
            attempt.frames.extend(data);

            let mut frames = Vec::new();
            let desync = loop {
                match attempt.frames.next_frame() {
                    Ok(Some(frame)) => frames.push(frame),
                    Ok(None) => break None,
                    Err(err) => break Some(err),
                }
            };
            (frames, desync)
        };

        let generation = self.generation.get();
        for frame in frames {
            if self.generation.get() != generation {
                return;
            }
            if self.hub.handle_frame(frame) == FrameAction::Disconnect {
                self.close(None);
                return;
            }
        }
        if self.generation.get() != generation {
            return;
        }

        if let Some(err) = desync {
            log::warn!("Stream from {} desynchronized: {}", self.server_addr, err);
            self.hub.notify_error(err.into());
            self.close(None);
        }
    }
}

impl MessageSink for TokioClient {
    fn transmit(&self, _data: &MessageData, frame: Vec<u8>) -> Result<(), UsageError> {
        self.hub.check_connected()?;
        let attempt = self.attempt.borrow();
        let writer = attempt
            .as_ref()
            .and_then(|attempt| attempt.writer.as_ref())
            .ok_or(UsageError::NotConnected)?;
        writer.send(frame);
        Ok(())
    }
}

impl Updateable for TokioClient {
    fn update(&self, _dt: Duration) {
        let generation = self.generation.get();
        loop {
            let event = match self.attempt.borrow_mut().as_mut() {
                Some(attempt) => attempt.events.try_recv(),
                None => return,
            };
            match event {
                Ok(event) => self.handle_event(event),
                Err(_) => break,
            }
            if self.generation.get() != generation {
                return;
            }
        }

        let expired = self.hub.state() == ConnectionState::Connecting
            && self
                .attempt
                .borrow()
                .as_ref()
                .is_some_and(|attempt| attempt.started.elapsed() > self.connect_timeout);
        if expired {
            self.close(Some(NetworkError::transport(
                CONNECTION_TIMED_OUT,
                "handshake timed out",
            )));
        }
    }
}

impl NetworkClient for TokioClient {
    fn connect(&self) {
        if self.hub.state() != ConnectionState::Disconnected {
            return;
        }
        self.hub.begin_connecting();
        *self.attempt.borrow_mut() = Some(self.spawn_attempt());
    }

    fn disconnect(&self) {
        if self.hub.state() == ConnectionState::Disconnected {
            return;
        }

        if let Some(attempt) = self.attempt.borrow_mut().take() {
            if let Some(writer) = &attempt.writer {
                writer.send(ControlFrame::Disconnect.encode());
            }
            attempt.close();
        }
        self.generation.set(self.generation.get() + 1);
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

impl Drop for TokioClient {
    fn drop(&mut self) {
        if let Some(attempt) = self.attempt.get_mut().take() {
            attempt.close();
        }
    }
}
