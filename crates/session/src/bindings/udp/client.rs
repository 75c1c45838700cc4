use std::cell::{Cell, RefCell};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::rc::Rc;
use std::time::{Duration, Instant};

use super::endpoint::{NetworkStats, UdpEndpoint};
use super::protocol::{Datagram, DatagramKind, MAX_FRAME_SIZE};
use super::reliability::PeerChannels;
use super::simulator::rand_u64;
use crate::client::{ClientDelegate, ClientHub, FrameAction, NetworkClient};
use crate::config::{ClientConfig, UdpConfig};
use crate::connection::ConnectionState;
use crate::error::{
    CONNECTION_REFUSED, CONNECTION_TIMED_OUT, NetworkError, SEND_QUEUE_FULL, SERVER_FULL,
    UsageError,
};
use crate::message::{
    ClientId, MessageData, MessageReceiver, MessageSink, NetworkMessage, check_application_type,
};
use crate::scheduler::Updateable;

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(250);

struct Session {
    server: SocketAddr,
    salt: u64,
    channels: PeerChannels,
    started: Instant,
    last_request: Instant,
    last_send: Instant,
    last_receive: Instant,
}

enum ClientEffect {
    Accepted(ClientId),
    Denied(String),
    Closed,
    Frame(Vec<u8>),
}

/// Reliable-ordered client over UDP. A connect request is repeated until
/// the server answers or `connect_timeout` elapses.
pub struct UdpClient {
    hub: ClientHub,
    server_addr: String,
    connect_timeout: Duration,
    config: UdpConfig,
    endpoint: RefCell<Option<UdpEndpoint>>,
    session: RefCell<Option<Session>>,
    pending_error: RefCell<Option<NetworkError>>,
    generation: Cell<u64>,
}

impl UdpClient {
    pub fn new(
        server_addr: impl Into<String>,
        connect_timeout: Duration,
        config: UdpConfig,
    ) -> Self {
        Self {
            hub: ClientHub::new(),
            server_addr: server_addr.into(),
            connect_timeout,
            config,
            endpoint: RefCell::new(None),
            session: RefCell::new(None),
            pending_error: RefCell::new(None),
            generation: Cell::new(0),
        }
    }

    pub fn from_config(client: &ClientConfig, udp: &UdpConfig) -> Self {
        Self::new(client.server_addr(), client.connect_timeout(), udp.clone())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.borrow().as_ref().map(UdpEndpoint::local_addr)
    }

    pub fn stats(&self) -> Option<NetworkStats> {
        self.endpoint.borrow().as_ref().map(|e| e.stats().clone())
    }

    fn open(&self) -> io::Result<(UdpEndpoint, Session)> {
        let server = self.server_addr.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} did not resolve to an address", self.server_addr),
            )
        })?;
        let local = if server.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        let mut endpoint = UdpEndpoint::bind(local)?;
        endpoint.set_loss_simulation(self.config.loss_simulation.clone());

        let now = Instant::now();
        let session = Session {
            server,
            salt: rand_u64(),
            channels: PeerChannels::new(),
            started: now,
            last_request: now,
            last_send: now,
            last_receive: now,
        };
        Ok((endpoint, session))
    }

    fn send(&self, session: &Session, kind: DatagramKind) {
        if let Some(endpoint) = self.endpoint.borrow_mut().as_mut() {
            if let Err(e) = endpoint.send_to(&Datagram::new(session.salt, kind), session.server) {
                log::debug!("Send to {} failed: {}", session.server, e);
            }
        }
    }

    fn process(&self, received: Vec<(Datagram, SocketAddr)>) -> Vec<ClientEffect> {
        let mut effects = Vec::new();
        let mut session = self.session.borrow_mut();
        let Some(session) = session.as_mut() else {
            return effects;
        };

        let now = Instant::now();
        let mut accepted = self.hub.connected();
        for (datagram, addr) in received {
            if addr != session.server || datagram.header.salt != session.salt {
                continue;
            }
            session.last_receive = now;

            match datagram.kind {
                DatagramKind::ConnectAccepted { client_id } => {
                    if !accepted {
                        accepted = true;
                        effects.push(ClientEffect::Accepted(client_id));
                    }
                }
                DatagramKind::ConnectDenied { reason } => {
                    effects.push(ClientEffect::Denied(reason));
                }
                DatagramKind::Disconnect => effects.push(ClientEffect::Closed),
                // Not acknowledged until the handshake completes or while the
                // channel cannot hold it; the server resends.
                DatagramKind::Payload {
                    channel,
                    sequence,
                    frame,
                } if accepted => {
                    let Some(ready) = session.channels.on_payload(channel, sequence, frame) else {
                        continue;
                    };
                    self.send(session, DatagramKind::Ack { channel, sequence });
                    session.last_send = now;
                    effects.extend(ready.into_iter().map(ClientEffect::Frame));
                }
                DatagramKind::Ack { channel, sequence } => {
                    session.channels.on_ack(channel, sequence, now);
                }
                _ => {}
            }
        }
        effects
    }

    /// Handshake retries, resends, keepalives and the idle timeout.
    fn maintain(&self) -> Option<NetworkError> {
        let now = Instant::now();
        let mut session = self.session.borrow_mut();
        let session = session.as_mut()?;

        match self.hub.state() {
            ConnectionState::Connecting => {
                if now.duration_since(session.started) > self.connect_timeout {
                    return Some(NetworkError::transport(
                        CONNECTION_TIMED_OUT,
                        format!("no answer from {}", session.server),
                    ));
                }
                if now.duration_since(session.last_request) >= CONNECT_RETRY_INTERVAL {
                    self.send(session, DatagramKind::ConnectRequest);
                    session.last_request = now;
                }
            }
            ConnectionState::Connected => {
                if now.duration_since(session.last_receive) > self.config.connection_timeout() {
                    return Some(NetworkError::transport(
                        CONNECTION_TIMED_OUT,
                        format!("{} stopped responding", session.server),
                    ));
                }
                for (channel, sequence, frame) in
                    session.channels.resends(now, self.config.resend_interval())
                {
                    if let Some(endpoint) = self.endpoint.borrow_mut().as_mut() {
                        endpoint.record_resend();
                    }
                    self.send(
                        session,
                        DatagramKind::Payload {
                            channel,
                            sequence,
                            frame,
                        },
                    );
                    session.last_send = now;
                }
                if now.duration_since(session.last_send) >= self.config.keepalive_interval() {
                    self.send(session, DatagramKind::KeepAlive);
                    session.last_send = now;
                }
            }
            ConnectionState::Disconnected => {}
        }

        if let Some(endpoint) = self.endpoint.borrow_mut().as_mut() {
            if let Err(e) = endpoint.flush_delayed() {
                log::debug!("Flushing delayed datagrams failed: {}", e);
            }
        }
        None
    }

    /// Tears the session down. `notify_server` sends a best-effort `Disconnect`.
    fn close(&self, reason: Option<NetworkError>, notify_server: bool) {
        let was_connecting = self.hub.state() == ConnectionState::Connecting;
        if let Some(session) = self.session.borrow_mut().take() {
            if notify_server {
                self.send(&session, DatagramKind::Disconnect);
            }
        }
        self.endpoint.borrow_mut().take();
        self.pending_error.borrow_mut().take();
        self.generation.set(self.generation.get() + 1);

        self.hub.notify_disconnected();
        match reason {
            Some(err) => self.hub.notify_error(err),
            None if was_connecting => self.hub.notify_error(NetworkError::transport(
                CONNECTION_REFUSED,
                "server closed the session during handshake",
            )),
            None => {}
        }
    }
}

impl MessageSink for UdpClient {
    fn transmit(&self, data: &MessageData, frame: Vec<u8>) -> Result<(), UsageError> {
        self.hub.check_connected()?;
        if frame.len() > MAX_FRAME_SIZE {
            return Err(UsageError::PayloadTooLarge {
                size: frame.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        let mut session = self.session.borrow_mut();
        let session = session.as_mut().ok_or(UsageError::NotConnected)?;
        let now = Instant::now();
        let Some(sequence) = session.channels.queue(data.channel, frame.clone(), now) else {
            log::warn!(
                "{} stopped acknowledging channel {}",
                session.server,
                data.channel
            );
            let mut pending = self.pending_error.borrow_mut();
            if pending.is_none() {
                *pending = Some(NetworkError::transport(
                    SEND_QUEUE_FULL,
                    format!("too many unacknowledged frames on channel {}", data.channel),
                ));
            }
            return Ok(());
        };
        session.last_send = now;
        self.send(
            session,
            DatagramKind::Payload {
                channel: data.channel,
                sequence,
                frame,
            },
        );
        Ok(())
    }
}

impl Updateable for UdpClient {
    fn update(&self, _dt: Duration) {
        let pending = self.pending_error.borrow_mut().take();
        if let Some(err) = pending {
            self.close(Some(err), true);
            return;
        }

        let result = self.endpoint.borrow_mut().as_mut().map(UdpEndpoint::receive);
        let received = match result {
            Some(Ok(received)) => received,
            Some(Err(e)) => {
                self.close(Some(e.into()), false);
                return;
            }
            None => return,
        };

        let generation = self.generation.get();
        for effect in self.process(received) {
            if self.generation.get() != generation {
                return;
            }
            match effect {
                ClientEffect::Accepted(client_id) => self.hub.notify_connected(client_id),
                ClientEffect::Denied(reason) => {
                    log::warn!("Connection to {} denied: {}", self.server_addr, reason);
                    self.close(Some(NetworkError::transport(SERVER_FULL, reason)), false);
                    return;
                }
                ClientEffect::Closed => {
                    self.close(None, false);
                    return;
                }
                ClientEffect::Frame(bytes) => {
                    if self.hub.handle_bytes(&bytes) == FrameAction::Disconnect {
                        self.close(None, true);
                        return;
                    }
                }
            }
        }
        if self.generation.get() != generation {
            return;
        }

        if let Some(err) = self.maintain() {
            log::warn!("{}", err);
            self.close(Some(err), true);
        }
    }
}

impl NetworkClient for UdpClient {
    fn connect(&self) {
        if self.hub.state() != ConnectionState::Disconnected {
            return;
        }
        self.hub.begin_connecting();

        match self.open() {
            Ok((endpoint, session)) => {
                log::debug!(
                    "Requesting session with {} from {}",
                    session.server,
                    endpoint.local_addr()
                );
                *self.endpoint.borrow_mut() = Some(endpoint);
                self.send(&session, DatagramKind::ConnectRequest);
                *self.session.borrow_mut() = Some(session);
            }
            Err(e) => {
                log::warn!("Failed to open UDP session to {}: {}", self.server_addr, e);
                *self.pending_error.borrow_mut() = Some(e.into());
            }
        }
    }

    fn disconnect(&self) {
        if self.hub.state() == ConnectionState::Disconnected {
            return;
        }

        if let Some(session) = self.session.borrow_mut().take() {
            self.send(&session, DatagramKind::Disconnect);
        }
        self.endpoint.borrow_mut().take();
        self.pending_error.borrow_mut().take();
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

    fn latency(&self) -> Option<Duration> {
        self.session
            .borrow()
            .as_ref()
            .and_then(|session| session.channels.latency())
    }
}
