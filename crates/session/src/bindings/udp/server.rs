use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use super::endpoint::{NetworkStats, UdpEndpoint};
use super::protocol::{Datagram, DatagramKind, MAX_FRAME_SIZE};
use super::reliability::PeerChannels;
use crate::client::FrameAction;
use crate::config::{ServerConfig, UdpConfig};
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::{NetworkError, SEND_QUEUE_FULL, UsageError};
use crate::message::{
    ClientId, ControlFrame, MessageData, MessageReceiver, MessageSink, NetworkMessage,
    check_application_type,
};
use crate::scheduler::Updateable;
use crate::server::{NetworkServer, ServerDelegate, ServerHub};

#[derive(Debug)]
struct UdpPeer {
    salt: u64,
    channels: PeerChannels,
    last_send: Instant,
    /// Set when a channel hit its unacknowledged-frame limit.
    stalled: bool,
}

enum ServerEffect {
    Connected(ClientId),
    Frame(ClientId, Vec<u8>),
    Disconnected(ClientId),
}

pub struct UdpServer {
    hub: ServerHub,
    bind_addr: String,
    config: UdpConfig,
    endpoint: RefCell<Option<UdpEndpoint>>,
    connections: RefCell<ConnectionManager<SocketAddr, UdpPeer>>,
}

impl UdpServer {
    pub fn new(bind_addr: impl Into<String>, max_clients: usize, config: UdpConfig) -> Self {
        Self {
            hub: ServerHub::new(),
            bind_addr: bind_addr.into(),
            config,
            endpoint: RefCell::new(None),
            connections: RefCell::new(ConnectionManager::new(max_clients)),
        }
    }

    pub fn from_config(server: &ServerConfig, udp: &UdpConfig) -> Self {
        Self::new(server.bind_addr(), server.max_clients, udp.clone())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.borrow().as_ref().map(UdpEndpoint::local_addr)
    }

    pub fn stats(&self) -> Option<NetworkStats> {
        self.endpoint.borrow().as_ref().map(|e| e.stats().clone())
    }

    fn send(&self, addr: SocketAddr, datagram: &Datagram) {
        if let Some(endpoint) = self.endpoint.borrow_mut().as_mut() {
            if let Err(e) = endpoint.send_to(datagram, addr) {
                log::debug!("Send to {} failed: {}", addr, e);
            }
        }
    }

    fn process(&self, datagram: Datagram, addr: SocketAddr, effects: &mut Vec<ServerEffect>) {
        let salt = datagram.header.salt;
        if datagram.kind == DatagramKind::ConnectRequest {
            self.on_connect_request(addr, salt, effects);
            return;
        }

        let now = Instant::now();
        let mut connections = self.connections.borrow_mut();
        let Some(conn) = connections.get_by_key_mut(&addr) else {
            return;
        };
        if conn.handle.salt != salt {
            return;
        }
        conn.touch();
        let client_id = conn.client_id;

        match datagram.kind {
            DatagramKind::Disconnect => {
                connections.remove(client_id);
                effects.push(ServerEffect::Disconnected(client_id));
            }
            DatagramKind::Payload {
                channel,
                sequence,
                frame,
            } => {
                let Some(ready) = conn.handle.channels.on_payload(channel, sequence, frame) else {
                    return;
                };
                self.send(addr, &Datagram::new(salt, DatagramKind::Ack { channel, sequence }));
                conn.handle.last_send = now;
                for frame in ready {
                    effects.push(ServerEffect::Frame(client_id, frame));
                }
            }
            DatagramKind::Ack { channel, sequence } => {
                conn.handle.channels.on_ack(channel, sequence, now);
            }
            DatagramKind::KeepAlive
            | DatagramKind::ConnectRequest
            | DatagramKind::ConnectAccepted { .. }
            | DatagramKind::ConnectDenied { .. } => {}
        }
    }

    fn on_connect_request(&self, addr: SocketAddr, salt: u64, effects: &mut Vec<ServerEffect>) {
        let mut connections = self.connections.borrow_mut();

        if let Some(conn) = connections.get_by_key_mut(&addr) {
            if conn.handle.salt == salt {
                // The accept was lost; repeat it.
                conn.touch();
                let client_id = conn.client_id;
                self.send(addr, &Datagram::new(salt, DatagramKind::ConnectAccepted { client_id }));
                return;
            }
            if let Some(stale) = connections.remove_by_key(&addr) {
                log::debug!("Client {} reconnected from {}", stale.client_id, addr);
                effects.push(ServerEffect::Disconnected(stale.client_id));
            }
        }

        if let Err(err) = connections.check_capacity() {
            log::warn!("Connection denied to {}: {}", addr, err);
            self.send(
                addr,
                &Datagram::new(
                    salt,
                    DatagramKind::ConnectDenied {
                        reason: err.to_string(),
                    },
                ),
            );
            return;
        }

        let peer = UdpPeer {
            salt,
            channels: PeerChannels::new(),
            last_send: Instant::now(),
            stalled: false,
        };
        let Ok(client_id) = connections.accept(addr, peer) else {
            return;
        };
        if let Some(conn) = connections.get_mut(client_id) {
            conn.state = ConnectionState::Connected;
        }

        log::debug!("Accepted {} as client {}", addr, client_id);
        self.send(addr, &Datagram::new(salt, DatagramKind::ConnectAccepted { client_id }));
        effects.push(ServerEffect::Connected(client_id));
    }

    fn apply(&self, effects: Vec<ServerEffect>) {
        for effect in effects {
            if !self.hub.running() {
                return;
            }
            match effect {
                ServerEffect::Connected(client_id) => {
                    if self.connections.borrow().get(client_id).is_some() {
                        self.hub.notify_client_connected(client_id);
                    }
                }
                ServerEffect::Frame(client_id, bytes) => {
                    if self.connections.borrow().get(client_id).is_none() {
                        continue;
                    }
                    if self.hub.handle_bytes(client_id, &bytes) == FrameAction::Disconnect {
                        self.drop_connection(client_id);
                    }
                }
                ServerEffect::Disconnected(client_id) => {
                    self.hub.notify_client_disconnected(client_id);
                }
            }
        }
    }

    fn maintain(&self) {
        let stalled: Vec<ClientId> = self
            .connections
            .borrow()
            .iter()
            .filter(|conn| conn.handle.stalled)
            .map(|conn| conn.client_id)
            .collect();
        for client_id in stalled {
            log::warn!("Client {} stopped acknowledging, dropping it", client_id);
            self.drop_connection(client_id);
            self.hub.notify_error(NetworkError::transport(
                SEND_QUEUE_FULL,
                format!("client {} has too many unacknowledged frames", client_id),
            ));
            if !self.hub.running() {
                return;
            }
        }

        let timed_out = self
            .connections
            .borrow_mut()
            .cleanup_timed_out(self.config.connection_timeout());
        for conn in timed_out {
            log::info!("Client {} timed out", conn.client_id);
            self.hub.notify_client_disconnected(conn.client_id);
        }

        let now = Instant::now();
        let mut endpoint = self.endpoint.borrow_mut();
        let Some(endpoint) = endpoint.as_mut() else {
            return;
        };

        for conn in self.connections.borrow_mut().iter_mut() {
            let addr = conn.key;
            let salt = conn.handle.salt;
            for (channel, sequence, frame) in conn
                .handle
                .channels
                .resends(now, self.config.resend_interval())
            {
                let datagram = Datagram::new(
                    salt,
                    DatagramKind::Payload {
                        channel,
                        sequence,
                        frame,
                    },
                );
                endpoint.record_resend();
                if let Err(e) = endpoint.send_to(&datagram, addr) {
                    log::debug!("Resend to {} failed: {}", addr, e);
                }
                conn.handle.last_send = now;
            }

            if now.duration_since(conn.handle.last_send) >= self.config.keepalive_interval() {
                let _ = endpoint.send_to(&Datagram::new(salt, DatagramKind::KeepAlive), addr);
                conn.handle.last_send = now;
            }
        }

        if let Err(e) = endpoint.flush_delayed() {
            log::debug!("Flushing delayed datagrams failed: {}", e);
        }
    }

    fn drop_connection(&self, client_id: ClientId) {
        let removed = self.connections.borrow_mut().remove(client_id);
        if let Some(conn) = removed {
            self.send(
                conn.key,
                &Datagram::new(conn.handle.salt, DatagramKind::Disconnect),
            );
            self.hub.notify_client_disconnected(client_id);
        }
    }

    fn send_frame(
        &self,
        destination: Option<ClientId>,
        channel: i32,
        frame: &[u8],
    ) -> Result<(), UsageError> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(UsageError::PayloadTooLarge {
                size: frame.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        let now = Instant::now();
        let mut connections = self.connections.borrow_mut();
        for conn in connections.iter_mut() {
            let selected = destination.is_none_or(|id| id == conn.client_id);
            if !selected || !conn.is_connected() {
                continue;
            }
            let Some(sequence) = conn.handle.channels.queue(channel, frame.to_vec(), now) else {
                conn.handle.stalled = true;
                continue;
            };
            conn.handle.last_send = now;
            self.send(
                conn.key,
                &Datagram::new(
                    conn.handle.salt,
                    DatagramKind::Payload {
                        channel,
                        sequence,
                        frame: frame.to_vec(),
                    },
                ),
            );
        }
        Ok(())
    }
}

impl MessageSink for UdpServer {
    fn transmit(&self, data: &MessageData, frame: Vec<u8>) -> Result<(), UsageError> {
        self.hub.check_running()?;
        self.send_frame(data.client_id, data.channel, &frame)
    }
}

impl Updateable for UdpServer {
    fn update(&self, _dt: Duration) {
        if !self.hub.running() {
            return;
        }

        let result = self.endpoint.borrow_mut().as_mut().map(UdpEndpoint::receive);
        let received = match result {
            Some(Ok(received)) => received,
            Some(Err(e)) => {
                self.hub.notify_error(e.into());
                return;
            }
            None => return,
        };

        let mut effects = Vec::new();
        for (datagram, addr) in received {
            self.process(datagram, addr, &mut effects);
        }
        self.apply(effects);

        if self.hub.running() {
            self.maintain();
        }
    }
}

impl NetworkServer for UdpServer {
    fn start(&self) {
        if self.hub.running() {
            return;
        }

        let mut endpoint = match UdpEndpoint::bind(&self.bind_addr) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                log::warn!("Failed to bind {}: {}", self.bind_addr, e);
                self.hub.notify_error(e.into());
                return;
            }
        };
        endpoint.set_loss_simulation(self.config.loss_simulation.clone());

        log::info!("UDP server listening on {}", endpoint.local_addr());
        *self.endpoint.borrow_mut() = Some(endpoint);
        self.hub.notify_started();
    }

    fn stop(&self) {
        if !self.hub.running() {
            return;
        }

        let closed = self.connections.borrow_mut().drain();
        for conn in &closed {
            self.send(
                conn.key,
                &Datagram::new(conn.handle.salt, DatagramKind::Disconnect),
            );
        }
        self.endpoint.borrow_mut().take();

        log::info!("UDP server stopped");
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
        if let Err(e) = self.send_frame(None, 0, &frame) {
            log::warn!("Failed to broadcast error: {}", e);
        }
    }

    fn latency(&self, client_id: ClientId) -> Option<Duration> {
        self.connections
            .borrow()
            .get(client_id)
            .and_then(|conn| conn.handle.channels.latency())
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::rc::Weak;
    use std::thread;

    use super::*;
    use crate::bindings::udp::{MAX_IN_FLIGHT, UdpClient};
    use crate::client::NetworkClient;

    #[derive(Default)]
    struct Events {
        server: RefCell<Weak<UdpServer>>,
        stop_on_error: bool,
        disconnected: RefCell<Vec<ClientId>>,
        errors: RefCell<Vec<NetworkError>>,
    }

    impl ServerDelegate for Events {
        fn on_client_disconnected(&self, client_id: ClientId) {
            self.disconnected.borrow_mut().push(client_id);
        }

        fn on_error(&self, error: &NetworkError) {
            self.errors.borrow_mut().push(error.clone());
            if self.stop_on_error {
                if let Some(server) = self.server.borrow().upgrade() {
                    server.stop();
                }
            }
        }
    }

    fn running_server(stop_on_error: bool) -> (Rc<UdpServer>, Rc<Events>) {
        let server = Rc::new(UdpServer::new("127.0.0.1:0", 4, UdpConfig::default()));
        let events = Rc::new(Events {
            server: RefCell::new(Rc::downgrade(&server)),
            stop_on_error,
            ..Default::default()
        });
        server.add_delegate(events.clone());
        server.start();
        assert!(server.running());
        (server, events)
    }

    #[test]
    fn delegate_may_stop_server_on_receive_error() {
        let (server, events) = running_server(true);
        server
            .endpoint
            .borrow_mut()
            .as_mut()
            .unwrap()
            .inject_receive_error(io::Error::other("socket gone"));

        server.update(Duration::ZERO);

        assert_eq!(events.errors.borrow().len(), 1);
        assert!(!server.running());
        assert!(server.local_addr().is_none());
    }

    #[test]
    fn client_that_stops_acknowledging_is_dropped() {
        let (server, events) = running_server(false);
        let addr = server.local_addr().unwrap().to_string();
        let client = UdpClient::new(addr, Duration::from_secs(5), UdpConfig::default());
        client.connect();
        let started = Instant::now();
        while !client.connected() && started.elapsed() < Duration::from_secs(5) {
            server.update(Duration::ZERO);
            client.update(Duration::ZERO);
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(server.connected_clients(), vec![1]);

        // The client is not updated again, so nothing gets acknowledged.
        let data = MessageData::new(10).to_client(1);
        for _ in 0..=MAX_IN_FLIGHT {
            server.transmit(&data, vec![0; 8]).unwrap();
        }
        server.update(Duration::ZERO);

        assert!(server.connected_clients().is_empty());
        assert_eq!(*events.disconnected.borrow(), vec![1]);
        assert_eq!(events.errors.borrow()[0].code(), SEND_QUEUE_FULL);
        assert!(server.running());
    }
}
