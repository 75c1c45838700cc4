use std::cell::{Cell, RefCell};
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use super::stream::{StreamEnd, StreamPeer};
use crate::client::{ClientDelegate, ClientHub, FrameAction, NetworkClient};
use crate::config::ClientConfig;
use crate::connection::ConnectionState;
use crate::error::{CONNECTION_REFUSED, CONNECTION_TIMED_OUT, NetworkError, UsageError};
use crate::message::{
    ClientId, ControlFrame, MessageData, MessageReceiver, MessageSink, NetworkMessage,
    check_application_type,
};
use crate::scheduler::Updateable;

/// Progress of an outgoing connection before the stream exists.
enum Dial {
    Idle,
    Start,
    /// Hostname lookup running on a helper thread.
    Resolving(Receiver<io::Result<SocketAddr>>),
    /// Non-blocking connect waiting for the socket to become writable.
    Connecting(Socket),
}

/// TCP client. The socket is opened without blocking over the updates after
/// `connect`; the connection counts as established once the server's
/// `Connect` frame assigns an id. Dialing plus handshake may take at most
/// `connect_timeout` of summed update time.
pub struct TcpClient {
    hub: ClientHub,
    server_addr: String,
    connect_timeout: Duration,
    peer: RefCell<Option<StreamPeer>>,
    dial: RefCell<Dial>,
    connect_elapsed: Cell<Duration>,
    generation: Cell<u64>,
}

impl TcpClient {
    pub fn new(server_addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            hub: ClientHub::new(),
            server_addr: server_addr.into(),
            connect_timeout,
            peer: RefCell::new(None),
            dial: RefCell::new(Dial::Idle),
            connect_elapsed: Cell::new(Duration::ZERO),
            generation: Cell::new(0),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.server_addr(), config.connect_timeout())
    }

    /// Literal addresses connect right away; hostnames are looked up off-thread.
    fn start_dial(&self) -> io::Result<Dial> {
        if let Ok(addr) = self.server_addr.parse::<SocketAddr>() {
            return begin_connect(addr).map(Dial::Connecting);
        }

        let (tx, rx) = mpsc::channel();
        let host = self.server_addr.clone();
        thread::Builder::new()
            .name("tcp-resolve".into())
            .spawn(move || {
                let _ = tx.send(resolve(&host));
            })?;
        Ok(Dial::Resolving(rx))
    }

    fn advance_dial(&self) {
        let next = match self.dial.replace(Dial::Idle) {
            Dial::Idle => return,
            Dial::Start => self.start_dial(),
            Dial::Resolving(rx) => match rx.try_recv() {
                Ok(Ok(addr)) => begin_connect(addr).map(Dial::Connecting),
                Ok(Err(e)) => Err(e),
                Err(TryRecvError::Empty) => Ok(Dial::Resolving(rx)),
                Err(TryRecvError::Disconnected) => {
                    Err(io::Error::other("address lookup ended without a result"))
                }
            },
            Dial::Connecting(socket) => match connect_finished(&socket) {
                Ok(true) => StreamPeer::new(TcpStream::from(socket)).map(|peer| {
                    log::debug!("TCP stream open to {}, awaiting handshake", self.server_addr);
                    *self.peer.borrow_mut() = Some(peer);
                    Dial::Idle
                }),
                Ok(false) => Ok(Dial::Connecting(socket)),
                Err(e) => Err(e),
            },
        };

        match next {
            Ok(dial) => *self.dial.borrow_mut() = dial,
            Err(e) => {
                log::warn!("Failed to connect to {}: {}", self.server_addr, e);
                self.close(Some(e.into()));
            }
        }
    }

    /// Tears the connection down and reports it. An attempt that never
    /// completed its handshake is reported as an error, not a disconnect.
    fn close(&self, reason: Option<NetworkError>) {
        let was_connecting = self.hub.state() == ConnectionState::Connecting;
        if let Some(peer) = self.peer.borrow_mut().take() {
            peer.close();
        }
        *self.dial.borrow_mut() = Dial::Idle;
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

    fn poll(&self) {
        let read = self.peer.borrow_mut().as_mut().map(StreamPeer::read_available);
        let Some((frames, end)) = read else {
            return;
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

        if let Some(end) = end {
            if let StreamEnd::Desync(err) = &end {
                log::warn!("Stream from {} desynchronized: {}", self.server_addr, err);
                self.hub.notify_error(err.clone().into());
                self.close(None);
                return;
            }
            self.close(end.into_error());
            return;
        }

        let flushed = self.peer.borrow_mut().as_mut().map(StreamPeer::flush);
        if let Some(Err(end)) = flushed {
            self.close(end.into_error());
        }
    }
}

impl MessageSink for TcpClient {
    fn transmit(&self, _data: &MessageData, frame: Vec<u8>) -> Result<(), UsageError> {
        self.hub.check_connected()?;
        let mut peer = self.peer.borrow_mut();
        let peer = peer.as_mut().ok_or(UsageError::NotConnected)?;
        peer.queue(&frame);
        if let Err(StreamEnd::Io(e)) = peer.flush() {
            log::debug!("Write to {} failed: {}", self.server_addr, e);
        }
        Ok(())
    }
}

impl Updateable for TcpClient {
    fn update(&self, dt: Duration) {
        if self.hub.state() == ConnectionState::Connecting {
            let elapsed = self.connect_elapsed.get() + dt;
            self.connect_elapsed.set(elapsed);
            if elapsed > self.connect_timeout {
                let stage = if self.peer.borrow().is_some() {
                    "handshake"
                } else {
                    "connect"
                };
                self.close(Some(NetworkError::transport(
                    CONNECTION_TIMED_OUT,
                    format!("{} to {} timed out", stage, self.server_addr),
                )));
                return;
            }
        }

        self.advance_dial();
        self.poll();
    }
}

impl NetworkClient for TcpClient {
    fn connect(&self) {
        if self.hub.state() != ConnectionState::Disconnected {
            return;
        }
        self.hub.begin_connecting();
        self.connect_elapsed.set(Duration::ZERO);
        *self.dial.borrow_mut() = Dial::Start;
    }

    fn disconnect(&self) {
        if self.hub.state() == ConnectionState::Disconnected {
            return;
        }

        if let Some(mut peer) = self.peer.borrow_mut().take() {
            peer.queue(&ControlFrame::Disconnect.encode());
            peer.close();
        }
        *self.dial.borrow_mut() = Dial::Idle;
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

fn resolve(host: &str) -> io::Result<SocketAddr> {
    host.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} did not resolve to an address", host),
        )
    })
}

// Stable stand-in for the unstable `io::ErrorKind::InProgress` (EINPROGRESS).
#[cfg(any(target_os = "linux", target_os = "android"))]
const EINPROGRESS: i32 = 115;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
const EINPROGRESS: i32 = 36;
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
)))]
const EINPROGRESS: i32 = 0;

fn begin_connect(addr: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => Ok(socket),
        Err(ref e)
            if e.kind() == io::ErrorKind::WouldBlock
                || (EINPROGRESS != 0 && e.raw_os_error() == Some(EINPROGRESS)) =>
        {
            Ok(socket)
        }
        Err(e) => Err(e),
    }
}

/// `Ok(false)` while the connect is still in flight.
fn connect_finished(socket: &Socket) -> io::Result<bool> {
    if let Some(err) = socket.take_error()? {
        return Err(err);
    }
    match socket.peer_addr() {
        Ok(_) => Ok(true),
        Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
        Err(e) => Err(e),
    }
}
