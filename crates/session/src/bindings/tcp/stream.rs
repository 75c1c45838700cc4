use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};

use crate::error::{NetworkError, ProtocolError, SEND_QUEUE_FULL};
use crate::message::{Frame, FrameBuffer};

const READ_CHUNK: usize = 16 * 1024;
/// Upper bound on bytes pulled from one socket per update.
const MAX_READ_PER_UPDATE: usize = 1024 * 1024;
/// Unsent bytes a peer may fall behind before its stream is failed.
pub(crate) const MAX_OUTBOUND_BYTES: usize = 8 * 1024 * 1024;

/// Why a stream stopped producing frames.
#[derive(Debug)]
pub(crate) enum StreamEnd {
    Closed,
    Io(io::Error),
    Desync(ProtocolError),
    /// The peer stopped reading and the outbound queue hit its limit.
    Backlogged,
}

impl StreamEnd {
    /// The error to report, if the peer did not simply close the stream.
    pub fn into_error(self) -> Option<NetworkError> {
        match self {
            Self::Closed => None,
            Self::Io(e) => Some(e.into()),
            Self::Desync(err) => Some(err.into()),
            Self::Backlogged => Some(NetworkError::transport(
                SEND_QUEUE_FULL,
                format!("peer fell {} bytes behind", MAX_OUTBOUND_BYTES),
            )),
        }
    }
}

/// A non-blocking framed TCP stream with an outbound queue.
#[derive(Debug)]
pub(crate) struct StreamPeer {
    stream: TcpStream,
    peer_addr: Option<SocketAddr>,
    frames: FrameBuffer,
    outbound: Vec<u8>,
    backlogged: bool,
    read_buf: Box<[u8]>,
}

impl StreamPeer {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr().ok();

        Ok(Self {
            stream,
            peer_addr,
            frames: FrameBuffer::new(),
            outbound: Vec::new(),
            backlogged: false,
            read_buf: vec![0u8; READ_CHUNK].into_boxed_slice(),
        })
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Frames that would push the queue past [`MAX_OUTBOUND_BYTES`] are
    /// discarded and the next [`flush`](Self::flush) fails.
    pub fn queue(&mut self, frame: &[u8]) {
        if self.outbound.len() + frame.len() > MAX_OUTBOUND_BYTES {
            self.backlogged = true;
            return;
        }
        self.outbound.extend_from_slice(frame);
    }

    pub fn pending_bytes(&self) -> usize {
        self.outbound.len()
    }

    /// Writes as much of the outbound queue as the socket accepts right now.
    pub fn flush(&mut self) -> Result<(), StreamEnd> {
        if self.backlogged {
            return Err(StreamEnd::Backlogged);
        }
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => return Err(StreamEnd::Closed),
                Ok(n) => {
                    self.outbound.drain(..n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(StreamEnd::Io(e)),
            }
        }
        Ok(())
    }

    /// Returns every complete frame currently readable. Frames read before the
    /// stream ended are returned alongside the reason it ended.
    pub fn read_available(&mut self) -> (Vec<Frame>, Option<StreamEnd>) {
        let mut end = None;
        let mut total = 0;

        while total < MAX_READ_PER_UPDATE {
            match self.stream.read(&mut self.read_buf) {
                Ok(0) => {
                    end = Some(StreamEnd::Closed);
                    break;
                }
                Ok(n) => {
                    self.frames.extend(&self.read_buf[..n]);
                    total += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    end = Some(StreamEnd::Io(e));
                    break;
                }
            }
        }

        let mut frames = Vec::new();
        loop {
            match self.frames.next_frame() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(err) => {
                    end = Some(StreamEnd::Desync(err));
                    break;
                }
            }
        }

        (frames, end)
    }

    /// Best-effort flush followed by a write shutdown.
    pub fn close(mut self) {
        let _ = self.flush();
        let _ = self.stream.shutdown(Shutdown::Write);
    }
}
