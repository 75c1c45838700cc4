//! Transport-independent framing.
//!
//! Format: `[type: u8][channel: i32][payload_len: u32][payload]`, little endian.
//! Types `0..=HIGHEST_RESERVED_TYPE` are control frames owned by the bindings.

use super::{ClientId, Reader, Writer};
use crate::error::ProtocolError;

pub const MSG_CONNECT: u8 = 0;
pub const MSG_DISCONNECT: u8 = 1;
pub const MSG_ERROR: u8 = 2;
pub const HIGHEST_RESERVED_TYPE: u8 = MSG_ERROR;
/// First message type available to applications.
pub const FIRST_APPLICATION_TYPE: u8 = HIGHEST_RESERVED_TYPE + 1;

pub const FRAME_HEADER_SIZE: usize = 9;
/// Largest payload a stream transport accepts before treating the stream as desynchronized.
pub const MAX_FRAME_PAYLOAD: usize = 1024 * 1024;

#[inline]
pub fn is_reserved(message_type: u8) -> bool {
    message_type <= HIGHEST_RESERVED_TYPE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub message_type: u8,
    pub channel: i32,
    pub payload_len: usize,
}

impl FrameHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = Reader::new(bytes);
        let message_type = reader.read_u8()?;
        let channel = reader.read_i32()?;
        let payload_len = reader.read_u32()? as usize;

        if payload_len > MAX_FRAME_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_FRAME_PAYLOAD,
            });
        }

        Ok(Self {
            message_type,
            channel,
            payload_len,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: u8,
    pub channel: i32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn encode(message_type: u8, channel: i32, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        out.push(message_type);
        out.extend_from_slice(&channel.to_le_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        Self::encode(self.message_type, self.channel, &self.payload)
    }

    /// Decodes exactly one frame; the slice must not carry trailing bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                needed: FRAME_HEADER_SIZE,
                available: bytes.len(),
            });
        }

        let header = FrameHeader::parse(&bytes[..FRAME_HEADER_SIZE])?;
        let actual = bytes.len() - FRAME_HEADER_SIZE;
        if actual != header.payload_len {
            return Err(ProtocolError::FrameLength {
                declared: header.payload_len,
                actual,
            });
        }

        Ok(Self {
            message_type: header.message_type,
            channel: header.channel,
            payload: bytes[FRAME_HEADER_SIZE..].to_vec(),
        })
    }

    pub fn is_control(&self) -> bool {
        is_reserved(self.message_type)
    }
}

/// Payload of a reserved frame type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    Connect { client_id: ClientId },
    Disconnect,
    Error { code: i32, message: String },
}

impl ControlFrame {
    pub fn message_type(&self) -> u8 {
        match self {
            Self::Connect { .. } => MSG_CONNECT,
            Self::Disconnect => MSG_DISCONNECT,
            Self::Error { .. } => MSG_ERROR,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = Writer::new();
        match self {
            Self::Connect { client_id } => {
                writer.write_u8(*client_id);
            }
            Self::Disconnect => {}
            Self::Error { code, message } => {
                writer.write_i32(*code).write_string(message);
            }
        }
        Frame::encode(self.message_type(), 0, writer.as_bytes())
    }

    pub fn parse(frame: &Frame) -> Result<Self, ProtocolError> {
        let malformed = ProtocolError::MalformedControl {
            message_type: frame.message_type,
        };
        let mut reader = Reader::new(&frame.payload);

        let control = match frame.message_type {
            MSG_CONNECT => Self::Connect {
                client_id: reader.read_u8().map_err(|_| malformed.clone())?,
            },
            MSG_DISCONNECT => Self::Disconnect,
            MSG_ERROR => {
                let code = reader.read_i32().map_err(|_| malformed.clone())?;
                let message = reader.read_string().map_err(|_| malformed.clone())?;
                Self::Error { code, message }
            }
            _ => return Err(malformed),
        };

        if !reader.is_empty() {
            return Err(malformed);
        }
        Ok(control)
    }
}

/// Reassembles frames from a byte stream.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Returns the next complete frame. An error means the stream can no
    /// longer be trusted to be aligned on frame boundaries.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if self.buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let header = FrameHeader::parse(&self.buf[..FRAME_HEADER_SIZE])?;
        let total = FRAME_HEADER_SIZE + header.payload_len;
        if self.buf.len() < total {
            return Ok(None);
        }

        let payload = self.buf[FRAME_HEADER_SIZE..total].to_vec();
        self.buf.drain(..total);

        Ok(Some(Frame {
            message_type: header.message_type,
            channel: header.channel,
            payload,
        }))
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
