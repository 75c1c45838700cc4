mod frame;
mod reader;
mod writer;

pub use frame::{
    ControlFrame, FIRST_APPLICATION_TYPE, FRAME_HEADER_SIZE, Frame, FrameBuffer, FrameHeader,
    HIGHEST_RESERVED_TYPE, MAX_FRAME_PAYLOAD, MSG_CONNECT, MSG_DISCONNECT, MSG_ERROR, is_reserved,
};
pub use reader::Reader;
pub use writer::Writer;

use crate::error::{ProtocolError, UsageError};

/// Server-assigned peer id, unique among the currently connected clients.
pub type ClientId = u8;

/// Envelope of a message: what it is, which lane it travels on and who gets it.
///
/// On the server `client_id` selects the destination (`None` broadcasts); on a
/// received server-side message it names the sender.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MessageData {
    pub message_type: u8,
    pub channel: i32,
    pub client_id: Option<ClientId>,
}

impl MessageData {
    pub fn new(message_type: u8) -> Self {
        Self {
            message_type,
            channel: 0,
            client_id: None,
        }
    }

    pub fn with_channel(mut self, channel: i32) -> Self {
        self.channel = channel;
        self
    }

    pub fn to_client(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }
}

/// A message delivered by a binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    data: MessageData,
    payload: Vec<u8>,
}

impl ReceivedMessage {
    pub fn new(data: MessageData, payload: Vec<u8>) -> Self {
        Self { data, payload }
    }

    pub(crate) fn from_frame(frame: Frame, client_id: Option<ClientId>) -> Self {
        Self {
            data: MessageData {
                message_type: frame.message_type,
                channel: frame.channel,
                client_id,
            },
            payload: frame.payload,
        }
    }

    pub fn data(&self) -> &MessageData {
        &self.data
    }

    pub fn message_type(&self) -> u8 {
        self.data.message_type
    }

    pub fn channel(&self) -> i32 {
        self.data.channel
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.data.client_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn reader(&self) -> Reader<'_> {
        Reader::new(&self.payload)
    }

    /// Rebuilds a typed value from the start of the payload.
    pub fn decode<T: NetworkDeserialize>(&self) -> Result<T, ProtocolError> {
        T::deserialize(&mut self.reader())
    }
}

/// Binding side of [`NetworkMessage::send`].
pub(crate) trait MessageSink {
    fn transmit(&self, data: &MessageData, frame: Vec<u8>) -> Result<(), UsageError>;
}

/// An outgoing message being built.
///
/// The writer stays available until [`send`](Self::send); afterwards every
/// writer access and any further send fail with [`UsageError::AlreadySent`].
pub struct NetworkMessage<'a> {
    data: MessageData,
    writer: Option<Writer>,
    sink: &'a dyn MessageSink,
}

impl<'a> NetworkMessage<'a> {
    pub(crate) fn new(data: MessageData, sink: &'a dyn MessageSink) -> Self {
        Self {
            data,
            writer: Some(Writer::new()),
            sink,
        }
    }

    pub fn data(&self) -> &MessageData {
        &self.data
    }

    pub fn writer(&mut self) -> Result<&mut Writer, UsageError> {
        self.writer.as_mut().ok_or(UsageError::AlreadySent)
    }

    pub fn is_sent(&self) -> bool {
        self.writer.is_none()
    }

    pub fn send(&mut self) -> Result<(), UsageError> {
        let writer = self.writer.take().ok_or(UsageError::AlreadySent)?;
        let frame = Frame::encode(self.data.message_type, self.data.channel, writer.as_bytes());
        self.sink.transmit(&self.data, frame)
    }
}

impl std::fmt::Debug for NetworkMessage<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkMessage")
            .field("data", &self.data)
            .field("sent", &self.is_sent())
            .finish()
    }
}

/// A value that knows how to write itself into a message payload.
pub trait NetworkShareable {
    fn serialize(&self, writer: &mut Writer);
}

/// Single optional consumer of every application message, called before the delegates.
pub trait MessageReceiver {
    fn on_message_received(&self, data: &MessageData, reader: &mut Reader<'_>);
}

/// A value that can be rebuilt from a received payload.
pub trait NetworkDeserialize: Sized {
    fn deserialize(reader: &mut Reader<'_>) -> Result<Self, ProtocolError>;
}

impl NetworkShareable for String {
    fn serialize(&self, writer: &mut Writer) {
        writer.write_string(self);
    }
}

impl NetworkDeserialize for String {
    fn deserialize(reader: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        reader.read_string()
    }
}

/// Rejects reserved types before a binding builds a message.
pub(crate) fn check_application_type(data: &MessageData) -> Result<(), UsageError> {
    if is_reserved(data.message_type) {
        Err(UsageError::ReservedType(data.message_type))
    } else {
        Ok(())
    }
}
