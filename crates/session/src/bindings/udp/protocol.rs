use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize, rancor};

pub const MAX_DATAGRAM_SIZE: usize = 1200;
/// Room left for the datagram envelope around an encoded frame.
pub const MAX_FRAME_SIZE: usize = MAX_DATAGRAM_SIZE - 64;
pub const PROTOCOL_VERSION: u32 = 1;
pub const PROTOCOL_MAGIC: u32 = 0x4E53_5544;

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct DatagramHeader {
    pub magic: u32,
    pub version: u32,
    /// Chosen by the client per connection attempt; datagrams carrying a
    /// different salt belong to another session and are ignored.
    pub salt: u64,
}

impl DatagramHeader {
    pub fn new(salt: u64) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            salt,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == PROTOCOL_MAGIC && self.version == PROTOCOL_VERSION
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum DatagramKind {
    ConnectRequest,
    ConnectAccepted {
        client_id: u8,
    },
    ConnectDenied {
        reason: String,
    },
    Disconnect,
    KeepAlive,
    /// One encoded frame, sequenced within its channel.
    Payload {
        channel: i32,
        sequence: u32,
        frame: Vec<u8>,
    },
    Ack {
        channel: i32,
        sequence: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Datagram {
    pub header: DatagramHeader,
    pub kind: DatagramKind,
}

#[derive(Debug, thiserror::Error)]
pub enum DatagramError {
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
    #[error("datagram of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },
}

impl Datagram {
    pub fn new(salt: u64, kind: DatagramKind) -> Self {
        Self {
            header: DatagramHeader::new(salt),
            kind,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, DatagramError> {
        let bytes = rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(DatagramError::Serialize)?;

        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(DatagramError::TooLarge {
                size: bytes.len(),
                max: MAX_DATAGRAM_SIZE,
            });
        }
        Ok(bytes)
    }

    /// Validates and decodes a received datagram. The bytes are copied into an
    /// aligned buffer first since socket buffers carry no alignment guarantee.
    pub fn deserialize(data: &[u8]) -> Result<Self, DatagramError> {
        let mut aligned = AlignedVec::<16>::with_capacity(data.len());
        aligned.extend_from_slice(data);
        rkyv::from_bytes::<Self, rancor::Error>(&aligned).map_err(DatagramError::Deserialize)
    }
}
