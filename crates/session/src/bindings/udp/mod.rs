//! Reliable-ordered transport over UDP.
//!
//! Every frame travels in a [`Datagram`] tagged with its channel and a
//! per-channel sequence number. Receivers acknowledge each payload and
//! release frames strictly in sequence; senders retransmit anything left
//! unacknowledged for longer than the smoothed retransmission timeout.

mod client;
mod endpoint;
mod protocol;
mod reliability;
mod server;
mod simulator;

pub use client::UdpClient;
pub use endpoint::{NetworkStats, UdpEndpoint};
pub use protocol::{
    Datagram, DatagramError, DatagramHeader, DatagramKind, MAX_DATAGRAM_SIZE, MAX_FRAME_SIZE,
    sequence_greater_than,
};
pub use reliability::{
    MAX_BUFFERED, MAX_IN_FLIGHT, PeerChannels, ReliableReceiver, ReliableSender, RttEstimator,
};
pub use server::UdpServer;
pub use simulator::{NetworkSimulator, PacketLossSimulation, XorShift64};
