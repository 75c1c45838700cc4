//! Heartbeat decorators.
//!
//! [`StatsClient`] and [`StatsServer`] wrap any binding and implement the
//! same contract, so they stack transparently on top of every transport.

mod client;
mod heartbeat;
mod server;

pub use client::StatsClient;
pub use heartbeat::{HeartbeatEvent, HeartbeatPacket, HeartbeatState, HeartbeatTracker};
pub use server::StatsServer;
