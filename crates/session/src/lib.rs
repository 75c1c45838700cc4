//! Transport-agnostic client/server messaging.
//!
//! Application code talks to [`NetworkClient`] and [`NetworkServer`] and
//! never learns which wire carries its messages: an in-process loopback,
//! raw TCP, reliable UDP or TCP on a tokio runtime. Everything is driven by
//! the caller's cooperative [`Updateable::update`] tick; delegates fire on
//! that thread only.

pub mod bindings;
pub mod client;
pub mod config;
pub mod connection;
pub mod delegate;
pub mod error;
pub mod factory;
pub mod message;
pub mod scheduler;
pub mod server;
pub mod stats;

pub use client::{ClientDelegate, NetworkClient};
pub use config::{
    ClientConfig, DEFAULT_PORT, HeartbeatConfig, NetworkConfig, Protocol, ServerConfig, UdpConfig,
};
pub use connection::ConnectionState;
pub use error::{NetworkError, ProtocolError, UsageError};
pub use factory::NetworkFactory;
pub use message::{
    ClientId, MessageData, MessageReceiver, NetworkDeserialize, NetworkMessage, NetworkShareable,
    Reader, ReceivedMessage, Writer,
};
pub use scheduler::{FixedTimestep, UpdateScheduler, Updateable};
pub use server::{NetworkServer, ServerDelegate};
pub use stats::{StatsClient, StatsServer};
