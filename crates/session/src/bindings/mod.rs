//! Concrete transports. Every binding implements [`NetworkClient`](crate::NetworkClient)
//! and [`NetworkServer`](crate::NetworkServer) over its own wire.

pub mod local;
pub mod tcp;
pub mod tokio_tcp;
pub mod udp;

pub use local::{LocalClient, LocalServer};
pub use tcp::{TcpClient, TcpServer};
pub use tokio_tcp::{TokioClient, TokioServer, TransportRuntime};
pub use udp::{UdpClient, UdpServer};
