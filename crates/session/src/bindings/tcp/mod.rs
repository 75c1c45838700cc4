//! Raw TCP over non-blocking `std::net` sockets.

mod client;
mod server;
pub(crate) mod stream;

pub use client::TcpClient;
pub use server::TcpServer;
