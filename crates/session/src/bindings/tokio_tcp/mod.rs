//! TCP driven by a background tokio runtime.
//!
//! Socket I/O runs on the runtime's worker threads. Everything the
//! application observes is posted back over unbounded channels and drained
//! by `update()`, so delegates still run on the caller's thread.

mod client;
mod server;

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::runtime::Runtime;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

pub use client::TokioClient;
pub use server::TokioServer;

const READ_CHUNK: usize = 16 * 1024;

/// Shared handle to the runtime that drives socket I/O.
#[derive(Clone)]
pub struct TransportRuntime {
    runtime: Arc<Runtime>,
}

impl TransportRuntime {
    pub fn new() -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("netsession-io")
            .enable_all()
            .build()?;
        Ok(Self {
            runtime: Arc::new(runtime),
        })
    }

    pub(crate) fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(future)
    }
}

impl std::fmt::Debug for TransportRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRuntime").finish_non_exhaustive()
    }
}

enum Outgoing {
    Bytes(Vec<u8>),
    Close,
}

/// Write side of a stream owned by a writer task.
struct StreamWriter {
    outgoing: UnboundedSender<Outgoing>,
}

impl StreamWriter {
    /// Must be called from inside the runtime.
    fn spawn(writer: OwnedWriteHalf) -> Self {
        let (outgoing, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(writer, rx));
        Self { outgoing }
    }

    fn send(&self, bytes: Vec<u8>) {
        let _ = self.outgoing.send(Outgoing::Bytes(bytes));
    }

    /// Writes whatever is queued, then shuts the stream down.
    fn close(&self) {
        let _ = self.outgoing.send(Outgoing::Close);
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: UnboundedReceiver<Outgoing>) {
    while let Some(outgoing) = rx.recv().await {
        match outgoing {
            Outgoing::Bytes(bytes) => {
                if let Err(e) = writer.write_all(&bytes).await {
                    log::debug!("Stream write failed: {}", e);
                    return;
                }
            }
            Outgoing::Close => break,
        }
    }
    let _ = writer.shutdown().await;
}

/// Reads until the peer closes, handing each chunk to `on_bytes`. Returns
/// `None` on a clean close.
async fn read_loop(
    mut reader: OwnedReadHalf,
    mut on_bytes: impl FnMut(Vec<u8>) -> bool,
) -> Option<io::Error> {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => return None,
            Ok(n) => {
                if !on_bytes(buf[..n].to_vec()) {
                    return None;
                }
            }
            Err(e) => return Some(e),
        }
    }
}

fn split(stream: TcpStream) -> (OwnedReadHalf, StreamWriter) {
    let _ = stream.set_nodelay(true);
    let (reader, writer) = stream.into_split();
    (reader, StreamWriter::spawn(writer))
}
