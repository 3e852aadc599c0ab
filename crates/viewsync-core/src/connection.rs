//! One framed TCP connection to another viewer instance
//!
//! Each connection splits into a reader task and a writer task as soon as
//! it is admitted; the manager only ever talks to the [`ConnectionHandle`].
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  ConnectionHandle (owned by the manager)                        │
//! │  ├── send() ─▶ unbounded queue ─▶ writer task ─▶ FramedWrite    │
//! │  └── close() ─ drops the queue, aborts the reader, and hands    │
//! │                back the writer task (drains, then FIN)          │
//! │                                                                 │
//! │  reader task: FramedRead ─▶ ConnectionEvent::Message            │
//! │               stream end / framing error ─▶ ConnectionEvent::   │
//! │               Closed (exactly once)                             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Framing errors are terminal: the reader logs them and closes rather
//! than trying to resynchronize a corrupted byte stream.

use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, warn};

use crate::protocol::{FrameCodec, Message};

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// Accepted by our server
    Inbound,
    /// Dialed by us
    Outbound,
}

impl std::fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionRole::Inbound => write!(f, "inbound"),
            ConnectionRole::Outbound => write!(f, "outbound"),
        }
    }
}

/// What a connection reports back to the manager
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A decoded message arrived
    Message { conn_id: u16, message: Message },
    /// The connection ended; sent exactly once per connection
    Closed { conn_id: u16 },
}

/// Manager-side handle to a running connection
#[derive(Debug)]
pub struct ConnectionHandle {
    id: u16,
    remote: SocketAddr,
    role: ConnectionRole,
    tx: Option<mpsc::UnboundedSender<Message>>,
    reader: JoinHandle<()>,
    writer: Option<JoinHandle<()>>,
}

impl ConnectionHandle {
    /// Queue a message for sending. Messages to a dead connection are
    /// dropped with a debug log; the Closed event is already on its way.
    pub fn send(&self, message: Message) {
        let kind = message.kind_name();
        match &self.tx {
            Some(tx) => {
                if tx.send(message).is_err() {
                    debug!(conn_id = self.id, kind, "Dropping message, writer gone");
                }
            }
            None => {
                debug!(conn_id = self.id, kind, "Dropping message, connection closing");
            }
        }
    }

    /// Close the connection. Queued messages still flush before the
    /// socket shuts down, so a goodbye sent just before this call makes
    /// it onto the wire; the returned writer handle completes once it
    /// has.
    pub fn close(&mut self) -> Option<JoinHandle<()>> {
        self.tx = None;
        self.reader.abort();
        self.writer.take()
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.reader.abort();
        // The writer ends on its own once the queue sender is gone.
    }
}

/// Split a stream into reader and writer tasks and hand back the handle.
pub fn spawn_connection(
    id: u16,
    stream: TcpStream,
    remote: SocketAddr,
    role: ConnectionRole,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) -> ConnectionHandle {
    // Transforms and positions are latency sensitive.
    if let Err(e) = stream.set_nodelay(true) {
        debug!(conn_id = id, error = %e, "Could not set TCP_NODELAY");
    }

    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();

    // The writer drains the queue and exits once the sender side is
    // gone; its handle lets shutdown await that last flush.
    let writer = tokio::spawn(write_loop(id, write_half, rx));
    let reader = tokio::spawn(read_loop(id, read_half, events));

    trace!(conn_id = id, %remote, %role, "Connection tasks started");

    ConnectionHandle {
        id,
        remote,
        role,
        tx: Some(tx),
        reader,
        writer: Some(writer),
    }
}

async fn read_loop(
    id: u16,
    read_half: OwnedReadHalf,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    let mut frames = FramedRead::new(read_half, FrameCodec::new());
    while let Some(next) = frames.next().await {
        match next {
            Ok(message) => {
                trace!(conn_id = id, kind = message.kind_name(), "Received message");
                let forwarded = events.send(ConnectionEvent::Message {
                    conn_id: id,
                    message,
                });
                if forwarded.is_err() {
                    // Manager is gone, nobody cares about Closed either.
                    return;
                }
            }
            Err(e) => {
                warn!(conn_id = id, error = %e, "Closing connection after framing error");
                break;
            }
        }
    }
    let _ = events.send(ConnectionEvent::Closed { conn_id: id });
}

async fn write_loop(
    id: u16,
    write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    let mut frames = FramedWrite::new(write_half, FrameCodec::new());
    while let Some(message) = rx.recv().await {
        if let Err(e) = frames.send(message).await {
            debug!(conn_id = id, error = %e, "Write failed, dropping outbound queue");
            return;
        }
    }
    // Queue sender dropped: flush and send FIN.
    let _ = frames.close().await;
}
