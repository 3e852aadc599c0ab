//! TCP server feeding accepted sockets to the manager
//!
//! Two binding modes, one per manager family:
//!
//! - local: scan the loopback port range and take the first free port, so
//!   every instance on the machine ends up on a predictable port its
//!   siblings can probe
//! - LAN: bind one configured port on all interfaces (zero for an
//!   ephemeral port, which discovery then advertises)
//!
//! The accept loop only hands sockets over; admitting a connection is the
//! manager's call.

use std::net::{Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};

/// A socket accepted by the server, not yet admitted by the manager
#[derive(Debug)]
pub struct AcceptedConnection {
    pub stream: TcpStream,
    pub remote: SocketAddr,
}

/// A listening TCP server with a running accept loop
#[derive(Debug)]
pub struct SessionServer {
    port: u16,
    task: JoinHandle<()>,
}

impl SessionServer {
    /// Bind the first free loopback port in the range.
    pub async fn bind_local(
        range: RangeInclusive<u16>,
        accepts: mpsc::UnboundedSender<AcceptedConnection>,
    ) -> SyncResult<Self> {
        for port in range.clone() {
            match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
                Ok(listener) => {
                    info!(port, "Local server listening");
                    return Ok(Self::run(listener, port, accepts));
                }
                Err(e) => {
                    debug!(port, error = %e, "Port not usable, trying next");
                }
            }
        }
        Err(SyncError::PortRangeExhausted {
            start: *range.start(),
            end: *range.end(),
        })
    }

    /// Bind the given port on all interfaces. Zero picks an ephemeral
    /// port; the bound port is readable via [`SessionServer::port`].
    pub async fn bind_lan(
        port: u16,
        accepts: mpsc::UnboundedSender<AcceptedConnection>,
    ) -> SyncResult<Self> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        let port = listener.local_addr()?.port();
        info!(port, "LAN server listening");
        Ok(Self::run(listener, port, accepts))
    }

    fn run(
        listener: TcpListener,
        port: u16,
        accepts: mpsc::UnboundedSender<AcceptedConnection>,
    ) -> Self {
        let task = tokio::spawn(accept_loop(listener, accepts));
        Self { port, task }
    }

    /// The port this server listens on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting and release the port.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for SessionServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(listener: TcpListener, accepts: mpsc::UnboundedSender<AcceptedConnection>) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                debug!(%remote, "Accepted connection");
                if accepts.send(AcceptedConnection { stream, remote }).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "Accept failed");
                // Keeps the loop from spinning when fds run out.
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
