//! UDP broadcast discovery for LAN instances
//!
//! Every LAN instance binds the first free port in the discovery range
//! and listens there. While an instance runs a server it broadcasts an
//! [`Announcement`] to every port in the range on an interval, so
//! instances that landed on different ports still hear each other.
//!
//! Datagrams from our own addresses are dropped; an instance never
//! discovers itself. The filter list is injected so tests can switch it
//! off, production callers pass [`local_addresses`].

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::{SyncError, SyncResult};
use crate::protocol::{decode_announcement, encode_announcement, Announcement};

/// Events emitted by the discovery listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// Another instance announced its server
    HostFound {
        address: IpAddr,
        server_port: u16,
        client_name: String,
    },
}

/// Discovery socket with optional listen and announce tasks
#[derive(Debug)]
pub struct DiscoveryService {
    socket: Arc<UdpSocket>,
    port: u16,
    ports: RangeInclusive<u16>,
    local_addrs: Arc<Vec<IpAddr>>,
    interval: Duration,
    listen_task: Option<JoinHandle<()>>,
    announce_task: Option<JoinHandle<()>>,
}

impl DiscoveryService {
    /// Bind the first free UDP port in the range with broadcast enabled.
    ///
    /// `local_addrs` is the complete self-filter set; announcements whose
    /// source address is in it are ignored.
    pub async fn bind(
        ports: RangeInclusive<u16>,
        local_addrs: Vec<IpAddr>,
        interval: Duration,
    ) -> SyncResult<Self> {
        let mut bound = None;
        for port in ports.clone() {
            match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await {
                Ok(socket) => {
                    bound = Some((socket, port));
                    break;
                }
                Err(e) => {
                    debug!(port, error = %e, "Discovery port not usable, trying next");
                }
            }
        }
        let (socket, port) = bound.ok_or(SyncError::PortRangeExhausted {
            start: *ports.start(),
            end: *ports.end(),
        })?;
        socket.set_broadcast(true)?;
        info!(port, "Discovery socket bound");

        Ok(Self {
            socket: Arc::new(socket),
            port,
            ports,
            local_addrs: Arc::new(local_addrs),
            interval,
            listen_task: None,
            announce_task: None,
        })
    }

    /// The UDP port this instance listens on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Start forwarding announcements from other instances. No-op if the
    /// listener is already running.
    pub fn start_listening(&mut self, events: mpsc::UnboundedSender<DiscoveryEvent>) {
        if self.listen_task.is_some() {
            return;
        }
        let socket = Arc::clone(&self.socket);
        let local_addrs = Arc::clone(&self.local_addrs);
        self.listen_task = Some(tokio::spawn(listen_loop(socket, local_addrs, events)));
    }

    /// Stop the listener.
    pub fn stop_listening(&mut self) {
        if let Some(task) = self.listen_task.take() {
            task.abort();
        }
    }

    /// Broadcast the announcement to the whole port range, immediately
    /// and then on the configured interval. Replaces a running announce
    /// task, so a changed server port takes effect right away.
    pub fn start_announcing(&mut self, announcement: Announcement) {
        self.stop_announcing();
        let socket = Arc::clone(&self.socket);
        let ports = self.ports.clone();
        let interval = self.interval;
        self.announce_task = Some(tokio::spawn(announce_loop(
            socket,
            ports,
            announcement,
            interval,
        )));
    }

    /// Stop broadcasting. The listener keeps running.
    pub fn stop_announcing(&mut self) {
        if let Some(task) = self.announce_task.take() {
            task.abort();
        }
    }

    /// Whether the announce task is running.
    pub fn is_announcing(&self) -> bool {
        self.announce_task.is_some()
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        self.stop_listening();
        self.stop_announcing();
    }
}

async fn listen_loop(
    socket: Arc<UdpSocket>,
    local_addrs: Arc<Vec<IpAddr>>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
) {
    let mut buf = vec![0u8; 2048];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, src)) => {
                let Some(announcement) = decode_announcement(&buf[..len]) else {
                    trace!(%src, len, "Ignoring foreign datagram");
                    continue;
                };
                if local_addrs.contains(&src.ip()) {
                    trace!(%src, "Ignoring our own announcement");
                    continue;
                }
                debug!(
                    address = %src.ip(),
                    port = announcement.server_port,
                    name = %announcement.client_name,
                    "Host announced itself"
                );
                let event = DiscoveryEvent::HostFound {
                    address: src.ip(),
                    server_port: announcement.server_port,
                    client_name: announcement.client_name,
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "Discovery receive failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn announce_loop(
    socket: Arc<UdpSocket>,
    ports: RangeInclusive<u16>,
    announcement: Announcement,
    interval: Duration,
) {
    let datagram = encode_announcement(&announcement);
    loop {
        for port in ports.clone() {
            if let Err(e) = socket.send_to(&datagram, (Ipv4Addr::BROADCAST, port)).await {
                debug!(port, error = %e, "Broadcast send failed");
            }
        }
        trace!(port = announcement.server_port, "Announcement broadcast");
        tokio::time::sleep(interval).await;
    }
}

/// All addresses this machine answers under, loopback included.
///
/// This is the self-filter set for production discovery.
pub fn local_addresses() -> Vec<IpAddr> {
    let mut addrs = vec![
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(Ipv6Addr::LOCALHOST),
    ];
    match local_ip_address::list_afinet_netifas() {
        Ok(netifas) => addrs.extend(netifas.into_iter().map(|(_, addr)| addr)),
        Err(e) => warn!(error = %e, "Could not enumerate local interfaces"),
    }
    addrs
}
