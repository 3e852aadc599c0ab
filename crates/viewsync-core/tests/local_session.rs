//! Local (same machine) session tests
//!
//! These tests run several viewer instances against each other on
//! loopback, each through its own `SyncHost`, and verify the full path
//! from port probing to synchronized mirroring:
//!
//! - Instances find each other by scanning the configured port range
//! - Synchronize requests build a session both sides agree on
//! - Transforms, file steps, and titles flow only where they should
//! - LAN-only traffic (server switches, image pushes) stays out
//! - Leaving and disconnecting shrink the session on the other side
//! - Sessions are transitive: joining one member joins them all
//!
//! Every test uses its own disjoint port range so the tests can run in
//! parallel without seeing each other's instances.

use std::net::{IpAddr, Ipv4Addr};
use std::ops::RangeInclusive;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::codec::Framed;
use viewsync_core::types::file_op;
use viewsync_core::{
    FrameCodec, Message, PeerSnapshot, PointF, SyncConfig, SyncEvent, SyncHost, SyncMode,
    Transform, WindowRect,
};

// ============================================================================
// Test Utilities
// ============================================================================

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const CONVERGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Start a local-mode instance with its own scan range.
fn local_host(title: &str, range: RangeInclusive<u16>) -> SyncHost {
    let _ = tracing_subscriber::fmt::try_init();
    let config = SyncConfig {
        local_port_range: range,
        ..SyncConfig::with_title(title)
    };
    SyncHost::start(SyncMode::Local, config).expect("host should start")
}

/// Poll until the host sees exactly `count` connected peers.
async fn wait_for_peers(host: &SyncHost, count: usize) -> Vec<PeerSnapshot> {
    let deadline = tokio::time::Instant::now() + CONVERGE_TIMEOUT;
    loop {
        let peers = host.peer_list();
        if peers.len() == count {
            return peers;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("expected {} peers, still at {:?}", count, peers);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Poll until the host sees exactly `count` synchronized peers.
async fn wait_for_synced(host: &SyncHost, count: usize) -> Vec<PeerSnapshot> {
    let deadline = tokio::time::Instant::now() + CONVERGE_TIMEOUT;
    loop {
        let peers = host.peer_list();
        if peers.iter().filter(|p| p.synchronized).count() == count {
            return peers;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("expected {} synchronized peers, still at {:?}", count, peers);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Wait for the first event matching the predicate, skipping the rest.
async fn wait_for_event(
    events: &mut broadcast::Receiver<SyncEvent>,
    pred: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    let result = tokio::time::timeout(CONVERGE_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await;
    result.expect("timed out waiting for event")
}

/// Assert that no matching event arrives within a short window.
async fn assert_no_event(
    events: &mut broadcast::Receiver<SyncEvent>,
    pred: impl Fn(&SyncEvent) -> bool,
) {
    let result = tokio::time::timeout(Duration::from_millis(300), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => std::future::pending().await,
            }
        }
    })
    .await;
    if let Ok(event) = result {
        panic!("unexpected event: {:?}", event);
    }
}

/// Build a fully synchronized pair on the given range.
async fn synced_pair(range: RangeInclusive<u16>) -> (SyncHost, SyncHost) {
    let a = local_host("instance a", range.clone());
    let b = local_host("instance b", range);
    let peers = wait_for_peers(&b, 1).await;
    b.synchronize_with(peers[0].id);
    wait_for_synced(&a, 1).await;
    wait_for_synced(&b, 1).await;
    (a, b)
}

/// Connect a bare framed socket to the instance and introduce it, so a
/// test can speak the protocol directly.
async fn scripted_peer(port: u16, title: &str) -> Framed<TcpStream, FrameCodec> {
    let stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .expect("connect to instance");
    let mut framed = Framed::new(stream, FrameCodec::new());
    framed
        .send(Message::Greeting {
            title: title.to_string(),
            server_port: 0,
        })
        .await
        .expect("send greeting");
    let reply = tokio::time::timeout(CONVERGE_TIMEOUT, framed.next())
        .await
        .expect("timed out waiting for greeting")
        .expect("connection stays open")
        .expect("frame decodes");
    assert!(matches!(reply, Message::Greeting { .. }));
    framed
}

// ============================================================================
// Discovery by Port Probing
// ============================================================================

/// A freshly started instance finds the one already running and both
/// end up with one connected, unsynchronized peer.
#[tokio::test]
async fn test_probe_finds_running_instance() {
    let a = local_host("first viewer", 48001..=48004);
    let b = local_host("second viewer", 48001..=48004);

    let seen_by_a = wait_for_peers(&a, 1).await;
    let seen_by_b = wait_for_peers(&b, 1).await;

    assert_eq!(seen_by_a[0].title, "second viewer");
    assert_eq!(seen_by_b[0].title, "first viewer");
    assert_eq!(seen_by_b[0].server_port, a.server_port());
    assert!(seen_by_a[0].local);
    assert!(!seen_by_a[0].synchronized);
    assert!(!seen_by_b[0].synchronized);
}

// ============================================================================
// Session Membership
// ============================================================================

/// A synchronize request marks the peer on both sides and reports the
/// membership through synchronized-peers events.
#[tokio::test]
async fn test_synchronize_builds_session() {
    let a = local_host("instance a", 48011..=48014);
    let b = local_host("instance b", 48011..=48014);
    let mut a_events = a.subscribe();

    let peers = wait_for_peers(&b, 1).await;
    b.synchronize_with(peers[0].id);

    wait_for_synced(&a, 1).await;
    wait_for_synced(&b, 1).await;

    let event = wait_for_event(&mut a_events, |e| {
        matches!(e, SyncEvent::SynchronizedPeersChanged { ports } if !ports.is_empty())
    })
    .await;
    match event {
        SyncEvent::SynchronizedPeersChanged { ports } => {
            assert_eq!(ports, vec![b.server_port()]);
        }
        _ => unreachable!(),
    }
}

/// Leaving the session clears the mark on both sides.
#[tokio::test]
async fn test_stop_synchronize_shrinks_session() {
    let (a, b) = synced_pair(48051..=48054).await;

    let peers = b.peer_list();
    b.stop_synchronize_with(peers[0].id);

    wait_for_synced(&a, 0).await;
    wait_for_synced(&b, 0).await;
    // Still connected, just not mirroring.
    assert_eq!(a.peer_list().len(), 1);
    assert_eq!(b.peer_list().len(), 1);
}

/// Joining one member of an existing session transitively joins the
/// other members too.
#[tokio::test]
async fn test_session_join_is_transitive() {
    let a = local_host("instance a", 48071..=48075);
    let b = local_host("instance b", 48071..=48075);
    wait_for_peers(&b, 1).await;
    b.synchronize_with(b.peer_list()[0].id);
    wait_for_synced(&a, 1).await;

    let c = local_host("instance c", 48071..=48075);
    let c_peers = wait_for_peers(&c, 2).await;
    let a_id = c_peers
        .iter()
        .find(|p| p.server_port == a.server_port())
        .expect("c should know a")
        .id;
    c.synchronize_with(a_id);

    // The synchronize-list from a names b's port, so c joins b as well.
    wait_for_synced(&a, 2).await;
    wait_for_synced(&b, 2).await;
    wait_for_synced(&c, 2).await;
}

// ============================================================================
// Mirrored State
// ============================================================================

/// Transforms reach synchronized peers with their values intact.
#[tokio::test]
async fn test_transform_reaches_synchronized_peer() {
    let (a, b) = synced_pair(48021..=48024).await;
    let mut b_events = b.subscribe();

    let view = Transform::scaling(2.0, 2.0);
    let image = Transform::translation(10.0, -4.5);
    a.send_transform(view, image, PointF { x: 3.0, y: 7.0 });

    let event = wait_for_event(&mut b_events, |e| {
        matches!(e, SyncEvent::TransformReceived { .. })
    })
    .await;
    match event {
        SyncEvent::TransformReceived {
            view: got_view,
            image: got_image,
            canvas,
        } => {
            assert_eq!(got_view, view);
            assert_eq!(got_image, image);
            assert_eq!(canvas, PointF { x: 3.0, y: 7.0 });
        }
        _ => unreachable!(),
    }

    // After leaving the session nothing arrives anymore.
    b.stop_synchronize_with(b.peer_list()[0].id);
    wait_for_synced(&a, 0).await;
    a.send_transform(view, image, PointF { x: 0.0, y: 0.0 });
    assert_no_event(&mut b_events, |e| {
        matches!(e, SyncEvent::TransformReceived { .. })
    })
    .await;
}

/// Window geometry reaches synchronized peers with both flags intact.
#[tokio::test]
async fn test_position_reaches_synchronized_peer() {
    let (a, b) = synced_pair(48101..=48104).await;
    let mut b_events = b.subscribe();

    let rect = WindowRect::new(120, 80, 1024, 768);
    a.send_position(rect, true, false);

    let event = wait_for_event(&mut b_events, |e| {
        matches!(e, SyncEvent::PositionReceived { .. })
    })
    .await;
    match event {
        SyncEvent::PositionReceived {
            rect: got,
            opacity,
            overlaid,
        } => {
            assert_eq!(got, rect);
            assert!(opacity);
            assert!(!overlaid);
        }
        _ => unreachable!(),
    }
}

/// File navigation steps reach synchronized peers.
#[tokio::test]
async fn test_new_file_reaches_synchronized_peer() {
    let (a, b) = synced_pair(48031..=48034).await;
    let mut b_events = b.subscribe();

    a.send_new_file(file_op::NEXT, "beach/0042.jpg");

    let event = wait_for_event(&mut b_events, |e| {
        matches!(e, SyncEvent::NewFileReceived { .. })
    })
    .await;
    match event {
        SyncEvent::NewFileReceived { op, filename } => {
            assert_eq!(op, file_op::NEXT);
            assert_eq!(filename, "beach/0042.jpg");
        }
        _ => unreachable!(),
    }
}

/// Title updates reach every connected peer, synchronized or not, and
/// show up in the peer list.
#[tokio::test]
async fn test_title_update_reaches_connected_peer() {
    let a = local_host("instance a", 48041..=48044);
    let b = local_host("instance b", 48041..=48044);
    wait_for_peers(&a, 1).await;
    wait_for_peers(&b, 1).await;
    let mut a_events = a.subscribe();

    b.send_title("sunset.jpg");

    let event = wait_for_event(&mut a_events, |e| {
        matches!(e, SyncEvent::TitleReceived { .. })
    })
    .await;
    match event {
        SyncEvent::TitleReceived { peer_id, title } => {
            assert_eq!(title, "sunset.jpg");
            assert_eq!(peer_id, a.peer_list()[0].id);
        }
        _ => unreachable!(),
    }
    assert_eq!(a.peer_list()[0].title, "sunset.jpg");
}

// ============================================================================
// Mode Boundaries
// ============================================================================

/// A switch-server request belongs to the LAN variants; a local
/// instance leaves its connections where they are.
#[tokio::test]
async fn test_switch_server_ignored_in_local_mode() {
    let host = local_host("local viewer", 48111..=48114);
    let mut peer = scripted_peer(host.server_port(), "pushy peer").await;
    wait_for_peers(&host, 1).await;
    let mut events = host.subscribe();

    peer.send(Message::SwitchServer {
        addr: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)),
        port: 45000,
    })
    .await
    .expect("send switch server");

    assert_no_event(&mut events, |e| matches!(e, SyncEvent::Info { .. })).await;
    assert_eq!(host.peer_list().len(), 1);
}

/// Image pushes belong to the LAN variants; in local mode the call is
/// a no-op and nothing reaches the session.
#[tokio::test]
async fn test_image_push_skipped_in_local_mode() {
    let (a, b) = synced_pair(48121..=48124).await;
    let mut b_events = b.subscribe();

    a.send_new_image("panorama.jpg", Bytes::from_static(b"raw bytes"));

    assert_no_event(&mut b_events, |e| {
        matches!(
            e,
            SyncEvent::UpcomingImageReceived { .. } | SyncEvent::ImageReceived { .. }
        )
    })
    .await;
}

// ============================================================================
// Teardown
// ============================================================================

/// A shut-down instance disappears from the other side's peer list and
/// from the session.
#[tokio::test]
async fn test_shutdown_removes_peer() {
    let (a, b) = synced_pair(48061..=48064).await;

    b.shutdown();

    wait_for_peers(&a, 0).await;
    wait_for_synced(&a, 0).await;
}

/// A goodbye broadcast empties both peer lists, but unlike shutdown the
/// sender keeps serving its port and can be reconnected.
#[tokio::test]
async fn test_goodbye_disconnects_but_keeps_running() {
    let (a, b) = synced_pair(48091..=48094).await;

    a.send_goodbye();

    wait_for_peers(&a, 0).await;
    wait_for_peers(&b, 0).await;

    b.connect_to_host(IpAddr::V4(Ipv4Addr::LOCALHOST), a.server_port());
    wait_for_peers(&a, 1).await;
    wait_for_peers(&b, 1).await;
}

/// Quit requests reach local peers so the whole machine's instances can
/// close together.
#[tokio::test]
async fn test_quit_reaches_local_peer() {
    let a = local_host("instance a", 48081..=48084);
    let b = local_host("instance b", 48081..=48084);
    wait_for_peers(&a, 1).await;
    wait_for_peers(&b, 1).await;
    let mut b_events = b.subscribe();

    a.send_quit();

    wait_for_event(&mut b_events, |e| matches!(e, SyncEvent::QuitReceived)).await;
}
