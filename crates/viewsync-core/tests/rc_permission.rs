//! Remote-control permission tests
//!
//! In remote-control mode nothing state-changing crosses the gate until
//! the local user grants the peer permission. These tests drive the gate
//! from both sides: a scripted raw-protocol peer plays the controller
//! against a real host, and a second group lets two hosts negotiate
//! permissions end to end.
//!
//! - Synchronize and state-changing messages are dropped without a grant
//! - List replies, uninvited grants, and switch requests stay outside too
//! - The request/answer flow opens the gate, once
//! - Mode changes revoke every grant
//! - A denied controller can ask again

use std::net::Ipv4Addr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::codec::Framed;
use viewsync_core::{
    ControlMode, FrameCodec, Message, PointF, SyncConfig, SyncEvent, SyncHost, SyncMode,
    Transform,
};

// ============================================================================
// Test Utilities
// ============================================================================

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const CONVERGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Start a remote-control instance. Each host gets its own discovery
/// port so parallel tests never collide on the UDP bind.
fn rc_host(title: &str, rc_port: u16) -> SyncHost {
    let _ = tracing_subscriber::fmt::try_init();
    let config = SyncConfig {
        rc_discovery_port: rc_port,
        ..SyncConfig::with_title(title)
    };
    SyncHost::start(SyncMode::RemoteControl, config).expect("host should start")
}

/// Bring up the host's server and return its port.
async fn serving(host: &SyncHost) -> u16 {
    let mut events = host.subscribe();
    host.start_server(true);
    let result = tokio::time::timeout(CONVERGE_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(SyncEvent::ServerPortChanged { port }) if port != 0 => return port,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await;
    result.expect("timed out waiting for server port")
}

/// Connect a scripted controller and complete the greeting exchange.
async fn scripted_controller(port: u16, title: &str) -> Framed<TcpStream, FrameCodec> {
    let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))
        .await
        .expect("connect to server");
    let mut framed = Framed::new(stream, FrameCodec::new());
    framed
        .send(Message::Greeting {
            title: title.to_string(),
            server_port: 0,
        })
        .await
        .expect("send greeting");
    let greeting = tokio::time::timeout(CONVERGE_TIMEOUT, framed.next())
        .await
        .expect("timed out waiting for greeting")
        .expect("connection stayed open")
        .expect("greeting decodes");
    assert!(matches!(greeting, Message::Greeting { .. }));
    framed
}

/// Read the next frame, failing on timeout or closed connection.
async fn next_frame(framed: &mut Framed<TcpStream, FrameCodec>) -> Message {
    tokio::time::timeout(CONVERGE_TIMEOUT, framed.next())
        .await
        .expect("timed out waiting for frame")
        .expect("connection stayed open")
        .expect("frame decodes")
}

/// Assert no frame arrives within a short window.
async fn assert_no_frame(framed: &mut Framed<TcpStream, FrameCodec>) {
    let result = tokio::time::timeout(Duration::from_millis(300), framed.next()).await;
    assert!(result.is_err(), "unexpected frame: {:?}", result);
}

/// Wait for the first event matching the predicate.
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

/// Assert no matching event arrives within a short window.
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

/// Poll until the host's synchronized peer count matches.
async fn wait_for_synced(host: &SyncHost, count: usize) {
    let deadline = tokio::time::Instant::now() + CONVERGE_TIMEOUT;
    loop {
        let synced = host
            .peer_list()
            .iter()
            .filter(|p| p.synchronized)
            .count();
        if synced == count {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("expected {} synchronized peers", count);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn sample_transform() -> Message {
    Message::Transform {
        view: Transform::scaling(1.5, 1.5),
        image: Transform::IDENTITY,
        canvas: PointF { x: 0.0, y: 0.0 },
    }
}

// ============================================================================
// The Gate, Scripted Side
// ============================================================================

/// Without a grant a synchronize request goes unanswered and the peer
/// stays out of the session.
#[tokio::test]
async fn test_synchronize_blocked_without_grant() {
    let host = rc_host("controlled", 29561);
    let port = serving(&host).await;
    let mut controller = scripted_controller(port, "controller").await;

    controller
        .send(Message::Synchronize)
        .await
        .expect("send synchronize");

    assert_no_frame(&mut controller).await;
    assert!(host.peer_list().iter().all(|p| !p.synchronized));
}

/// Without a grant state-changing messages never surface as events.
#[tokio::test]
async fn test_transform_blocked_without_grant() {
    let host = rc_host("controlled", 29562);
    let port = serving(&host).await;
    let mut controller = scripted_controller(port, "controller").await;
    let mut events = host.subscribe();

    controller
        .send(sample_transform())
        .await
        .expect("send transform");

    assert_no_event(&mut events, |e| {
        matches!(e, SyncEvent::TransformReceived { .. })
    })
    .await;
}

/// The full request/grant flow opens the gate for synchronize and the
/// state-changing messages behind it.
#[tokio::test]
async fn test_grant_opens_gate() {
    let host = rc_host("controlled", 29563);
    let port = serving(&host).await;
    let mut events = host.subscribe();
    let mut controller = scripted_controller(port, "controller").await;

    controller
        .send(Message::PermissionRequest)
        .await
        .expect("send request");
    let requested = wait_for_event(&mut events, |e| {
        matches!(e, SyncEvent::PermissionRequested { .. })
    })
    .await;
    let peer_id = match requested {
        SyncEvent::PermissionRequested { peer_id, title } => {
            assert_eq!(title, "controller");
            peer_id
        }
        _ => unreachable!(),
    };

    host.set_permission(peer_id, true);
    assert_eq!(
        next_frame(&mut controller).await,
        Message::Permission { allowed: true }
    );

    controller
        .send(Message::Synchronize)
        .await
        .expect("send synchronize");
    assert!(matches!(
        next_frame(&mut controller).await,
        Message::SynchronizeList { .. }
    ));
    wait_for_synced(&host, 1).await;

    controller
        .send(sample_transform())
        .await
        .expect("send transform");
    wait_for_event(&mut events, |e| {
        matches!(e, SyncEvent::TransformReceived { .. })
    })
    .await;
}

/// A mode change revokes the grant; the next state change is dropped
/// again.
#[tokio::test]
async fn test_mode_change_revokes_grant() {
    let host = rc_host("controlled", 29564);
    let port = serving(&host).await;
    let mut events = host.subscribe();
    let mut controller = scripted_controller(port, "controller").await;

    controller
        .send(Message::PermissionRequest)
        .await
        .expect("send request");
    let peer_id = wait_for_event(&mut events, |e| {
        matches!(e, SyncEvent::PermissionRequested { .. })
    })
    .await
    .peer_id()
    .expect("request names the peer");
    host.set_permission(peer_id, true);
    assert_eq!(
        next_frame(&mut controller).await,
        Message::Permission { allowed: true }
    );

    host.set_mode(ControlMode::Inactive);
    assert_eq!(
        next_frame(&mut controller).await,
        Message::ModeChange { mode: 0 }
    );

    controller
        .send(sample_transform())
        .await
        .expect("send transform");
    assert_no_event(&mut events, |e| {
        matches!(e, SyncEvent::TransformReceived { .. })
    })
    .await;
}

/// An unsolicited synchronize-list does not smuggle a peer into the
/// session, and nothing is rebroadcast to it either.
#[tokio::test]
async fn test_synchronize_list_blocked_without_grant() {
    let host = rc_host("controlled", 29569);
    let port = serving(&host).await;
    let mut controller = scripted_controller(port, "controller").await;

    controller
        .send(Message::SynchronizeList { ports: vec![] })
        .await
        .expect("send synchronize list");

    assert_no_frame(&mut controller).await;
    assert!(host.peer_list().iter().all(|p| !p.synchronized));
}

/// A grant the host never asked for opens nothing.
#[tokio::test]
async fn test_uninvited_grant_opens_nothing() {
    let host = rc_host("controlled", 29570);
    let port = serving(&host).await;
    let mut controller = scripted_controller(port, "controller").await;

    controller
        .send(Message::Permission { allowed: true })
        .await
        .expect("send permission");
    controller
        .send(Message::SynchronizeList { ports: vec![] })
        .await
        .expect("send synchronize list");

    assert_no_frame(&mut controller).await;
    assert!(host.peer_list().iter().all(|p| !p.synchronized));
}

/// Without a grant a switch-server request cannot steer the host to a
/// different address; the connection stays where it is.
#[tokio::test]
async fn test_switch_server_blocked_without_grant() {
    let host = rc_host("controlled", 29571);
    let port = serving(&host).await;
    let mut controller = scripted_controller(port, "controller").await;

    controller
        .send(Message::SwitchServer {
            addr: Ipv4Addr::new(203, 0, 113, 9).into(),
            port: 45000,
        })
        .await
        .expect("send switch server");

    assert_no_frame(&mut controller).await;
    assert_eq!(host.peer_list().len(), 1);
}

// ============================================================================
// The Gate, Host to Host
// ============================================================================

/// Two hosts negotiate permission before their session starts.
#[tokio::test]
async fn test_hosts_negotiate_permission() {
    let controlled = rc_host("controlled", 29565);
    let controller = rc_host("controller", 29566);
    let port = serving(&controlled).await;

    let mut controlled_events = controlled.subscribe();
    controller.connect_to_host(Ipv4Addr::LOCALHOST.into(), port);
    let deadline = tokio::time::Instant::now() + CONVERGE_TIMEOUT;
    while controller.peer_list().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "never connected");
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    // Asking to synchronize turns into a permission request first.
    controller.synchronize_with(controller.peer_list()[0].id);
    let requested = wait_for_event(&mut controlled_events, |e| {
        matches!(e, SyncEvent::PermissionRequested { .. })
    })
    .await;
    let peer_id = requested.peer_id().expect("request names the peer");
    assert!(controlled.peer_list().iter().all(|p| !p.synchronized));

    controlled.set_permission(peer_id, true);
    wait_for_synced(&controlled, 1).await;
    wait_for_synced(&controller, 1).await;
}

/// A denied controller stays out of the session but may ask again.
#[tokio::test]
async fn test_denied_controller_can_ask_again() {
    let controlled = rc_host("controlled", 29567);
    let controller = rc_host("controller", 29568);
    let port = serving(&controlled).await;

    let mut controlled_events = controlled.subscribe();
    let mut controller_events = controller.subscribe();
    controller.connect_to_host(Ipv4Addr::LOCALHOST.into(), port);
    let deadline = tokio::time::Instant::now() + CONVERGE_TIMEOUT;
    while controller.peer_list().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "never connected");
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    controller.synchronize_with(controller.peer_list()[0].id);
    let peer_id = wait_for_event(&mut controlled_events, |e| {
        matches!(e, SyncEvent::PermissionRequested { .. })
    })
    .await
    .peer_id()
    .expect("request names the peer");

    controlled.set_permission(peer_id, false);
    wait_for_event(&mut controller_events, |e| {
        matches!(e, SyncEvent::Info { message, .. } if message.contains("denied"))
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(controlled.peer_list().iter().all(|p| !p.synchronized));
    assert!(controller.peer_list().iter().all(|p| !p.synchronized));

    // The denial is not final.
    controller.synchronize_with(controller.peer_list()[0].id);
    wait_for_event(&mut controlled_events, |e| {
        matches!(e, SyncEvent::PermissionRequested { .. })
    })
    .await;
}
