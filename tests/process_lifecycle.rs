//! 실제 자식 프로세스(sh 스크립트)로 감독 기능 검증
#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bridge_core::events::{Event, EventBus, ServerEvent, TunnelEvent};
use bridge_core::supervisor::process::{GracefulStop, LaunchSpec};
use bridge_core::supervisor::state_machine::ProcessState;
use bridge_core::supervisor::Supervisor;
use tokio::sync::broadcast;

const FAKE_SERVER: &str = r#"
echo "[12:00:00] [Server thread/INFO]: Starting minecraft server version 1.20.4"
echo '[12:00:01] [Server thread/INFO]: Done (1.234s)! For help, type "help"'
while IFS= read -r line; do
  case "$line" in
    stop) echo "[12:00:09] [Server thread/INFO]: Stopping server"; exit 0 ;;
    "join "*) echo "[12:00:02] [Server thread/INFO]: ${line#join } joined the game" ;;
    "leave "*) echo "[12:00:03] [Server thread/INFO]: ${line#leave } left the game" ;;
    *) echo "[12:00:04] [Server thread/INFO]: [Server] $line" ;;
  esac
done
"#;

const FAKE_TUNNEL: &str = r#"
echo "Visit https://playit.gg/claim/abc123XYZ to claim this agent"
echo "Visit https://playit.gg/claim/abc123XYZ to claim this agent"
echo "Visit https://playit.gg/claim/abc123XYZ to claim this agent"
echo "tunnel running at brave-fox-42.ply.gg:12345"
exec sleep 30
"#;

/// TERM도 stop 명령도 무시하는 프로세스 (자식 프로세스 없이 busy loop)
const STUBBORN: &str = r#"
trap '' TERM
while :; do :; done
"#;

fn script_spec(dir: &Path, name: &str, body: &str, graceful: GracefulStop) -> LaunchSpec {
    std::fs::write(dir.join(name), body).unwrap();
    LaunchSpec {
        program: "sh".to_string(),
        args: vec![name.to_string()],
        working_dir: dir.to_path_buf(),
        env: vec![],
        accepts_input: matches!(graceful, GracefulStop::Command(_)),
        graceful,
        graceful_timeout: Duration::from_millis(500),
        kill_timeout: Duration::from_secs(2),
    }
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<Event>, mut pred: F) -> Event
where
    F: FnMut(&Event) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(event)) if pred(&event) => return event,
            Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(e)) => panic!("event stream closed: {}", e),
            Err(_) => panic!("timed out waiting for event"),
        }
    }
}

#[tokio::test]
async fn test_server_ready_players_and_graceful_stop() {
    let dir = tempfile::tempdir().unwrap();
    let bus = EventBus::new();
    let server = script_spec(dir.path(), "server.sh", FAKE_SERVER, GracefulStop::Command("stop".into()));
    let tunnel = script_spec(dir.path(), "tunnel.sh", FAKE_TUNNEL, GracefulStop::Terminate);
    let sup = Supervisor::new(server, tunnel, None, bus.clone());
    let mut rx = bus.listen();

    let process = sup.start_server().await.unwrap();
    assert_eq!(process.generation(), 1);
    wait_for(&mut rx, |e| matches!(e, Event::Server(ServerEvent::Ready))).await;
    assert!(process.is_ready());

    sup.send_command("join Steve").await.unwrap();
    wait_for(&mut rx, |e| matches!(e, Event::Server(ServerEvent::PlayerCountChanged(1)))).await;
    sup.send_command("leave Steve").await.unwrap();
    wait_for(&mut rx, |e| matches!(e, Event::Server(ServerEvent::PlayerCountChanged(0)))).await;

    // 두 번째 시작은 거부
    assert!(sup.start_server().await.is_err());

    sup.stop_server().await;
    assert_eq!(process.state(), ProcessState::Exited);
    assert!(!process.is_ready());
    assert!(sup.send_command("list").await.is_err());

    let stopped = bus
        .events_since(None)
        .into_iter()
        .filter(|r| matches!(r.event, Event::Server(ServerEvent::Stopped)))
        .count();
    assert_eq!(stopped, 1, "terminal event must be emitted exactly once");

    let console = sup.slot(bridge_core::events::ProcessRole::Server).console_recent(100).await;
    assert!(console.iter().any(|l| l.content.contains("Process started with PID")));
    assert!(console.iter().any(|l| l.content.contains("Steve joined the game")));
    assert!(console.iter().any(|l| l.content.contains("Stopping server")));

    // 같은 슬롯에서 새 세대로 재시작 가능
    let second = sup.start_server().await.unwrap();
    assert_eq!(second.generation(), 2);

    // 이전 세대를 대상으로 한 명령은 거부
    assert!(sup.send_command_to(1, "say stale").await.is_err());
    assert!(sup.send_command_to(2, "say fresh").await.is_ok());
    sup.stop_server().await;
}

#[tokio::test]
async fn test_stubborn_process_is_force_killed_within_timeouts() {
    let dir = tempfile::tempdir().unwrap();
    let bus = EventBus::new();
    let server = script_spec(dir.path(), "stubborn.sh", STUBBORN, GracefulStop::Command("stop".into()));
    let tunnel = script_spec(dir.path(), "tunnel.sh", FAKE_TUNNEL, GracefulStop::Terminate);
    let (graceful, kill) = (server.graceful_timeout, server.kill_timeout);
    let sup = Supervisor::new(server, tunnel, None, bus.clone());

    let process = sup.start_server().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    sup.stop_server().await;
    let elapsed = started.elapsed();

    assert_eq!(process.state(), ProcessState::Exited);
    assert!(
        elapsed < graceful + kill,
        "stop took {:?}, expected under {:?}",
        elapsed,
        graceful + kill
    );
    assert!(elapsed >= graceful, "force kill must wait for the graceful timeout");
}

#[tokio::test]
async fn test_concurrent_stops_share_one_exit() {
    let dir = tempfile::tempdir().unwrap();
    let bus = EventBus::new();
    let server = script_spec(dir.path(), "stubborn.sh", STUBBORN, GracefulStop::Command("stop".into()));
    let tunnel = script_spec(dir.path(), "tunnel.sh", FAKE_TUNNEL, GracefulStop::Terminate);
    let sup = Arc::new(Supervisor::new(server, tunnel, None, bus.clone()));

    let process = sup.start_server().await.unwrap();
    tokio::join!(process.stop(), sup.stop_server());

    assert!(process.has_exited());
    let stopped = bus
        .events_since(None)
        .into_iter()
        .filter(|r| matches!(r.event, Event::Server(ServerEvent::Stopped)))
        .count();
    assert_eq!(stopped, 1);
}

#[tokio::test]
async fn test_tunnel_claim_url_reported_once() {
    let dir = tempfile::tempdir().unwrap();
    let bus = EventBus::new();
    let server = script_spec(dir.path(), "server.sh", FAKE_SERVER, GracefulStop::Command("stop".into()));
    let tunnel = script_spec(dir.path(), "tunnel.sh", FAKE_TUNNEL, GracefulStop::Terminate);
    let sup = Supervisor::new(server, tunnel, None, bus.clone());
    let mut rx = bus.listen();

    let agent = sup.start_tunnel().await.unwrap();
    let addr = wait_for(&mut rx, |e| matches!(e, Event::Tunnel(TunnelEvent::AddressAssigned(_)))).await;
    assert_eq!(
        addr,
        Event::Tunnel(TunnelEvent::AddressAssigned("brave-fox-42.ply.gg".into()))
    );
    assert!(agent.is_ready());

    let status = sup.status().await;
    assert_eq!(status.live.tunnel_address.as_deref(), Some("brave-fox-42.ply.gg"));
    assert_eq!(
        status.live.claim_url.as_deref(),
        Some("https://playit.gg/claim/abc123XYZ")
    );

    let claims = bus
        .events_since(None)
        .into_iter()
        .filter(|r| matches!(r.event, Event::Tunnel(TunnelEvent::ClaimUrlDetected(_))))
        .count();
    assert_eq!(claims, 1);

    sup.stop_tunnel().await;
    assert!(agent.has_exited());
    assert!(sup.status().await.live.tunnel_address.is_none());
}

#[tokio::test]
async fn test_start_all_launches_tunnel_after_ready() {
    let dir = tempfile::tempdir().unwrap();
    let bus = EventBus::new();
    let server = script_spec(dir.path(), "server.sh", FAKE_SERVER, GracefulStop::Command("stop".into()));
    let tunnel = script_spec(dir.path(), "tunnel.sh", FAKE_TUNNEL, GracefulStop::Terminate);
    let sup = Arc::new(Supervisor::new(server, tunnel, None, bus.clone()));
    let mut rx = bus.listen();

    sup.start_all().await.unwrap();
    wait_for(&mut rx, |e| matches!(e, Event::Server(ServerEvent::Ready))).await;
    wait_for(&mut rx, |e| matches!(e, Event::Tunnel(TunnelEvent::Starting))).await;

    // Ready가 Starting보다 먼저 기록되어야 한다
    let order: Vec<Event> = bus
        .events_since(None)
        .into_iter()
        .map(|r| r.event)
        .filter(|e| {
            matches!(
                e,
                Event::Server(ServerEvent::Ready) | Event::Tunnel(TunnelEvent::Starting)
            )
        })
        .collect();
    assert_eq!(
        order,
        vec![Event::Server(ServerEvent::Ready), Event::Tunnel(TunnelEvent::Starting)]
    );

    sup.shutdown().await;
    let status = sup.status().await;
    assert_eq!(status.server.state, ProcessState::Exited);
    assert_eq!(status.tunnel.state, ProcessState::Exited);
}

#[tokio::test]
async fn test_missing_workdir_is_launch_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = script_spec(dir.path(), "server.sh", FAKE_SERVER, GracefulStop::Command("stop".into()));
    server.working_dir = dir.path().join("does-not-exist");
    let tunnel = script_spec(dir.path(), "tunnel.sh", FAKE_TUNNEL, GracefulStop::Terminate);
    let sup = Supervisor::new(server, tunnel, None, EventBus::new());

    let err = sup.start_server().await.unwrap_err();
    assert!(err.is_launch_error());
    assert_eq!(sup.status().await.server.state, ProcessState::NotStarted);
}
