//! missionlink-node 統合テスト
//!
//! ループバック UDP 上でコーディネーターとローバーを実際に動かす。
//! 損失のある経路は、間に挟んだ中継ソケットがメッセージを選んで捨てることで再現する。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use missionlink_node::{Coordinator, CoordinatorConfig, RoverNode, RoverNodeConfig};
use missionlink_proto::{Message, MessageKind};
use missionlink_session::ProtocolConfig;
use missionlink_store::{MissionDraft, MissionStatus, MissionStore, RoverStatus};
use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;
use tokio::sync::watch;

const ROVER: i32 = 1;

// ==============================================================
// ヘルパー
// ==============================================================

fn fast_protocol() -> ProtocolConfig {
    ProtocolConfig::default()
        .with_timeout_ms(200)
        .with_final_ack_gap_ms(20)
}

fn coordinator_config(scan_interval: Duration) -> CoordinatorConfig {
    CoordinatorConfig {
        bind: "127.0.0.1:0".parse().unwrap(),
        protocol: fast_protocol(),
        rovers: Vec::new(),
        scan_interval,
        reaper_interval: Duration::from_millis(200),
        inactivity_timeout: Duration::from_secs(30),
        fault_cooldown: Duration::from_secs(60),
    }
}

fn rover_config(coordinator: SocketAddr, battery: f32) -> RoverNodeConfig {
    let mut config = RoverNodeConfig::new(ROVER).unwrap();
    config.bind = "127.0.0.1:0".parse().unwrap();
    config.coordinator = coordinator;
    config.protocol = fast_protocol();
    config.simulation.tick_ms = 100;
    config.battery = battery;
    config
}

fn draft(task: String, duration_secs: i64) -> MissionDraft {
    MissionDraft {
        x1: 0.0,
        y1: 0.0,
        x2: 4.0,
        y2: 4.0,
        task,
        duration_secs,
        update_interval_secs: 1,
        start_time: None,
        priority: 3,
    }
}

/// 条件が成り立つまで待つ
async fn wait_for(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// コーディネーターとローバーの間でデータグラムを中継する
///
/// `lose` が true を返したメッセージは転送しない。
async fn relay(
    socket: UdpSocket,
    coordinator: SocketAddr,
    rover: SocketAddr,
    mut lose: impl FnMut(&Message) -> bool + Send + 'static,
) {
    let mut buf = vec![0u8; 65_536];
    loop {
        let Ok((n, from)) = socket.recv_from(&mut buf).await else {
            return;
        };
        let to = if from == rover { coordinator } else { rover };
        if let Ok(msg) = Message::decode(&buf[..n]) {
            if lose(&msg) {
                continue;
            }
        }
        let _ = socket.send_to(&buf[..n], to).await;
    }
}

struct Harness {
    store: Arc<MissionStore>,
    shutdown: watch::Sender<bool>,
}

impl Harness {
    /// コーディネーター・(中継)・ローバーを起動し、ミッションを 1 件投入する
    async fn start(
        scan_interval: Duration,
        rover_battery: f32,
        mission: MissionDraft,
        lose: Option<Box<dyn FnMut(&Message) -> bool + Send>>,
    ) -> (Self, i32) {
        let coordinator = Coordinator::bind(coordinator_config(scan_interval)).await.unwrap();
        let coord_addr = coordinator.local_addr();

        let (rover, rover_seen_at) = match lose {
            Some(lose) => {
                let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
                let relay_addr = socket.local_addr().unwrap();
                let rover = RoverNode::bind(rover_config(relay_addr, rover_battery)).await.unwrap();
                tokio::spawn(relay(socket, coord_addr, rover.local_addr(), lose));
                (rover, relay_addr)
            }
            None => {
                let rover = RoverNode::bind(rover_config(coord_addr, rover_battery)).await.unwrap();
                let addr = rover.local_addr();
                (rover, addr)
            }
        };
        coordinator.register_rover(ROVER, rover_seen_at);
        let mission_id = coordinator.submit_mission(mission).unwrap();

        let store = coordinator.store();
        let (shutdown, rx) = watch::channel(false);
        tokio::spawn(rover.run(rx.clone()));
        tokio::spawn(coordinator.run(rx));

        (Harness { store, shutdown }, mission_id)
    }

    fn mission_status(&self, id: i32) -> Option<MissionStatus> {
        self.store.mission(id).map(|m| m.status)
    }

    fn stop(self) {
        let _ = self.shutdown.send(true);
    }
}

// ==============================================================
// テスト
// ==============================================================

#[tokio::test]
async fn test_mission_completes_end_to_end() {
    let (h, id) = Harness::start(
        Duration::from_millis(100),
        100.0,
        draft("Survey the landing zone".into(), 2),
        None,
    )
    .await;

    assert!(
        wait_for(Duration::from_secs(10), || h.mission_status(id) == Some(MissionStatus::Completed)).await,
        "mission did not complete: {:?}",
        h.store.mission(id)
    );
    let record = h.store.mission(id).unwrap();
    assert_eq!(record.rover_id, Some(ROVER));
    assert_eq!(record.attempts, 1);
    assert!(record.progress_reports >= 1);

    assert!(wait_for(Duration::from_secs(2), || {
        h.store.rover(ROVER).map(|r| r.status) == Some(RoverStatus::Available)
    })
    .await);
    h.stop();
}

#[tokio::test]
async fn test_lost_fragment_is_recovered() {
    let mut dropped = false;
    let lose = move |msg: &Message| {
        if !dropped && msg.kind() == MessageKind::Mission && msg.seq() == 3 {
            dropped = true;
            return true;
        }
        false
    };
    let (h, id) = Harness::start(
        Duration::from_millis(100),
        100.0,
        draft("x".repeat(2000), 2),
        Some(Box::new(lose)),
    )
    .await;

    assert!(
        wait_for(Duration::from_secs(10), || h.mission_status(id) == Some(MissionStatus::Completed)).await,
        "mission did not complete: {:?}",
        h.store.mission(id)
    );
    assert_eq!(h.store.mission(id).unwrap().attempts, 1);
    h.stop();
}

#[tokio::test]
async fn test_unreachable_rover_returns_mission_to_pending() {
    let (h, id) = Harness::start(
        Duration::from_secs(60),
        100.0,
        draft("Collect soil samples".into(), 2),
        Some(Box::new(|_: &Message| true)),
    )
    .await;

    // 1 回目の割り当てが始まるのを待ってから、Pending に戻るのを待つ
    assert!(wait_for(Duration::from_secs(2), || {
        h.store.mission(id).is_some_and(|m| m.attempts >= 1)
    })
    .await);
    assert!(
        wait_for(Duration::from_secs(5), || h.mission_status(id) == Some(MissionStatus::Pending)).await,
        "mission was not reverted: {:?}",
        h.store.mission(id)
    );
    let record = h.store.mission(id).unwrap();
    assert_eq!(record.rover_id, None);
    assert_eq!(
        h.store.rover(ROVER).map(|r| r.status),
        Some(RoverStatus::Available)
    );
    h.stop();
}

#[tokio::test]
async fn test_battery_critical_fails_mission_and_faults_rover() {
    let mut mission = draft("Drive to the far ridge".into(), 5);
    mission.x2 = 100.0;
    mission.y2 = 100.0;
    let (h, id) = Harness::start(Duration::from_millis(100), 10.6, mission, None).await;

    assert!(
        wait_for(Duration::from_secs(10), || h.mission_status(id) == Some(MissionStatus::Failed)).await,
        "mission did not fail: {:?}",
        h.store.mission(id)
    );
    let record = h.store.mission(id).unwrap();
    assert_eq!(record.failure.as_ref().and_then(|f| f.code), Some(1));
    assert!(record.progress_reports >= 1);
    assert_eq!(
        h.store.rover(ROVER).map(|r| r.status),
        Some(RoverStatus::Fault)
    );
    h.stop();
}

#[tokio::test]
async fn test_random_loss_still_completes() {
    let mut rng = StdRng::seed_from_u64(7);
    let lose = move |_: &Message| rng.gen_bool(0.1);
    let (h, id) = Harness::start(
        Duration::from_millis(300),
        100.0,
        draft("y".repeat(1500), 2),
        Some(Box::new(lose)),
    )
    .await;

    assert!(
        wait_for(Duration::from_secs(30), || h.mission_status(id) == Some(MissionStatus::Completed)).await,
        "mission did not complete under loss: {:?}",
        h.store.mission(id)
    );
    h.stop();
}
