//! コーディネーターのランタイム
//!
//! タスク構成:
//! - 受信ループ 1 本: データグラムを (ローバー, ミッション) でセッションの受信箱へ振り分ける
//! - セッションタスク: 1 ローバーにつき 1 本。状態機械を駆動し、結果をストアへ書く
//! - 割り当てスキャナー: Pending ミッションを空いているローバーに割り当てる
//! - リーパー: `reaper` モジュール

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use missionlink_proto::{AckPayload, Header, Message, MessageKind, Payload, COORDINATOR_ID};
use missionlink_session::{CoordinatorSession, FailureReason, ProtocolConfig, SessionEvent};
use missionlink_store::{MissionDraft, MissionStore, StoreSnapshot};
use missionlink_transport::{Packet, MAX_DATAGRAM_LEN};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::clock;
use crate::config::CoordinatorConfig;
use crate::error::Result;
use crate::link::Link;
use crate::reaper::{run_reaper, ReaperConfig};
use crate::registry::{Dispatch, SessionRegistry, SessionStatus};

/// タスク間で共有するもの
struct Shared {
    link: Link,
    store: Arc<MissionStore>,
    registry: Arc<SessionRegistry>,
    protocol: ProtocolConfig,
}

pub struct Coordinator {
    config: CoordinatorConfig,
    shared: Arc<Shared>,
}

impl Coordinator {
    /// ソケットを開き、設定にあるローバーを登録する
    pub async fn bind(config: CoordinatorConfig) -> Result<Self> {
        let link = Link::bind(config.bind).await?;
        let store = Arc::new(MissionStore::new());
        for rover in &config.rovers {
            store.register_rover(rover.id, Some(rover.addr));
        }
        info!(
            local = %link.local_addr(),
            rovers = config.rovers.len(),
            "coordinator listening"
        );
        Ok(Coordinator {
            shared: Arc::new(Shared {
                link,
                store,
                registry: Arc::new(SessionRegistry::new()),
                protocol: config.protocol.clone(),
            }),
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.link.local_addr()
    }

    pub fn store(&self) -> Arc<MissionStore> {
        Arc::clone(&self.shared.store)
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.shared.registry)
    }

    pub fn register_rover(&self, id: i32, addr: SocketAddr) {
        self.shared.store.register_rover(id, Some(addr));
    }

    /// 割り当て待ちにミッションを積む
    pub fn submit_mission(&self, draft: MissionDraft) -> Result<i32> {
        Ok(self.shared.store.submit_mission(draft, clock::now_secs())?)
    }

    /// 現在のローバー・ミッション状態
    pub fn snapshot(&self) -> StoreSnapshot {
        self.shared.store.snapshot()
    }

    /// シャットダウンまで受信ループ・スキャナー・リーパーを動かす
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let io = tokio::spawn(receive_loop(Arc::clone(&self.shared), shutdown.clone()));
        let reaper = tokio::spawn(run_reaper(
            Arc::clone(&self.shared.registry),
            Arc::clone(&self.shared.store),
            ReaperConfig {
                interval: self.config.reaper_interval,
                inactivity_timeout: self.config.inactivity_timeout,
                fault_cooldown: self.config.fault_cooldown,
            },
            shutdown.clone(),
        ));

        let mut ticker = interval(self.config.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut stop = shutdown.clone();
        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.scan_once(&shutdown);
                }
            }
        }

        info!("coordinator shutting down");
        if let Err(e) = io.await {
            warn!(error = %e, "receive loop ended abnormally");
        }
        if let Err(e) = reaper.await {
            warn!(error = %e, "reaper ended abnormally");
        }
        Ok(())
    }

    /// Pending ミッションを優先度順に空きローバーへ割り当てる
    ///
    /// # 戻り値
    /// 開始したセッション数
    pub fn scan_once(&self, shutdown: &watch::Receiver<bool>) -> usize {
        let store = &self.shared.store;
        let registry = &self.shared.registry;
        let mut rovers = store
            .available_rovers()
            .into_iter()
            .filter(|id| !registry.contains(*id));

        let mut started = 0;
        for mission in store.pending_missions() {
            let Some(rover_id) = rovers.next() else {
                break;
            };
            if start_session(&self.shared, rover_id, mission.mission_id, shutdown.clone()) {
                started += 1;
            }
        }
        if started > 0 {
            debug!(started, active = registry.len(), "assignment scan");
        }
        started
    }
}

/// 枠の確保 → ストアの予約 → タスク起動。途中で失敗したら戻す
fn start_session(
    shared: &Arc<Shared>,
    rover_id: i32,
    mission_id: i32,
    shutdown: watch::Receiver<bool>,
) -> bool {
    let store = &shared.store;
    let registry = &shared.registry;

    let Some((inbox, status)) = registry.try_reserve(rover_id, mission_id, clock::now_ms()) else {
        return false;
    };
    let mission = match store.begin_assignment(rover_id, mission_id) {
        Ok(mission) => mission,
        Err(e) => {
            debug!(rover = rover_id, mission = mission_id, error = %e, "assignment skipped");
            registry.remove(rover_id, mission_id);
            return false;
        }
    };
    let Some(peer) = store.rover(rover_id).and_then(|r| r.endpoint) else {
        warn!(rover = rover_id, "rover has no known address");
        let _ = store.revert_mission(mission_id, "rover address unknown");
        registry.remove(rover_id, mission_id);
        return false;
    };
    let session = match CoordinatorSession::new(shared.protocol.clone(), rover_id, mission) {
        Ok(session) => session,
        Err(e) => {
            // 何度やっても送れないので戻さない
            warn!(mission = mission_id, error = %e, "mission cannot be fragmented");
            let _ = store.abandon_mission(mission_id, &e.to_string());
            registry.remove(rover_id, mission_id);
            return false;
        }
    };

    tokio::spawn(drive_session(
        Arc::clone(shared),
        session,
        peer,
        inbox,
        status,
        shutdown,
    ));
    true
}

/// 1 セッションを終端まで駆動する
async fn drive_session(
    shared: Arc<Shared>,
    mut session: CoordinatorSession,
    mut peer: SocketAddr,
    mut inbox: mpsc::UnboundedReceiver<Packet>,
    status: Arc<SessionStatus>,
    mut shutdown: watch::Receiver<bool>,
) {
    let agent_id = session.agent_id();
    let mission_id = session.mission_id();
    let mut endpoint_bound = false;

    let hello = session.start(clock::now_ms());
    transmit(&shared, &mut session, hello, peer).await;

    loop {
        apply_events(&shared.store, &mut session);
        status.update(&session);
        if session.is_finished() {
            break;
        }

        let deadline = session.next_deadline();
        tokio::select! {
            received = inbox.recv() => {
                let Some(packet) = received else {
                    // リーパーに回収された
                    info!(agent = agent_id, mission = mission_id, "session evicted");
                    return;
                };
                if !endpoint_bound {
                    endpoint_bound = true;
                    if packet.peer != peer {
                        debug!(agent = agent_id, from = %peer, to = %packet.peer, "agent endpoint rebound");
                    }
                    peer = packet.peer;
                    if let Err(e) = shared.store.set_rover_endpoint(agent_id, peer) {
                        debug!(agent = agent_id, error = %e, "endpoint not recorded");
                    }
                }
                let now = clock::now_ms();
                status.touch(now);
                let out = session.handle_message(&packet.message, now);
                transmit(&shared, &mut session, out, peer).await;
            }
            _ = tokio::time::sleep(clock::until(deadline.unwrap_or(0))), if deadline.is_some() => {
                let out = session.poll(clock::now_ms());
                transmit(&shared, &mut session, out, peer).await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!(agent = agent_id, mission = mission_id, "session stopped by shutdown");
                    return;
                }
            }
        }
    }

    shared.registry.remove(agent_id, mission_id);
    debug!(agent = agent_id, mission = mission_id, outcome = ?session.outcome(), "session finished");
}

/// 送信する。ミッション転送はフラグメント間隔を空け、送り終えたら状態機械に知らせる
async fn transmit(shared: &Shared, session: &mut CoordinatorSession, messages: Vec<Message>, peer: SocketAddr) {
    if messages.is_empty() {
        return;
    }
    let transfer = messages.len() > 1 && messages.iter().all(|m| m.kind() == MessageKind::Mission);
    let gap = transfer.then(|| Duration::from_millis(shared.protocol.fragment_send_gap_ms));
    shared.link.send_all(messages, peer, gap).await;
    session.mark_transmitted(clock::now_ms());
}

/// セッションの出来事をストアへ反映する
fn apply_events(store: &MissionStore, session: &mut CoordinatorSession) {
    let mission_id = session.mission_id();
    for event in session.take_events() {
        let result = match event {
            SessionEvent::Accepted => store.mark_in_progress(mission_id),
            SessionEvent::Progress(progress) => store.record_progress(mission_id, &progress),
            SessionEvent::Completed => store.complete_mission(mission_id),
            SessionEvent::Failed {
                reason: FailureReason::MissionError(error),
                ..
            } => store.fail_mission_with_error(mission_id, &error, clock::now_ms()),
            SessionEvent::Failed {
                reason,
                progress_seen: false,
            } => store.revert_mission(mission_id, &reason.to_string()),
            SessionEvent::Failed {
                reason,
                progress_seen: true,
            } => store.abandon_mission(mission_id, &reason.to_string()),
        };
        if let Err(e) = result {
            warn!(mission = mission_id, error = %e, "store update failed");
        }
    }
}

async fn receive_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            received = shared.link.recv(&mut buf) => match received {
                Ok(Some(packet)) => route(&shared, packet).await,
                Ok(None) => {}
                Err(e) => warn!(error = %e, "receive failed"),
            }
        }
    }
    debug!("coordinator receive loop stopped");
}

async fn route(shared: &Shared, packet: Packet) {
    let header = &packet.message.header;
    if header.receiver != COORDINATOR_ID {
        debug!(receiver = header.receiver, peer = %packet.peer, "datagram for someone else");
        return;
    }
    let (agent_id, mission_id) = (header.sender, header.mission_id);
    match shared.registry.dispatch(agent_id, mission_id, packet) {
        Dispatch::Delivered => {}
        Dispatch::NoSession(packet) => answer_without_session(shared, packet).await,
    }
}

/// セッションが消えた後の報告に Ack だけ返す
///
/// 終端報告には最終 Ack を返し、ローバーの再送を止める。
async fn answer_without_session(shared: &Shared, packet: Packet) {
    let msg = &packet.message;
    let kind = msg.kind();
    if !kind.is_report() {
        debug!(agent = msg.header.sender, ?kind, "no session for message");
        return;
    }
    let final_ack = kind.is_terminal_report();
    debug!(
        agent = msg.header.sender,
        mission = msg.header.mission_id,
        seq = msg.seq(),
        final_ack,
        "acknowledging report without session"
    );
    let ack = Message::new(
        Header::new(MessageKind::Ack, COORDINATOR_ID, msg.header.sender, msg.header.mission_id)
            .with_seq(msg.seq())
            .with_success(true),
        Payload::Ack(AckPayload {
            missing: Vec::new(),
            final_ack,
        }),
    );
    shared.link.send(ack, packet.peer).await;
}
