//! 滞留セッションの回収とストアとの整合
//!
//! 1 回の `sweep` で次を行う。
//! - 無通信が続いたセッションを消し、ミッションを戻す（進捗があれば Failed）
//! - 終端に達したのに残っているセッションを消す（最終 Ack 送信中は除く）
//! - セッションのない拘束中ローバーを解放する
//! - クールダウンを過ぎた Fault ローバーを戻す

use std::sync::Arc;
use std::time::Duration;

use missionlink_store::{MissionStore, Release};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::clock;
use crate::registry::SessionRegistry;

#[derive(Debug, Clone, Copy)]
pub struct ReaperConfig {
    pub interval: Duration,
    pub inactivity_timeout: Duration,
    pub fault_cooldown: Duration,
}

#[derive(Debug, Default, PartialEq)]
pub struct SweepReport {
    /// 無通信で消したセッション（ローバー ID）
    pub stale: Vec<i32>,
    /// 終端後に残っていたセッション
    pub terminal: Vec<i32>,
    pub orphans: Vec<Release>,
    pub recovered: Vec<i32>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.stale.is_empty()
            && self.terminal.is_empty()
            && self.orphans.is_empty()
            && self.recovered.is_empty()
    }
}

pub fn sweep(
    registry: &SessionRegistry,
    store: &MissionStore,
    config: &ReaperConfig,
    now_ms: u64,
) -> SweepReport {
    let mut report = SweepReport::default();
    let inactivity_ms = config.inactivity_timeout.as_millis() as u64;

    for (agent_id, handle) in registry.entries() {
        let status = &handle.status;
        if status.is_terminal() {
            if status.final_ack_in_flight() {
                continue;
            }
            if registry.remove(agent_id, handle.mission_id) {
                report.terminal.push(agent_id);
            }
            continue;
        }

        let idle_ms = now_ms.saturating_sub(status.last_activity_ms());
        if idle_ms <= inactivity_ms || !registry.remove(agent_id, handle.mission_id) {
            continue;
        }
        warn!(agent = agent_id, mission = handle.mission_id, idle_ms, "reaping inactive session");
        report.stale.push(agent_id);
        let result = if status.progress_seen() {
            store.abandon_mission(handle.mission_id, "session inactive")
        } else {
            store.revert_mission(handle.mission_id, "session inactive")
        };
        if let Err(e) = result {
            warn!(mission = handle.mission_id, error = %e, "could not update reaped mission");
        }
    }

    for rover_id in store.engaged_rovers() {
        if registry.contains(rover_id) {
            continue;
        }
        if let Some(release) = store.release_orphan(rover_id) {
            report.orphans.push(release);
        }
    }

    report.recovered = store.recover_faulted(now_ms, config.fault_cooldown.as_millis() as u64);
    report
}

/// シャットダウンまで一定間隔で `sweep` する
pub async fn run_reaper(
    registry: Arc<SessionRegistry>,
    store: Arc<MissionStore>,
    config: ReaperConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(interval_ms = config.interval.as_millis() as u64, "reaper started");

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let report = sweep(&registry, &store, &config, clock::now_ms());
                if !report.is_empty() {
                    info!(
                        stale = report.stale.len(),
                        terminal = report.terminal.len(),
                        orphans = report.orphans.len(),
                        recovered = report.recovered.len(),
                        "reaper sweep"
                    );
                }
            }
        }
    }
    info!("reaper stopped");
}
