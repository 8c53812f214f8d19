//! ローバーとミッションの並行テーブル
//!
//! スキャナー・リーパー・セッションタスクから同時に更新される。
//! DashMap の参照を保持したまま別のマップ（同じマップも）に触れないこと。

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};

use dashmap::DashMap;
use missionlink_proto::{ErrorPayload, MissionPayload, ProgressPayload};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::model::{
    MissionDraft, MissionFailure, MissionRecord, MissionStatus, RoverRecord, RoverStatus,
};

/// 孤立ローバーを解放した結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Release {
    pub rover_id: i32,
    pub mission_id: Option<i32>,
    /// ミッションを Pending に戻したか（false なら Failed にした）
    pub reverted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub rovers: Vec<RoverRecord>,
    pub missions: Vec<MissionRecord>,
}

impl StoreSnapshot {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

pub struct MissionStore {
    rovers: DashMap<i32, RoverRecord>,
    missions: DashMap<i32, MissionRecord>,
    next_mission_id: AtomicI32,
}

impl Default for MissionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MissionStore {
    pub fn new() -> Self {
        Self {
            rovers: DashMap::new(),
            missions: DashMap::new(),
            next_mission_id: AtomicI32::new(1),
        }
    }

    // ---- ローバー ----

    /// ローバーを登録する。既に登録済みならエンドポイントだけ更新する
    pub fn register_rover(&self, id: i32, endpoint: Option<SocketAddr>) {
        self.rovers
            .entry(id)
            .and_modify(|r| {
                if endpoint.is_some() {
                    r.endpoint = endpoint;
                }
            })
            .or_insert_with(|| RoverRecord::new(id, endpoint));
        debug!(rover = id, ?endpoint, "rover registered");
    }

    pub fn rover(&self, id: i32) -> Option<RoverRecord> {
        self.rovers.get(&id).map(|r| r.clone())
    }

    pub fn rovers(&self) -> Vec<RoverRecord> {
        let mut rovers: Vec<RoverRecord> = self.rovers.iter().map(|r| r.clone()).collect();
        rovers.sort_by_key(|r| r.id);
        rovers
    }

    /// 最初に届いたデータグラムの送信元をエンドポイントとして記録する
    pub fn set_rover_endpoint(&self, id: i32, endpoint: SocketAddr) -> Result<()> {
        let mut rover = self.rovers.get_mut(&id).ok_or(StoreError::UnknownRover(id))?;
        rover.endpoint = Some(endpoint);
        Ok(())
    }

    /// 割り当て可能なローバー（ID 昇順）
    pub fn available_rovers(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self
            .rovers
            .iter()
            .filter(|r| r.status == RoverStatus::Available)
            .map(|r| r.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// ミッションに拘束されているローバー
    pub fn engaged_rovers(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self
            .rovers
            .iter()
            .filter(|r| r.status.is_engaged())
            .map(|r| r.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    // ---- ミッション ----

    /// ドラフトを検証して Pending として登録し、採番した ID を返す
    pub fn submit_mission(&self, draft: MissionDraft, now_secs: i64) -> Result<i32> {
        // 却下されたドラフトで ID を消費しない
        draft.validate()?;
        let id = self.next_mission_id.fetch_add(1, Ordering::SeqCst);
        let payload = draft.into_payload(id, now_secs)?;
        info!(mission = id, priority = payload.priority, "mission submitted");
        self.missions.insert(id, MissionRecord::pending(payload));
        Ok(id)
    }

    pub fn mission(&self, id: i32) -> Option<MissionRecord> {
        self.missions.get(&id).map(|m| m.clone())
    }

    pub fn missions(&self) -> Vec<MissionRecord> {
        let mut missions: Vec<MissionRecord> = self.missions.iter().map(|m| m.clone()).collect();
        missions.sort_by_key(MissionRecord::id);
        missions
    }

    /// Pending のミッションを割り当て順（優先度の高い順、同じなら ID の小さい順）に返す
    pub fn pending_missions(&self) -> Vec<MissionPayload> {
        let mut pending: Vec<MissionPayload> = self
            .missions
            .iter()
            .filter(|m| m.status == MissionStatus::Pending)
            .map(|m| m.mission.clone())
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.mission_id.cmp(&b.mission_id))
        });
        pending
    }

    // ---- 状態遷移 ----

    /// ローバーとミッションを予約する
    ///
    /// ローバーを先に押さえ、ミッションが割り当てられなければローバーを戻す。
    ///
    /// # 戻り値
    /// 送信するミッション
    pub fn begin_assignment(&self, rover_id: i32, mission_id: i32) -> Result<MissionPayload> {
        {
            let mut rover = self
                .rovers
                .get_mut(&rover_id)
                .ok_or(StoreError::UnknownRover(rover_id))?;
            if rover.status != RoverStatus::Available {
                return Err(StoreError::NotAssignable {
                    rover_id,
                    mission_id,
                    reason: "rover is not available",
                });
            }
            rover.status = RoverStatus::ReceivingMission;
            rover.mission_id = Some(mission_id);
            rover.progress = 0.0;
        }

        let reserved = match self.missions.get_mut(&mission_id) {
            None => Err(StoreError::UnknownMission(mission_id)),
            Some(m) if m.status != MissionStatus::Pending => Err(StoreError::NotAssignable {
                rover_id,
                mission_id,
                reason: "mission is not pending",
            }),
            Some(mut m) => {
                m.status = MissionStatus::Assigned;
                m.rover_id = Some(rover_id);
                m.attempts += 1;
                m.progress = 0.0;
                m.progress_reports = 0;
                m.failure = None;
                Ok(m.mission.clone())
            }
        };

        if reserved.is_err() {
            if let Some(mut rover) = self.rovers.get_mut(&rover_id) {
                rover.status = RoverStatus::Available;
                rover.mission_id = None;
            }
        } else {
            info!(rover = rover_id, mission = mission_id, "mission assigned");
        }
        reserved
    }

    /// ローバーがミッションの受信を確認した
    pub fn mark_in_progress(&self, mission_id: i32) -> Result<()> {
        let rover_id = {
            let mut m = self
                .missions
                .get_mut(&mission_id)
                .ok_or(StoreError::UnknownMission(mission_id))?;
            if m.status == MissionStatus::Assigned {
                m.status = MissionStatus::InProgress;
            }
            m.rover_id
        };
        if let Some(rover_id) = rover_id {
            self.update_rover_on(rover_id, mission_id, |r| r.status = RoverStatus::OnMission);
        }
        Ok(())
    }

    pub fn record_progress(&self, mission_id: i32, progress: &ProgressPayload) -> Result<()> {
        let rover_id = {
            let mut m = self
                .missions
                .get_mut(&mission_id)
                .ok_or(StoreError::UnknownMission(mission_id))?;
            if !m.status.is_active() {
                debug!(mission = mission_id, status = m.status.as_str(), "progress for inactive mission ignored");
                return Ok(());
            }
            m.status = MissionStatus::InProgress;
            m.progress = progress.percent;
            m.elapsed_secs = progress.elapsed_secs;
            m.progress_reports += 1;
            m.rover_id
        };
        if let Some(rover_id) = rover_id {
            self.update_rover_on(rover_id, mission_id, |r| {
                r.status = RoverStatus::OnMission;
                r.progress = progress.percent;
            });
        }
        Ok(())
    }

    pub fn complete_mission(&self, mission_id: i32) -> Result<()> {
        let rover_id = self.finish_mission(mission_id, MissionStatus::Completed, None, Some(100.0))?;
        info!(mission = mission_id, rover = ?rover_id, "mission completed");
        if let Some(rover_id) = rover_id {
            self.release_rover(rover_id, mission_id);
        }
        Ok(())
    }

    /// ローバーが報告したエラーで失敗させる。ローバーは Fault になる
    pub fn fail_mission_with_error(&self, mission_id: i32, error: &ErrorPayload, now_ms: u64) -> Result<()> {
        let failure = MissionFailure {
            code: Some(error.code.code()),
            description: error.description.clone(),
        };
        let rover_id =
            self.finish_mission(mission_id, MissionStatus::Failed, Some(failure), Some(error.progress))?;
        warn!(mission = mission_id, rover = ?rover_id, code = error.code.code(), "mission failed with rover error");
        if let Some(rover_id) = rover_id {
            self.update_rover_on(rover_id, mission_id, |r| {
                r.status = RoverStatus::Fault;
                r.mission_id = None;
                r.fault_since_ms = Some(now_ms);
                r.battery = error.battery;
                r.x = error.x;
                r.y = error.y;
                r.progress = error.progress;
            });
        }
        Ok(())
    }

    /// 進捗が出た後のプロトコル失敗。ミッションは Failed のまま、ローバーは解放する
    pub fn abandon_mission(&self, mission_id: i32, reason: &str) -> Result<()> {
        let failure = MissionFailure {
            code: None,
            description: reason.to_string(),
        };
        let rover_id = self.finish_mission(mission_id, MissionStatus::Failed, Some(failure), None)?;
        warn!(mission = mission_id, rover = ?rover_id, reason, "mission abandoned");
        if let Some(rover_id) = rover_id {
            self.release_rover(rover_id, mission_id);
        }
        Ok(())
    }

    /// 始まらなかった割り当てを取り消して Pending に戻す
    pub fn revert_mission(&self, mission_id: i32, reason: &str) -> Result<()> {
        let rover_id = {
            let mut m = self
                .missions
                .get_mut(&mission_id)
                .ok_or(StoreError::UnknownMission(mission_id))?;
            if m.status.is_finished() {
                return Ok(());
            }
            m.status = MissionStatus::Pending;
            m.progress = 0.0;
            m.elapsed_secs = 0;
            m.progress_reports = 0;
            m.rover_id.take()
        };
        info!(mission = mission_id, rover = ?rover_id, reason, "mission reverted to pending");
        if let Some(rover_id) = rover_id {
            self.release_rover(rover_id, mission_id);
        }
        Ok(())
    }

    /// セッションのないまま拘束状態のローバーを Available に戻す
    ///
    /// ミッションは進捗報告がなければ Pending に戻し、あれば Failed にする。
    pub fn release_orphan(&self, rover_id: i32) -> Option<Release> {
        let mission_id = {
            let mut rover = self.rovers.get_mut(&rover_id)?;
            if !rover.status.is_engaged() {
                return None;
            }
            rover.status = RoverStatus::Available;
            rover.progress = 0.0;
            rover.mission_id.take()
        };
        warn!(rover = rover_id, mission = ?mission_id, "releasing orphaned rover");

        let Some(mission_id) = mission_id else {
            return Some(Release {
                rover_id,
                mission_id: None,
                reverted: false,
            });
        };

        let progressed = self
            .missions
            .get(&mission_id)
            .map(|m| m.progress_reports > 0);
        let reverted = match progressed {
            Some(false) => self.revert_mission(mission_id, "orphaned before progress").is_ok(),
            Some(true) => {
                // 進捗済みなので戻さない
                let _ = self.abandon_mission(mission_id, "session lost after progress");
                false
            }
            None => false,
        };
        Some(Release {
            rover_id,
            mission_id: Some(mission_id),
            reverted,
        })
    }

    /// クールダウンを過ぎた Fault ローバーを Available に戻す
    pub fn recover_faulted(&self, now_ms: u64, cooldown_ms: u64) -> Vec<i32> {
        let mut recovered = Vec::new();
        for mut rover in self.rovers.iter_mut() {
            if rover.status != RoverStatus::Fault {
                continue;
            }
            let since = rover.fault_since_ms.unwrap_or(0);
            if now_ms.saturating_sub(since) >= cooldown_ms {
                rover.status = RoverStatus::Available;
                rover.fault_since_ms = None;
                recovered.push(rover.id);
            }
        }
        recovered.sort_unstable();
        for id in &recovered {
            info!(rover = id, "rover recovered from fault");
        }
        recovered
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            rovers: self.rovers(),
            missions: self.missions(),
        }
    }

    /// ミッションを終了状態にして担当ローバーを返す。割り当て中でなければ何もしない
    fn finish_mission(
        &self,
        mission_id: i32,
        status: MissionStatus,
        failure: Option<MissionFailure>,
        progress: Option<f32>,
    ) -> Result<Option<i32>> {
        let mut m = self
            .missions
            .get_mut(&mission_id)
            .ok_or(StoreError::UnknownMission(mission_id))?;
        if !m.status.is_active() {
            debug!(mission = mission_id, status = m.status.as_str(), "outcome for inactive mission ignored");
            return Ok(None);
        }
        m.status = status;
        m.failure = failure;
        if let Some(progress) = progress {
            m.progress = progress;
        }
        Ok(m.rover_id)
    }

    /// ローバーがまだこのミッションを担当していれば Available に戻す
    fn release_rover(&self, rover_id: i32, mission_id: i32) {
        self.update_rover_on(rover_id, mission_id, |r| {
            r.status = RoverStatus::Available;
            r.mission_id = None;
            r.progress = 0.0;
        });
    }

    /// 既に別ミッションに割り当て直されたローバーは触らない
    fn update_rover_on(&self, rover_id: i32, mission_id: i32, f: impl FnOnce(&mut RoverRecord)) {
        if let Some(mut rover) = self.rovers.get_mut(&rover_id) {
            if rover.mission_id == Some(mission_id) {
                f(&mut rover);
            }
        }
    }
}
