//! ストアに保持するローバー・ミッションのレコード

use std::net::SocketAddr;

use missionlink_proto::MissionPayload;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// 報告間隔・ミッション時間が未指定のときの既定値（秒）
const DEFAULT_DURATION_SECS: i64 = 60;
const DEFAULT_UPDATE_INTERVAL_SECS: i64 = 2;

/// ミッション時間の上限（7 日）
pub const MAX_DURATION_SECS: i64 = 7 * 24 * 3600;
/// 報告間隔の上限（1 時間）
pub const MAX_UPDATE_INTERVAL_SECS: i64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoverStatus {
    Available,
    ReceivingMission,
    OnMission,
    Fault,
}

impl RoverStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::ReceivingMission => "receiving_mission",
            Self::OnMission => "on_mission",
            Self::Fault => "fault",
        }
    }

    /// ミッションに拘束されている
    pub fn is_engaged(&self) -> bool {
        matches!(self, Self::ReceivingMission | Self::OnMission)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    Pending,
    /// ハンドシェイク・転送中
    Assigned,
    InProgress,
    Completed,
    Failed,
}

impl MissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// ローバーに割り当てられている
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Assigned | Self::InProgress)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoverRecord {
    pub id: i32,
    pub endpoint: Option<SocketAddr>,
    pub status: RoverStatus,
    pub mission_id: Option<i32>,
    pub progress: f32,
    pub battery: f32,
    pub x: f32,
    pub y: f32,
    /// Fault になった時刻（エポックミリ秒）
    pub fault_since_ms: Option<u64>,
}

impl RoverRecord {
    pub fn new(id: i32, endpoint: Option<SocketAddr>) -> Self {
        Self {
            id,
            endpoint,
            status: RoverStatus::Available,
            mission_id: None,
            progress: 0.0,
            battery: 100.0,
            x: 0.0,
            y: 0.0,
            fault_since_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionFailure {
    /// ローバーが報告したエラーコード。プロトコル上の失敗では None
    pub code: Option<i32>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionRecord {
    pub mission: MissionPayload,
    pub status: MissionStatus,
    pub progress: f32,
    pub elapsed_secs: i64,
    pub rover_id: Option<i32>,
    pub failure: Option<MissionFailure>,
    /// 割り当てられた回数
    pub attempts: u32,
    /// 現在の割り当てで受け取った進捗報告の数
    pub progress_reports: u32,
}

impl MissionRecord {
    pub fn pending(mission: MissionPayload) -> Self {
        Self {
            mission,
            status: MissionStatus::Pending,
            progress: 0.0,
            elapsed_secs: 0,
            rover_id: None,
            failure: None,
            attempts: 0,
            progress_reports: 0,
        }
    }

    pub fn id(&self) -> i32 {
        self.mission.mission_id
    }
}

/// 投入されるミッションの記述（ID はストアが採番する）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionDraft {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub task: String,
    #[serde(default)]
    pub duration_secs: i64,
    #[serde(default)]
    pub update_interval_secs: i64,
    /// 開始時刻（エポック秒）。省略時は投入時刻
    #[serde(default)]
    pub start_time: Option<i64>,
    pub priority: i32,
}

impl MissionDraft {
    /// JSON 配列からドラフト一覧を読む
    pub fn list_from_json(json: &str) -> Result<Vec<MissionDraft>> {
        Ok(serde_json::from_str(json)?)
    }

    /// 登録できる内容かを検証する
    ///
    /// # エラー
    /// 優先度が 1..=5 の範囲外、座標が有限でない、タスクが空
    pub fn validate(&self) -> Result<()> {
        if !(1..=5).contains(&self.priority) {
            return Err(StoreError::InvalidMission {
                reason: format!("priority {} outside 1..=5", self.priority),
            });
        }
        if ![self.x1, self.y1, self.x2, self.y2].iter().all(|v| v.is_finite()) {
            return Err(StoreError::InvalidMission {
                reason: "area coordinates must be finite".into(),
            });
        }
        if self.task.trim().is_empty() {
            return Err(StoreError::InvalidMission {
                reason: "task is empty".into(),
            });
        }
        Ok(())
    }

    /// 検証して `MissionPayload` にする
    ///
    /// 時間と報告間隔は 0 以下なら既定値、上限を超えれば上限に丸める。
    ///
    /// # エラー
    /// `validate` と同じ
    pub fn into_payload(self, mission_id: i32, now_secs: i64) -> Result<MissionPayload> {
        self.validate()?;

        Ok(MissionPayload {
            mission_id,
            x1: self.x1,
            y1: self.y1,
            x2: self.x2,
            y2: self.y2,
            task: self.task,
            duration_secs: positive_or(self.duration_secs, DEFAULT_DURATION_SECS).min(MAX_DURATION_SECS),
            update_interval_secs: positive_or(self.update_interval_secs, DEFAULT_UPDATE_INTERVAL_SECS)
                .min(MAX_UPDATE_INTERVAL_SECS),
            start_time: self.start_time.unwrap_or(now_secs),
            priority: self.priority,
        })
    }
}

fn positive_or(value: i64, default: i64) -> i64 {
    if value > 0 {
        value
    } else {
        default
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn draft(priority: i32) -> MissionDraft {
        MissionDraft {
            x1: 0.0,
            y1: 0.0,
            x2: 2.0,
            y2: 2.0,
            task: "photograph crater".into(),
            duration_secs: 0,
            update_interval_secs: -1,
            start_time: None,
            priority,
        }
    }

    #[test]
    fn test_draft_defaults() {
        let payload = draft(3).into_payload(7, 1_700_000_000).unwrap();
        assert_eq!(payload.mission_id, 7);
        assert_eq!(payload.duration_secs, 60);
        assert_eq!(payload.update_interval_secs, 2);
        assert_eq!(payload.start_time, 1_700_000_000);
    }

    #[test]
    fn test_draft_priority_range() {
        assert!(matches!(
            draft(0).into_payload(1, 0),
            Err(StoreError::InvalidMission { .. })
        ));
        assert!(draft(5).into_payload(1, 0).is_ok());
        assert!(draft(6).into_payload(1, 0).is_err());
    }

    #[test]
    fn test_draft_huge_times_are_capped() {
        let mut d = draft(2);
        d.duration_secs = i64::MAX;
        d.update_interval_secs = i64::MAX;
        let payload = d.into_payload(1, 0).unwrap();
        assert_eq!(payload.duration_secs, MAX_DURATION_SECS);
        assert_eq!(payload.update_interval_secs, MAX_UPDATE_INTERVAL_SECS);

        let mut d = draft(2);
        d.duration_secs = 90;
        d.update_interval_secs = 5;
        let payload = d.into_payload(1, 0).unwrap();
        assert_eq!(payload.duration_secs, 90);
        assert_eq!(payload.update_interval_secs, 5);
    }

    #[test]
    fn test_draft_validate_rejects_bad_fields() {
        let mut d = draft(3);
        d.x2 = f32::NAN;
        assert!(d.validate().is_err());

        let mut d = draft(3);
        d.task = "   ".into();
        assert!(d.validate().is_err());

        assert!(draft(3).validate().is_ok());
    }

    #[test]
    fn test_draft_list_from_json() {
        let json = r#"[
            {"x1": 0, "y1": 0, "x2": 5, "y2": 5, "task": "survey", "priority": 2},
            {"x1": 1, "y1": 1, "x2": 2, "y2": 2, "task": "drill", "duration_secs": 30,
             "update_interval_secs": 3, "start_time": 10, "priority": 5}
        ]"#;
        let drafts = MissionDraft::list_from_json(json).unwrap();
        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[1].duration_secs, 30);
        assert_eq!(drafts[1].start_time, Some(10));

        assert!(matches!(
            MissionDraft::list_from_json("{"),
            Err(StoreError::Json(_))
        ));
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(RoverStatus::ReceivingMission.as_str(), "receiving_mission");
        assert_eq!(MissionStatus::InProgress.as_str(), "in_progress");
        assert!(MissionStatus::Failed.is_finished());
        assert!(RoverStatus::OnMission.is_engaged());
        assert!(!RoverStatus::Fault.is_engaged());
    }
}
