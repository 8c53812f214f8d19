//! # missionlink-store
//!
//! コーディネーターが持つローバー・ミッションの状態テーブル。
//!
//! セッションタスク・割り当てスキャナー・リーパーが同時に読み書きするため
//! `DashMap` で保持する。外部（観測 API など）へは `snapshot()` の JSON だけを出す。

pub mod error;
pub mod model;
pub mod store;

pub use error::{Result, StoreError};
pub use model::{
    MissionDraft, MissionFailure, MissionRecord, MissionStatus, RoverRecord, RoverStatus,
    MAX_DURATION_SECS, MAX_UPDATE_INTERVAL_SECS,
};
pub use store::{MissionStore, Release, StoreSnapshot};
