//! # missionlink-session
//!
//! コーディネーターとローバー（エージェント）の状態機械。
//!
//! どちらも I/O を持たない。受信メッセージと現在時刻 `now_ms` を渡すと
//! 送信すべきメッセージを返し、`next_deadline()` で次に `poll` すべき時刻を示す。
//! ソケットとタイマーは `missionlink-node` が担当する。
//!
//! ## コーディネーター側の状態遷移
//!
//! ```text
//! Idle → AwaitingResponse ─(Response ok)→ Transmitting → AwaitingAck
//!              │ (再送上限)                                 │ (空 Ack / 報告)
//!              ▼                                            ▼
//!        Terminal(Failed) ◀─(進捗タイムアウト)── SupervisingProgress
//!                                                           │ (Completed / Error)
//!                                                           ▼
//!                                                Terminal(最終 Ack × 3)
//! ```
//!
//! ## エージェント側の状態遷移
//!
//! ```text
//! Idle → RespondedAvailable → ReceivingFragments → Executing → ReportingTerminal → Idle
//! ```

pub mod agent;
pub mod config;
pub mod coordinator;
pub mod reliable;
pub mod rover;

#[cfg(test)]
mod scenarios;

pub use agent::{Agent, AgentEvent, AgentPhase, CloseReason};
pub use config::ProtocolConfig;
pub use coordinator::{CoordinatorPhase, CoordinatorSession, FailureReason, SessionEvent, SessionOutcome};
pub use reliable::{AckOutcome, Report, ReportSender};
pub use rover::{RoverModel, SimulationConfig};

pub use missionlink_proto::{COORDINATOR_ID, MISSIONLINK_PROTOCOL_VERSION};

/// 応答待ちタイムアウト（ミリ秒）
pub const TIMEOUT_MS: u64 = 5000;

/// Hello / ミッション全体送信の最大回数（初回を含む）
pub const MAX_RETRIES: u32 = 3;

/// デフォルトのフラグメントサイズ（バイト）
pub const DEFAULT_FRAGMENT_SIZE: usize = 512;

/// Hello の seq
pub const HELLO_SEQ: i32 = 1;

/// ミッションの最初のフラグメントの seq
pub const FIRST_FRAGMENT_SEQ: i32 = 2;

/// 欠落チェックを行うフラグメント数の間隔
pub const ACK_BATCH: usize = 5;

/// 最終 Ack の送信回数と間隔
pub const FINAL_ACK_REPEATS: u32 = 3;
pub const FINAL_ACK_GAP_MS: u64 = 200;

/// フラグメント連続送信の間隔（ミリ秒）
pub const FRAGMENT_SEND_GAP_MS: u64 = 10;

/// 進捗タイムアウト = 報告間隔 × 8
pub const PROGRESS_TIMEOUT_FACTOR: u64 = 8;

/// 報告間隔が未設定のときの進捗タイムアウト（ミリ秒）
pub const PROGRESS_TIMEOUT_FLOOR_MS: u64 = 40_000;

/// 進捗報告の再送上限
pub const PROGRESS_MAX_RETRIES: u32 = 3;

/// 終端報告（Completed / Error）の再送上限
pub const TERMINAL_MAX_RETRIES: u32 = 8;

/// ミッション時間・報告間隔が 0 以下のときの既定値（秒）
pub const DEFAULT_MISSION_DURATION_SECS: i64 = 60;
pub const DEFAULT_UPDATE_INTERVAL_SECS: i64 = 2;
