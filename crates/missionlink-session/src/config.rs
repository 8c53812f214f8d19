//! プロトコルのタイミング設定

use serde::{Deserialize, Serialize};

use crate::{
    ACK_BATCH, DEFAULT_FRAGMENT_SIZE, FINAL_ACK_GAP_MS, FINAL_ACK_REPEATS, FRAGMENT_SEND_GAP_MS,
    MAX_RETRIES, PROGRESS_MAX_RETRIES, PROGRESS_TIMEOUT_FACTOR, PROGRESS_TIMEOUT_FLOOR_MS,
    TERMINAL_MAX_RETRIES, TIMEOUT_MS,
};

/// 両端の状態機械が共有するタイミング・上限値
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// 応答待ちタイムアウト（Hello / フラグメント Ack / 報告 Ack）
    pub timeout_ms: u64,
    /// Hello とミッション全体送信の最大回数（初回を含む）
    pub max_retries: u32,
    /// 1 フラグメントの Field シリアライズ長上限
    pub fragment_size: usize,
    /// フラグメント連続送信の間隔
    pub fragment_send_gap_ms: u64,
    /// 最終 Ack の送信回数
    pub final_ack_repeats: u32,
    pub final_ack_gap_ms: u64,
    /// 進捗タイムアウト = 報告間隔 × この係数
    pub progress_timeout_factor: u64,
    /// 報告間隔が 0 以下のときの進捗タイムアウト
    pub progress_timeout_floor_ms: u64,
    pub progress_max_retries: u32,
    pub terminal_max_retries: u32,
    /// 何フラグメントごとに欠落チェックを行うか
    pub ack_batch: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            timeout_ms: TIMEOUT_MS,
            max_retries: MAX_RETRIES,
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            fragment_send_gap_ms: FRAGMENT_SEND_GAP_MS,
            final_ack_repeats: FINAL_ACK_REPEATS,
            final_ack_gap_ms: FINAL_ACK_GAP_MS,
            progress_timeout_factor: PROGRESS_TIMEOUT_FACTOR,
            progress_timeout_floor_ms: PROGRESS_TIMEOUT_FLOOR_MS,
            progress_max_retries: PROGRESS_MAX_RETRIES,
            terminal_max_retries: TERMINAL_MAX_RETRIES,
            ack_batch: ACK_BATCH,
        }
    }
}

impl ProtocolConfig {
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_fragment_size(mut self, fragment_size: usize) -> Self {
        self.fragment_size = fragment_size;
        self
    }

    pub fn with_final_ack_gap_ms(mut self, gap_ms: u64) -> Self {
        self.final_ack_gap_ms = gap_ms;
        self
    }

    pub fn with_progress_timeout_floor_ms(mut self, floor_ms: u64) -> Self {
        self.progress_timeout_floor_ms = floor_ms;
        self
    }

    /// 報告間隔（秒）から進捗タイムアウトを求める
    pub fn progress_timeout_ms(&self, update_interval_secs: i64) -> u64 {
        match u64::try_from(update_interval_secs) {
            Ok(secs) if secs > 0 => secs
                .saturating_mul(1000)
                .saturating_mul(self.progress_timeout_factor),
            _ => self.progress_timeout_floor_ms,
        }
    }
}
