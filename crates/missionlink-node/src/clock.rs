//! 壁時計。状態機械に渡す `now_ms` はすべてここから取る

use std::time::Duration;

use chrono::Utc;

/// エポックミリ秒
pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// エポック秒
pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

/// `deadline_ms` までの残り時間（過ぎていれば 0）
pub fn until(deadline_ms: u64) -> Duration {
    Duration::from_millis(deadline_ms.saturating_sub(now_ms()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_until_past_deadline_is_zero() {
        assert_eq!(until(0), Duration::ZERO);
        assert!(until(now_ms() + 60_000) > Duration::from_secs(50));
    }
}
