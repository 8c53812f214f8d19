//! 受信済みフラグメント番号の追跡
//!
//! ミッションのフラグメントは `first_seq..first_seq + total` の連番で送られる。
//! 受信側はこの窓で到着済み seq を記録し、Ack に載せる欠落 seq を求める。

use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentWindow {
    first_seq: i32,
    total: i32,
    received: BTreeSet<i32>,
}

impl FragmentWindow {
    /// `total` が 1 未満なら 1 として扱う
    pub fn new(first_seq: i32, total: i32) -> Self {
        FragmentWindow {
            first_seq,
            total: total.max(1),
            received: BTreeSet::new(),
        }
    }

    pub fn first_seq(&self) -> i32 {
        self.first_seq
    }

    pub fn last_seq(&self) -> i32 {
        self.first_seq + self.total - 1
    }

    pub fn total(&self) -> i32 {
        self.total
    }

    pub fn contains_seq(&self, seq: i32) -> bool {
        (self.first_seq..=self.last_seq()).contains(&seq)
    }

    /// 到着を記録する
    ///
    /// # 戻り値
    /// 窓の範囲内で初めて受け取った seq なら `true`
    pub fn record(&mut self, seq: i32) -> bool {
        self.contains_seq(seq) && self.received.insert(seq)
    }

    pub fn received_count(&self) -> usize {
        self.received.len()
    }

    pub fn highest_received(&self) -> Option<i32> {
        self.received.last().copied()
    }

    pub fn is_complete(&self) -> bool {
        self.received.len() == self.total as usize
    }

    /// 未着の seq すべて
    pub fn missing(&self) -> Vec<i32> {
        (self.first_seq..=self.last_seq())
            .filter(|seq| !self.received.contains(seq))
            .collect()
    }

    /// 最大到着 seq より手前の未着 seq（送信途中の分は含めない）
    pub fn gaps(&self) -> Vec<i32> {
        match self.highest_received() {
            Some(highest) => (self.first_seq..highest)
                .filter(|seq| !self.received.contains(seq))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.received.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_tracks_missing_and_gaps() {
        let mut window = FragmentWindow::new(2, 6);
        assert_eq!(window.last_seq(), 7);

        assert!(window.record(2));
        assert!(window.record(5));
        assert!(!window.record(5)); // 重複
        assert!(!window.record(8)); // 範囲外

        assert_eq!(window.gaps(), vec![3, 4]);
        assert_eq!(window.missing(), vec![3, 4, 6, 7]);
        assert!(!window.is_complete());

        for seq in [3, 4, 6, 7] {
            window.record(seq);
        }
        assert!(window.is_complete());
        assert!(window.missing().is_empty());
    }

    #[test]
    fn test_window_zero_total_is_one() {
        let mut window = FragmentWindow::new(2, 0);
        assert_eq!(window.total(), 1);
        assert!(window.record(2));
        assert!(window.is_complete());
    }
}
