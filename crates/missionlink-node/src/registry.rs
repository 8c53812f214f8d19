//! コーディネーターのセッション表（ローバー ID → 実行中セッション）
//!
//! 1 ローバーにつきセッションは 1 つ。エントリを消すと受信箱の送信側が落ち、
//! セッションタスクは次の待機で終了する。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use missionlink_session::CoordinatorSession;
use missionlink_transport::Packet;
use tokio::sync::mpsc;

/// セッションタスクが公開する状態。リーパーはこれだけを読む
#[derive(Debug, Default)]
pub struct SessionStatus {
    last_activity_ms: AtomicU64,
    terminal: AtomicBool,
    final_ack_in_flight: AtomicBool,
    progress_seen: AtomicBool,
}

impl SessionStatus {
    pub fn new(now_ms: u64) -> Self {
        let status = SessionStatus::default();
        status.last_activity_ms.store(now_ms, Ordering::Relaxed);
        status
    }

    /// 状態機械の現在値を写す
    pub fn update(&self, session: &CoordinatorSession) {
        self.last_activity_ms
            .fetch_max(session.last_activity_ms(), Ordering::Relaxed);
        self.progress_seen
            .store(session.progress_seen(), Ordering::Relaxed);
        // 最終 Ack 中フラグを先に立ててから終端にする
        self.final_ack_in_flight
            .store(session.final_ack_in_flight(), Ordering::Release);
        self.terminal.store(session.is_terminal(), Ordering::Release);
    }

    pub fn touch(&self, now_ms: u64) {
        self.last_activity_ms.fetch_max(now_ms, Ordering::Relaxed);
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::Acquire)
    }

    pub fn final_ack_in_flight(&self) -> bool {
        self.final_ack_in_flight.load(Ordering::Acquire)
    }

    pub fn progress_seen(&self) -> bool {
        self.progress_seen.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub mission_id: i32,
    pub status: Arc<SessionStatus>,
    inbox: mpsc::UnboundedSender<Packet>,
}

/// `dispatch` の結果
#[derive(Debug)]
pub enum Dispatch {
    Delivered,
    /// 該当するセッションがない。パケットを返す
    NoSession(Packet),
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<i32, SessionHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// ローバーの枠を確保する。既にセッションがあれば None
    ///
    /// # 戻り値
    /// セッションタスクが使う受信箱と状態
    pub fn try_reserve(
        &self,
        agent_id: i32,
        mission_id: i32,
        now_ms: u64,
    ) -> Option<(mpsc::UnboundedReceiver<Packet>, Arc<SessionStatus>)> {
        match self.sessions.entry(agent_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let status = Arc::new(SessionStatus::new(now_ms));
                slot.insert(SessionHandle {
                    mission_id,
                    status: Arc::clone(&status),
                    inbox: tx,
                });
                Some((rx, status))
            }
        }
    }

    /// 受信パケットを担当セッションの受信箱へ入れる
    pub fn dispatch(&self, agent_id: i32, mission_id: i32, packet: Packet) -> Dispatch {
        let Some(handle) = self.sessions.get(&agent_id) else {
            return Dispatch::NoSession(packet);
        };
        if handle.mission_id != mission_id {
            return Dispatch::NoSession(packet);
        }
        match handle.inbox.send(packet) {
            Ok(()) => Dispatch::Delivered,
            // タスクは終了済み
            Err(mpsc::error::SendError(packet)) => Dispatch::NoSession(packet),
        }
    }

    /// ミッションが一致するときだけ消す
    pub fn remove(&self, agent_id: i32, mission_id: i32) -> bool {
        self.sessions
            .remove_if(&agent_id, |_, h| h.mission_id == mission_id)
            .is_some()
    }

    pub fn contains(&self, agent_id: i32) -> bool {
        self.sessions.contains_key(&agent_id)
    }

    /// 現在のエントリの写し（ローバー ID 昇順）
    pub fn entries(&self) -> Vec<(i32, SessionHandle)> {
        let mut entries: Vec<(i32, SessionHandle)> = self
            .sessions
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use missionlink_proto::{Header, Message, MessageKind, Payload};

    fn packet(sender: i32, mission: i32) -> Packet {
        Packet::new(
            "127.0.0.1:9011".parse().unwrap(),
            Message::new(Header::new(MessageKind::Response, sender, 0, mission), Payload::Empty),
        )
    }

    #[test]
    fn test_one_session_per_agent() {
        let registry = SessionRegistry::new();
        let first = registry.try_reserve(1, 10, 0);
        assert!(first.is_some());
        assert!(registry.try_reserve(1, 11, 0).is_none());
        assert!(registry.try_reserve(2, 11, 0).is_some());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_dispatch_by_agent_and_mission() {
        let registry = SessionRegistry::new();
        let (mut rx, _) = registry.try_reserve(1, 10, 0).unwrap();

        assert!(matches!(registry.dispatch(1, 10, packet(1, 10)), Dispatch::Delivered));
        assert_eq!(rx.try_recv().unwrap().message.header.mission_id, 10);

        assert!(matches!(registry.dispatch(1, 99, packet(1, 99)), Dispatch::NoSession(_)));
        assert!(matches!(registry.dispatch(5, 10, packet(5, 10)), Dispatch::NoSession(_)));

        drop(rx);
        assert!(matches!(registry.dispatch(1, 10, packet(1, 10)), Dispatch::NoSession(_)));
    }

    #[test]
    fn test_remove_checks_mission() {
        let registry = SessionRegistry::new();
        let _slot = registry.try_reserve(3, 30, 0).unwrap();
        assert!(!registry.remove(3, 31));
        assert!(registry.contains(3));
        assert!(registry.remove(3, 30));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_status_touch_is_monotonic() {
        let status = SessionStatus::new(500);
        status.touch(100);
        assert_eq!(status.last_activity_ms(), 500);
        status.touch(900);
        assert_eq!(status.last_activity_ms(), 900);
        assert!(!status.is_terminal());
    }
}
