//! コーディネーター側セッション状態機械
//!
//! 1 ローバー × 1 ミッションの配送と監視を担当する。
//! ハンドシェイク → ミッション転送（必要なら分割）→ 確認 → 進捗監視 → 終端、と進む。

use std::collections::BTreeSet;
use std::fmt;

use missionlink_proto::{
    AckPayload, ErrorCode, ErrorPayload, FieldSchema, Header, Message, MessageKind, MissionPayload,
    Payload, ProgressPayload, COORDINATOR_ID,
};
use missionlink_transport::{Fragmenter, TransportError};
use tracing::{debug, info, warn};

use crate::config::ProtocolConfig;
use crate::{FIRST_FRAGMENT_SEQ, HELLO_SEQ};

/// セッションの失敗理由
#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    /// Hello に応答がない
    AgentUnresponsive,
    /// Response(success=false)
    AgentDeclined,
    /// ミッション転送の確認が来ない
    AckTimeout,
    /// 進捗報告が途絶えた
    ProgressTimeout,
    /// ローバーがミッション実行エラーを報告した
    MissionError(ErrorPayload),
}

impl FailureReason {
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            FailureReason::MissionError(e) => Some(e.code),
            _ => None,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::AgentUnresponsive => write!(f, "agent unresponsive"),
            FailureReason::AgentDeclined => write!(f, "agent declined the mission"),
            FailureReason::AckTimeout => write!(f, "mission transfer was never acknowledged"),
            FailureReason::ProgressTimeout => write!(f, "progress reports stopped"),
            FailureReason::MissionError(e) => {
                write!(f, "mission error {}: {}", e.code.code(), e.description)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Completed,
    Failed(FailureReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorPhase {
    Idle,
    AwaitingResponse,
    Transmitting,
    AwaitingAck,
    SupervisingProgress,
    Terminal(SessionOutcome),
}

/// ミッションストアへ反映すべき出来事
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// ミッションの受信が確認された
    Accepted,
    Progress(ProgressPayload),
    Completed,
    Failed {
        reason: FailureReason,
        /// 失敗前に進捗報告を一度でも受け取ったか
        progress_seen: bool,
    },
}

pub struct CoordinatorSession {
    config: ProtocolConfig,
    agent_id: i32,
    mission: MissionPayload,
    phase: CoordinatorPhase,
    /// ミッション転送メッセージ（seq 順）
    transfer: Vec<Message>,
    /// 現フェーズで使った再送回数
    retries_used: u32,
    deadline_ms: Option<u64>,
    /// 最後に受け入れた報告 seq（0 = まだない）
    last_seq: i32,
    /// 欠落している報告 seq
    lost: BTreeSet<i32>,
    progress_seen: bool,
    final_acks_remaining: u32,
    final_ack_seq: i32,
    next_final_ack_ms: u64,
    last_activity_ms: u64,
    events: Vec<SessionEvent>,
}

impl CoordinatorSession {
    /// ミッション転送メッセージを組み立ててセッションを生成する
    ///
    /// # エラー
    /// フラグメントサイズが小さすぎてミッションを分割できない
    pub fn new(config: ProtocolConfig, agent_id: i32, mission: MissionPayload) -> Result<Self, TransportError> {
        let transfer = build_transfer(&config, agent_id, &mission)?;
        Ok(CoordinatorSession {
            config,
            agent_id,
            mission,
            phase: CoordinatorPhase::Idle,
            transfer,
            retries_used: 0,
            deadline_ms: None,
            last_seq: 0,
            lost: BTreeSet::new(),
            progress_seen: false,
            final_acks_remaining: 0,
            final_ack_seq: 0,
            next_final_ack_ms: 0,
            last_activity_ms: 0,
            events: Vec::new(),
        })
    }

    /// Hello を送ってハンドシェイクを始める
    pub fn start(&mut self, now_ms: u64) -> Vec<Message> {
        if self.phase != CoordinatorPhase::Idle {
            return Vec::new();
        }
        info!(agent = self.agent_id, mission = self.mission.mission_id, "starting handshake");
        self.phase = CoordinatorPhase::AwaitingResponse;
        self.retries_used = 0;
        self.deadline_ms = Some(now_ms + self.config.timeout_ms);
        self.last_activity_ms = now_ms;
        vec![self.hello()]
    }

    /// ローバーからのメッセージを処理し、返信を返す
    pub fn handle_message(&mut self, msg: &Message, now_ms: u64) -> Vec<Message> {
        if msg.header.sender != self.agent_id || msg.header.mission_id != self.mission.mission_id {
            debug!(
                agent = self.agent_id,
                sender = msg.header.sender,
                mission = msg.header.mission_id,
                "message for another session ignored"
            );
            return Vec::new();
        }
        self.last_activity_ms = now_ms;

        match msg.kind() {
            MessageKind::Response => self.on_response(msg),
            MessageKind::Ack => self.on_ack(msg, now_ms),
            kind if kind.is_report() => self.on_report(msg, now_ms),
            kind => {
                debug!(agent = self.agent_id, ?kind, "unexpected message kind ignored");
                Vec::new()
            }
        }
    }

    /// タイムアウト処理。`next_deadline()` を過ぎたら呼ぶ
    pub fn poll(&mut self, now_ms: u64) -> Vec<Message> {
        if let CoordinatorPhase::Terminal(_) = self.phase {
            if self.final_acks_remaining > 0 && now_ms >= self.next_final_ack_ms {
                self.final_acks_remaining -= 1;
                self.next_final_ack_ms = now_ms + self.config.final_ack_gap_ms;
                return vec![self.final_ack(self.final_ack_seq)];
            }
            return Vec::new();
        }

        match self.deadline_ms {
            Some(deadline) if now_ms >= deadline => {}
            _ => return Vec::new(),
        }

        match self.phase {
            CoordinatorPhase::AwaitingResponse => {
                // 最初の送信も 1 回に数える
                if self.retries_used + 1 < self.config.max_retries {
                    self.retries_used += 1;
                    self.deadline_ms = Some(now_ms + self.config.timeout_ms);
                    debug!(agent = self.agent_id, retry = self.retries_used, "resending hello");
                    vec![self.hello()]
                } else {
                    self.fail(FailureReason::AgentUnresponsive)
                }
            }
            CoordinatorPhase::AwaitingAck => {
                if self.retries_used + 1 < self.config.max_retries {
                    self.retries_used += 1;
                    self.deadline_ms = Some(now_ms + self.config.timeout_ms);
                    warn!(
                        agent = self.agent_id,
                        retry = self.retries_used,
                        fragments = self.transfer.len(),
                        "no mission ack, retransmitting everything"
                    );
                    self.transfer.clone()
                } else {
                    self.fail(FailureReason::AckTimeout)
                }
            }
            CoordinatorPhase::SupervisingProgress => self.fail(FailureReason::ProgressTimeout),
            _ => Vec::new(),
        }
    }

    /// 転送メッセージをすべて送り終えたことを通知する
    pub fn mark_transmitted(&mut self, now_ms: u64) {
        if self.phase == CoordinatorPhase::Transmitting {
            self.phase = CoordinatorPhase::AwaitingAck;
            self.retries_used = 0;
            self.deadline_ms = Some(now_ms + self.config.timeout_ms);
        }
    }

    /// 次に `poll` すべき時刻
    pub fn next_deadline(&self) -> Option<u64> {
        match self.phase {
            CoordinatorPhase::Terminal(_) => {
                (self.final_acks_remaining > 0).then_some(self.next_final_ack_ms)
            }
            _ => self.deadline_ms,
        }
    }

    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn phase(&self) -> &CoordinatorPhase {
        &self.phase
    }

    pub fn outcome(&self) -> Option<&SessionOutcome> {
        match &self.phase {
            CoordinatorPhase::Terminal(outcome) => Some(outcome),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome().is_some()
    }

    /// 最終 Ack の送信中か
    pub fn final_ack_in_flight(&self) -> bool {
        self.is_terminal() && self.final_acks_remaining > 0
    }

    /// 終端に達し、送るものも残っていない
    pub fn is_finished(&self) -> bool {
        self.is_terminal() && self.final_acks_remaining == 0
    }

    pub fn agent_id(&self) -> i32 {
        self.agent_id
    }

    pub fn mission_id(&self) -> i32 {
        self.mission.mission_id
    }

    pub fn mission(&self) -> &MissionPayload {
        &self.mission
    }

    pub fn progress_seen(&self) -> bool {
        self.progress_seen
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms
    }

    pub fn lost_reports(&self) -> Vec<i32> {
        self.lost.iter().copied().collect()
    }

    pub fn fragment_count(&self) -> usize {
        self.transfer.len()
    }

    fn on_response(&mut self, msg: &Message) -> Vec<Message> {
        if self.phase != CoordinatorPhase::AwaitingResponse {
            debug!(agent = self.agent_id, "duplicate response ignored");
            return Vec::new();
        }
        if !msg.header.success {
            warn!(agent = self.agent_id, mission = self.mission.mission_id, "agent declined mission");
            return self.fail(FailureReason::AgentDeclined);
        }
        info!(
            agent = self.agent_id,
            mission = self.mission.mission_id,
            fragments = self.transfer.len(),
            "agent available, transmitting mission"
        );
        self.phase = CoordinatorPhase::Transmitting;
        self.deadline_ms = None;
        self.transfer.clone()
    }

    fn on_ack(&mut self, msg: &Message, now_ms: u64) -> Vec<Message> {
        if !matches!(self.phase, CoordinatorPhase::Transmitting | CoordinatorPhase::AwaitingAck) {
            debug!(agent = self.agent_id, seq = msg.seq(), "late mission ack ignored");
            return Vec::new();
        }
        let missing = match &msg.payload {
            Payload::Ack(ack) => ack.missing.as_slice(),
            _ => &[],
        };
        if missing.is_empty() {
            self.accept(now_ms);
            return Vec::new();
        }

        let retransmit: Vec<Message> = self
            .transfer
            .iter()
            .filter(|m| missing.contains(&m.seq()))
            .cloned()
            .collect();
        debug!(
            agent = self.agent_id,
            requested = missing.len(),
            resent = retransmit.len(),
            "retransmitting missing fragments"
        );
        self.phase = CoordinatorPhase::AwaitingAck;
        self.deadline_ms = Some(now_ms + self.config.timeout_ms);
        retransmit
    }

    fn on_report(&mut self, msg: &Message, now_ms: u64) -> Vec<Message> {
        match self.phase {
            CoordinatorPhase::Transmitting | CoordinatorPhase::AwaitingAck => {
                // 空 Ack が失われても報告が届けば受信済みとみなす
                self.accept(now_ms);
                self.supervise(msg, now_ms)
            }
            CoordinatorPhase::SupervisingProgress => self.supervise(msg, now_ms),
            CoordinatorPhase::Terminal(_) if msg.kind().is_terminal_report() => {
                debug!(agent = self.agent_id, seq = msg.seq(), "duplicate terminal report");
                vec![self.final_ack(msg.seq())]
            }
            CoordinatorPhase::Terminal(_) => vec![self.ack(msg.seq(), false)],
            _ => Vec::new(),
        }
    }

    fn accept(&mut self, now_ms: u64) {
        info!(agent = self.agent_id, mission = self.mission.mission_id, "mission accepted by agent");
        self.phase = CoordinatorPhase::SupervisingProgress;
        self.deadline_ms = Some(now_ms.saturating_add(self.progress_timeout_ms()));
        self.events.push(SessionEvent::Accepted);
    }

    fn supervise(&mut self, msg: &Message, now_ms: u64) -> Vec<Message> {
        let seq = msg.seq();
        if seq <= self.last_seq {
            if self.lost.remove(&seq) {
                info!(agent = self.agent_id, seq, "lost report recovered");
            } else {
                debug!(agent = self.agent_id, seq, "duplicate report");
            }
            return vec![self.ack(seq, false)];
        }

        if seq > self.last_seq + 1 {
            warn!(
                agent = self.agent_id,
                from = self.last_seq + 1,
                to = seq - 1,
                "gap in report sequence"
            );
            self.lost.extend(self.last_seq + 1..seq);
        }
        self.last_seq = seq;

        match (&msg.payload, msg.kind()) {
            (Payload::Progress(p), MessageKind::Progress) => {
                debug!(agent = self.agent_id, seq, percent = p.percent, "progress");
                self.progress_seen = true;
                self.deadline_ms = Some(now_ms.saturating_add(self.progress_timeout_ms()));
                self.events.push(SessionEvent::Progress(p.clone()));
                vec![self.ack(seq, false)]
            }
            (_, MessageKind::Completed) => {
                info!(agent = self.agent_id, mission = self.mission.mission_id, "mission completed");
                self.events.push(SessionEvent::Completed);
                self.finish(SessionOutcome::Completed, seq, now_ms)
            }
            (Payload::Error(e), MessageKind::Error) => {
                warn!(
                    agent = self.agent_id,
                    mission = self.mission.mission_id,
                    code = e.code.code(),
                    description = %e.description,
                    "mission error reported"
                );
                let reason = FailureReason::MissionError(e.clone());
                self.events.push(SessionEvent::Failed {
                    reason: reason.clone(),
                    progress_seen: self.progress_seen,
                });
                self.finish(SessionOutcome::Failed(reason), seq, now_ms)
            }
            _ => Vec::new(),
        }
    }

    /// 終端報告を受けて最終 Ack の送信を始める
    fn finish(&mut self, outcome: SessionOutcome, seq: i32, now_ms: u64) -> Vec<Message> {
        self.phase = CoordinatorPhase::Terminal(outcome);
        self.deadline_ms = None;
        self.final_ack_seq = seq;
        self.final_acks_remaining = self.config.final_ack_repeats.saturating_sub(1);
        self.next_final_ack_ms = now_ms + self.config.final_ack_gap_ms;
        vec![self.final_ack(seq)]
    }

    fn fail(&mut self, reason: FailureReason) -> Vec<Message> {
        warn!(
            agent = self.agent_id,
            mission = self.mission.mission_id,
            reason = %reason,
            progress_seen = self.progress_seen,
            "session failed"
        );
        self.events.push(SessionEvent::Failed {
            reason: reason.clone(),
            progress_seen: self.progress_seen,
        });
        self.phase = CoordinatorPhase::Terminal(SessionOutcome::Failed(reason));
        self.deadline_ms = None;
        self.final_acks_remaining = 0;
        Vec::new()
    }

    fn progress_timeout_ms(&self) -> u64 {
        self.config
            .progress_timeout_ms(self.mission.update_interval_secs)
    }

    fn hello(&self) -> Message {
        Message::new(
            Header::new(MessageKind::Hello, COORDINATOR_ID, self.agent_id, self.mission.mission_id)
                .with_seq(HELLO_SEQ),
            Payload::Empty,
        )
    }

    fn ack(&self, seq: i32, final_ack: bool) -> Message {
        Message::new(
            Header::new(MessageKind::Ack, COORDINATOR_ID, self.agent_id, self.mission.mission_id)
                .with_seq(seq)
                .with_success(self.lost.is_empty()),
            Payload::Ack(AckPayload {
                missing: self.lost_reports(),
                final_ack,
            }),
        )
    }

    fn final_ack(&self, seq: i32) -> Message {
        self.ack(seq, true)
    }
}

/// ミッションを 1 メッセージ、または seq 連番のフラグメント列にする
fn build_transfer(
    config: &ProtocolConfig,
    agent_id: i32,
    mission: &MissionPayload,
) -> Result<Vec<Message>, TransportError> {
    let header = Header::new(MessageKind::Mission, COORDINATOR_ID, agent_id, mission.mission_id);
    let fields = mission.to_fields();
    let fragmenter = Fragmenter::new(config.fragment_size);

    if !fragmenter.needs_fragmentation(&fields) {
        return Ok(vec![Message::new(
            header.with_seq(FIRST_FRAGMENT_SEQ).with_total_fragments(1),
            Payload::Mission(mission.clone()),
        )]);
    }

    let fragments = fragmenter.make_fragments(&fields)?;
    let total = fragments.len() as i32;
    Ok(fragments
        .iter()
        .zip(FIRST_FRAGMENT_SEQ..)
        .map(|(fragment, seq)| {
            Message::new(
                header.clone().with_seq(seq).with_total_fragments(total),
                Payload::Fragment(fragment.to_bytes()),
            )
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const AGENT: i32 = 2;

    fn mission(task: &str) -> MissionPayload {
        MissionPayload {
            mission_id: 9,
            x1: 0.0,
            y1: 0.0,
            x2: 10.0,
            y2: 10.0,
            task: task.into(),
            duration_secs: 30,
            update_interval_secs: 2,
            start_time: 0,
            priority: 2,
        }
    }

    fn config() -> ProtocolConfig {
        ProtocolConfig::default().with_timeout_ms(1000)
    }

    fn from_agent(kind: MessageKind, seq: i32, payload: Payload) -> Message {
        Message::new(
            Header::new(kind, AGENT, COORDINATOR_ID, 9)
                .with_seq(seq)
                .with_success(true),
            payload,
        )
    }

    fn response(ok: bool) -> Message {
        let mut msg = from_agent(MessageKind::Response, HELLO_SEQ, Payload::Empty);
        msg.header.success = ok;
        msg
    }

    fn progress(seq: i32, percent: f32) -> Message {
        from_agent(
            MessageKind::Progress,
            seq,
            Payload::Progress(ProgressPayload {
                mission_id: 9,
                elapsed_secs: 1,
                percent,
            }),
        )
    }

    fn ack_missing(msg: &Message) -> Vec<i32> {
        match &msg.payload {
            Payload::Ack(a) => a.missing.clone(),
            other => panic!("not an ack: {other:?}"),
        }
    }

    /// Hello → Response → 転送 → 空 Ack まで進めたセッション
    fn supervising() -> CoordinatorSession {
        let mut s = CoordinatorSession::new(config(), AGENT, mission("scan")).unwrap();
        s.start(0);
        s.handle_message(&response(true), 10);
        s.mark_transmitted(20);
        s.handle_message(
            &from_agent(MessageKind::Ack, FIRST_FRAGMENT_SEQ, Payload::Ack(AckPayload::complete())),
            30,
        );
        assert_eq!(s.phase(), &CoordinatorPhase::SupervisingProgress);
        s.take_events();
        s
    }

    #[test]
    fn test_small_mission_single_message() {
        let mut s = CoordinatorSession::new(config(), AGENT, mission("scan")).unwrap();
        let hello = s.start(0);
        assert_eq!(hello.len(), 1);
        assert_eq!(hello[0].kind(), MessageKind::Hello);
        assert_eq!(hello[0].seq(), HELLO_SEQ);

        let out = s.handle_message(&response(true), 5);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].seq(), FIRST_FRAGMENT_SEQ);
        assert!(matches!(out[0].payload, Payload::Mission(_)));
        assert_eq!(s.phase(), &CoordinatorPhase::Transmitting);
        assert_eq!(s.next_deadline(), None);

        s.mark_transmitted(6);
        assert_eq!(s.next_deadline(), Some(1006));
    }

    #[test]
    fn test_large_mission_fragmented() {
        let s = CoordinatorSession::new(config(), AGENT, mission(&"a".repeat(2000))).unwrap();
        assert!(s.fragment_count() > 1);
        let seqs: Vec<i32> = s.transfer.iter().map(Message::seq).collect();
        let expected: Vec<i32> = (FIRST_FRAGMENT_SEQ..FIRST_FRAGMENT_SEQ + s.fragment_count() as i32).collect();
        assert_eq!(seqs, expected);
        assert!(s
            .transfer
            .iter()
            .all(|m| m.header.total_fragments == s.fragment_count() as i32));
    }

    #[test]
    fn test_fragment_size_too_small_is_error() {
        let result = CoordinatorSession::new(config().with_fragment_size(8), AGENT, mission("scan"));
        assert!(matches!(result, Err(TransportError::FragmentSizeTooSmall { .. })));
    }

    #[test]
    fn test_hello_retries_then_unresponsive() {
        let mut s = CoordinatorSession::new(config(), AGENT, mission("scan")).unwrap();
        s.start(0);
        assert!(s.poll(999).is_empty());

        // start の 1 回と合わせて MAX_RETRIES 回
        let mut now = 0;
        for _ in 1..crate::MAX_RETRIES {
            now += 1000;
            let out = s.poll(now);
            assert_eq!(out.len(), 1);
            assert_eq!(out[0].kind(), MessageKind::Hello);
        }
        now += 1000;
        assert_eq!(now, 3000);
        assert!(s.poll(now).is_empty());
        assert_eq!(
            s.take_events(),
            vec![SessionEvent::Failed {
                reason: FailureReason::AgentUnresponsive,
                progress_seen: false
            }]
        );
        assert!(s.is_finished());
        assert_eq!(s.next_deadline(), None);
    }

    #[test]
    fn test_huge_update_interval_does_not_overflow() {
        let mut m = mission("scan");
        m.update_interval_secs = i64::MAX;
        let mut s = CoordinatorSession::new(config(), AGENT, m).unwrap();
        s.start(0);
        s.handle_message(&response(true), 10);
        s.mark_transmitted(20);
        s.handle_message(
            &from_agent(MessageKind::Ack, FIRST_FRAGMENT_SEQ, Payload::Ack(AckPayload::complete())),
            30,
        );
        assert_eq!(s.phase(), &CoordinatorPhase::SupervisingProgress);
        assert_eq!(s.next_deadline(), Some(u64::MAX));

        s.handle_message(&progress(1, 1.0), 1_000);
        assert_eq!(s.next_deadline(), Some(u64::MAX));
        assert!(s.poll(1_000_000).is_empty());
        assert!(!s.is_terminal());
    }

    #[test]
    fn test_declined() {
        let mut s = CoordinatorSession::new(config(), AGENT, mission("scan")).unwrap();
        s.start(0);
        assert!(s.handle_message(&response(false), 1).is_empty());
        assert_eq!(
            s.outcome(),
            Some(&SessionOutcome::Failed(FailureReason::AgentDeclined))
        );
    }

    #[test]
    fn test_missing_ack_retransmits_without_consuming_retry() {
        let mut s = CoordinatorSession::new(config(), AGENT, mission(&"b".repeat(2000))).unwrap();
        s.start(0);
        s.handle_message(&response(true), 1);
        s.mark_transmitted(2);

        for round in 0..10u64 {
            let out = s.handle_message(
                &from_agent(MessageKind::Ack, 3, Payload::Ack(AckPayload::missing(vec![3, 5]))),
                10 + round,
            );
            assert_eq!(out.iter().map(Message::seq).collect::<Vec<_>>(), vec![3, 5]);
        }
        assert_eq!(s.retries_used, 0);
        assert_eq!(s.phase(), &CoordinatorPhase::AwaitingAck);
    }

    #[test]
    fn test_ack_timeout_retransmits_all_then_fails() {
        let mut s = CoordinatorSession::new(config(), AGENT, mission("scan")).unwrap();
        s.start(0);
        s.handle_message(&response(true), 0);
        s.mark_transmitted(0);

        // 最初の転送 + 全体再送 2 回
        for i in 1..crate::MAX_RETRIES as u64 {
            let out = s.poll(i * 1000);
            assert_eq!(out.len(), s.fragment_count());
        }
        assert!(s.poll(3000).is_empty());
        assert_eq!(
            s.outcome(),
            Some(&SessionOutcome::Failed(FailureReason::AckTimeout))
        );
    }

    #[test]
    fn test_progress_implies_acceptance() {
        let mut s = CoordinatorSession::new(config(), AGENT, mission("scan")).unwrap();
        s.start(0);
        s.handle_message(&response(true), 0);
        s.mark_transmitted(0);

        let out = s.handle_message(&progress(1, 5.0), 100);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind(), MessageKind::Ack);
        assert_eq!(out[0].seq(), 1);
        assert_eq!(s.phase(), &CoordinatorPhase::SupervisingProgress);
        assert_eq!(
            s.take_events(),
            vec![
                SessionEvent::Accepted,
                SessionEvent::Progress(ProgressPayload {
                    mission_id: 9,
                    elapsed_secs: 1,
                    percent: 5.0
                })
            ]
        );
    }

    #[test]
    fn test_gap_detection_and_recovery() {
        let mut s = supervising();
        s.handle_message(&progress(1, 10.0), 100);
        s.handle_message(&progress(2, 20.0), 200);

        let out = s.handle_message(&progress(5, 50.0), 300);
        assert_eq!(ack_missing(&out[0]), vec![3, 4]);
        assert!(!out[0].header.success);

        // 後から再送された 3 は処理されずに Ack だけ返る
        s.take_events();
        let out = s.handle_message(&progress(3, 30.0), 310);
        assert_eq!(out[0].seq(), 3);
        assert_eq!(s.lost_reports(), vec![4]);
        assert!(s.take_events().is_empty());

        // 新しいギャップは追加される
        let out = s.handle_message(&progress(7, 70.0), 400);
        assert_eq!(ack_missing(&out[0]), vec![4, 6]);
    }

    #[test]
    fn test_progress_timeout_resets_on_new_report() {
        let mut s = supervising();
        // interval 2s → 16s
        assert_eq!(s.next_deadline(), Some(30 + 16_000));
        s.handle_message(&progress(1, 10.0), 10_000);
        assert_eq!(s.next_deadline(), Some(26_000));
        // 重複ではリセットしない
        s.handle_message(&progress(1, 10.0), 20_000);
        assert_eq!(s.next_deadline(), Some(26_000));

        s.poll(26_000);
        assert_eq!(
            s.take_events().last(),
            Some(&SessionEvent::Failed {
                reason: FailureReason::ProgressTimeout,
                progress_seen: true
            })
        );
    }

    #[test]
    fn test_completed_sends_three_final_acks() {
        let mut s = supervising();
        s.handle_message(&progress(1, 50.0), 100);
        let out = s.handle_message(&from_agent(MessageKind::Completed, 2, Payload::Empty), 200);
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0].payload, Payload::Ack(a) if a.final_ack));
        assert!(s.final_ack_in_flight());
        assert!(!s.is_finished());

        assert_eq!(s.next_deadline(), Some(400));
        assert_eq!(s.poll(400).len(), 1);
        assert_eq!(s.poll(500).len(), 0);
        assert_eq!(s.poll(600).len(), 1);
        assert!(s.is_finished());
        assert_eq!(s.poll(1000).len(), 0);

        // 重複した終端報告には最終 Ack を 1 回だけ返す
        let out = s.handle_message(&from_agent(MessageKind::Completed, 2, Payload::Empty), 2000);
        assert_eq!(out.len(), 1);
        assert!(s.is_finished());
    }

    #[test]
    fn test_mission_error_fails_session() {
        let mut s = supervising();
        let error = ErrorPayload {
            mission_id: 9,
            code: ErrorCode::BatteryCritical,
            description: "low".into(),
            progress: 12.0,
            battery: 8.0,
            x: 1.0,
            y: 1.0,
            timestamp: 0,
        };
        let out = s.handle_message(&from_agent(MessageKind::Error, 1, Payload::Error(error.clone())), 100);
        assert_eq!(out.len(), 1);
        assert_eq!(
            s.take_events(),
            vec![SessionEvent::Failed {
                reason: FailureReason::MissionError(error),
                progress_seen: false
            }]
        );
        assert_eq!(
            s.outcome().and_then(|o| match o {
                SessionOutcome::Failed(r) => r.error_code(),
                SessionOutcome::Completed => None,
            }),
            Some(ErrorCode::BatteryCritical)
        );
    }

    #[test]
    fn test_foreign_messages_ignored() {
        let mut s = supervising();
        let mut msg = progress(1, 10.0);
        msg.header.sender = 77;
        assert!(s.handle_message(&msg, 100).is_empty());
        let mut msg = progress(1, 10.0);
        msg.header.mission_id = 1234;
        assert!(s.handle_message(&msg, 100).is_empty());
    }
}
