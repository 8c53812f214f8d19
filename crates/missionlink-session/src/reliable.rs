//! ローバー側の報告送信キュー（stop-and-wait）
//!
//! 同時に Ack 待ちにできる報告は 1 つだけ。seq は実際に送信する時点で採番する。
//! 送信済みの報告は seq ごとに保持し、コーディネーターの Ack が欠落 seq を
//! 列挙してきたときにそのまま再送する。

use std::collections::{BTreeMap, VecDeque};

use missionlink_proto::{
    AckPayload, ErrorPayload, Header, Message, MessageKind, Payload, ProgressPayload,
};
use tracing::debug;

use crate::config::ProtocolConfig;

/// 送信待ちの報告
#[derive(Debug, Clone, PartialEq)]
pub enum Report {
    Progress(ProgressPayload),
    Completed,
    Error(ErrorPayload),
}

impl Report {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Report::Progress(_))
    }
}

/// Ack 待ちの報告
#[derive(Debug, Clone)]
struct InFlight {
    seq: i32,
    message: Message,
    /// 送信回数（初回を含む）
    attempts: u32,
    sent_at_ms: u64,
    terminal: bool,
}

/// `on_ack` の結果
#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    /// Ack 待ちの seq と一致しない
    Ignored,
    Confirmed {
        seq: i32,
        terminal: bool,
        /// コーディネーターが欠落を報告した過去の報告
        replay: Vec<Message>,
    },
}

/// `poll` の結果
#[derive(Debug, Default)]
pub struct SendOutcome {
    pub messages: Vec<Message>,
    /// 再送上限に達して諦めた報告 (seq, 終端報告か)
    pub abandoned: Option<(i32, bool)>,
}

pub struct ReportSender {
    agent_id: i32,
    coordinator_id: i32,
    mission_id: i32,
    /// 次に採番する seq（1 始まり）
    next_seq: i32,
    queue: VecDeque<Report>,
    in_flight: Option<InFlight>,
    /// 送信済み報告（seq → メッセージ）
    sent: BTreeMap<i32, Message>,
    timeout_ms: u64,
    progress_attempts: u32,
    terminal_attempts: u32,
}

impl ReportSender {
    pub fn new(agent_id: i32, coordinator_id: i32, mission_id: i32, config: &ProtocolConfig) -> Self {
        ReportSender {
            agent_id,
            coordinator_id,
            mission_id,
            next_seq: 1,
            queue: VecDeque::new(),
            in_flight: None,
            sent: BTreeMap::new(),
            timeout_ms: config.timeout_ms,
            // 上限は再送回数なので初回送信を足す
            progress_attempts: config.progress_max_retries + 1,
            terminal_attempts: config.terminal_max_retries + 1,
        }
    }

    /// 報告を積む
    ///
    /// 未送信の進捗は新しいもので置き換える。終端報告を積むと未送信の進捗は捨てる。
    pub fn enqueue(&mut self, report: Report) {
        if report.is_terminal() {
            self.queue.retain(Report::is_terminal);
            self.queue.push_back(report);
            return;
        }
        if self.queue.iter().any(Report::is_terminal) {
            return;
        }
        if let Some(last) = self.queue.back_mut() {
            if matches!(last, Report::Progress(_)) {
                *last = report;
                return;
            }
        }
        self.queue.push_back(report);
    }

    /// Ack を処理する
    pub fn on_ack(&mut self, seq: i32, ack: &AckPayload) -> AckOutcome {
        match &self.in_flight {
            Some(f) if f.seq == seq => {}
            _ => return AckOutcome::Ignored,
        }
        let Some(confirmed) = self.in_flight.take() else {
            return AckOutcome::Ignored;
        };

        let replay: Vec<Message> = ack
            .missing
            .iter()
            .filter(|s| **s < seq)
            .filter_map(|s| self.sent.get(s).cloned())
            .collect();
        if !replay.is_empty() {
            debug!(seq, replay = replay.len(), "replaying reports the coordinator missed");
        }

        AckOutcome::Confirmed {
            seq,
            terminal: confirmed.terminal,
            replay,
        }
    }

    /// 再送と次の報告の送信を行う
    pub fn poll(&mut self, now_ms: u64) -> SendOutcome {
        let mut outcome = SendOutcome::default();

        if let Some(flight) = self.in_flight.as_mut() {
            if now_ms < flight.sent_at_ms + self.timeout_ms {
                return outcome;
            }
            let limit = if flight.terminal {
                self.terminal_attempts
            } else {
                self.progress_attempts
            };
            if flight.attempts < limit {
                flight.attempts += 1;
                flight.sent_at_ms = now_ms;
                debug!(seq = flight.seq, attempt = flight.attempts, "retransmitting report");
                outcome.messages.push(flight.message.clone());
                return outcome;
            }
            let terminal = flight.terminal;
            outcome.abandoned = Some((flight.seq, terminal));
            self.in_flight = None;
            if terminal {
                return outcome;
            }
        }

        if let Some(report) = self.queue.pop_front() {
            let seq = self.next_seq;
            self.next_seq += 1;
            let message = self.build(seq, &report);
            self.sent.insert(seq, message.clone());
            self.in_flight = Some(InFlight {
                seq,
                message: message.clone(),
                attempts: 1,
                sent_at_ms: now_ms,
                terminal: report.is_terminal(),
            });
            outcome.messages.push(message);
        }
        outcome
    }

    /// 次に `poll` すべき時刻
    pub fn next_deadline(&self) -> Option<u64> {
        match &self.in_flight {
            Some(flight) => Some(flight.sent_at_ms + self.timeout_ms),
            None if !self.queue.is_empty() => Some(0),
            None => None,
        }
    }

    pub fn in_flight_seq(&self) -> Option<i32> {
        self.in_flight.as_ref().map(|f| f.seq)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    fn build(&self, seq: i32, report: &Report) -> Message {
        let (kind, payload, success) = match report {
            Report::Progress(p) => (MessageKind::Progress, Payload::Progress(p.clone()), true),
            Report::Completed => (MessageKind::Completed, Payload::Empty, true),
            Report::Error(e) => (MessageKind::Error, Payload::Error(e.clone()), false),
        };
        Message::new(
            Header::new(kind, self.agent_id, self.coordinator_id, self.mission_id)
                .with_seq(seq)
                .with_success(success),
            payload,
        )
    }
}
