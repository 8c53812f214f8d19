//! ローバー（エージェント）側状態機械
//!
//! `Agent` はローバーの永続状態（シミュレーションモデル）を持ち、
//! ミッションごとに `AgentSession` を 1 つだけ保持する。
//! セッションは Hello で生まれ、終端報告が確認されるか諦めたときに消える。

use std::collections::BTreeMap;

use missionlink_proto::{
    AckPayload, Header, Message, MessageKind, MissionPayload, Payload, ProgressPayload,
};
use missionlink_transport::{FieldAssembly, Fragment, FragmentWindow};
use tracing::{debug, info, warn};

use crate::config::ProtocolConfig;
use crate::reliable::{AckOutcome, Report, ReportSender};
use crate::rover::RoverModel;
use crate::{DEFAULT_MISSION_DURATION_SECS, DEFAULT_UPDATE_INTERVAL_SECS, FIRST_FRAGMENT_SEQ};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentPhase {
    Idle,
    RespondedAvailable,
    ReceivingFragments,
    Executing,
    ReportingTerminal,
}

impl AgentPhase {
    /// ミッション実行中（新しい Hello は断る）
    pub fn is_busy(self) -> bool {
        matches!(self, AgentPhase::Executing | AgentPhase::ReportingTerminal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// 終端報告が確認された
    Confirmed,
    /// 終端報告の再送上限に達した
    Unconfirmed,
    /// ミッション転送が途絶えた
    TransferAbandoned,
    /// 別ミッションの Hello に置き換えられた
    Superseded,
}

/// ドライバーがログ等に使う出来事
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    HelloDeclined { mission_id: i32 },
    MissionStarted(MissionPayload),
    ReportAbandoned { seq: i32 },
    SessionClosed { mission_id: i32, reason: CloseReason },
}

#[derive(Debug, Clone)]
struct Execution {
    mission: MissionPayload,
    started_ms: u64,
    duration_ms: u64,
    interval_ms: u64,
    last_tick_ms: u64,
    last_report_ms: u64,
}

/// 1 ミッション分の受信・実行・報告状態
struct AgentSession {
    mission_id: i32,
    coordinator_id: i32,
    phase: AgentPhase,
    /// Hello の重複に返す Response
    response: Message,
    assembly: FieldAssembly,
    window: Option<FragmentWindow>,
    /// 前回の欠落チェック以降に受け取ったフラグメント数
    since_check: usize,
    /// 再送を要求した seq → 要求時刻
    requested: BTreeMap<i32, u64>,
    last_inbound_ms: u64,
    nudges: u32,
    execution: Option<Execution>,
    reports: ReportSender,
}

impl AgentSession {
    fn mission_ack(&self, agent_id: i32, seq: i32, missing: Vec<i32>) -> Message {
        let total = self.window.as_ref().map_or(1, FragmentWindow::total);
        Message::new(
            Header::new(MessageKind::Ack, agent_id, self.coordinator_id, self.mission_id)
                .with_seq(seq)
                .with_total_fragments(total)
                .with_success(missing.is_empty()),
            Payload::Ack(AckPayload::missing(missing)),
        )
    }

    fn begin_execution(&mut self, mission: MissionPayload, rover: &mut RoverModel, now_ms: u64) {
        let duration_secs = if mission.duration_secs > 0 {
            mission.duration_secs
        } else {
            DEFAULT_MISSION_DURATION_SECS
        };
        let interval_secs = if mission.update_interval_secs > 0 {
            mission.update_interval_secs
        } else {
            DEFAULT_UPDATE_INTERVAL_SECS
        };
        rover.begin_mission();
        self.requested.clear();
        self.execution = Some(Execution {
            mission,
            started_ms: now_ms,
            duration_ms: (duration_secs as u64).saturating_mul(1000),
            interval_ms: (interval_secs as u64).saturating_mul(1000),
            last_tick_ms: now_ms,
            last_report_ms: now_ms,
        });
        self.phase = AgentPhase::Executing;
        self.assembly.clear();
    }
}

pub struct Agent {
    agent_id: i32,
    config: ProtocolConfig,
    rover: RoverModel,
    session: Option<AgentSession>,
    /// 故障からの復帰時刻
    recover_at_ms: Option<u64>,
    events: Vec<AgentEvent>,
}

impl Agent {
    pub fn new(agent_id: i32, config: ProtocolConfig, rover: RoverModel) -> Self {
        Agent {
            agent_id,
            config,
            rover,
            session: None,
            recover_at_ms: None,
            events: Vec::new(),
        }
    }

    pub fn agent_id(&self) -> i32 {
        self.agent_id
    }

    pub fn phase(&self) -> AgentPhase {
        self.session.as_ref().map_or(AgentPhase::Idle, |s| s.phase)
    }

    pub fn mission_id(&self) -> Option<i32> {
        self.session.as_ref().map(|s| s.mission_id)
    }

    pub fn rover(&self) -> &RoverModel {
        &self.rover
    }

    pub fn rover_mut(&mut self) -> &mut RoverModel {
        &mut self.rover
    }

    pub fn take_events(&mut self) -> Vec<AgentEvent> {
        std::mem::take(&mut self.events)
    }

    /// コーディネーターからのメッセージを処理し、返信を返す
    pub fn handle_message(&mut self, msg: &Message, now_ms: u64) -> Vec<Message> {
        if msg.header.receiver != self.agent_id {
            debug!(agent = self.agent_id, receiver = msg.header.receiver, "message for another agent");
            return Vec::new();
        }
        match msg.kind() {
            MessageKind::Hello => self.on_hello(msg, now_ms),
            MessageKind::Mission => self.on_mission(msg, now_ms),
            MessageKind::Ack => self.on_ack(msg, now_ms),
            kind => {
                debug!(agent = self.agent_id, ?kind, "unexpected message kind ignored");
                Vec::new()
            }
        }
    }

    /// タイマー処理：受信途絶の催促、シミュレーション、報告の送信と再送
    pub fn poll(&mut self, now_ms: u64) -> Vec<Message> {
        if self.recover_at_ms.is_some_and(|at| now_ms >= at) {
            self.recover_at_ms = None;
            self.rover.clear_fault();
            info!(agent = self.agent_id, "recovered from fault");
        }

        let mut out = Vec::new();
        self.poll_transfer(now_ms, &mut out);
        self.poll_execution(now_ms);
        self.poll_reports(now_ms, &mut out);
        out
    }

    /// 次に `poll` すべき時刻
    pub fn next_deadline(&self) -> Option<u64> {
        let session_deadline = self.session.as_ref().and_then(|s| match s.phase {
            AgentPhase::RespondedAvailable | AgentPhase::ReceivingFragments => {
                Some(s.last_inbound_ms + self.config.timeout_ms)
            }
            AgentPhase::Executing => {
                let tick = s
                    .execution
                    .as_ref()
                    .map(|e| e.last_tick_ms + self.rover.config().tick_ms);
                match (tick, s.reports.next_deadline()) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                }
            }
            AgentPhase::ReportingTerminal => s.reports.next_deadline(),
            AgentPhase::Idle => None,
        });
        match (session_deadline, self.recover_at_ms) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn on_hello(&mut self, msg: &Message, now_ms: u64) -> Vec<Message> {
        let mission_id = msg.header.mission_id;

        if let Some(session) = self.session.as_mut() {
            if session.mission_id == mission_id {
                debug!(agent = self.agent_id, mission = mission_id, "duplicate hello, repeating response");
                session.last_inbound_ms = now_ms;
                return vec![session.response.clone()];
            }
            if session.phase.is_busy() {
                info!(
                    agent = self.agent_id,
                    busy_with = session.mission_id,
                    mission = mission_id,
                    "declining hello while executing"
                );
                self.events.push(AgentEvent::HelloDeclined { mission_id });
                return vec![self.response(msg, false)];
            }
            info!(
                agent = self.agent_id,
                old = session.mission_id,
                new = mission_id,
                "new hello supersedes pending handshake"
            );
            let old = session.mission_id;
            self.events.push(AgentEvent::SessionClosed {
                mission_id: old,
                reason: CloseReason::Superseded,
            });
        }

        if let Some(code) = self.rover.check_failure() {
            warn!(agent = self.agent_id, mission = mission_id, code = code.code(), "declining hello, rover not operational");
            self.session = None;
            self.events.push(AgentEvent::HelloDeclined { mission_id });
            return vec![self.response(msg, false)];
        }

        let response = self.response(msg, true);
        info!(agent = self.agent_id, mission = mission_id, "available for mission");
        self.session = Some(AgentSession {
            mission_id,
            coordinator_id: msg.header.sender,
            phase: AgentPhase::RespondedAvailable,
            response: response.clone(),
            assembly: FieldAssembly::new(),
            window: None,
            since_check: 0,
            requested: BTreeMap::new(),
            last_inbound_ms: now_ms,
            nudges: 0,
            execution: None,
            reports: ReportSender::new(self.agent_id, msg.header.sender, mission_id, &self.config),
        });
        vec![response]
    }

    fn on_mission(&mut self, msg: &Message, now_ms: u64) -> Vec<Message> {
        let agent_id = self.agent_id;
        let batch = self.config.ack_batch;
        let hold_ms = self.config.timeout_ms;
        let Some(session) = self.session.as_mut() else {
            debug!(agent = agent_id, "mission data without a session");
            return Vec::new();
        };
        if session.mission_id != msg.header.mission_id {
            debug!(agent = agent_id, mission = msg.header.mission_id, "mission data for another mission");
            return Vec::new();
        }
        session.last_inbound_ms = now_ms;
        session.nudges = 0;

        if session.phase.is_busy() {
            // 空 Ack が届かなかった。もう一度確認を返す
            debug!(agent = agent_id, seq = msg.seq(), "mission already received, re-acking");
            return vec![session.mission_ack(agent_id, msg.seq(), Vec::new())];
        }

        let seq = msg.seq();
        let fragment = match &msg.payload {
            Payload::Mission(mission) => {
                let ack = session.mission_ack(agent_id, seq, Vec::new());
                session.begin_execution(mission.clone(), &mut self.rover, now_ms);
                info!(agent = agent_id, mission = mission.mission_id, "mission received");
                self.events.push(AgentEvent::MissionStarted(mission.clone()));
                return vec![ack];
            }
            Payload::Fragment(bytes) => match Fragment::from_bytes(bytes) {
                Ok(fragment) => fragment,
                Err(e) => {
                    debug!(agent = agent_id, seq, error = %e, "undecodable fragment dropped");
                    return Vec::new();
                }
            },
            _ => return Vec::new(),
        };

        session.phase = AgentPhase::ReceivingFragments;
        let window = session
            .window
            .get_or_insert_with(|| FragmentWindow::new(FIRST_FRAGMENT_SEQ, msg.header.total_fragments));

        if !window.record(seq) {
            // 最後の seq の重複は全体再送とみなして欠落を知らせる
            if seq == window.last_seq() {
                let missing = window.missing();
                mark_requested(&mut session.requested, &missing, now_ms);
                return vec![session.mission_ack(agent_id, seq, missing)];
            }
            debug!(agent = agent_id, seq, "duplicate or out-of-range fragment");
            return Vec::new();
        }
        session.assembly.add_fragment(&fragment);
        session.since_check += 1;

        if window.is_complete() {
            session.since_check = 0;
            match session.assembly.reconstruct::<MissionPayload>() {
                Ok(mission) => {
                    let ack = session.mission_ack(agent_id, seq, Vec::new());
                    info!(agent = agent_id, mission = mission.mission_id, "mission reassembled");
                    session.begin_execution(mission.clone(), &mut self.rover, now_ms);
                    self.events.push(AgentEvent::MissionStarted(mission));
                    vec![ack]
                }
                Err(e) => {
                    warn!(
                        agent = agent_id,
                        error = %e,
                        fields = ?session.assembly.missing_fields::<MissionPayload>(),
                        "reassembly failed, requesting everything again"
                    );
                    window.reset();
                    let missing = window.missing();
                    session.assembly.clear();
                    session.requested.clear();
                    mark_requested(&mut session.requested, &missing, now_ms);
                    vec![session.mission_ack(agent_id, seq, missing)]
                }
            }
        } else if seq == window.last_seq() || session.since_check >= batch {
            // 末尾では未着すべて、途中では飛ばされた seq だけを要求する
            let missing = if seq == window.last_seq() {
                window.missing()
            } else {
                window.gaps()
            };
            session.since_check = 0;
            let missing = unrequested(&mut session.requested, missing, now_ms, hold_ms);
            if missing.is_empty() {
                Vec::new()
            } else {
                vec![session.mission_ack(agent_id, seq, missing)]
            }
        } else {
            Vec::new()
        }
    }

    fn on_ack(&mut self, msg: &Message, now_ms: u64) -> Vec<Message> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        if session.mission_id != msg.header.mission_id {
            return Vec::new();
        }
        let ack = match &msg.payload {
            Payload::Ack(ack) => ack.clone(),
            _ => AckPayload::complete(),
        };

        match session.reports.on_ack(msg.seq(), &ack) {
            AckOutcome::Ignored => {
                debug!(agent = self.agent_id, seq = msg.seq(), "ack for another report ignored");
                Vec::new()
            }
            AckOutcome::Confirmed {
                terminal: true,
                replay,
                ..
            } => {
                self.close(CloseReason::Confirmed, now_ms);
                replay
            }
            AckOutcome::Confirmed { mut replay, .. } => {
                replay.extend(session.reports.poll(now_ms).messages);
                replay
            }
        }
    }

    fn poll_transfer(&mut self, now_ms: u64, out: &mut Vec<Message>) {
        let agent_id = self.agent_id;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !matches!(session.phase, AgentPhase::RespondedAvailable | AgentPhase::ReceivingFragments)
            || now_ms < session.last_inbound_ms + self.config.timeout_ms
        {
            return;
        }

        if session.nudges >= self.config.max_retries {
            warn!(agent = agent_id, mission = session.mission_id, "mission transfer went silent, giving up");
            self.close(CloseReason::TransferAbandoned, now_ms);
            return;
        }
        session.nudges += 1;
        session.last_inbound_ms = now_ms;
        if let Some(window) = &session.window {
            let missing = window.missing();
            let seq = window.highest_received().unwrap_or(FIRST_FRAGMENT_SEQ);
            mark_requested(&mut session.requested, &missing, now_ms);
            debug!(agent = agent_id, missing = missing.len(), "nudging coordinator for missing fragments");
            out.push(session.mission_ack(agent_id, seq, missing));
        }
    }

    fn poll_execution(&mut self, now_ms: u64) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.phase != AgentPhase::Executing {
            return;
        }
        let Some(exec) = session.execution.as_mut() else {
            return;
        };
        let tick_ms = self.rover.config().tick_ms.max(1);

        while now_ms >= exec.last_tick_ms + tick_ms {
            exec.last_tick_ms += tick_ms;
            let elapsed_ms = exec.last_tick_ms - exec.started_ms;
            self.rover.step(&exec.mission, elapsed_ms, exec.duration_ms);

            if let Some(code) = self.rover.check_failure() {
                warn!(agent = self.agent_id, mission = session.mission_id, code = code.code(), "mission error");
                let report = self
                    .rover
                    .error_report(session.mission_id, code, (now_ms / 1000) as i64);
                session.reports.enqueue(Report::Error(report));
                session.phase = AgentPhase::ReportingTerminal;
                return;
            }

            if self.rover.progress() >= 100.0 {
                info!(agent = self.agent_id, mission = session.mission_id, "mission complete");
                session.reports.enqueue(Report::Completed);
                session.phase = AgentPhase::ReportingTerminal;
                return;
            }

            if exec.last_tick_ms - exec.last_report_ms >= exec.interval_ms {
                exec.last_report_ms = exec.last_tick_ms;
                session.reports.enqueue(Report::Progress(ProgressPayload {
                    mission_id: session.mission_id,
                    elapsed_secs: (elapsed_ms / 1000) as i64,
                    percent: self.rover.progress(),
                }));
            }
        }
    }

    fn poll_reports(&mut self, now_ms: u64, out: &mut Vec<Message>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let sent = session.reports.poll(now_ms);
        out.extend(sent.messages);

        match sent.abandoned {
            Some((seq, true)) => {
                warn!(agent = self.agent_id, seq, "terminal report never confirmed, closing session");
                self.events.push(AgentEvent::ReportAbandoned { seq });
                self.close(CloseReason::Unconfirmed, now_ms);
            }
            Some((seq, false)) => {
                debug!(agent = self.agent_id, seq, "progress report abandoned");
                self.events.push(AgentEvent::ReportAbandoned { seq });
            }
            None => {}
        }
    }

    fn close(&mut self, reason: CloseReason, now_ms: u64) {
        let Some(session) = self.session.take() else {
            return;
        };
        info!(agent = self.agent_id, mission = session.mission_id, ?reason, "session closed");
        if self.rover.check_failure().is_some() && session.phase == AgentPhase::ReportingTerminal {
            self.recover_at_ms = Some(now_ms + self.rover.config().fault_recovery_ms);
        }
        self.events.push(AgentEvent::SessionClosed {
            mission_id: session.mission_id,
            reason,
        });
    }

    fn response(&self, hello: &Message, available: bool) -> Message {
        Message::new(
            Header::new(MessageKind::Response, self.agent_id, hello.header.sender, hello.header.mission_id)
                .with_seq(hello.seq())
                .with_success(available),
            Payload::Empty,
        )
    }
}

/// `hold_ms` 以内に要求済みの seq を除き、残りを要求済みにする
fn unrequested(requested: &mut BTreeMap<i32, u64>, missing: Vec<i32>, now_ms: u64, hold_ms: u64) -> Vec<i32> {
    let fresh: Vec<i32> = missing
        .into_iter()
        .filter(|seq| {
            requested
                .get(seq)
                .map_or(true, |&at| now_ms >= at.saturating_add(hold_ms))
        })
        .collect();
    mark_requested(requested, &fresh, now_ms);
    fresh
}

fn mark_requested(requested: &mut BTreeMap<i32, u64>, seqs: &[i32], now_ms: u64) {
    for &seq in seqs {
        requested.insert(seq, now_ms);
    }
}
