//! コーディネーターとエージェントを直結した往復テスト
//!
//! 遅延 0 のネットワークを 10ms 刻みで進め、`lose` が true を返したメッセージを捨てる。

use std::collections::VecDeque;

use missionlink_proto::{ErrorCode, Message, MessageKind, MissionPayload, Payload};
use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::{
    Agent, AgentPhase, CoordinatorSession, FailureReason, ProtocolConfig, RoverModel, SessionEvent,
    SessionOutcome, FIRST_FRAGMENT_SEQ,
};

const AGENT: i32 = 4;
const STEP_MS: u64 = 10;

fn config() -> ProtocolConfig {
    ProtocolConfig::default()
        .with_timeout_ms(1000)
        .with_final_ack_gap_ms(50)
}

fn mission(task_len: usize, duration_secs: i64) -> MissionPayload {
    MissionPayload {
        mission_id: 21,
        x1: 0.0,
        y1: 0.0,
        x2: 6.0,
        y2: 6.0,
        task: "s".repeat(task_len),
        duration_secs,
        update_interval_secs: 2,
        start_time: 1_700_000_000,
        priority: 4,
    }
}

struct Run {
    events: Vec<SessionEvent>,
    ended_at_ms: u64,
}

fn run(
    coord: &mut CoordinatorSession,
    agent: &mut Agent,
    mut lose: impl FnMut(&Message) -> bool,
    until_ms: u64,
) -> Run {
    let mut now = 0;
    let mut to_agent: VecDeque<Message> = coord.start(now).into();
    let mut to_coord: VecDeque<Message> = VecDeque::new();
    let mut events = Vec::new();

    loop {
        while !to_agent.is_empty() || !to_coord.is_empty() {
            while let Some(msg) = to_agent.pop_front() {
                if !lose(&msg) {
                    to_coord.extend(agent.handle_message(&msg, now));
                }
            }
            while let Some(msg) = to_coord.pop_front() {
                if !lose(&msg) {
                    to_agent.extend(coord.handle_message(&msg, now));
                }
            }
        }
        coord.mark_transmitted(now);
        events.extend(coord.take_events());

        if coord.is_finished() && agent.phase() == AgentPhase::Idle {
            break;
        }
        now += STEP_MS;
        if now > until_ms {
            break;
        }
        to_agent.extend(coord.poll(now));
        to_coord.extend(agent.poll(now));
    }

    Run {
        events,
        ended_at_ms: now,
    }
}

fn is_fragment(msg: &Message, seq: i32) -> bool {
    msg.kind() == MessageKind::Mission && msg.seq() == seq
}

fn ack_missing(msg: &Message) -> Option<&[i32]> {
    match (&msg.payload, msg.kind()) {
        (Payload::Ack(a), MessageKind::Ack) => Some(&a.missing),
        _ => None,
    }
}

#[test]
fn test_large_mission_with_lost_fragment_completes() {
    // 欠落チェック (5 個ごと) と末尾の両方が走る大きさ
    let mut coord = CoordinatorSession::new(config(), AGENT, mission(3000, 8)).unwrap();
    assert!(coord.fragment_count() > 6);
    let mut agent = Agent::new(AGENT, config(), RoverModel::new(0.0, 0.0, 90.0));

    let lost_seq = FIRST_FRAGMENT_SEQ + 1;
    let mut dropped = false;
    let mut sends_of_lost = 0;
    let mut requested = Vec::new();
    let result = run(
        &mut coord,
        &mut agent,
        |msg| {
            if let Some(missing) = ack_missing(msg) {
                if msg.header.sender == AGENT && !missing.is_empty() {
                    requested.push(missing.to_vec());
                }
            }
            if is_fragment(msg, lost_seq) {
                sends_of_lost += 1;
                if !dropped {
                    dropped = true;
                    return true;
                }
            }
            false
        },
        60_000,
    );

    assert_eq!(coord.outcome(), Some(&SessionOutcome::Completed));
    assert_eq!(agent.phase(), AgentPhase::Idle);
    // 初回 + ピンポイント再送 1 回
    assert_eq!(sends_of_lost, 2);
    assert_eq!(requested, vec![vec![lost_seq]]);
    assert_eq!(result.events.first(), Some(&SessionEvent::Accepted));
    assert_eq!(result.events.last(), Some(&SessionEvent::Completed));
    assert!(result
        .events
        .iter()
        .any(|e| matches!(e, SessionEvent::Progress(_))));
}

#[test]
fn test_absent_agent_is_unresponsive() {
    let mut coord = CoordinatorSession::new(config(), AGENT, mission(10, 5)).unwrap();
    let mut agent = Agent::new(AGENT, config(), RoverModel::new(0.0, 0.0, 90.0));
    let mut hellos = 0;

    let result = run(
        &mut coord,
        &mut agent,
        |msg| {
            if msg.kind() == MessageKind::Hello {
                hellos += 1;
            }
            true
        },
        60_000,
    );

    assert_eq!(hellos, crate::MAX_RETRIES);
    assert_eq!(
        result.events,
        vec![SessionEvent::Failed {
            reason: FailureReason::AgentUnresponsive,
            progress_seen: false
        }]
    );
    assert_eq!(result.ended_at_ms, 3000);
}

#[test]
fn test_lost_progress_is_replayed() {
    let mut coord = CoordinatorSession::new(config(), AGENT, mission(10, 20)).unwrap();
    let mut agent = Agent::new(AGENT, config(), RoverModel::new(0.0, 0.0, 90.0));

    let mut drops_of_third = 0;
    let mut gap_reported = false;
    let mut third_delivered = false;
    let result = run(
        &mut coord,
        &mut agent,
        |msg| {
            if ack_missing(msg).is_some_and(|m| m.contains(&3)) {
                gap_reported = true;
            }
            if msg.kind() == MessageKind::Progress && msg.seq() == 3 {
                // 初回 + 再送 3 回をすべて落とす
                if drops_of_third < 1 + crate::PROGRESS_MAX_RETRIES {
                    drops_of_third += 1;
                    return true;
                }
                third_delivered = true;
            }
            false
        },
        60_000,
    );

    assert!(gap_reported, "欠落した seq 3 が Ack で報告されるべき");
    assert!(third_delivered, "seq 3 は後から再送されるべき");
    assert!(coord.lost_reports().is_empty());
    assert_eq!(coord.outcome(), Some(&SessionOutcome::Completed));
    assert_eq!(result.events.last(), Some(&SessionEvent::Completed));
}

#[test]
fn test_battery_critical_error_gets_final_acks() {
    let mut coord = CoordinatorSession::new(config(), AGENT, mission(10, 30)).unwrap();
    let mut agent = Agent::new(AGENT, config(), RoverModel::new(0.0, 0.0, 10.02));

    let mut final_acks = 0;
    let result = run(
        &mut coord,
        &mut agent,
        |msg| {
            if matches!(&msg.payload, Payload::Ack(a) if a.final_ack) {
                final_acks += 1;
                // 最初の 2 つは失われる
                return final_acks <= 2;
            }
            false
        },
        60_000,
    );

    assert_eq!(agent.phase(), AgentPhase::Idle);
    assert!(final_acks >= 3);
    match result.events.as_slice() {
        [SessionEvent::Accepted, SessionEvent::Failed {
            reason: FailureReason::MissionError(e),
            progress_seen: false,
        }] => assert_eq!(e.code, ErrorCode::BatteryCritical),
        other => panic!("unexpected events {other:?}"),
    }
}

#[test]
fn test_random_loss_still_converges() {
    for seed in 0..8u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut coord = CoordinatorSession::new(config(), AGENT, mission(1500, 10)).unwrap();
        let mut agent = Agent::new(AGENT, config(), RoverModel::new(0.0, 0.0, 90.0));

        let result = run(&mut coord, &mut agent, |_| rng.gen_bool(0.1), 120_000);

        // 10% の損失では通常完了するが、どの結果でも両端は必ず終わる
        assert!(coord.is_terminal(), "seed {seed}: コーディネーターが終端に達していない");
        assert!(
            result.ended_at_ms < 120_000,
            "seed {seed}: 収束しなかった"
        );
    }
}
