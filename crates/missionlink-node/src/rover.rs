//! ローバーのランタイム
//!
//! 1 タスクで受信とエージェント状態機械のタイマーを回す。
//! 返信は最後に受信した相手へ送り、まだ何も受信していなければ設定のコーディネーターへ送る。

use std::net::SocketAddr;

use missionlink_proto::{ErrorCode, Message};
use missionlink_session::{Agent, AgentEvent, CloseReason, RoverModel};
use missionlink_transport::MAX_DATAGRAM_LEN;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock;
use crate::config::RoverNodeConfig;
use crate::error::Result;
use crate::link::Link;

pub struct RoverNode {
    config: RoverNodeConfig,
    link: Link,
}

impl RoverNode {
    pub async fn bind(config: RoverNodeConfig) -> Result<Self> {
        let link = Link::bind(config.bind).await?;
        info!(rover = config.id, local = %link.local_addr(), "rover listening");
        Ok(RoverNode { config, link })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.link.local_addr()
    }

    fn build_agent(&self) -> Agent {
        let c = &self.config;
        let mut model = RoverModel::new(c.x, c.y, c.battery).with_config(c.simulation.clone());
        if let Some(at) = c.fail_at {
            model = model.with_scheduled_fault(at, ErrorCode::Hardware);
        }
        Agent::new(c.id, c.protocol.clone(), model)
    }

    /// シャットダウンまで動かす
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut agent = self.build_agent();
        let mut peer = self.config.coordinator;
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];

        loop {
            let deadline = agent.next_deadline();
            let out: Vec<Message> = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    Vec::new()
                }
                received = self.link.recv(&mut buf) => match received {
                    Ok(Some(packet)) => {
                        peer = packet.peer;
                        agent.handle_message(&packet.message, clock::now_ms())
                    }
                    Ok(None) => Vec::new(),
                    Err(e) => {
                        warn!(rover = self.config.id, error = %e, "receive failed");
                        Vec::new()
                    }
                },
                _ = tokio::time::sleep(clock::until(deadline.unwrap_or(0))), if deadline.is_some() => {
                    agent.poll(clock::now_ms())
                }
            };

            for message in out {
                self.link.send(message, peer).await;
            }
            log_events(&mut agent);
        }

        info!(rover = self.config.id, "rover shutting down");
        Ok(())
    }
}

fn log_events(agent: &mut Agent) {
    let rover = agent.agent_id();
    for event in agent.take_events() {
        match event {
            AgentEvent::MissionStarted(mission) => info!(
                rover,
                mission = mission.mission_id,
                duration_secs = mission.duration_secs,
                task = %mission.task,
                "executing mission"
            ),
            AgentEvent::HelloDeclined { mission_id } => {
                info!(rover, mission = mission_id, "mission declined")
            }
            AgentEvent::ReportAbandoned { seq } => debug!(rover, seq, "report abandoned"),
            AgentEvent::SessionClosed {
                mission_id,
                reason: CloseReason::Unconfirmed,
            } => warn!(rover, mission = mission_id, "terminal report never confirmed"),
            AgentEvent::SessionClosed { mission_id, reason } => {
                info!(rover, mission = mission_id, ?reason, "mission session closed")
            }
        }
    }
}
