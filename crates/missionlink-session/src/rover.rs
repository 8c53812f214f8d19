//! ローバーの実行シミュレーション
//!
//! ミッション実行中は tick ごとにエリア中心へ移動し、バッテリーを消費する。
//! 進捗は経過時間 / ミッション時間で決まる。

use missionlink_proto::{ErrorCode, ErrorPayload, MissionPayload};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// シミュレーションの刻み（ミリ秒）
    pub tick_ms: u64,
    /// 1 tick あたりの移動距離
    pub speed: f32,
    /// 1 tick あたりのバッテリー消費（%）
    pub drain_moving: f32,
    pub drain_idle: f32,
    /// これを下回ると BatteryCritical
    pub critical_battery: f32,
    /// 故障状態から復帰するまでの時間（ミリ秒）
    pub fault_recovery_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            tick_ms: 1000,
            speed: 1.0,
            drain_moving: 0.05,
            drain_idle: 0.01,
            critical_battery: 10.0,
            fault_recovery_ms: 5000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoverModel {
    config: SimulationConfig,
    x: f32,
    y: f32,
    battery: f32,
    progress: f32,
    fault: Option<ErrorCode>,
    /// 指定の進捗率に達したら発生させる故障
    scheduled_fault: Option<(f32, ErrorCode)>,
}

impl RoverModel {
    pub fn new(x: f32, y: f32, battery: f32) -> Self {
        RoverModel {
            config: SimulationConfig::default(),
            x,
            y,
            battery: battery.clamp(0.0, 100.0),
            progress: 0.0,
            fault: None,
            scheduled_fault: None,
        }
    }

    pub fn with_config(mut self, config: SimulationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_scheduled_fault(mut self, at_percent: f32, code: ErrorCode) -> Self {
        self.scheduled_fault = Some((at_percent, code));
        self
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn begin_mission(&mut self) {
        self.progress = 0.0;
    }

    /// 1 tick 進める
    ///
    /// # 引数
    /// - `elapsed_ms`: ミッション開始からの経過時間
    /// - `duration_ms`: ミッション時間
    pub fn step(&mut self, mission: &MissionPayload, elapsed_ms: u64, duration_ms: u64) {
        self.progress = (elapsed_ms as f32 / duration_ms.max(1) as f32 * 100.0).min(100.0);

        let (cx, cy) = mission.area_center();
        let (dx, dy) = (cx - self.x, cy - self.y);
        let distance = dx.hypot(dy);
        if distance > self.config.speed {
            self.x += dx / distance * self.config.speed;
            self.y += dy / distance * self.config.speed;
            self.battery -= self.config.drain_moving;
        } else {
            self.x = cx;
            self.y = cy;
            self.battery -= self.config.drain_idle;
        }
        self.battery = self.battery.max(0.0);

        if let Some((at, code)) = self.scheduled_fault {
            if self.progress >= at {
                self.fault = Some(code);
                self.scheduled_fault = None;
            }
        }
    }

    /// 実行を続けられない理由
    pub fn check_failure(&self) -> Option<ErrorCode> {
        if self.fault.is_some() {
            return self.fault;
        }
        (self.battery < self.config.critical_battery).then_some(ErrorCode::BatteryCritical)
    }

    pub fn inject_fault(&mut self, code: ErrorCode) {
        self.fault = Some(code);
    }

    pub fn clear_fault(&mut self) {
        self.fault = None;
    }

    pub fn error_report(&self, mission_id: i32, code: ErrorCode, timestamp: i64) -> ErrorPayload {
        let detail = match code {
            ErrorCode::BatteryCritical => Some(format!("battery at {:.1}%", self.battery)),
            _ => None,
        };
        ErrorPayload {
            mission_id,
            code,
            description: code.describe(detail.as_deref()),
            progress: self.progress,
            battery: self.battery,
            x: self.x,
            y: self.y,
            timestamp,
        }
    }

    pub fn position(&self) -> (f32, f32) {
        (self.x, self.y)
    }

    pub fn battery(&self) -> f32 {
        self.battery
    }

    pub fn progress(&self) -> f32 {
        self.progress
    }
}
