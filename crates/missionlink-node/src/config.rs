//! ノードの実行時設定

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use missionlink_session::{ProtocolConfig, SimulationConfig};

use crate::error::{NodeError, Result};

/// コーディネーターのミッションポート
pub const DEFAULT_COORDINATOR_PORT: u16 = 9001;

/// ローバーのポート = これ + ローバー ID
pub const DEFAULT_ROVER_BASE_PORT: u16 = 9010;

/// ローバー ID から既定のポートを求める
///
/// # エラー
/// ポート番号が u16 に収まらない
pub fn rover_port(id: i32) -> Result<u16> {
    u16::try_from(id)
        .ok()
        .and_then(|id| DEFAULT_ROVER_BASE_PORT.checked_add(id))
        .ok_or_else(|| NodeError::Config(format!("rover id {id} has no default port")))
}

/// コーディネーターが知っているローバーの宛先
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoverEndpoint {
    pub id: i32,
    pub addr: SocketAddr,
}

impl FromStr for RoverEndpoint {
    type Err = String;

    /// `ID` または `ID=HOST:PORT`。アドレス省略時は 127.0.0.1:(9010 + ID)
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (id, addr) = match s.split_once('=') {
            Some((id, addr)) => (id, Some(addr)),
            None => (s, None),
        };
        let id: i32 = id
            .trim()
            .parse()
            .map_err(|_| format!("invalid rover id in {s:?}"))?;
        let addr = match addr {
            Some(addr) => addr
                .trim()
                .parse()
                .map_err(|_| format!("invalid rover address in {s:?}"))?,
            None => {
                let port = rover_port(id).map_err(|e| e.to_string())?;
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
            }
        };
        Ok(RoverEndpoint { id, addr })
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub bind: SocketAddr,
    pub protocol: ProtocolConfig,
    pub rovers: Vec<RoverEndpoint>,
    /// 割り当てスキャンの間隔
    pub scan_interval: Duration,
    pub reaper_interval: Duration,
    /// これだけ無通信のセッションは回収する
    pub inactivity_timeout: Duration,
    /// Fault ローバーを Available に戻すまでの時間
    pub fault_cooldown: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_COORDINATOR_PORT),
            protocol: ProtocolConfig::default(),
            rovers: Vec::new(),
            scan_interval: Duration::from_secs(2),
            reaper_interval: Duration::from_secs(10),
            inactivity_timeout: Duration::from_secs(120),
            fault_cooldown: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoverNodeConfig {
    pub id: i32,
    pub bind: SocketAddr,
    /// 返信先が分からないときの宛先
    pub coordinator: SocketAddr,
    pub protocol: ProtocolConfig,
    pub simulation: SimulationConfig,
    pub x: f32,
    pub y: f32,
    pub battery: f32,
    /// この進捗率でハードウェア故障を起こす
    pub fail_at: Option<f32>,
}

impl RoverNodeConfig {
    /// 既定のポートで待ち受ける設定
    pub fn new(id: i32) -> Result<Self> {
        Ok(RoverNodeConfig {
            id,
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), rover_port(id)?),
            coordinator: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_COORDINATOR_PORT),
            protocol: ProtocolConfig::default(),
            simulation: SimulationConfig::default(),
            x: 0.0,
            y: 0.0,
            battery: 100.0,
            fail_at: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_rover_endpoint_parse() {
        let e: RoverEndpoint = "3".parse().unwrap();
        assert_eq!(e.addr, "127.0.0.1:9013".parse().unwrap());

        let e: RoverEndpoint = "12=10.0.0.5:7000".parse().unwrap();
        assert_eq!(
            e,
            RoverEndpoint {
                id: 12,
                addr: "10.0.0.5:7000".parse().unwrap()
            }
        );

        assert!("x".parse::<RoverEndpoint>().is_err());
        assert!("1=nowhere".parse::<RoverEndpoint>().is_err());
        assert!("-4".parse::<RoverEndpoint>().is_err());
    }

    #[test]
    fn test_rover_port() {
        assert_eq!(rover_port(0).unwrap(), 9010);
        assert!(matches!(rover_port(70_000), Err(NodeError::Config(_))));
    }

    #[test]
    fn test_defaults() {
        let c = CoordinatorConfig::default();
        assert_eq!(c.bind.port(), 9001);
        assert_eq!(c.inactivity_timeout, Duration::from_secs(120));

        let r = RoverNodeConfig::new(4).unwrap();
        assert_eq!(r.bind.port(), 9014);
        assert_eq!(r.coordinator.port(), 9001);
    }
}
