//! # missionlink-node
//!
//! MissionLink の tokio ランタイム。
//!
//! `missionlink-session` の状態機械に UDP ソケットとタイマーをつなぎ、
//! コーディネーター側ではセッション表・割り当てスキャナー・リーパーを動かす。
//!
//! ## バイナリ
//! - `missionlink-coordinator`: ミッションを割り当てて監視する
//! - `missionlink-rover`: ミッションを受信してシミュレーション実行する

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod link;
pub mod reaper;
pub mod registry;
pub mod rover;

pub use config::{
    rover_port, CoordinatorConfig, RoverEndpoint, RoverNodeConfig, DEFAULT_COORDINATOR_PORT,
    DEFAULT_ROVER_BASE_PORT,
};
pub use coordinator::Coordinator;
pub use error::{NodeError, Result};
pub use link::Link;
pub use reaper::{sweep, ReaperConfig, SweepReport};
pub use registry::{Dispatch, SessionHandle, SessionRegistry, SessionStatus};
pub use rover::RoverNode;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// ログ出力を初期化する
///
/// `RUST_LOG` があればそれを使う。なければ info（`verbose` なら debug）。
pub fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    // 二重初期化はテストで起こりうるので無視する
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .try_init();
}
