use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use missionlink_node::{init_logging, Coordinator, CoordinatorConfig, NodeError, Result, RoverEndpoint};
use missionlink_session::ProtocolConfig;
use missionlink_store::MissionDraft;
use tokio::sync::watch;
use tracing::{error, info};

/// MissionLink coordinator: assigns missions to rovers over UDP and supervises them
#[derive(Debug, Parser)]
#[command(name = "missionlink-coordinator", version)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "MISSIONLINK_BIND", default_value = "0.0.0.0:9001")]
    bind: SocketAddr,

    /// Rover as ID or ID=HOST:PORT (repeatable)
    #[arg(long = "rover", env = "MISSIONLINK_ROVERS", value_delimiter = ',')]
    rovers: Vec<RoverEndpoint>,

    /// JSON file with a list of mission drafts
    #[arg(long, env = "MISSIONLINK_MISSIONS")]
    missions: Option<PathBuf>,

    /// Seed a few demo missions
    #[arg(long)]
    demo: bool,

    #[arg(long, env = "MISSIONLINK_TIMEOUT_MS", default_value_t = 5000)]
    timeout_ms: u64,

    /// Hello and full-transfer attempts, the first send included
    #[arg(long, env = "MISSIONLINK_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    #[arg(long, env = "MISSIONLINK_FRAGMENT_SIZE", default_value_t = 512)]
    fragment_size: usize,

    #[arg(long, env = "MISSIONLINK_SCAN_INTERVAL_MS", default_value_t = 2000)]
    scan_interval_ms: u64,

    #[arg(long, env = "MISSIONLINK_REAPER_INTERVAL_MS", default_value_t = 10_000)]
    reaper_interval_ms: u64,

    #[arg(long, env = "MISSIONLINK_INACTIVITY_TIMEOUT_MS", default_value_t = 120_000)]
    inactivity_timeout_ms: u64,

    #[arg(long, env = "MISSIONLINK_FAULT_COOLDOWN_MS", default_value_t = 5000)]
    fault_cooldown_ms: u64,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            bind: self.bind,
            protocol: ProtocolConfig::default()
                .with_timeout_ms(self.timeout_ms)
                .with_max_retries(self.max_retries)
                .with_fragment_size(self.fragment_size),
            rovers: self.rovers.clone(),
            scan_interval: Duration::from_millis(self.scan_interval_ms),
            reaper_interval: Duration::from_millis(self.reaper_interval_ms),
            inactivity_timeout: Duration::from_millis(self.inactivity_timeout_ms),
            fault_cooldown: Duration::from_millis(self.fault_cooldown_ms),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "coordinator failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    if cli.rovers.is_empty() {
        return Err(NodeError::Config("at least one --rover is required".into()));
    }

    let coordinator = Coordinator::bind(cli.config()).await?;

    if let Some(path) = &cli.missions {
        let json = std::fs::read_to_string(path)?;
        for draft in MissionDraft::list_from_json(&json)? {
            coordinator.submit_mission(draft)?;
        }
    }
    if cli.demo {
        for draft in demo_missions() {
            coordinator.submit_mission(draft)?;
        }
    }

    let store = coordinator.store();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received");
            let _ = shutdown_tx.send(true);
        }
    });

    coordinator.run(shutdown_rx).await?;

    match store.snapshot().to_json() {
        Ok(json) => info!(state = %json, "final state"),
        Err(e) => error!(error = %e, "could not render final state"),
    }
    Ok(())
}

fn demo_missions() -> Vec<MissionDraft> {
    let draft = |x1, y1, x2, y2, task: String, duration_secs, priority| MissionDraft {
        x1,
        y1,
        x2,
        y2,
        task,
        duration_secs,
        update_interval_secs: 2,
        start_time: None,
        priority,
    };
    vec![
        draft(0.0, 0.0, 10.0, 10.0, "Survey the landing zone".into(), 20, 5),
        draft(20.0, 5.0, 30.0, 15.0, "Collect soil samples near the ridge".into(), 30, 3),
        // 1 フラグメントに収まらない長さ
        draft(
            -10.0,
            -10.0,
            0.0,
            0.0,
            "Photograph every rock formation along the crater rim. ".repeat(30),
            40,
            1,
        ),
    ]
}
