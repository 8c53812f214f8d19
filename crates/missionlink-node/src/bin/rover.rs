use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;
use missionlink_node::{init_logging, rover_port, Result, RoverNode, RoverNodeConfig};
use tokio::sync::watch;
use tracing::{error, info};

/// MissionLink rover: receives missions and reports simulated progress
#[derive(Debug, Parser)]
#[command(name = "missionlink-rover", version)]
struct Cli {
    #[arg(long, env = "MISSIONLINK_ROVER_ID")]
    id: i32,

    /// Address to listen on (default 0.0.0.0:9010+ID)
    #[arg(long, env = "MISSIONLINK_ROVER_BIND")]
    bind: Option<SocketAddr>,

    #[arg(long, env = "MISSIONLINK_COORDINATOR", default_value = "127.0.0.1:9001")]
    coordinator: SocketAddr,

    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    x: f32,

    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    y: f32,

    #[arg(long, env = "MISSIONLINK_ROVER_BATTERY", default_value_t = 100.0)]
    battery: f32,

    /// Raise a hardware fault once progress reaches this percentage
    #[arg(long, value_name = "PERCENT")]
    fail_at: Option<f32>,

    /// Simulation tick
    #[arg(long, env = "MISSIONLINK_TICK_MS", default_value_t = 1000)]
    tick_ms: u64,

    #[arg(long, env = "MISSIONLINK_TIMEOUT_MS", default_value_t = 5000)]
    timeout_ms: u64,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn config(&self) -> Result<RoverNodeConfig> {
        let mut config = RoverNodeConfig::new(self.id)?;
        config.bind = match self.bind {
            Some(bind) => bind,
            None => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), rover_port(self.id)?),
        };
        config.coordinator = self.coordinator;
        config.protocol = config.protocol.with_timeout_ms(self.timeout_ms);
        config.simulation.tick_ms = self.tick_ms;
        config.x = self.x;
        config.y = self.y;
        config.battery = self.battery;
        config.fail_at = self.fail_at;
        Ok(config)
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
            error!(error = %e, "rover failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let node = RoverNode::bind(cli.config()?).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received");
            let _ = shutdown_tx.send(true);
        }
    });

    node.run(shutdown_rx).await
}
