//! Sample Changer Daemon
//!
//! Runs the state monitor and exchange operations from the command line:
//! - `monitor` prints state transitions until Ctrl+C
//! - `load`, `unload` and `chained-load` perform one exchange and exit
//! - `status` prints the reconciled state and the mounted sample
//! - `maint` runs a maintenance action on the robot arm

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use scd::events::EventPublisher;
use scd::service::open_store;
use scd::{
    Changer, ChangerConfig, ChangerService, ConsoleEvents, Hardware, MaintenanceCommand, NoOpEvents,
    SampleChanger,
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "scd")]
#[command(about = "Sample Changer Daemon - pin and tray exchange control")]
#[command(version)]
struct Args {
    /// Path to the changer configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Run against simulated hardware
    #[arg(long)]
    simulate: bool,

    /// Pretty-print published events
    #[arg(long)]
    pretty: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the monitor loops and print state transitions
    Monitor,
    /// Mount the sample at ADDRESS ("3:7" or "B7:2")
    Load { address: String },
    /// Unmount the mounted sample
    Unload,
    /// Unmount what is mounted (if anything else) and mount NEW
    ChainedLoad {
        /// Sample expected to be mounted
        #[arg(long)]
        old: Option<String>,
        new: String,
    },
    /// Print the current state
    Status,
    /// Robot maintenance action
    Maint {
        #[arg(value_enum)]
        action: MaintAction,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum MaintAction {
    Home,
    Soak,
    Dry,
    Reset,
    Abort,
    ReturnPrefetch,
}

impl From<MaintAction> for MaintenanceCommand {
    fn from(action: MaintAction) -> Self {
        match action {
            MaintAction::Home => MaintenanceCommand::Home,
            MaintAction::Soak => MaintenanceCommand::Soak,
            MaintAction::Dry => MaintenanceCommand::Dry,
            MaintAction::Reset => MaintenanceCommand::Reset,
            MaintAction::Abort => MaintenanceCommand::Abort,
            MaintAction::ReturnPrefetch => MaintenanceCommand::ReturnPrefetch,
        }
    }
}

impl Args {
    fn get_config_path(&self) -> String {
        self.config
            .clone()
            .or_else(|| std::env::var("DEFAULT_CONFIG_PATH").ok())
            .unwrap_or_else(|| "config/default_config.yaml".to_string())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args.get_config_path();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    info!("Sample Changer Daemon");
    info!("{}", "=".repeat(50));
    info!("Using config: {}", config_path);

    let config = ChangerConfig::load_from_path(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    if !args.simulate {
        bail!("No hardware drivers are linked into this build; run with --simulate");
    }

    let events: Arc<dyn EventPublisher> = match args.command {
        Command::Monitor if args.pretty => Arc::new(ConsoleEvents::pretty()),
        Command::Monitor => Arc::new(ConsoleEvents::new()),
        _ => Arc::new(NoOpEvents),
    };
    let store = open_store(&config.store).await.context("Failed to open store")?;
    let hardware = Hardware::simulated(&config, Arc::clone(&store));
    let service = ChangerService::new(config, hardware, store, events)
        .await
        .context("Failed to start sample changer service")?;

    let result = run_command(&args.command, &service).await;
    service.stop().await;
    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

async fn run_command(command: &Command, service: &ChangerService) -> Result<()> {
    let changer = service.sample_changer();
    match command {
        Command::Monitor => {
            info!("Monitoring; press Ctrl+C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, stopping monitor");
        }
        Command::Load { address } => {
            changer.load(address).await.context("Load failed")?;
            info!("Loaded {}", address);
        }
        Command::Unload => {
            changer.unload().await.context("Unload failed")?;
            info!("Unloaded");
        }
        Command::ChainedLoad { old, new } => {
            changer
                .chained_load(old.as_deref(), new)
                .await
                .context("Chained load failed")?;
            info!("Loaded {}", new);
        }
        Command::Status => {
            let mut status = serde_json::json!({
                "state": changer.state().name(),
                "phase": changer.phase().to_string(),
                "mounted": changer.mounted().await.map(|a| a.to_string()),
            });
            match service.changer() {
                Changer::Robot(robot) => {
                    status["enabled"] = serde_json::json!(robot.is_enabled().await?);
                    status["powered"] = serde_json::json!(robot.is_powered().await?);
                }
                Changer::Tray(tray) => {
                    status["plate"] = serde_json::to_value(tray.plate_info().await?)?;
                }
            }
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Maint { action } => {
            let Changer::Robot(robot) = service.changer() else {
                bail!("Maintenance actions need the robot variant");
            };
            robot
                .maintenance((*action).into())
                .await
                .context("Maintenance action failed")?;
            info!("Maintenance action finished");
        }
    }
    Ok(())
}
