use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use legion::sdk::process::ProcessSdkFactory;
use legion::{LegionConfig, LegionSystem};

#[derive(Parser)]
#[command(name = "legion", about = "Multi-agent orchestration core", version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestration core until interrupted
    Serve {
        /// Root data directory (overrides configuration)
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Agent CLI executable used to launch sessions
        #[arg(long, default_value = "claude")]
        agent_bin: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false).compact();
    let filter_layer =
        tracing_subscriber::EnvFilter::from_default_env().add_directive(log_level.into());

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    match cli.command {
        Command::Serve {
            data_dir,
            agent_bin,
        } => {
            let config = LegionConfig::load_with_data_dir(data_dir)?;
            let factory = Arc::new(ProcessSdkFactory::with_binary(agent_bin));
            let mut system = LegionSystem::new(config, factory);
            system.start().await?;

            tokio::signal::ctrl_c().await?;
            tracing::info!("shutdown requested");
            system.shutdown().await;
        }
    }

    Ok(())
}
