//! Posterrama CLI - 命令行工具

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use posterrama_core::PosterramaConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser)]
#[command(name = "posterrama")]
#[command(about = "Posterrama - device capability and command routing server", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Print the built-in capability catalog
    Capabilities {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a default configuration file
    Init {
        /// Configuration file path
        #[arg(short, long)]
        path: Option<PathBuf>,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// 日志级别优先取 RUST_LOG，否则取配置中的 logging.level
fn init_tracing(default_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("posterrama={level},{level}", level = default_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, host, port } => {
            let path = config.unwrap_or_else(PosterramaConfig::default_path);
            let config = PosterramaConfig::load(&path)?;
            init_tracing(&config.logging.level);
            commands::serve::run(config, host, port).await?;
        }
        Commands::Capabilities { json } => {
            init_tracing("warn");
            commands::capabilities::run(json)?;
        }
        Commands::Config { command } => match command {
            ConfigCommands::Init { path, force } => {
                init_tracing("info");
                let path = path.unwrap_or_else(PosterramaConfig::default_path);
                commands::config::init(&path, force)?;
            }
        },
    }

    Ok(())
}
