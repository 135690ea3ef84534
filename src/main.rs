use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use devroom::logging::{self, LogOptions};

mod cmd;

#[derive(Parser)]
#[command(name = "devroom")]
#[command(version, about = "Collaborative session engine for shared projects")]
pub struct Cli {
    /// Path to the config file
    #[arg(long, global = true, default_value = devroom::config::DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Also write daily-rolling JSON logs to this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve rooms over HTTP and WebSocket
    Serve {
        #[arg(short, long)]
        port: Option<u16>,

        #[arg(long)]
        host: Option<String>,

        /// Permissive CORS for browser clients on other origins
        #[arg(long)]
        dev: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Check the configuration and list every problem
    Validate,
    /// Write a default config file
    Init {
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let _log_guard = logging::init(&LogOptions {
        verbose: cli.verbose,
        json: cli.log_json,
        log_dir: cli.log_dir.as_deref(),
    })?;

    match cli.command {
        Commands::Serve { port, host, dev } => {
            cmd::cmd_serve(&cli.config, port, host, dev).await?;
        }
        Commands::Config { command } => {
            cmd::cmd_config(&cli.config, command)?;
        }
    }

    Ok(())
}
