use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "devflow")]
#[command(version, about = "Turn feature requests into validated diffs")]
pub struct Cli {
    /// Path to devflow.toml (defaults to .devflow/devflow.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the REST API server
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (permissive CORS, debug logging)
        #[arg(long)]
        dev: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Create the run database without starting the server
    InitDb {
        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and list any problems
    Validate,
    /// Write a default devflow.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Serve {
            port,
            host,
            db_path,
            dev,
        } => {
            cmd::cmd_serve(
                config_path,
                cmd::serve::ServeOverrides {
                    port,
                    host,
                    db_path,
                    dev,
                },
            )
            .await?;
        }
        Commands::Config { command } => cmd::cmd_config(config_path, command)?,
        Commands::InitDb { db_path } => cmd::cmd_init_db(config_path, db_path.as_deref())?,
    }

    Ok(())
}
