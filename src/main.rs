use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use runway::config::RunwayConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "runway")]
#[command(version, about = "Per-project container runtimes for generated code")]
pub struct Cli {
    /// Path to the configuration file (defaults to ./runway.toml if present)
    #[arg(short, long, global = true, env = "RUNWAY_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Reconcile runtime status, then serve the HTTP/WebSocket API
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
        /// SQLite database holding runtime records
        #[arg(long)]
        db_path: Option<PathBuf>,
        /// Directory containing one sub-directory per project
        #[arg(long)]
        projects_root: Option<PathBuf>,
        /// Enable permissive CORS for a locally served frontend
        #[arg(long)]
        dev: bool,
    },
    /// Correct persisted runtime status against Docker and exit
    Reconcile,
    /// Print the effective configuration as TOML
    Config {
        /// Only check that the configuration is valid
        #[arg(long)]
        validate: bool,
    },
    /// Inspect the command policy
    Policy {
        #[command(subcommand)]
        command: PolicyCommands,
    },
}

#[derive(Subcommand)]
pub enum PolicyCommands {
    /// Evaluate a command against the policy without running it
    Check {
        /// Working directory, relative to the container workdir
        #[arg(long)]
        cwd: Option<String>,
        command: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let mut config = RunwayConfig::load(cli.config.as_deref())?;
    config.apply_env()?;
    cmd::init_tracing(&config.logging, cli.verbose);

    match cli.command {
        Commands::Serve {
            host,
            port,
            db_path,
            projects_root,
            dev,
        } => {
            cmd::cmd_serve(
                config,
                cmd::serve::ServeOverrides {
                    host,
                    port,
                    db_path,
                    projects_root,
                    dev,
                },
            )
            .await?
        }
        Commands::Reconcile => cmd::cmd_reconcile(config).await?,
        Commands::Config { validate } => cmd::cmd_config(&config, validate)?,
        Commands::Policy {
            command: PolicyCommands::Check { cwd, command, args },
        } => cmd::cmd_policy_check(&config, &command, &args, cwd.as_deref())?,
    }

    Ok(())
}
