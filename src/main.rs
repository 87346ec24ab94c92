use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use bugsniper::bugsniper_config::BugsniperConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "bugsniper")]
#[command(version, about = "Analyze a commit, propose a fix, open a PR")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Path to a bugsniper.toml. Defaults to .bugsniper/bugsniper.toml in the project directory.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the job API
    Serve {
        /// Port to serve on (overrides [server] port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind (overrides [server] host)
        #[arg(long)]
        host: Option<String>,

        /// Enable dev mode (permissive CORS, bind all interfaces)
        #[arg(long)]
        dev: bool,
    },
    /// Analyze one commit in-process and print the result
    Analyze {
        /// Local clone containing the commit
        repo: PathBuf,

        /// Commit to analyze
        sha: String,

        /// owner/repo used when opening the PR
        #[arg(long)]
        repo_name: Option<String>,

        /// Print the job as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one job
    Status {
        id: String,

        /// Print the job as JSON
        #[arg(long)]
        json: bool,
    },
    /// Approve a job that is ready for review and open its PR
    Approve { id: String },
    /// List jobs
    Jobs {
        /// Delete every job record
        #[arg(long)]
        clear: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default bugsniper.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    if let Commands::Config { command } = &cli.command {
        // Must work even when the config file is broken.
        return cmd::cmd_config(&project_dir, cli.config.as_deref(), command.clone());
    }

    let config = BugsniperConfig::new(project_dir, cli.config.clone())?.with_verbose(cli.verbose);
    bugsniper::logging::init_logging(cli.verbose, &config.toml.logging);
    for warning in &config.env_warnings {
        tracing::warn!("{}", warning);
    }

    match &cli.command {
        Commands::Serve { port, host, dev } => {
            cmd::cmd_serve(&config, *port, host.clone(), *dev).await?
        }
        Commands::Analyze {
            repo,
            sha,
            repo_name,
            json,
        } => cmd::cmd_analyze(&config, repo, sha, repo_name.clone(), *json).await?,
        Commands::Status { id, json } => cmd::cmd_status(&config, id, *json).await?,
        Commands::Approve { id } => cmd::cmd_approve(&config, id).await?,
        Commands::Jobs { clear } => cmd::cmd_jobs(&config, *clear).await?,
        Commands::Config { .. } => {}
    }

    Ok(())
}
