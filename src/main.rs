use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use multitalk::config::{MultitalkToml, config_dir};
use multitalk::telemetry::{LogOptions, init_tracing};

mod cmd;

#[derive(Parser)]
#[command(name = "multitalk")]
#[command(version, about = "Lead pipeline board with optimistic stage changes")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Skip confirmation prompts
    #[arg(long, global = true)]
    pub yes: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Lead database file. Overrides multitalk.toml and MULTITALK_DB_PATH.
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .multitalk/ with a default config and an empty lead database
    Init,
    /// Serve the JSON API and the per-account event stream
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(long)]
        host: Option<String>,
        /// Permissive CORS for a locally served front end
        #[arg(long)]
        dev: bool,
    },
    /// Work with one account's lead board from the terminal
    Leads {
        #[command(subcommand)]
        command: LeadsCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

/// Whose board a `leads` command acts on.
#[derive(Args, Clone, Debug)]
pub struct SessionArgs {
    #[arg(long)]
    pub account: String,
    /// affiliate or superadmin
    #[arg(long, default_value = "affiliate")]
    pub role: String,
}

#[derive(Subcommand, Clone, Debug)]
pub enum LeadsCommands {
    /// Print the board, one column per stage
    List {
        #[command(flatten)]
        session: SessionArgs,
        /// Only show this stage
        #[arg(long)]
        stage: Option<String>,
        /// Print the board as JSON
        #[arg(long)]
        json: bool,
    },
    /// Add a lead
    Add {
        #[command(flatten)]
        session: SessionArgs,
        name: String,
        email: String,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        company: Option<String>,
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        message: Option<String>,
        /// Deal value, e.g. "1.500,00" or "R$ 2.000"
        #[arg(long)]
        value: Option<String>,
        #[arg(long)]
        probability: Option<u8>,
        /// Starting stage (defaults to new)
        #[arg(long)]
        stage: Option<String>,
    },
    /// Move a lead to another stage
    Move {
        #[command(flatten)]
        session: SessionArgs,
        /// Lead id or a unique prefix of it
        id: String,
        stage: String,
    },
    /// Permanently delete a lead
    Delete {
        #[command(flatten)]
        session: SessionArgs,
        /// Lead id or a unique prefix of it
        id: String,
    },
}

impl LeadsCommands {
    pub fn session(&self) -> &SessionArgs {
        match self {
            LeadsCommands::List { session, .. }
            | LeadsCommands::Add { session, .. }
            | LeadsCommands::Move { session, .. }
            | LeadsCommands::Delete { session, .. } => session,
        }
    }
}

#[derive(Subcommand, Clone, Debug)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration file
    Validate,
    /// Create a default configuration file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // Config commands report on the file themselves, even when it doesn't parse.
    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&project_dir, command.clone());
    }

    dotenvy::dotenv().ok();

    let mut config = MultitalkToml::load_or_default(&config_dir(&project_dir))?;
    config.apply_env()?;
    if let Some(db_path) = &cli.db_path {
        config.database.path = db_path.clone();
    }
    if cli.log_json {
        config.logging.json = true;
    }

    let _log_guard = init_tracing(&LogOptions {
        verbose: cli.verbose,
        json: config.logging.json,
        dir: config.log_dir(&project_dir),
    })?;

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir, &config)?,
        Commands::Serve { port, host, dev } => {
            if let Some(port) = port {
                config.server.port = *port;
            }
            if let Some(host) = host {
                config.server.host = host.clone();
            }
            if *dev {
                config.server.dev_mode = true;
            }
            cmd::cmd_serve(&project_dir, &config).await?;
        }
        Commands::Leads { command } => {
            cmd::cmd_leads(&project_dir, &config, command.clone(), cli.yes).await?;
        }
        Commands::Config { .. } => {}
    }

    Ok(())
}
