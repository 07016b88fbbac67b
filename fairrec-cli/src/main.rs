//! FairRec CLI: inspect training configuration, plans and checkpoints.

mod commands;

use clap::Parser;
use std::path::PathBuf;

/// FairRec: adversarial fairness training for recommenders
#[derive(Parser, Debug)]
#[command(name = "fairrec", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    /// Directory for JSON log files (defaults to the user data directory)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show how a configured model is trained (variant, stage, optimizer roles)
    Plan {
        /// Extra configuration files, applied after the default ones
        #[arg(short, long)]
        config: Vec<PathBuf>,
    },
    /// Summarise a checkpoint file
    Inspect {
        /// Checkpoint to read
        checkpoint: PathBuf,
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write the default configuration to <workspace>/.fairrec/config.toml
    Init,
    /// Print the resolved configuration
    Show {
        /// Extra configuration files, applied after the default ones
        #[arg(short, long)]
        config: Vec<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let log_dir = cli.log_dir.clone().or_else(|| {
        directories::ProjectDirs::from("dev", "fairrec", "fairrec")
            .map(|d| d.data_dir().join("logs"))
    });
    let _guard = fairrec_core::init_logging(cli.verbose, cli.quiet, log_dir.as_deref())?;

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| cli.workspace.clone());

    commands::handle_command(cli.command, &workspace)
}
