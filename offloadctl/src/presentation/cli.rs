use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about = "offloadctl: resumable bulk media offload", long_about = None)]
pub struct Cli {
    /// Directory holding job state, the run lock and the catalog ledger
    #[arg(long, global = true, default_value = ".offload/state")]
    pub state_dir: PathBuf,

    /// Root of the local media library
    #[arg(long, global = true, default_value = "media")]
    pub media_root: PathBuf,

    /// Directory acting as the remote bucket
    #[arg(long, global = true, default_value = ".offload/bucket")]
    pub bucket_dir: PathBuf,

    /// JSON config file; missing fields take their defaults
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, default_value = "admin")]
    pub user: String,

    #[arg(long, global = true, value_enum, default_value_t = Role::Admin)]
    pub role: Role,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Role {
    /// May start runs and poll progress
    Admin,
    /// May only poll progress
    Author,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Issue a security token for the current user
    Token {
        /// Action the token is bound to (defaults to the job id)
        action: Option<String>,
    },

    /// Select a batch and begin a run
    Start {
        #[arg(long)]
        token: String,
    },

    /// Process the active run until it completes or is cancelled
    Run,

    /// Print progress of the current or last run
    Progress {
        #[arg(long)]
        token: String,
    },

    /// Request cancellation of the active run
    Cancel {
        #[arg(long)]
        token: String,
    },

    /// Release a run that stopped making progress
    Watchdog {
        /// Check now instead of waiting for the check interval
        #[arg(long)]
        force: bool,
    },

    /// Remove a media item locally and its offloaded copies remotely
    Remove { item_id: String },

    /// Show (and clear) a pending remote-delete failure notice
    Notice,

    /// Offloaded / pending / failed totals for the library
    Counts,
}
