pub mod handlers;

use crate::presentation::cli::{Cli, Commands};
use clap::Parser;
use offload_core::Result;

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let env = handlers::Env::open(&cli)?;
    match cli.command {
        Commands::Token { action } => handlers::handle_token(&env, action),
        Commands::Start { token } => handlers::handle_start(&env, token),
        Commands::Run => handlers::handle_run(&env),
        Commands::Progress { token } => handlers::handle_progress(&env, token),
        Commands::Cancel { token } => handlers::handle_cancel(&env, token),
        Commands::Watchdog { force } => handlers::handle_watchdog(&env, force),
        Commands::Remove { item_id } => handlers::handle_remove(&env, &item_id),
        Commands::Notice => handlers::handle_notice(&env),
        Commands::Counts => handlers::handle_counts(&env),
    }
}
