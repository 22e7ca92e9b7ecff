//! fnos-git-auth - Git authentication for fnOS servers
//!
//! Logs in to an fnOS NAS, writes the entry-token into Git's global
//! `extraHeader` configuration and refreshes it from a pre-push hook.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use fnos_git_auth::cli::commands::{Cli, Commands};
use fnos_git_auth::cli::{auth, config, git};
use fnos_git_auth::error::Result;

#[tokio::main]
async fn main() {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Login(args) => auth::handle_login(args).await,
        Commands::Logout(args) => auth::handle_logout(args),
        Commands::Status(args) => auth::handle_status(args),
        Commands::Refresh(args) => auth::handle_refresh(args).await,
        Commands::Config(args) => config::handle_config(args),
        Commands::Git(args) => git::handle_git(args),
    }
}
