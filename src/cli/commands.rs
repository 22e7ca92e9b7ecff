//! CLI command definitions using clap
//!
//! Defines the command structure for the `fnos-git-auth` tool.

use clap::{Args, Parser, Subcommand};

/// fnos-git-auth - Git authentication for fnOS servers
///
/// Logs in to an fnOS NAS and keeps Git's HTTP headers supplied with a
/// valid entry-token, refreshing it automatically before every push.
#[derive(Parser, Debug)]
#[command(name = "fnos-git-auth", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Log in and configure Git for an fnOS server
    Login(LoginArgs),

    /// Remove the Git header and hook, keeping saved credentials
    Logout(LogoutArgs),

    /// Show the current login state
    Status(StatusArgs),

    /// Obtain a fresh token with the saved password
    Refresh(RefreshArgs),

    /// Show or change settings
    Config(ConfigArgs),

    /// Inspect or clean up the Git configuration
    Git(GitArgs),
}

/// Login arguments
#[derive(Args, Debug, Default)]
pub struct LoginArgs {
    /// Server address, e.g. demo.fnos.net or 192.168.1.4:5666
    #[arg(short, long)]
    pub server: Option<String>,

    /// Username (prompts for the password)
    #[arg(short, long)]
    pub username: Option<String>,

    /// Password (prompted when omitted)
    #[arg(short, long, env = "FNOS_GIT_AUTH_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Do not save the password (automatic refresh will not work)
    #[arg(short = 'n', long)]
    pub no_save: bool,
}

/// Logout arguments
#[derive(Args, Debug, Default)]
pub struct LogoutArgs {
    /// Also forget the saved username and password
    #[arg(short, long)]
    pub all: bool,
}

/// Status arguments
#[derive(Args, Debug, Default)]
pub struct StatusArgs {
    /// Print machine-readable JSON
    #[arg(long)]
    pub json: bool,
}

/// Refresh arguments
#[derive(Args, Debug, Default)]
pub struct RefreshArgs {
    /// Refresh a specific saved server instead of the active one
    #[arg(short, long)]
    pub server: Option<String>,

    /// Invoked from the pre-push hook: never fail
    #[arg(long, hide = true)]
    pub hook: bool,

    /// Remote URL Git is pushing to (passed by the hook)
    #[arg(long, hide = true, allow_hyphen_values = true)]
    pub remote_url: Option<String>,
}

/// Config arguments
#[derive(Args, Debug, Default)]
pub struct ConfigArgs {
    /// Setting name (lists all settings when omitted)
    #[arg(short, long)]
    pub key: Option<String>,

    /// New value for the setting
    #[arg(short, long, requires = "key")]
    pub value: Option<String>,

    /// Reset the setting (or all settings) to the default
    #[arg(short, long, conflicts_with = "value")]
    pub reset: bool,
}

/// Git arguments
#[derive(Args, Debug, Default)]
pub struct GitArgs {
    /// Show configured entry-token headers (default)
    #[arg(short, long)]
    pub show: bool,

    /// Remove every entry-token header
    #[arg(short, long, conflicts_with = "remove")]
    pub clear: bool,

    /// Remove the headers of one server
    #[arg(short, long, value_name = "SERVER")]
    pub remove: Option<String>,

    /// Set Git's credential cache timeout in seconds (0 disables it)
    #[arg(short = 't', long, value_name = "SECONDS")]
    pub cache_timeout: Option<u64>,
}
