//! Authentication CLI command handlers

use secrecy::SecretString;

use crate::cli::commands::{LoginArgs, LogoutArgs, RefreshArgs, StatusArgs};
use crate::cli::prompt::TerminalPrompter;
use crate::core::git_config::check_git;
use crate::core::token_manager::{AuthState, HookOutcome, LoginRequest, StatusReport, TokenManager};
use crate::error::Result;

/// Handle the login command
pub async fn handle_login(args: LoginArgs) -> Result<()> {
    let version = check_git()?;
    tracing::debug!(%version, "found git");

    let manager = TokenManager::open_default()?;

    let request = LoginRequest {
        server: args.server,
        username: args.username,
        password: args.password.map(SecretString::from),
        save: manager.settings().auto_save_credentials && !args.no_save,
    };

    let outcome = manager.login(request, &TerminalPrompter).await?;

    if outcome.reauthenticated {
        println!("✓ Logged in to {} as {}", outcome.server, outcome.username);
    } else {
        println!(
            "✓ Already logged in to {} as {} (token still fresh)",
            outcome.server, outcome.username
        );
    }
    println!("  Git requests to {} now carry the entry-token.", outcome.server);

    if outcome.hook_installed {
        println!("  Tokens refresh automatically before each push.");
    } else {
        println!("  Could not install the pre-push hook; run 'fnos-git-auth refresh' when pushes fail.");
    }
    if !outcome.password_saved {
        println!();
        println!("  Password not saved: automatic refresh is disabled.");
    }
    Ok(())
}

/// Handle the logout command
pub fn handle_logout(args: LogoutArgs) -> Result<()> {
    let manager = TokenManager::open_default()?;
    let outcome = manager.logout(args.all)?;

    match &outcome.server {
        Some(server) => println!("✓ Logged out from {}", server),
        None => println!("Not currently logged in."),
    }
    if outcome.headers_removed > 0 {
        println!("  Removed {} Git header(s).", outcome.headers_removed);
    }
    if outcome.hook_removed {
        println!("  Removed the pre-push hook.");
    }
    if outcome.credentials_forgotten {
        println!("  Saved credentials have been deleted.");
    } else if outcome.server.is_some() {
        println!("  Saved credentials kept; run 'fnos-git-auth login' to log in again.");
    }
    Ok(())
}

/// Handle the status command
pub fn handle_status(args: StatusArgs) -> Result<()> {
    let manager = TokenManager::open_default()?;
    let report = manager.status()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    print_status(&report);
    Ok(())
}

fn print_status(report: &StatusReport) {
    let yes_no = |flag: bool, yes: &'static str, no: &'static str| if flag { yes } else { no };

    let state = match report.state {
        AuthState::Authenticated => "✓ logged in",
        AuthState::Authenticating => "logging in",
        AuthState::LoggedOut => "✗ logged out",
    };

    println!("fnOS Git authentication");
    println!("  State:       {}", state);
    println!("  Server:      {}", report.server.as_deref().unwrap_or("-"));
    println!("  Username:    {}", report.username.as_deref().unwrap_or("-"));
    println!("  Password:    {}", yes_no(report.password_saved, "saved", "not saved"));

    match report.token_issued_at {
        Some(issued) => println!(
            "  Token:       issued {} ({})",
            issued.format("%Y-%m-%d %H:%M UTC"),
            yes_no(report.token_stale, "stale", "fresh")
        ),
        None => println!("  Token:       none"),
    }

    let header = yes_no(report.header_present, "configured", "missing");
    if report.header_healed {
        println!("  Git header:  {} (repaired from the saved token)", header);
    } else {
        println!("  Git header:  {}", header);
    }
    println!("  Hook:        {}", yes_no(report.hook_installed, "installed", "not installed"));

    match report.credential_cache_timeout {
        Some(secs) => println!("  Cred cache:  {}s", secs),
        None => println!("  Cred cache:  off"),
    }
    if let Some(last) = report.last_login {
        println!("  Last login:  {}", last.format("%Y-%m-%d %H:%M UTC"));
    }
}

/// Handle the refresh command
///
/// In hook mode every failure becomes a warning so the push proceeds.
pub async fn handle_refresh(args: RefreshArgs) -> Result<()> {
    if args.hook {
        hook_refresh(args.remote_url.as_deref()).await;
        return Ok(());
    }

    let manager = TokenManager::open_default()?;
    let token = manager.refresh(args.server.as_deref()).await?;
    println!("✓ Token refreshed for {}", token.server);
    Ok(())
}

async fn hook_refresh(remote_url: Option<&str>) {
    let manager = match TokenManager::open_default() {
        Ok(manager) => manager,
        Err(e) => {
            eprintln!("[fnos-git-auth] token refresh skipped: {}", first_line(&e.to_string()));
            return;
        }
    };

    if let HookOutcome::Failed(reason) = manager.hook_refresh(remote_url).await {
        eprintln!("[fnos-git-auth] token refresh failed: {}", first_line(&reason));
        eprintln!("[fnos-git-auth] continuing; run 'fnos-git-auth login' if the push is rejected");
    }
}

fn first_line(message: &str) -> &str {
    message.lines().next().unwrap_or(message)
}
