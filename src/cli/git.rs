//! Git configuration CLI command handlers

use crate::cli::commands::GitArgs;
use crate::core::credentials::CredentialStore;
use crate::core::git_config::check_git;
use crate::core::token_manager::TokenManager;
use crate::error::Result;

/// Handle the git command
pub fn handle_git(args: GitArgs) -> Result<()> {
    check_git()?;
    let manager = TokenManager::open_default()?;
    let mut acted = false;

    if args.clear {
        let removed = manager.clear_git_headers()?;
        println!("✓ Removed {} entry-token header(s).", removed);
        acted = true;
    }

    if let Some(server) = &args.remove {
        let removed = manager.remove_git_header(server)?;
        if removed == 0 {
            println!("No entry-token header configured for {}.", server);
        } else {
            println!("✓ Removed {} header(s) for {}.", removed, server);
        }
        acted = true;
    }

    if let Some(seconds) = args.cache_timeout {
        manager.set_credential_cache(seconds)?;
        if seconds == 0 {
            println!("✓ Git credential cache disabled.");
        } else {
            println!("✓ Git credential cache timeout set to {}s.", seconds);
        }
        acted = true;
    }

    if args.show || !acted {
        show_headers(&manager)?;
    }
    Ok(())
}

fn show_headers<A: crate::fnos::Authenticator>(manager: &TokenManager<A>) -> Result<()> {
    let headers = manager.git_headers()?;

    if headers.is_empty() {
        println!("No entry-token headers configured.");
        return Ok(());
    }

    println!("Entry-token headers:");
    for header in &headers {
        println!(
            "  {:<40} entry-token={}",
            header.pattern,
            CredentialStore::mask_token(&header.token)
        );
    }
    Ok(())
}
