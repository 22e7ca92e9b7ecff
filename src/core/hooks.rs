//! Pre-push refresh hook management
//!
//! The hook is a marker-delimited block inside Git's `pre-push` script. It
//! re-invokes this binary with `refresh --hook` so the entry-token is renewed
//! before Git talks to the server. The block never fails the push.
//!
//! Existing third-party hooks are preserved: the block is inserted after
//! their shebang and stripped again on uninstall.

use std::fs;
use std::path::{Path, PathBuf};

use git2::Repository;
use tracing::{debug, info};

use crate::core::git_config::GitConfigBridge;
use crate::core::lock::StateLock;
use crate::error::{FnosError, Result};

/// Hook the refresh block is installed into
pub const HOOK_NAME: &str = "pre-push";

/// Managed hooks directory inside the configuration directory
pub const MANAGED_HOOKS_DIR: &str = "hooks";

const BEGIN_MARKER: &str = "# >>> fnos-git-auth refresh >>>";
const END_MARKER: &str = "# <<< fnos-git-auth refresh <<<";
const SHEBANG: &str = "#!/bin/sh";
const TRAILER: &str = "exit 0";

/// Where a hook is installed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookScope {
    /// Global hooks directory (`core.hooksPath`)
    Global,
    /// Hooks of the repository containing this path
    Repository(PathBuf),
}

/// Installs and removes the refresh block
#[derive(Debug, Clone)]
pub struct RefreshHook {
    git: GitConfigBridge,
    managed_dir: PathBuf,
    binary: String,
}

impl RefreshHook {
    /// Hook manager whose managed directory lives under `config_dir`
    pub fn new(git: GitConfigBridge, config_dir: &Path) -> Self {
        let binary = std::env::current_exe()
            .map(|path| path.to_string_lossy().replace('\\', "/"))
            .unwrap_or_else(|_| env!("CARGO_PKG_NAME").to_string());

        Self {
            git,
            managed_dir: config_dir.join(MANAGED_HOOKS_DIR),
            binary,
        }
    }

    /// Use `binary` as the command the hook runs
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Install the block; a second install leaves the file unchanged
    pub fn install(&self, lock: &StateLock, scope: &HookScope) -> Result<PathBuf> {
        let dir = match scope {
            HookScope::Global => match self.git.hooks_path()? {
                Some(dir) => dir,
                None => {
                    self.git.set_hooks_path(lock, &self.managed_dir)?;
                    self.managed_dir.clone()
                }
            },
            HookScope::Repository(path) => repository_hooks_dir(path)?,
        };

        // Our hooksPath hides repository hooks, so the managed script runs them
        let chain_repository_hook = *scope == HookScope::Global && dir == self.managed_dir;

        fs::create_dir_all(&dir)?;
        let hook = dir.join(HOOK_NAME);
        let existing = read_optional(&hook)?;
        let updated = with_block(existing.as_deref(), &self.block(chain_repository_hook));

        if existing.as_deref() != Some(updated.as_str()) {
            fs::write(&hook, &updated)?;
            info!(hook = %hook.display(), "installed refresh hook");
        }
        make_executable(&hook)?;

        Ok(hook)
    }

    /// Remove the block, returning whether anything was removed
    pub fn uninstall(&self, lock: &StateLock, scope: &HookScope) -> Result<bool> {
        let Some(dir) = self.installed_dir(scope)? else {
            return Ok(false);
        };

        let hook = dir.join(HOOK_NAME);
        let removed = match read_optional(&hook)? {
            Some(contents) if contents.contains(BEGIN_MARKER) => {
                match without_block(&contents) {
                    Some(rest) => fs::write(&hook, rest)?,
                    None => fs::remove_file(&hook)?,
                }
                true
            }
            _ => false,
        };

        if *scope == HookScope::Global && dir == self.managed_dir {
            self.git.unset_hooks_path(lock)?;
            // Only removes the directory when nothing else lives there
            if fs::remove_dir(&self.managed_dir).is_err() {
                debug!(dir = %self.managed_dir.display(), "keeping non-empty hooks directory");
            }
        }

        if removed {
            info!(hook = %hook.display(), "removed refresh hook");
        }
        Ok(removed)
    }

    /// Whether the block is present in the active hook for `scope`
    pub fn is_installed(&self, scope: &HookScope) -> bool {
        let Ok(Some(dir)) = self.installed_dir(scope) else {
            return false;
        };
        matches!(read_optional(&dir.join(HOOK_NAME)), Ok(Some(contents)) if contents.contains(BEGIN_MARKER))
    }

    fn installed_dir(&self, scope: &HookScope) -> Result<Option<PathBuf>> {
        match scope {
            HookScope::Global => self.git.hooks_path(),
            HookScope::Repository(path) => repository_hooks_dir(path).map(Some),
        }
    }

    fn block(&self, chain_repository_hook: bool) -> String {
        let binary = self.binary.replace('\'', r"'\''");
        let mut block = format!(
            "{BEGIN_MARKER}\n\
             if ! '{binary}' refresh --hook --remote-url \"$2\" </dev/null; then\n\
             \x20   echo \"[fnos-git-auth] token refresh failed, continuing\" >&2\n\
             fi\n"
        );
        if chain_repository_hook {
            block.push_str(&format!(
                "repo_hook=\"$(git rev-parse --git-dir 2>/dev/null)/hooks/{HOOK_NAME}\"\n\
                 if [ -f \"$repo_hook\" ] && [ -x \"$repo_hook\" ]; then\n\
                 \x20   exec \"$repo_hook\" \"$@\"\n\
                 fi\n"
            ));
        }
        block.push_str(END_MARKER);
        block.push('\n');
        block
    }
}

fn repository_hooks_dir(path: &Path) -> Result<PathBuf> {
    let repo = Repository::discover(path)
        .map_err(|_| FnosError::InvalidInput(format!("{} is not inside a Git repository", path.display())))?;
    Ok(repo.path().join("hooks"))
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn make_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Hook contents with `block` present exactly once
fn with_block(existing: Option<&str>, block: &str) -> String {
    let existing = existing.unwrap_or_default();

    if existing.trim().is_empty() {
        return format!("{SHEBANG}\n{block}{TRAILER}\n");
    }

    if let Some((before, after)) = split_around_block(existing) {
        return format!("{before}{block}{after}");
    }

    match existing.split_once('\n') {
        Some((first, rest)) if first.starts_with("#!") => format!("{first}\n{block}{rest}"),
        None if existing.starts_with("#!") => format!("{existing}\n{block}"),
        _ => format!("{block}{existing}"),
    }
}

/// Hook contents with the block removed, or `None` if nothing meaningful remains
fn without_block(existing: &str) -> Option<String> {
    let rest = match split_around_block(existing) {
        Some((before, after)) => format!("{before}{after}"),
        None => existing.to_string(),
    };

    let meaningful = rest
        .lines()
        .map(str::trim)
        .any(|line| !line.is_empty() && !line.starts_with("#!") && line != TRAILER);

    meaningful.then_some(rest)
}

/// Text before the begin marker and after the end marker line
fn split_around_block(contents: &str) -> Option<(&str, &str)> {
    let start = contents.find(BEGIN_MARKER)?;
    let end_marker = start + contents[start..].find(END_MARKER)?;
    let mut end = end_marker + END_MARKER.len();
    if contents[end..].starts_with('\n') {
        end += 1;
    }
    Some((&contents[..start], &contents[end..]))
}
