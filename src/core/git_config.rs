//! Git global configuration bridge
//!
//! Writes the `entry-token` cookie into `http.<url>.extraHeader` so every
//! HTTP request Git makes to an fnOS server carries the session, and manages
//! the other global keys this tool owns:
//! - `credential.helper` cache timeout
//! - `core.hooksPath` for the global refresh hook

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Command;

use directories::BaseDirs;
use git2::{Config, ErrorCode};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};
use url::Url;

use crate::core::lock::StateLock;
use crate::error::{FnosError, Result};

/// Environment variable Git uses to relocate the global config file
const GIT_CONFIG_GLOBAL_ENV: &str = "GIT_CONFIG_GLOBAL";

const COOKIE_PREFIX: &str = "Cookie: entry-token=";
const HEADER_KEY_PATTERN: &str = r"^http\..*\.extraheader$";
const CREDENTIAL_HELPER: &str = "credential.helper";
const CACHE_HELPER_PREFIX: &str = "cache --timeout=";
const HOOKS_PATH: &str = "core.hooksPath";

/// One `extraHeader` entry carrying an entry-token
#[derive(Debug, Clone)]
pub struct GitHeaderEntry {
    /// URL pattern, e.g. `https://*.fnos.net`
    pub pattern: String,
    /// Token embedded in the cookie
    pub token: SecretString,
}

/// Reads and writes Git's global configuration file
#[derive(Debug, Clone)]
pub struct GitConfigBridge {
    path: PathBuf,
    scheme: &'static str,
}

impl GitConfigBridge {
    /// Bridge to the user's global config (`$GIT_CONFIG_GLOBAL` or `~/.gitconfig`)
    pub fn global(scheme: &'static str) -> Result<Self> {
        Ok(Self::at(global_config_path()?, scheme))
    }

    /// Bridge to an explicit config file
    pub fn at(path: impl Into<PathBuf>, scheme: &'static str) -> Self {
        Self {
            path: path.into(),
            scheme,
        }
    }

    /// Path of the config file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<Config> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| FnosError::GitUnavailable(format!("{}: {}", parent.display(), e)))?;
        }
        Ok(Config::open(&self.path)?)
    }

    /// URL patterns that receive the header for `server`
    pub fn header_patterns(&self, server: &str) -> Vec<String> {
        header_patterns(server, self.scheme)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // extraHeader
    // ─────────────────────────────────────────────────────────────────────────

    /// Point every header pattern of `server` at `token`
    ///
    /// Other `extraHeader` values configured for the same URL are kept.
    pub fn set_header(&self, _lock: &StateLock, server: &str, token: &SecretString) -> Result<()> {
        let mut config = self.open()?;
        let value = format!("{}{}", COOKIE_PREFIX, token.expose_secret());
        let cookie_values = cookie_value_pattern();

        for pattern in self.header_patterns(server) {
            let key = header_key(&pattern);
            match config.remove_multivar(&key, &cookie_values) {
                Ok(()) => {}
                Err(e) if e.code() == ErrorCode::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            // Nothing matches any more, so this appends
            config.set_multivar(&key, &cookie_values, &value)?;
            debug!(pattern = %pattern, "wrote extraHeader");
        }

        info!(server, "git extraHeader updated");
        Ok(())
    }

    /// All entry-token headers in the global config
    pub fn show_headers(&self) -> Result<Vec<GitHeaderEntry>> {
        let config = self.open()?.snapshot()?;
        let mut entries = config.entries(Some(HEADER_KEY_PATTERN))?;
        let mut headers = Vec::new();

        while let Some(entry) = entries.next() {
            let entry = entry?;
            let (Some(name), Some(value)) = (entry.name(), entry.value()) else {
                continue;
            };
            let Some(token) = value.strip_prefix(COOKIE_PREFIX) else {
                continue;
            };
            if let Some(pattern) = pattern_of_key(name) {
                headers.push(GitHeaderEntry {
                    pattern: pattern.to_string(),
                    token: SecretString::from(token.to_string()),
                });
            }
        }

        Ok(headers)
    }

    /// Token currently configured for the exact host pattern of `server`
    pub fn header_token(&self, server: &str) -> Result<Option<SecretString>> {
        let config = self.open()?;
        cookie_token(&config, &format!("{}://{}", self.scheme, server))
    }

    /// Whether every header pattern of `server` carries exactly `token`
    pub fn headers_carry(&self, server: &str, token: &SecretString) -> Result<bool> {
        let config = self.open()?;
        for pattern in self.header_patterns(server) {
            let current = cookie_token(&config, &pattern)?;
            if current.map(|t| t.expose_secret().to_string()).as_deref() != Some(token.expose_secret()) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Whether `server` has an entry-token header
    pub fn has_header(&self, server: &str) -> bool {
        matches!(self.header_token(server), Ok(Some(_)))
    }

    /// Remove the headers of `server`, returning how many were removed
    pub fn remove_header(&self, _lock: &StateLock, server: &str) -> Result<usize> {
        let patterns = self.header_patterns(server);
        self.remove_matching(|pattern| patterns.iter().any(|p| p.eq_ignore_ascii_case(pattern)))
    }

    /// Remove every entry-token header, leaving unrelated headers alone
    pub fn clear_all_headers(&self, _lock: &StateLock) -> Result<usize> {
        self.remove_matching(|_| true)
    }

    fn remove_matching(&self, selected: impl Fn(&str) -> bool) -> Result<usize> {
        let mut config = self.open()?;
        let targets: Vec<String> = self
            .show_headers()?
            .into_iter()
            .filter(|entry| selected(&entry.pattern))
            .map(|entry| entry.pattern)
            .collect();

        for pattern in &targets {
            let key = header_key(pattern);
            match config.remove_multivar(&key, &cookie_value_pattern()) {
                Ok(()) => debug!(pattern = %pattern, "removed extraHeader"),
                Err(e) if e.code() == ErrorCode::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(targets.len())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // credential.helper
    // ─────────────────────────────────────────────────────────────────────────

    /// Configured credential cache timeout, if the cache helper is in use
    pub fn credential_cache_timeout(&self) -> Result<Option<u64>> {
        let config = self.open()?;
        match config.get_string(CREDENTIAL_HELPER) {
            Ok(helper) => Ok(helper
                .strip_prefix(CACHE_HELPER_PREFIX)
                .and_then(|secs| secs.trim().parse().ok())),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Set `credential.helper` to the cache helper, or unset it for `0`
    pub fn set_credential_cache_timeout(&self, _lock: &StateLock, seconds: u64) -> Result<()> {
        let mut config = self.open()?;

        if seconds == 0 {
            return remove_if_present(&mut config, CREDENTIAL_HELPER);
        }

        config.set_str(CREDENTIAL_HELPER, &format!("{}{}", CACHE_HELPER_PREFIX, seconds))?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // core.hooksPath
    // ─────────────────────────────────────────────────────────────────────────

    /// Global hooks directory, if one is configured
    pub fn hooks_path(&self) -> Result<Option<PathBuf>> {
        let config = self.open()?;
        match config.get_path(HOOKS_PATH) {
            Ok(path) => Ok(Some(path)),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Point `core.hooksPath` at `dir`
    pub fn set_hooks_path(&self, _lock: &StateLock, dir: &Path) -> Result<()> {
        let mut config = self.open()?;
        config.set_str(HOOKS_PATH, &dir.to_string_lossy())?;
        Ok(())
    }

    /// Remove `core.hooksPath`
    pub fn unset_hooks_path(&self, _lock: &StateLock) -> Result<()> {
        let mut config = self.open()?;
        remove_if_present(&mut config, HOOKS_PATH)
    }
}

fn remove_if_present(config: &mut Config, key: &str) -> Result<()> {
    match config.remove(key) {
        Ok(()) => Ok(()),
        Err(e) if e.code() == ErrorCode::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Verify that a `git` executable is on PATH, returning its version line
pub fn check_git() -> Result<String> {
    let output = Command::new("git")
        .arg("--version")
        .output()
        .map_err(|e| FnosError::GitUnavailable(format!("Failed to execute git: {}", e)))?;

    if !output.status.success() {
        return Err(FnosError::GitUnavailable("git --version failed".into()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn global_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(GIT_CONFIG_GLOBAL_ENV) {
        if !path.is_empty() {
            return Ok(PathBuf::from(path));
        }
    }

    if let Ok(path) = Config::find_global() {
        return Ok(path);
    }

    let dirs = BaseDirs::new()
        .ok_or_else(|| FnosError::GitUnavailable("Could not determine home directory".into()))?;
    Ok(dirs.home_dir().join(".gitconfig"))
}

/// Last entry-token cookie configured under `pattern`
fn cookie_token(config: &Config, pattern: &str) -> Result<Option<SecretString>> {
    let key = header_key(pattern);
    let mut entries = match config.multivar(&key, Some(cookie_value_pattern().as_str())) {
        Ok(entries) => entries,
        Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut token = None;
    while let Some(entry) = entries.next() {
        let entry = entry?;
        if let Some(value) = entry.value().and_then(|v| v.strip_prefix(COOKIE_PREFIX)) {
            token = Some(SecretString::from(value.to_string()));
        }
    }
    Ok(token)
}

fn cookie_value_pattern() -> String {
    format!("^{}", COOKIE_PREFIX)
}

fn header_key(pattern: &str) -> String {
    format!("http.{}.extraHeader", pattern)
}

fn pattern_of_key(name: &str) -> Option<&str> {
    let rest = name.strip_prefix("http.")?;
    let dot = rest.rfind('.')?;
    Some(&rest[..dot])
}

/// URL patterns for `server`: the host itself and, for names with at least
/// three labels, the wildcard parent domain. The port is kept on both.
pub fn header_patterns(server: &str, scheme: &str) -> Vec<String> {
    let mut patterns = vec![format!("{}://{}", scheme, server)];

    let (host, port) = split_port(server);
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() >= 3 && host.parse::<IpAddr>().is_err() {
        let parent = labels[1..].join(".");
        patterns.push(format!("{}://*.{}{}", scheme, parent, port));
    }

    patterns
}

/// Split `host:port` into the host and the `:port` suffix
fn split_port(server: &str) -> (&str, &str) {
    match server.rfind(':') {
        Some(i) if !server.starts_with('[') && server[i + 1..].chars().all(|c| c.is_ascii_digit()) => {
            (&server[..i], &server[i..])
        }
        _ => (server, ""),
    }
}

/// Normalize user input (`demo.fnos.net`, `https://demo.fnos.net/`) to `host[:port]`
pub fn normalize_server(raw: &str) -> Result<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(FnosError::InvalidInput("Server address cannot be empty".into()));
    }

    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{}", raw)
    };

    Url::parse(&with_scheme)
        .ok()
        .and_then(|url| host_with_port(&url))
        .ok_or_else(|| FnosError::InvalidInput(format!("Invalid server address '{}'", raw)))
}

/// Host of an HTTP(S) remote URL; `None` for SSH and local remotes
pub fn remote_host(remote_url: &str) -> Option<String> {
    let url = Url::parse(remote_url).ok()?;
    matches!(url.scheme(), "http" | "https")
        .then(|| host_with_port(&url))
        .flatten()
}

/// Whether requests to `host` receive the header configured for `server`
pub fn server_covers(server: &str, host: &str) -> bool {
    if server.eq_ignore_ascii_case(host) {
        return true;
    }

    header_patterns(server, "https")
        .iter()
        .filter_map(|p| p.strip_prefix("https://*."))
        .any(|parent| {
            let (remote, remote_port) = split_port(host);
            let (parent_host, parent_port) = split_port(parent);
            remote_port == parent_port
                && remote
                    .to_ascii_lowercase()
                    .strip_suffix(&parent_host.to_ascii_lowercase())
                    .is_some_and(|sub| sub.ends_with('.') && sub.len() > 1 && !sub[..sub.len() - 1].contains('.'))
        })
}

fn host_with_port(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}
