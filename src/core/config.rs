//! Application configuration management
//!
//! Handles loading and saving non-auth preferences:
//! - Network timeout and retry policy for the login handshake
//! - Token staleness window
//! - Connection details (TLS, relay cookie, device name)

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{FnosError, Result};

/// Environment variable overriding the configuration directory
pub const CONFIG_DIR_ENV: &str = "FNOS_GIT_AUTH_CONFIG_DIR";

const CONFIG_FILE: &str = "config.toml";

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Handshake timeout in seconds
    pub timeout_secs: u64,

    /// Handshake attempts for transient failures
    pub retry_attempts: u32,

    /// Initial backoff between attempts in milliseconds (doubles per retry)
    pub retry_backoff_ms: u64,

    /// Assumed lifetime of an entry-token in hours
    pub token_max_age_hours: u64,

    /// Consider a token stale this many hours before it would expire
    pub token_refresh_threshold_hours: u64,

    /// Connect with `wss://` and configure `https://` header patterns
    pub use_ssl: bool,

    /// Cookie sent when connecting through fn connect relays
    pub fn_connect_cookie: String,

    /// Device type reported at login
    pub device_type: String,

    /// Device name reported at login
    pub device_name: String,

    /// Save passwords after successful login unless `--no-save` is given
    pub auto_save_credentials: bool,

    /// Keep the store's master key in the OS keyring instead of a key file
    pub use_keyring: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            retry_attempts: 3,
            retry_backoff_ms: 500,
            token_max_age_hours: 8,
            token_refresh_threshold_hours: 1,
            use_ssl: true,
            fn_connect_cookie: "mode=relay; language=zh".to_string(),
            device_type: "Browser".to_string(),
            device_name: "fnos-git-auth".to_string(),
            auto_save_credentials: true,
            use_keyring: true,
        }
    }
}

impl Settings {
    /// All keys accepted by `config -k`
    pub const KEYS: &'static [&'static str] = &[
        "timeout_secs",
        "retry_attempts",
        "retry_backoff_ms",
        "token_max_age_hours",
        "token_refresh_threshold_hours",
        "use_ssl",
        "fn_connect_cookie",
        "device_type",
        "device_name",
        "auto_save_credentials",
        "use_keyring",
    ];

    /// Load settings from the default configuration directory
    pub fn load() -> Result<Self> {
        Self::load_from(&config_dir()?)
    }

    /// Load settings from `dir`, or defaults if no file exists yet
    pub fn load_from(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);

        if path.exists() {
            let contents = fs::read_to_string(&path)?;
            let settings: Settings = toml::from_str(&contents)?;
            Ok(settings)
        } else {
            Ok(Settings::default())
        }
    }

    /// Save settings into `dir`
    pub fn save_to(&self, dir: &Path) -> Result<()> {
        ensure_private_dir(dir)?;
        let contents = toml::to_string_pretty(self)?;
        fs::write(dir.join(CONFIG_FILE), contents)?;
        Ok(())
    }

    /// Handshake timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    /// Age after which a stored token is no longer trusted
    pub fn stale_after(&self) -> ChronoDuration {
        let hours = self
            .token_max_age_hours
            .saturating_sub(self.token_refresh_threshold_hours);
        ChronoDuration::hours(hours as i64)
    }

    /// URL scheme used for headers and connections
    pub fn http_scheme(&self) -> &'static str {
        if self.use_ssl {
            "https"
        } else {
            "http"
        }
    }

    /// Read a single setting as a display string
    pub fn get(&self, key: &str) -> Option<String> {
        let value = toml::Value::try_from(self).ok()?;
        value.get(key).map(|v| match v {
            toml::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Set a single setting from its string form, keeping the key's type
    pub fn set(&mut self, key: &str, raw: &str) -> Result<()> {
        let mut table = toml::Value::try_from(&*self)?;
        let current = table
            .get(key)
            .ok_or_else(|| unknown_setting(key))?;

        let parsed = match current {
            toml::Value::Boolean(_) => toml::Value::Boolean(parse_bool(raw).ok_or_else(|| {
                FnosError::InvalidInput(format!("'{}' expects true or false, got '{}'", key, raw))
            })?),
            toml::Value::Integer(_) => {
                toml::Value::Integer(raw.trim().parse::<u32>().map(i64::from).map_err(|_| {
                    FnosError::InvalidInput(format!(
                        "'{}' expects a non-negative integer, got '{}'",
                        key, raw
                    ))
                })?)
            }
            _ => toml::Value::String(raw.to_string()),
        };

        if let Some(map) = table.as_table_mut() {
            map.insert(key.to_string(), parsed);
        }
        *self = table.try_into()?;
        Ok(())
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Error for a key that is not in [`Settings::KEYS`]
pub fn unknown_setting(key: &str) -> FnosError {
    FnosError::InvalidInput(format!(
        "Unknown setting '{}'. Valid settings: {}",
        key,
        Settings::KEYS.join(", ")
    ))
}

/// Get the configuration directory
///
/// `FNOS_GIT_AUTH_CONFIG_DIR` wins over the platform default.
pub fn config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }

    let project_dirs = ProjectDirs::from("net", "fnos", "fnos-git-auth")
        .ok_or_else(|| FnosError::Config("Could not determine config directory".into()))?;

    Ok(project_dirs.config_dir().to_path_buf())
}

/// Create `dir` if needed and restrict it to the current user
pub fn ensure_private_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.timeout_secs, 30);
        assert_eq!(settings.retry_attempts, 3);
        assert!(settings.use_ssl);
        assert_eq!(settings.stale_after(), ChronoDuration::hours(7));
    }

    #[test]
    fn test_set_keeps_types() {
        let mut settings = Settings::default();
        settings.set("timeout_secs", "60").unwrap();
        settings.set("use_ssl", "off").unwrap();
        settings.set("device_name", "laptop").unwrap();

        assert_eq!(settings.timeout_secs, 60);
        assert!(!settings.use_ssl);
        assert_eq!(settings.device_name, "laptop");
        assert_eq!(settings.get("timeout_secs").as_deref(), Some("60"));
    }

    #[test]
    fn test_set_rejects_unknown_and_malformed() {
        let mut settings = Settings::default();
        assert!(settings.set("colour", "blue").is_err());
        assert!(settings.set("timeout_secs", "soon").is_err());
        assert!(settings.set("use_ssl", "maybe").is_err());
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_round_trip_through_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.set("retry_attempts", "5").unwrap();
        settings.save_to(dir.path()).unwrap();

        let loaded = Settings::load_from(dir.path()).unwrap();
        assert_eq!(loaded.retry_attempts, 5);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Settings::load_from(dir.path()).unwrap(), Settings::default());
    }
}
