//! Custom error types for fnos-git-auth
//!
//! User-friendly error messages for all failure scenarios, plus the
//! classification used to pick retries and process exit codes.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the fnos-git-auth application
#[derive(Error, Debug)]
pub enum FnosError {
    /// Server refused the username/password pair
    #[error("Login failed: wrong username or password.\n\n  → Check your credentials and run 'fnos-git-auth login -u <user>' again.")]
    InvalidCredentials,

    /// Account is protected by two-factor authentication
    #[error("This account requires two-factor authentication, which is not supported.\n\n  → Create a dedicated fnOS account without 2FA for Git access.")]
    TwoFactorRequired,

    /// Transport failure or timeout while talking to the server
    #[error("Cannot reach the fnOS server: {0}\n\n  → Check your network connection and the server address.\n  → Raise the timeout with 'fnos-git-auth config -k timeout_secs -v 60'.")]
    NetworkTimeout(String),

    /// Server replied with something the handshake does not understand
    #[error("Unexpected reply from the fnOS server: {0}\n\n  → The server may run an unsupported fnOS version.")]
    ProtocolMismatch(String),

    /// Server understood the request but refused it
    #[error("The fnOS server rejected the request: {0}")]
    ServerRejected(String),

    /// Git global configuration cannot be read or written
    #[error("Git is not available: {0}\n\n  → Make sure Git is installed and ~/.gitconfig is writable.")]
    GitUnavailable(String),

    /// Refresh attempted without a saved password
    #[error("No saved password is available to refresh the token.\n\n  → Run 'fnos-git-auth login' and keep the password saved.")]
    CredentialsRequired,

    /// Stored state cannot be read or decrypted
    #[error("Stored credentials are unreadable: {0}\n\n  → Run 'fnos-git-auth login' to store them again.")]
    StorageCorrupt(String),

    /// No identity is logged in
    #[error("You are not logged in.\n\n  → Run 'fnos-git-auth login' to authenticate.")]
    NotLoggedIn,

    /// The stored identity changed while a handshake was running
    #[error("Login state changed during the refresh ({0}); the new token was discarded.\n\n  → Run 'fnos-git-auth status' to see who is logged in now.")]
    StateChanged(String),

    /// Another invocation holds the state lock for too long
    #[error("Timed out waiting for the state lock at {}.\n\n  → Another fnos-git-auth process may be running. Remove the file if it is stale.", .0.display())]
    LockTimeout(PathBuf),

    /// Credential storage error
    #[error("Cannot access secure storage: {0}\n\n  → On macOS: Make sure Keychain Access is available.\n  → On Linux: Ensure a secret service (like gnome-keyring) is running, or set use_keyring = false.")]
    Credential(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("File operation failed: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Failed to parse data: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML serialization/deserialization error
    #[error("Configuration file is invalid: {0}")]
    Toml(String),

    /// Invalid input from user
    #[error("{0}")]
    InvalidInput(String),

    /// Operation cancelled by user
    #[error("Operation cancelled.")]
    Cancelled,
}

impl FnosError {
    /// Whether the handshake may be retried after this error
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FnosError::NetworkTimeout(_) | FnosError::ServerRejected(_)
        )
    }

    /// Process exit code for this error kind
    pub fn exit_code(&self) -> i32 {
        match self {
            FnosError::InvalidCredentials => 2,
            FnosError::TwoFactorRequired => 3,
            FnosError::NetworkTimeout(_) => 4,
            FnosError::ServerRejected(_) | FnosError::ProtocolMismatch(_) => 5,
            FnosError::GitUnavailable(_) => 6,
            FnosError::CredentialsRequired | FnosError::NotLoggedIn => 7,
            FnosError::StorageCorrupt(_) | FnosError::LockTimeout(_) | FnosError::StateChanged(_) => 8,
            _ => 1,
        }
    }
}

impl From<keyring::Error> for FnosError {
    fn from(err: keyring::Error) -> Self {
        FnosError::Credential(err.to_string())
    }
}

impl From<git2::Error> for FnosError {
    fn from(err: git2::Error) -> Self {
        FnosError::GitUnavailable(err.message().to_string())
    }
}

impl From<toml::de::Error> for FnosError {
    fn from(err: toml::de::Error) -> Self {
        FnosError::Toml(err.to_string())
    }
}

impl From<toml::ser::Error> for FnosError {
    fn from(err: toml::ser::Error) -> Self {
        FnosError::Toml(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FnosError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        FnosError::NetworkTimeout(err.to_string())
    }
}

/// Result type alias using FnosError
pub type Result<T> = std::result::Result<T, FnosError>;
