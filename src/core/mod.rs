//! Core functionality for fnos-git-auth
//!
//! This module contains shared business logic including:
//! - Application settings
//! - Cross-process state lock
//! - Encrypted credential and token storage
//! - Git global configuration (headers, credential cache, hooks path)
//! - Pre-push refresh hook
//! - Token lifecycle management

pub mod config;
pub mod credentials;
pub mod git_config;
pub mod hooks;
pub mod lock;
pub mod token_manager;
pub mod vault;

pub use config::Settings;
pub use credentials::CredentialStore;
pub use git_config::GitConfigBridge;
pub use hooks::{HookScope, RefreshHook};
pub use lock::StateLock;
pub use token_manager::TokenManager;
