//! fnos-git-auth - Git authentication for fnOS servers
//!
//! This library logs in to fnOS over its encrypted WebSocket API, keeps the
//! resulting entry-token in an encrypted local store and injects it into
//! Git's per-URL `extraHeader` configuration, refreshing it from a pre-push
//! hook before it can expire.

pub mod cli;
pub mod core;
pub mod error;
pub mod fnos;

pub use error::{FnosError, Result};
