//! CLI module for fnos-git-auth
//!
//! This module contains all CLI command definitions and handlers using clap.

pub mod commands;
pub mod auth;
pub mod config;
pub mod git;
pub mod prompt;

pub use commands::{Cli, Commands};
