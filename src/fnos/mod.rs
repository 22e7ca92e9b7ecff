//! fnOS server integration
//!
//! This module contains the login handshake:
//! - Handshake cryptography (RSA, AES-CBC, HMAC signatures)
//! - WebSocket client for the main channel
//! - Reply classification into error kinds
//! - The `Authenticator` strategy and its retry wrapper

pub mod auth;
pub mod client;
pub mod crypto;
pub mod error_handler;

pub use auth::{authenticate_with_retry, Authenticator, RetryPolicy, SessionToken, WsAuthenticator};
pub use client::FnosClient;
