//! Password login against an fnOS server
//!
//! [`Authenticator`] is the seam between the token lifecycle and the network:
//! the real implementation runs the encrypted WebSocket handshake, tests
//! substitute a mock.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::core::config::Settings;
use crate::error::{FnosError, Result};
use crate::fnos::client::FnosClient;

/// Opaque entry-token issued by a server
#[derive(Debug, Clone)]
pub struct SessionToken {
    /// Server host the token belongs to
    pub server: String,
    /// Token value placed in the `entry-token` cookie
    pub token: SecretString,
    /// When the token was obtained
    pub issued_at: DateTime<Utc>,
    /// Expected expiry; recorded, never used to skip a refresh
    pub expires_hint: Option<DateTime<Utc>>,
}

impl SessionToken {
    /// Create a token issued now
    pub fn issued_now(server: &str, token: SecretString, lifetime: chrono::Duration) -> Self {
        let issued_at = Utc::now();
        Self {
            server: server.to_string(),
            token,
            issued_at,
            expires_hint: Some(issued_at + lifetime),
        }
    }
}

/// Turns a username/password into a [`SessionToken`]
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        server: &str,
        username: &str,
        password: &SecretString,
    ) -> Result<SessionToken>;
}

/// Authenticator speaking the fnOS WebSocket protocol
pub struct WsAuthenticator {
    settings: Settings,
}

impl WsAuthenticator {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    async fn handshake(
        &self,
        server: &str,
        username: &str,
        password: &SecretString,
    ) -> Result<SecretString> {
        let mut client = FnosClient::connect(server, &self.settings).await?;
        let result = Self::login_and_exchange(&mut client, username, password, &self.settings).await;
        client.close().await;
        result
    }

    async fn login_and_exchange(
        client: &mut FnosClient,
        username: &str,
        password: &SecretString,
        settings: &Settings,
    ) -> Result<SecretString> {
        client.get_rsa_pub().await?;
        let session = client.login(username, password, settings).await?;
        debug!(uid = ?session.uid, admin = session.admin, "logged in");

        match client.exchange_entry_token().await {
            Ok(token) => Ok(token),
            Err(e) => {
                warn!(error = %e, "entry-token exchange failed, using the session token");
                Ok(session.token)
            }
        }
    }
}

#[async_trait]
impl Authenticator for WsAuthenticator {
    async fn authenticate(
        &self,
        server: &str,
        username: &str,
        password: &SecretString,
    ) -> Result<SessionToken> {
        let limit = self.settings.timeout();
        let token = timeout(limit, self.handshake(server, username, password))
            .await
            .map_err(|_| {
                FnosError::NetworkTimeout(format!(
                    "login to {} did not finish within {}s",
                    server,
                    limit.as_secs()
                ))
            })??;

        info!(server, username, "obtained entry-token");
        let lifetime = chrono::Duration::hours(self.settings.token_max_age_hours as i64);
        Ok(SessionToken::issued_now(server, token, lifetime))
    }
}

/// How often and how patiently transient handshake failures are retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            attempts: settings.retry_attempts.max(1),
            base_delay: Duration::from_millis(settings.retry_backoff_ms),
        }
    }

    /// Single attempt, no backoff
    pub fn none() -> Self {
        Self {
            attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    fn delay_before(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)))
    }
}

/// Authenticate, retrying only transient failures with exponential backoff
pub async fn authenticate_with_retry<A: Authenticator + ?Sized>(
    authenticator: &A,
    policy: &RetryPolicy,
    server: &str,
    username: &str,
    password: &SecretString,
) -> Result<SessionToken> {
    let mut attempt = 1;
    loop {
        match authenticator.authenticate(server, username, password).await {
            Ok(token) => return Ok(token),
            Err(e) if e.is_transient() && attempt < policy.attempts => {
                let delay = policy.delay_before(attempt);
                warn!(attempt, error = %e, "login attempt failed, retrying in {:?}", delay);
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
