//! Token lifecycle orchestration
//!
//! Handles:
//! - Resolving who to log in as (flags, saved identity, prompts)
//! - Running the handshake outside the state lock
//! - Committing token, credentials, Git header and hook as one locked update
//! - Fail-open refresh from the pre-push hook
//! - Redaction-safe status with stale-header recovery
//!
//! ## Refresh policy
//!
//! A refresh always re-authenticates with the saved password. The server's
//! expiry hint is recorded but never used to skip a refresh.

use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::config::{config_dir, ensure_private_dir, Settings};
use crate::core::credentials::{CredentialStore, Credentials, StoredIdentity};
use crate::core::git_config::{normalize_server, remote_host, server_covers, GitConfigBridge, GitHeaderEntry};
use crate::core::hooks::{HookScope, RefreshHook};
use crate::core::lock::{StateLock, DEFAULT_WAIT};
use crate::error::{FnosError, Result};
use crate::fnos::{authenticate_with_retry, Authenticator, RetryPolicy, SessionToken, WsAuthenticator};

/// Asks the user for whatever a login is missing
#[cfg_attr(test, mockall::automock)]
pub trait Prompter {
    fn server(&self) -> Result<String>;
    fn username(&self, server: &str) -> Result<String>;
    fn password(&self, server: &str, username: &str) -> Result<SecretString>;
}

/// Lifecycle state of the active identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    LoggedOut,
    Authenticating,
    Authenticated,
}

/// Arguments of a login
#[derive(Debug, Default)]
pub struct LoginRequest {
    pub server: Option<String>,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    /// Keep the password for later refreshes
    pub save: bool,
}

/// Result of a successful login
#[derive(Debug)]
pub struct LoginOutcome {
    pub server: String,
    pub username: String,
    /// False when a still-fresh token was reused
    pub reauthenticated: bool,
    pub password_saved: bool,
    pub hook_installed: bool,
}

/// Result of a logout
#[derive(Debug, Default)]
pub struct LogoutOutcome {
    pub server: Option<String>,
    pub headers_removed: usize,
    pub hook_removed: bool,
    pub credentials_forgotten: bool,
}

/// What the pre-push hook did
#[derive(Debug, PartialEq, Eq)]
pub enum HookOutcome {
    /// Nothing to do for this remote
    Skipped,
    Refreshed,
    /// Refresh failed; the push continues
    Failed(String),
}

/// Redaction-safe summary of the current state
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub state: AuthState,
    pub server: Option<String>,
    pub username: Option<String>,
    pub password_saved: bool,
    pub token_present: bool,
    pub token_stale: bool,
    pub token_issued_at: Option<DateTime<Utc>>,
    pub token_expires_hint: Option<DateTime<Utc>>,
    pub last_login: Option<DateTime<Utc>>,
    pub header_present: bool,
    pub header_healed: bool,
    pub hook_installed: bool,
    pub credential_cache_timeout: Option<u64>,
}

/// Coordinates the handshake, the store, the Git config and the hook
pub struct TokenManager<A: Authenticator> {
    authenticator: A,
    store: CredentialStore,
    git: GitConfigBridge,
    hook: RefreshHook,
    settings: Settings,
    state_dir: PathBuf,
    retry: RetryPolicy,
    lock_wait: Duration,
    state: RwLock<AuthState>,
}

impl<A: Authenticator> TokenManager<A> {
    pub fn new(
        authenticator: A,
        store: CredentialStore,
        git: GitConfigBridge,
        hook: RefreshHook,
        settings: Settings,
        state_dir: &Path,
    ) -> Self {
        let state = match store.load(None) {
            Some(identity) if identity.token.is_some() => AuthState::Authenticated,
            _ => AuthState::LoggedOut,
        };

        Self {
            authenticator,
            store,
            git,
            hook,
            retry: RetryPolicy::from_settings(&settings),
            settings,
            state_dir: state_dir.to_path_buf(),
            lock_wait: DEFAULT_WAIT,
            state: RwLock::new(state),
        }
    }

    /// Override the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Settings the manager was built with
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Current lifecycle state
    pub fn state(&self) -> AuthState {
        self.state.read().map(|s| *s).unwrap_or(AuthState::LoggedOut)
    }

    fn set_state(&self, state: AuthState) {
        if let Ok(mut current) = self.state.write() {
            *current = state;
        }
    }

    fn lock(&self) -> Result<StateLock> {
        StateLock::acquire(&self.state_dir, self.lock_wait)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Login / logout
    // ─────────────────────────────────────────────────────────────────────────

    /// Log in, prompting only for what the request and the store lack
    pub async fn login(&self, request: LoginRequest, prompter: &dyn Prompter) -> Result<LoginOutcome> {
        let remembered = self.store.load(None);
        let explicit_server = request.server.as_deref().map(normalize_server).transpose()?;

        let (server, username, password) = match (explicit_server, request.username) {
            (Some(server), username) => {
                let username = match username {
                    Some(username) => username,
                    None => prompter.username(&server)?,
                };
                let password = match request.password {
                    Some(password) => password,
                    None => prompter.password(&server, &username)?,
                };
                (server, username, password)
            }
            (None, Some(username)) => {
                let server = match &remembered {
                    Some(identity) => identity.credentials.server.clone(),
                    None => normalize_server(&prompter.server()?)?,
                };
                let password = match request.password {
                    Some(password) => password,
                    None => prompter.password(&server, &username)?,
                };
                (server, username, password)
            }
            (None, None) => match remembered {
                Some(identity) => {
                    let fresh = !identity.token_is_stale(self.settings.stale_after(), Utc::now());
                    if fresh && request.password.is_none() {
                        return self.reuse(identity, request.save);
                    }

                    let Credentials { server, username, password } = identity.credentials;
                    let password = match request.password.or(password) {
                        Some(password) => password,
                        None => prompter.password(&server, &username)?,
                    };
                    (server, username, password)
                }
                None => {
                    let server = normalize_server(&prompter.server()?)?;
                    let username = prompter.username(&server)?;
                    let password = match request.password {
                        Some(password) => password,
                        None => prompter.password(&server, &username)?,
                    };
                    (server, username, password)
                }
            },
        };

        if username.trim().is_empty() {
            return Err(FnosError::InvalidInput("Username cannot be empty".into()));
        }

        let previous = self.state();
        self.set_state(AuthState::Authenticating);
        let token = match authenticate_with_retry(&self.authenticator, &self.retry, &server, &username, &password).await {
            Ok(token) => token,
            Err(e) => {
                self.set_state(previous);
                return Err(e);
            }
        };

        let credentials = Credentials {
            server: server.clone(),
            username: username.clone(),
            password: Some(password),
        };

        let lock = self.lock()?;
        // The active identity may have moved while the handshake ran
        if let Some(old) = self.store.load(None).filter(|old| old.credentials.server != server) {
            self.git.remove_header(&lock, &old.credentials.server)?;
            self.store.clear(&lock, Some(&old.credentials.server), false)?;
        }
        self.commit(&lock, &credentials, request.save, &token)?;
        let hook_installed = self.install_hook(&lock);
        drop(lock);

        self.set_state(AuthState::Authenticated);
        info!(server = %server, username = %username, "logged in");

        Ok(LoginOutcome {
            server,
            username,
            reauthenticated: true,
            password_saved: request.save,
            hook_installed,
        })
    }

    /// Keep a fresh token, refreshing only the bookkeeping around it
    fn reuse(&self, remembered: StoredIdentity, save: bool) -> Result<LoginOutcome> {
        let lock = self.lock()?;
        let identity = self
            .store
            .load(None)
            .filter(|current| same_identity(current, &remembered))
            .ok_or_else(|| state_changed(&remembered))?;

        let Credentials { server, username, .. } = identity.credentials.clone();
        debug!(server = %server, "reusing fresh token");

        if !save && identity.credentials.password.is_some() {
            self.store.save(&lock, &identity.credentials, false)?;
        }
        self.store.touch_login(&lock, &server, &username)?;
        if let Some(token) = &identity.token {
            self.git.set_header(&lock, &server, &token.token)?;
        }
        let hook_installed = self.install_hook(&lock);
        drop(lock);

        self.set_state(AuthState::Authenticated);
        Ok(LoginOutcome {
            password_saved: save && identity.credentials.password.is_some(),
            server,
            username,
            reauthenticated: false,
            hook_installed,
        })
    }

    fn install_hook(&self, lock: &StateLock) -> bool {
        match self.hook.install(lock, &HookScope::Global) {
            Ok(path) => {
                debug!(hook = %path.display(), "refresh hook in place");
                true
            }
            Err(e) => {
                warn!(error = %e, "could not install the refresh hook");
                false
            }
        }
    }

    /// Record a new token and point the Git header at it
    fn commit(&self, lock: &StateLock, credentials: &Credentials, save: bool, token: &SessionToken) -> Result<()> {
        self.store.save(lock, credentials, save)?;
        self.store.record_token(lock, &credentials.server, &credentials.username, token)?;
        self.store.touch_login(lock, &credentials.server, &credentials.username)?;
        self.git.set_header(lock, &credentials.server, &token.token)
    }

    /// Remove header and hook and drop the token; with `all` forget credentials too
    pub fn logout(&self, all: bool) -> Result<LogoutOutcome> {
        let identity = self.store.load(None);
        let lock = self.lock()?;

        let mut outcome = LogoutOutcome {
            server: identity.as_ref().map(|i| i.credentials.server.clone()),
            credentials_forgotten: all,
            ..LogoutOutcome::default()
        };

        if let Some(server) = &outcome.server {
            outcome.headers_removed = self.git.remove_header(&lock, server)?;
        }
        outcome.hook_removed = self.hook.uninstall(&lock, &HookScope::Global)?;
        self.store.clear(&lock, None, all)?;
        drop(lock);

        self.set_state(AuthState::LoggedOut);
        info!(all, "logged out");
        Ok(outcome)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Refresh
    // ─────────────────────────────────────────────────────────────────────────

    /// Re-authenticate with the saved password and rewrite the header
    pub async fn refresh(&self, server: Option<&str>) -> Result<SessionToken> {
        let server = server.map(normalize_server).transpose()?;
        let identity = self.store.load(server.as_deref()).ok_or(FnosError::NotLoggedIn)?;
        let credentials = identity.credentials.clone();
        let password = credentials
            .password
            .clone()
            .ok_or(FnosError::CredentialsRequired)?;

        let token = authenticate_with_retry(
            &self.authenticator,
            &self.retry,
            &credentials.server,
            &credentials.username,
            &password,
        )
        .await?;

        let lock = self.lock()?;
        let unchanged = self
            .store
            .load(Some(&credentials.server))
            .is_some_and(|current| same_identity(&current, &identity) && current.active == identity.active);
        if !unchanged {
            warn!(server = %credentials.server, "identity changed during refresh, discarding token");
            return Err(state_changed(&identity));
        }

        if identity.active {
            self.store
                .record_token(&lock, &credentials.server, &credentials.username, &token)?;
            self.git.set_header(&lock, &credentials.server, &token.token)?;
        } else {
            self.commit(&lock, &credentials, true, &token)?;
        }
        drop(lock);

        self.set_state(AuthState::Authenticated);
        info!(server = %credentials.server, "token refreshed");
        Ok(token)
    }

    /// Refresh for the pre-push hook; never fails
    pub async fn hook_refresh(&self, remote_url: Option<&str>) -> HookOutcome {
        let Some(identity) = self.store.load(None) else {
            debug!("no active identity, nothing to refresh");
            return HookOutcome::Skipped;
        };

        if let Some(url) = remote_url.filter(|url| !url.is_empty()) {
            let covered = remote_host(url).is_some_and(|host| server_covers(&identity.credentials.server, &host));
            if !covered {
                debug!(remote = url, "remote is not an fnOS server we manage");
                return HookOutcome::Skipped;
            }
        }

        match self.refresh(None).await {
            Ok(_) => HookOutcome::Refreshed,
            Err(e) => {
                warn!(error = %e, "hook refresh failed");
                HookOutcome::Failed(e.to_string())
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Status
    // ─────────────────────────────────────────────────────────────────────────

    /// Summarize the state without touching the network
    ///
    /// A header that does not carry the stored token is rewritten from the
    /// store.
    pub fn status(&self) -> Result<StatusReport> {
        let identity = self.store.load(None);
        let credential_cache_timeout = self.git.credential_cache_timeout().unwrap_or_else(|e| {
            warn!(error = %e, "cannot read credential.helper");
            None
        });
        let hook_installed = self.hook.is_installed(&HookScope::Global);

        let Some(identity) = identity else {
            return Ok(StatusReport {
                state: AuthState::LoggedOut,
                server: None,
                username: None,
                password_saved: false,
                token_present: false,
                token_stale: true,
                token_issued_at: None,
                token_expires_hint: None,
                last_login: None,
                header_present: false,
                header_healed: false,
                hook_installed,
                credential_cache_timeout,
            });
        };

        let server = identity.credentials.server.clone();
        let mut header_healed = false;
        let mut header_present = self.git.has_header(&server);

        if let Some(token) = &identity.token {
            if !self.headers_carry(&server, &token.token) {
                let lock = self.lock()?;
                // Heal from the token stored now, which a refresh may have replaced
                let current = self
                    .store
                    .load(None)
                    .filter(|current| same_identity(current, &identity))
                    .and_then(|current| current.token);
                if let Some(current) = current.filter(|c| !self.headers_carry(&server, &c.token)) {
                    self.git.set_header(&lock, &server, &current.token)?;
                    warn!(server = %server, "git header did not match the stored token, rewritten");
                    header_healed = true;
                    header_present = true;
                }
            }
        }

        let state = if identity.token.is_some() && header_present {
            AuthState::Authenticated
        } else {
            AuthState::LoggedOut
        };

        Ok(StatusReport {
            state,
            token_stale: identity.token_is_stale(self.settings.stale_after(), Utc::now()),
            server: Some(server),
            username: Some(identity.credentials.username.clone()),
            password_saved: identity.credentials.password.is_some(),
            token_present: identity.token.is_some(),
            token_issued_at: identity.token.as_ref().map(|t| t.issued_at),
            token_expires_hint: identity.token.as_ref().and_then(|t| t.expires_hint),
            last_login: identity.last_login,
            header_present,
            header_healed,
            hook_installed,
            credential_cache_timeout,
        })
    }

    fn headers_carry(&self, server: &str, token: &SecretString) -> bool {
        self.git.headers_carry(server, token).unwrap_or_else(|e| {
            warn!(error = %e, "cannot read entry-token headers");
            false
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Git configuration
    // ─────────────────────────────────────────────────────────────────────────

    /// Entry-token headers currently configured
    pub fn git_headers(&self) -> Result<Vec<GitHeaderEntry>> {
        self.git.show_headers()
    }

    /// Remove the headers of `server`
    pub fn remove_git_header(&self, server: &str) -> Result<usize> {
        let server = normalize_server(server)?;
        let lock = self.lock()?;
        self.git.remove_header(&lock, &server)
    }

    /// Remove every entry-token header
    pub fn clear_git_headers(&self) -> Result<usize> {
        let lock = self.lock()?;
        self.git.clear_all_headers(&lock)
    }

    /// Configure Git's credential cache; `0` disables it
    pub fn set_credential_cache(&self, seconds: u64) -> Result<()> {
        let lock = self.lock()?;
        self.git.set_credential_cache_timeout(&lock, seconds)
    }
}

fn same_identity(a: &StoredIdentity, b: &StoredIdentity) -> bool {
    a.credentials.server == b.credentials.server && a.credentials.username == b.credentials.username
}

fn state_changed(identity: &StoredIdentity) -> FnosError {
    FnosError::StateChanged(format!(
        "expected {}@{}",
        identity.credentials.username, identity.credentials.server
    ))
}

impl TokenManager<WsAuthenticator> {
    /// Manager wired to the user's configuration directory and global Git config
    pub fn open_default() -> Result<Self> {
        let dir = config_dir()?;
        ensure_private_dir(&dir)?;

        let settings = Settings::load_from(&dir)?;
        let store = CredentialStore::open(&dir, settings.use_keyring)?;
        let git = GitConfigBridge::global(settings.http_scheme())?;
        let hook = RefreshHook::new(git.clone(), &dir);
        let authenticator = WsAuthenticator::new(settings.clone());

        Ok(Self::new(authenticator, store, git, hook, settings, &dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::core::vault::Vault;
    use crate::fnos::auth::MockAuthenticator;

    const SERVER: &str = "demo.fnos.net";

    struct Fixture {
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn git(&self) -> GitConfigBridge {
            GitConfigBridge::at(self.dir.path().join("gitconfig"), "https")
        }

        fn state(&self) -> PathBuf {
            self.dir.path().join("state")
        }

        /// A second handle on the same state, as another process would have
        fn store(state: &Path) -> CredentialStore {
            let vault = Vault::with_key_file(&state.join(".key")).unwrap();
            CredentialStore::with_vault(state, vault)
        }

        fn manager(&self, auth: MockAuthenticator) -> TokenManager<MockAuthenticator> {
            self.manager_with(auth, Settings::default())
        }

        fn manager_with(&self, auth: MockAuthenticator, settings: Settings) -> TokenManager<MockAuthenticator> {
            let state = self.state();
            let store = Self::store(&state);
            let hook = RefreshHook::new(self.git(), &state).with_binary("fnos-git-auth");
            TokenManager::new(auth, store, self.git(), hook, settings, &state).with_retry(
                RetryPolicy {
                    attempts: 3,
                    base_delay: Duration::from_millis(1),
                },
            )
        }

        fn header(&self, server: &str) -> Option<String> {
            self.git()
                .header_token(server)
                .unwrap()
                .map(|t| t.expose_secret().to_string())
        }
    }

    /// Authenticator that accepts `pw` and hands out tok-1, tok-2, ...
    fn counting_auth(calls: Arc<AtomicUsize>) -> MockAuthenticator {
        let mut auth = MockAuthenticator::new();
        auth.expect_authenticate().returning(move |server, _, password| {
            if password.expose_secret() != "pw" {
                return Err(FnosError::InvalidCredentials);
            }
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(SessionToken::issued_now(
                server,
                SecretString::from(format!("tok-{}", n)),
                chrono::Duration::hours(8),
            ))
        });
        auth
    }

    fn no_prompts() -> MockPrompter {
        MockPrompter::new()
    }

    fn pw() -> Option<SecretString> {
        Some(SecretString::from("pw".to_string()))
    }

    fn explicit(server: &str, username: &str) -> LoginRequest {
        LoginRequest {
            server: Some(server.to_string()),
            username: Some(username.to_string()),
            password: pw(),
            save: true,
        }
    }

    fn bare() -> LoginRequest {
        LoginRequest {
            save: true,
            ..LoginRequest::default()
        }
    }

    #[tokio::test]
    async fn test_fresh_login_writes_token_header_and_hook() {
        let f = Fixture::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let manager = f.manager(counting_auth(calls.clone()));

        let outcome = manager.login(explicit(SERVER, "alice"), &no_prompts()).await.unwrap();
        assert!(outcome.reauthenticated);
        assert!(outcome.hook_installed);
        assert_eq!(manager.state(), AuthState::Authenticated);

        let patterns: Vec<_> = f.git().show_headers().unwrap().into_iter().map(|h| h.pattern).collect();
        assert!(patterns.contains(&"https://demo.fnos.net".to_string()));
        assert!(patterns.contains(&"https://*.fnos.net".to_string()));

        let status = manager.status().unwrap();
        assert_eq!(status.state, AuthState::Authenticated);
        assert!(status.token_present && status.header_present && status.hook_installed);
        assert!(status.password_saved);
        assert!(!status.header_healed);
    }

    #[tokio::test]
    async fn test_bare_login_reuses_fresh_token_without_prompts() {
        let f = Fixture::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let manager = f.manager(counting_auth(calls.clone()));

        manager.login(explicit(SERVER, "alice"), &no_prompts()).await.unwrap();
        let first_login = manager.status().unwrap().last_login.unwrap();

        let outcome = manager.login(bare(), &no_prompts()).await.unwrap();
        assert!(!outcome.reauthenticated);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.header(SERVER).as_deref(), Some("tok-1"));
        assert!(manager.status().unwrap().last_login.unwrap() >= first_login);
    }

    #[tokio::test]
    async fn test_login_logout_login_reuses_identity() {
        let f = Fixture::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let manager = f.manager(counting_auth(calls.clone()));

        manager.login(explicit(SERVER, "alice"), &no_prompts()).await.unwrap();
        manager.logout(false).unwrap();

        let outcome = manager.login(bare(), &no_prompts()).await.unwrap();
        assert_eq!(outcome.server, SERVER);
        assert_eq!(outcome.username, "alice");
        assert!(outcome.reauthenticated);
        assert_eq!(f.header(SERVER).as_deref(), Some("tok-2"));
    }

    #[tokio::test]
    async fn test_username_override_prompts_for_password() {
        let f = Fixture::new();
        let manager = f.manager(counting_auth(Arc::new(AtomicUsize::new(0))));
        manager.login(explicit(SERVER, "alice"), &no_prompts()).await.unwrap();

        let mut prompter = MockPrompter::new();
        prompter
            .expect_password()
            .times(1)
            .returning(|server, username| {
                assert_eq!(server, SERVER);
                assert_eq!(username, "bob");
                Ok(SecretString::from("pw".to_string()))
            });

        let request = LoginRequest {
            username: Some("bob".into()),
            save: true,
            ..LoginRequest::default()
        };
        let outcome = manager.login(request, &prompter).await.unwrap();
        assert_eq!(outcome.username, "bob");
        assert_eq!(outcome.server, SERVER);
    }

    #[tokio::test]
    async fn test_server_override_prompts_for_username_and_password() {
        let f = Fixture::new();
        let manager = f.manager(counting_auth(Arc::new(AtomicUsize::new(0))));
        manager.login(explicit(SERVER, "alice"), &no_prompts()).await.unwrap();

        let mut prompter = MockPrompter::new();
        prompter
            .expect_username()
            .times(1)
            .returning(|_| Ok("carol".to_string()));
        prompter
            .expect_password()
            .times(1)
            .returning(|_, _| Ok(SecretString::from("pw".to_string())));

        let request = LoginRequest {
            server: Some("https://nas.example.org/".into()),
            save: true,
            ..LoginRequest::default()
        };
        let outcome = manager.login(request, &prompter).await.unwrap();
        assert_eq!(outcome.server, "nas.example.org");

        // Switching servers retires the old header
        assert!(f.header(SERVER).is_none());
        assert!(f.header("nas.example.org").is_some());
    }

    #[tokio::test]
    async fn test_nothing_remembered_prompts_for_everything() {
        let f = Fixture::new();
        let manager = f.manager(counting_auth(Arc::new(AtomicUsize::new(0))));

        let mut prompter = MockPrompter::new();
        prompter.expect_server().times(1).returning(|| Ok(SERVER.to_string()));
        prompter.expect_username().times(1).returning(|_| Ok("alice".to_string()));
        prompter
            .expect_password()
            .times(1)
            .returning(|_, _| Ok(SecretString::from("pw".to_string())));

        let outcome = manager.login(bare(), &prompter).await.unwrap();
        assert_eq!(outcome.username, "alice");
    }

    #[tokio::test]
    async fn test_header_tracks_latest_token() {
        let f = Fixture::new();
        let manager = f.manager(counting_auth(Arc::new(AtomicUsize::new(0))));

        manager.login(explicit(SERVER, "alice"), &no_prompts()).await.unwrap();
        assert_eq!(f.header(SERVER).as_deref(), Some("tok-1"));

        let token = manager.refresh(None).await.unwrap();
        assert_eq!(token.token.expose_secret(), "tok-2");
        assert_eq!(f.header(SERVER).as_deref(), Some("tok-2"));

        let headers = f.git().show_headers().unwrap();
        assert!(headers.iter().all(|h| h.token.expose_secret() == "tok-2"));
    }

    #[tokio::test]
    async fn test_refresh_without_saved_password_writes_nothing() {
        let f = Fixture::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let manager = f.manager(counting_auth(calls.clone()));

        let request = LoginRequest {
            save: false,
            ..explicit(SERVER, "alice")
        };
        manager.login(request, &no_prompts()).await.unwrap();

        let err = manager.refresh(None).await.unwrap_err();
        assert!(matches!(err, FnosError::CredentialsRequired));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.header(SERVER).as_deref(), Some("tok-1"));
    }

    #[tokio::test]
    async fn test_two_factor_is_surfaced_after_one_attempt() {
        let f = Fixture::new();
        let mut auth = MockAuthenticator::new();
        auth.expect_authenticate()
            .times(1)
            .returning(|_, _, _| Err(FnosError::TwoFactorRequired));
        let manager = f.manager(auth);

        let err = manager.login(explicit(SERVER, "alice"), &no_prompts()).await.unwrap_err();
        assert!(matches!(err, FnosError::TwoFactorRequired));
    }

    #[tokio::test]
    async fn test_wrong_password_writes_nothing() {
        let f = Fixture::new();
        let manager = f.manager(counting_auth(Arc::new(AtomicUsize::new(0))));

        let request = LoginRequest {
            password: Some(SecretString::from("wrong".to_string())),
            ..explicit(SERVER, "alice")
        };
        let err = manager.login(request, &no_prompts()).await.unwrap_err();

        assert!(matches!(err, FnosError::InvalidCredentials));
        assert_eq!(manager.state(), AuthState::LoggedOut);
        assert!(f.header(SERVER).is_none());
        let status = manager.status().unwrap();
        assert!(!status.hook_installed);
        assert!(status.username.is_none());
    }

    #[tokio::test]
    async fn test_logout_then_status_keeps_identity() {
        let f = Fixture::new();
        let manager = f.manager(counting_auth(Arc::new(AtomicUsize::new(0))));
        manager.login(explicit(SERVER, "alice"), &no_prompts()).await.unwrap();

        let outcome = manager.logout(false).unwrap();
        assert_eq!(outcome.headers_removed, 2);
        assert!(outcome.hook_removed);

        let status = manager.status().unwrap();
        assert_eq!(status.state, AuthState::LoggedOut);
        assert!(!status.token_present && !status.header_present && !status.hook_installed);
        assert_eq!(status.server.as_deref(), Some(SERVER));
        assert_eq!(status.username.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_logout_all_forgets_credentials() {
        let f = Fixture::new();
        let manager = f.manager(counting_auth(Arc::new(AtomicUsize::new(0))));
        manager.login(explicit(SERVER, "alice"), &no_prompts()).await.unwrap();

        manager.logout(true).unwrap();
        let status = manager.status().unwrap();
        assert!(status.server.is_none());
    }

    #[tokio::test]
    async fn test_status_heals_stale_header() {
        let f = Fixture::new();
        let manager = f.manager(counting_auth(Arc::new(AtomicUsize::new(0))));
        manager.login(explicit(SERVER, "alice"), &no_prompts()).await.unwrap();

        let lock = StateLock::acquire(f.dir.path(), DEFAULT_WAIT).unwrap();
        f.git().set_header(&lock, SERVER, &SecretString::from("old".to_string())).unwrap();
        drop(lock);

        let status = manager.status().unwrap();
        assert!(status.header_healed);
        assert_eq!(f.header(SERVER).as_deref(), Some("tok-1"));
    }

    #[tokio::test]
    async fn test_status_report_is_redaction_safe() {
        let f = Fixture::new();
        let manager = f.manager(counting_auth(Arc::new(AtomicUsize::new(0))));
        manager.login(explicit(SERVER, "alice"), &no_prompts()).await.unwrap();

        let json = serde_json::to_string(&manager.status().unwrap()).unwrap();
        assert!(json.contains("\"authenticated\""));
        assert!(!json.contains("tok-1"));
        assert!(!json.contains("\"pw\""));
    }

    #[tokio::test]
    async fn test_hook_refresh_is_fail_open_and_scoped() {
        let f = Fixture::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let manager = f.manager(counting_auth(calls.clone()));

        assert_eq!(manager.hook_refresh(None).await, HookOutcome::Skipped);

        let request = LoginRequest {
            save: false,
            ..explicit(SERVER, "alice")
        };
        manager.login(request, &no_prompts()).await.unwrap();

        let other = manager.hook_refresh(Some("https://github.com/a/b.git")).await;
        assert_eq!(other, HookOutcome::Skipped);

        let ours = manager.hook_refresh(Some("https://git.fnos.net/a/b.git")).await;
        assert!(matches!(ours, HookOutcome::Failed(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hook_refresh_renews_token() {
        let f = Fixture::new();
        let manager = f.manager(counting_auth(Arc::new(AtomicUsize::new(0))));
        manager.login(explicit(SERVER, "alice"), &no_prompts()).await.unwrap();

        let outcome = manager.hook_refresh(Some("https://demo.fnos.net/repo.git")).await;
        assert_eq!(outcome, HookOutcome::Refreshed);
        assert_eq!(f.header(SERVER).as_deref(), Some("tok-2"));
    }

    #[tokio::test]
    async fn test_bare_login_with_stale_token_uses_saved_password() {
        let f = Fixture::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let settings = Settings {
            token_max_age_hours: 0,
            ..Settings::default()
        };
        let manager = f.manager_with(counting_auth(calls.clone()), settings);

        manager.login(explicit(SERVER, "alice"), &no_prompts()).await.unwrap();
        let outcome = manager.login(bare(), &no_prompts()).await.unwrap();

        assert!(outcome.reauthenticated);
        assert_eq!(outcome.username, "alice");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(f.header(SERVER).as_deref(), Some("tok-2"));
    }

    #[tokio::test]
    async fn test_status_heals_stale_wildcard_header() {
        let f = Fixture::new();
        let manager = f.manager(counting_auth(Arc::new(AtomicUsize::new(0))));
        manager.login(explicit(SERVER, "alice"), &no_prompts()).await.unwrap();

        let mut config = git2::Config::open(&f.dir.path().join("gitconfig")).unwrap();
        config
            .set_multivar(
                "http.https://*.fnos.net.extraHeader",
                "^Cookie: entry-token=",
                "Cookie: entry-token=old",
            )
            .unwrap();
        drop(config);

        let status = manager.status().unwrap();
        assert!(status.header_healed);
        let headers = f.git().show_headers().unwrap();
        assert_eq!(headers.len(), 2);
        assert!(headers.iter().all(|h| h.token.expose_secret() == "tok-1"));
    }

    #[tokio::test]
    async fn test_refresh_discards_token_when_identity_switches_mid_handshake() {
        let f = Fixture::new();
        let state = f.state();
        let git = f.git();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut auth = MockAuthenticator::new();
        let seen = calls.clone();
        auth.expect_authenticate().returning(move |server, _, _| {
            let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 2 {
                // Another process logs in as bob while alice's handshake runs
                let lock = StateLock::acquire(&state, DEFAULT_WAIT).unwrap();
                let store = Fixture::store(&state);
                let bob = Credentials {
                    server: SERVER.to_string(),
                    username: "bob".to_string(),
                    password: pw(),
                };
                let token = SessionToken::issued_now(
                    SERVER,
                    SecretString::from("bob-tok".to_string()),
                    chrono::Duration::hours(8),
                );
                store.save(&lock, &bob, true).unwrap();
                store.record_token(&lock, SERVER, "bob", &token).unwrap();
                git.set_header(&lock, SERVER, &token.token).unwrap();
            }
            Ok(SessionToken::issued_now(
                server,
                SecretString::from(format!("tok-{}", n)),
                chrono::Duration::hours(8),
            ))
        });
        let manager = f.manager(auth);

        manager.login(explicit(SERVER, "alice"), &no_prompts()).await.unwrap();
        let err = manager.refresh(None).await.unwrap_err();
        assert!(matches!(err, FnosError::StateChanged(_)));

        let active = Fixture::store(&f.state()).load(None).unwrap();
        assert_eq!(active.credentials.username, "bob");
        assert_eq!(active.token.unwrap().token.expose_secret(), "bob-tok");
        assert_eq!(f.header(SERVER).as_deref(), Some("bob-tok"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_login_retires_server_that_became_active_during_handshake() {
        let f = Fixture::new();
        let state = f.state();
        let git = f.git();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut auth = MockAuthenticator::new();
        let seen = calls.clone();
        auth.expect_authenticate().returning(move |server, _, _| {
            let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 2 {
                // Another process switches to carol on a third server
                let lock = StateLock::acquire(&state, DEFAULT_WAIT).unwrap();
                let store = Fixture::store(&state);
                let carol = Credentials {
                    server: "carol.fnos.org".to_string(),
                    username: "carol".to_string(),
                    password: pw(),
                };
                let token = SessionToken::issued_now(
                    "carol.fnos.org",
                    SecretString::from("carol-tok".to_string()),
                    chrono::Duration::hours(8),
                );
                store.save(&lock, &carol, true).unwrap();
                store.record_token(&lock, "carol.fnos.org", "carol", &token).unwrap();
                git.set_header(&lock, "carol.fnos.org", &token.token).unwrap();
            }
            Ok(SessionToken::issued_now(
                server,
                SecretString::from(format!("tok-{}", n)),
                chrono::Duration::hours(8),
            ))
        });
        let manager = f.manager(auth);

        manager.login(explicit(SERVER, "alice"), &no_prompts()).await.unwrap();
        manager.login(explicit("nas.example.org", "dave"), &no_prompts()).await.unwrap();

        assert!(f.header("carol.fnos.org").is_none());
        assert_eq!(f.header("nas.example.org").as_deref(), Some("tok-2"));
        let active = Fixture::store(&f.state()).load(None).unwrap();
        assert_eq!(active.credentials.username, "dave");
    }
}
