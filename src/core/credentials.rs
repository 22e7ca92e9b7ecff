//! Persistent credential and token store
//!
//! One JSON document (`credentials.json`) holds every server identity the
//! user has logged in with, plus which one is active. Passwords and tokens
//! are sealed by the [`Vault`] before they are written, and the document is
//! replaced atomically so a crash never leaves a half-written file.
//!
//! Mutating methods take the [`StateLock`] guard to prove the caller holds
//! the cross-process lock.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::core::config::ensure_private_dir;
use crate::core::lock::StateLock;
use crate::core::vault::Vault;
use crate::error::{FnosError, Result};
use crate::fnos::SessionToken;

const CREDENTIALS_FILE: &str = "credentials.json";
const DOCUMENT_VERSION: u32 = 1;

/// Username and optional password for one server
#[derive(Debug, Clone)]
pub struct Credentials {
    pub server: String,
    pub username: String,
    pub password: Option<SecretString>,
}

/// Everything known about one identity, secrets already opened
#[derive(Debug, Clone)]
pub struct StoredIdentity {
    pub credentials: Credentials,
    pub token: Option<SessionToken>,
    pub last_login: Option<DateTime<Utc>>,
    pub active: bool,
}

impl StoredIdentity {
    /// Whether the token is missing or older than `max_age`
    pub fn token_is_stale(&self, max_age: chrono::Duration, now: DateTime<Utc>) -> bool {
        match &self.token {
            Some(token) => now - token.issued_at >= max_age,
            None => true,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    active: Option<IdentityKey>,
    #[serde(default)]
    identities: Vec<IdentityRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct IdentityKey {
    server: String,
    username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdentityRecord {
    server: String,
    username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token_issued_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token_expires_hint: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_login: Option<DateTime<Utc>>,
}

impl IdentityKey {
    fn new(server: &str, username: &str) -> Self {
        Self {
            server: server.to_string(),
            username: username.to_string(),
        }
    }
}

impl IdentityRecord {
    fn key(&self) -> IdentityKey {
        IdentityKey {
            server: self.server.clone(),
            username: self.username.clone(),
        }
    }

    fn clear_token(&mut self) {
        self.token = None;
        self.token_issued_at = None;
        self.token_expires_hint = None;
    }
}

impl StoreDocument {
    fn find_mut(&mut self, key: &IdentityKey) -> Option<&mut IdentityRecord> {
        self.identities.iter_mut().find(|r| r.key() == *key)
    }
}

/// File-backed, encrypted-at-rest credential store
#[derive(Debug)]
pub struct CredentialStore {
    path: PathBuf,
    vault: Vault,
}

impl CredentialStore {
    /// Open the store in `dir`, using the keyring for the master key if allowed
    pub fn open(dir: &Path, use_keyring: bool) -> Result<Self> {
        let vault = Vault::open(dir, use_keyring)?;
        Ok(Self::with_vault(dir, vault))
    }

    /// Open the store in `dir` with an explicit vault
    pub fn with_vault(dir: &Path, vault: Vault) -> Self {
        Self {
            path: dir.join(CREDENTIALS_FILE),
            vault,
        }
    }

    /// Path of the store document
    pub fn path(&self) -> &Path {
        &self.path
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reading
    // ─────────────────────────────────────────────────────────────────────────

    /// Load an identity
    ///
    /// Without `server` the active identity is returned. With `server` the
    /// active identity is preferred when it matches, otherwise the most
    /// recently used identity for that server. Unreadable state is reported
    /// as absent.
    pub fn load(&self, server: Option<&str>) -> Option<StoredIdentity> {
        match self.try_load(server) {
            Ok(identity) => identity,
            Err(e) => {
                warn!(error = %e, "ignoring unreadable credential store");
                None
            }
        }
    }

    fn try_load(&self, server: Option<&str>) -> Result<Option<StoredIdentity>> {
        let doc = self.read_document()?;

        let active = doc
            .active
            .as_ref()
            .and_then(|key| doc.identities.iter().find(|r| r.key() == *key));

        let record = match server {
            None => active,
            Some(server) => active.filter(|r| r.server == server).or_else(|| {
                doc.identities
                    .iter()
                    .filter(|r| r.server == server)
                    .max_by_key(|r| r.last_login)
            }),
        };

        record
            .map(|r| self.open_record(r, doc.active.as_ref() == Some(&r.key())))
            .transpose()
    }

    fn open_record(&self, record: &IdentityRecord, active: bool) -> Result<StoredIdentity> {
        let password = record
            .password
            .as_deref()
            .map(|sealed| self.vault.unseal(sealed))
            .transpose()?;

        let token = match (&record.token, record.token_issued_at) {
            (Some(sealed), Some(issued_at)) => Some(SessionToken {
                server: record.server.clone(),
                token: self.vault.unseal(sealed)?,
                issued_at,
                expires_hint: record.token_expires_hint,
            }),
            _ => None,
        };

        Ok(StoredIdentity {
            credentials: Credentials {
                server: record.server.clone(),
                username: record.username.clone(),
                password,
            },
            token,
            last_login: record.last_login,
            active,
        })
    }

    fn read_document(&self) -> Result<StoreDocument> {
        if !self.path.exists() {
            return Ok(StoreDocument::default());
        }

        let contents = fs::read_to_string(&self.path)?;
        serde_json::from_str(&contents)
            .map_err(|e| FnosError::StorageCorrupt(format!("{}: {}", self.path.display(), e)))
    }

    /// Read the document for modification, starting over if it is corrupt
    fn read_for_update(&self) -> StoreDocument {
        self.read_document().unwrap_or_else(|e| {
            warn!(error = %e, "replacing unreadable credential store");
            StoreDocument::default()
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Writing
    // ─────────────────────────────────────────────────────────────────────────

    /// Save credentials and make them the active identity
    ///
    /// With `save_password` unset any stored password is removed. An
    /// existing token for the same identity is kept.
    pub fn save(&self, _lock: &StateLock, credentials: &Credentials, save_password: bool) -> Result<()> {
        let mut doc = self.read_for_update();
        let key = IdentityKey::new(&credentials.server, &credentials.username);

        let sealed = match (&credentials.password, save_password) {
            (Some(password), true) => Some(self.vault.seal(password.expose_secret())?),
            _ => None,
        };

        match doc.find_mut(&key) {
            Some(record) => {
                if sealed.is_some() || !save_password {
                    record.password = sealed;
                }
            }
            None => doc.identities.push(IdentityRecord {
                server: key.server.clone(),
                username: key.username.clone(),
                password: sealed,
                token: None,
                token_issued_at: None,
                token_expires_hint: None,
                last_login: None,
            }),
        }

        debug!(server = %key.server, username = %key.username, "saved credentials");
        doc.active = Some(key);
        self.write_document(&doc)
    }

    /// Record a freshly issued token for `username` on `server`
    pub fn record_token(
        &self,
        _lock: &StateLock,
        server: &str,
        username: &str,
        token: &SessionToken,
    ) -> Result<()> {
        let mut doc = self.read_for_update();
        let sealed = self.vault.seal(token.token.expose_secret())?;

        let record = doc
            .find_mut(&IdentityKey::new(server, username))
            .ok_or(FnosError::NotLoggedIn)?;
        record.token = Some(sealed);
        record.token_issued_at = Some(token.issued_at);
        record.token_expires_hint = token.expires_hint;

        self.write_document(&doc)
    }

    /// Update the last-login timestamp of `username` on `server`
    pub fn touch_login(&self, _lock: &StateLock, server: &str, username: &str) -> Result<()> {
        let mut doc = self.read_for_update();
        let record = doc
            .find_mut(&IdentityKey::new(server, username))
            .ok_or(FnosError::NotLoggedIn)?;
        record.last_login = Some(Utc::now());
        self.write_document(&doc)
    }

    /// Drop tokens for `server` (or every server)
    ///
    /// With `forget_credentials` the identities are removed as well.
    pub fn clear(&self, _lock: &StateLock, server: Option<&str>, forget_credentials: bool) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }

        let mut doc = self.read_for_update();
        let matches = |r: &IdentityRecord| server.map_or(true, |s| r.server == s);

        if forget_credentials {
            doc.identities.retain(|r| !matches(r));
            if doc
                .active
                .as_ref()
                .is_some_and(|key| server.map_or(true, |s| key.server == s))
            {
                doc.active = None;
            }
        } else {
            doc.identities
                .iter_mut()
                .filter(|r| matches(r))
                .for_each(IdentityRecord::clear_token);
        }

        self.write_document(&doc)
    }

    fn write_document(&self, doc: &StoreDocument) -> Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| FnosError::Config("credential store has no directory".into()))?;
        ensure_private_dir(dir)?;

        let doc = StoreDocument {
            version: DOCUMENT_VERSION,
            active: doc.active.clone(),
            identities: doc.identities.clone(),
        };
        let json = serde_json::to_string_pretty(&doc)?;

        // NamedTempFile is created owner-only
        let mut file = NamedTempFile::new_in(dir)?;
        file.write_all(json.as_bytes())?;
        file.as_file().sync_all()?;
        file.persist(&self.path).map_err(|e| FnosError::Io(e.error))?;
        Ok(())
    }

    /// Mask a token for display (show first 4 and last 4 chars)
    pub fn mask_token(token: &SecretString) -> String {
        let chars: Vec<char> = token.expose_secret().chars().collect();
        if chars.len() <= 8 {
            "*".repeat(chars.len())
        } else {
            let head: String = chars[..4].iter().collect();
            let tail: String = chars[chars.len() - 4..].iter().collect();
            format!("{}...{}", head, tail)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::lock::DEFAULT_WAIT;

    fn store_in(dir: &Path) -> CredentialStore {
        let vault = Vault::with_key_file(&dir.join(".key")).unwrap();
        CredentialStore::with_vault(dir, vault)
    }

    fn creds(server: &str, username: &str, password: Option<&str>) -> Credentials {
        Credentials {
            server: server.to_string(),
            username: username.to_string(),
            password: password.map(|p| SecretString::from(p.to_string())),
        }
    }

    fn token(server: &str, value: &str) -> SessionToken {
        SessionToken::issued_now(server, SecretString::from(value.to_string()), chrono::Duration::hours(8))
    }

    #[test]
    fn test_empty_store_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(store_in(dir.path()).load(None).is_none());
    }

    #[test]
    fn test_save_and_load_active_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let lock = StateLock::acquire(dir.path(), DEFAULT_WAIT).unwrap();

        store.save(&lock, &creds("demo.fnos.net", "alice", Some("pw")), true).unwrap();
        store.record_token(&lock, "demo.fnos.net", "alice", &token("demo.fnos.net", "tok-1")).unwrap();

        let identity = store.load(None).unwrap();
        assert!(identity.active);
        assert_eq!(identity.credentials.username, "alice");
        assert_eq!(identity.credentials.password.unwrap().expose_secret(), "pw");
        assert_eq!(identity.token.unwrap().token.expose_secret(), "tok-1");
    }

    #[test]
    fn test_secrets_are_not_stored_in_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let lock = StateLock::acquire(dir.path(), DEFAULT_WAIT).unwrap();

        store.save(&lock, &creds("demo.fnos.net", "alice", Some("hunter2")), true).unwrap();
        store.record_token(&lock, "demo.fnos.net", "alice", &token("demo.fnos.net", "entry-abc")).unwrap();

        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("alice"));
        assert!(!raw.contains("hunter2"));
        assert!(!raw.contains("entry-abc"));
    }

    #[test]
    fn test_no_save_drops_password() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let lock = StateLock::acquire(dir.path(), DEFAULT_WAIT).unwrap();

        store.save(&lock, &creds("demo.fnos.net", "alice", Some("pw")), true).unwrap();
        store.save(&lock, &creds("demo.fnos.net", "alice", Some("pw")), false).unwrap();

        assert!(store.load(None).unwrap().credentials.password.is_none());
    }

    #[test]
    fn test_switching_identity_keeps_prior_password() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let lock = StateLock::acquire(dir.path(), DEFAULT_WAIT).unwrap();

        store.save(&lock, &creds("demo.fnos.net", "alice", Some("pw-a")), true).unwrap();
        store.save(&lock, &creds("nas.local:5666", "bob", Some("pw-b")), true).unwrap();

        assert_eq!(store.load(None).unwrap().credentials.username, "bob");
        let alice = store.load(Some("demo.fnos.net")).unwrap();
        assert!(!alice.active);
        assert_eq!(alice.credentials.password.unwrap().expose_secret(), "pw-a");
    }

    #[test]
    fn test_record_token_requires_known_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let lock = StateLock::acquire(dir.path(), DEFAULT_WAIT).unwrap();

        let err = store
            .record_token(&lock, "demo.fnos.net", "alice", &token("demo.fnos.net", "t"))
            .unwrap_err();
        assert!(matches!(err, FnosError::NotLoggedIn));
    }

    #[test]
    fn test_record_token_files_under_named_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let lock = StateLock::acquire(dir.path(), DEFAULT_WAIT).unwrap();

        store.save(&lock, &creds("demo.fnos.net", "alice", Some("pw")), true).unwrap();
        store.save(&lock, &creds("demo.fnos.net", "bob", Some("pw")), true).unwrap();
        store.record_token(&lock, "demo.fnos.net", "alice", &token("demo.fnos.net", "alice-tok")).unwrap();

        let active = store.load(None).unwrap();
        assert_eq!(active.credentials.username, "bob");
        assert!(active.token.is_none());

        store.save(&lock, &creds("demo.fnos.net", "alice", Some("pw")), true).unwrap();
        let alice = store.load(None).unwrap();
        assert_eq!(alice.token.unwrap().token.expose_secret(), "alice-tok");
    }

    #[test]
    fn test_clear_keeps_credentials_unless_forgotten() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let lock = StateLock::acquire(dir.path(), DEFAULT_WAIT).unwrap();

        store.save(&lock, &creds("demo.fnos.net", "alice", Some("pw")), true).unwrap();
        store.record_token(&lock, "demo.fnos.net", "alice", &token("demo.fnos.net", "t")).unwrap();

        store.clear(&lock, None, false).unwrap();
        let identity = store.load(None).unwrap();
        assert!(identity.token.is_none());
        assert!(identity.credentials.password.is_some());

        store.clear(&lock, Some("demo.fnos.net"), true).unwrap();
        assert!(store.load(None).is_none());
    }

    #[test]
    fn test_corrupt_store_is_absent_and_recoverable() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        fs::write(store.path(), "{ not json").unwrap();
        assert!(store.load(None).is_none());

        let lock = StateLock::acquire(dir.path(), DEFAULT_WAIT).unwrap();
        store.save(&lock, &creds("demo.fnos.net", "alice", None), false).unwrap();
        assert_eq!(store.load(None).unwrap().credentials.username, "alice");
    }

    #[test]
    fn test_secret_from_other_key_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let lock = StateLock::acquire(dir.path(), DEFAULT_WAIT).unwrap();
        store.save(&lock, &creds("demo.fnos.net", "alice", Some("pw")), true).unwrap();

        fs::remove_file(dir.path().join(".key")).unwrap();
        assert!(store_in(dir.path()).load(None).is_none());
    }

    #[test]
    fn test_token_staleness() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let lock = StateLock::acquire(dir.path(), DEFAULT_WAIT).unwrap();
        store.save(&lock, &creds("demo.fnos.net", "alice", None), false).unwrap();
        store.record_token(&lock, "demo.fnos.net", "alice", &token("demo.fnos.net", "t")).unwrap();

        let identity = store.load(None).unwrap();
        let max_age = chrono::Duration::hours(7);
        assert!(!identity.token_is_stale(max_age, Utc::now()));
        assert!(identity.token_is_stale(max_age, Utc::now() + chrono::Duration::hours(8)));
    }

    #[test]
    fn test_mask_token() {
        let short = SecretString::from("abc".to_string());
        assert_eq!(CredentialStore::mask_token(&short), "***");

        let long = SecretString::from("abcdefghijklmnop".to_string());
        assert_eq!(CredentialStore::mask_token(&long), "abcd...mnop");

        let edited = SecretString::from("aéééééééé".to_string());
        assert_eq!(CredentialStore::mask_token(&edited), "aééé...éééé");
    }
}
