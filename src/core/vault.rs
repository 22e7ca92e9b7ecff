//! At-rest protection for stored secrets
//!
//! Passwords and tokens are sealed with AES-256-CBC and authenticated with
//! HMAC-SHA256 (encrypt-then-MAC) before they touch the disk. The 32-byte
//! master key lives in the system keyring; when the keyring is disabled or
//! unreachable (headless Linux, hooks run over SSH) a `0600` key file in the
//! configuration directory is used instead.
//!
//! Sealed format: `2.<iv b64>|<ciphertext b64>|<mac b64>`

use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use keyring::Entry;
use rand::RngCore;
use secrecy::SecretString;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::error::{FnosError, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

const SERVICE_NAME: &str = "fnos-git-auth";
const MASTER_KEY_NAME: &str = "store-key";
const KEY_FILE: &str = ".key";
const SEALED_PREFIX: &str = "2.";
const KEY_LEN: usize = 32;
const KEY_FILE_ATTEMPTS: u32 = 20;
const KEY_FILE_POLL: Duration = Duration::from_millis(25);

/// Where the master key is kept
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// System keyring entry
    Keyring,
    /// Owner-only key file
    File(PathBuf),
}

/// Seals and opens secrets with a per-user master key
pub struct Vault {
    enc_key: [u8; 32],
    mac_key: [u8; 32],
    source: KeySource,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl Vault {
    /// Open the vault for the configuration directory `dir`
    ///
    /// Tries the keyring first when `use_keyring` is set and falls back to
    /// the key file on any keyring error.
    pub fn open(dir: &Path, use_keyring: bool) -> Result<Self> {
        if use_keyring {
            match Self::keyring_master_key() {
                Ok(key) => return Self::from_master_key(&key, KeySource::Keyring),
                Err(e) => warn!(error = %e, "keyring unavailable, using key file"),
            }
        }
        Self::with_key_file(&dir.join(KEY_FILE))
    }

    /// Open the vault using only the key file at `path`
    pub fn with_key_file(path: &Path) -> Result<Self> {
        let key = Self::file_master_key(path)?;
        Self::from_master_key(&key, KeySource::File(path.to_path_buf()))
    }

    /// Where the master key came from
    pub fn source(&self) -> &KeySource {
        &self.source
    }

    fn from_master_key(master: &[u8], source: KeySource) -> Result<Self> {
        Ok(Self {
            enc_key: derive(master, b"enc")?,
            mac_key: derive(master, b"mac")?,
            source,
        })
    }

    fn keyring_master_key() -> Result<Vec<u8>> {
        let entry = Entry::new(SERVICE_NAME, MASTER_KEY_NAME)?;
        match entry.get_password() {
            Ok(encoded) => {
                let key = STANDARD
                    .decode(encoded.trim())
                    .map_err(|e| FnosError::Credential(format!("Invalid master key: {}", e)))?;
                if key.len() != KEY_LEN {
                    return Err(FnosError::Credential("Master key has wrong length".into()));
                }
                Ok(key)
            }
            Err(keyring::Error::NoEntry) => {
                let key = random_key();
                entry.set_password(&STANDARD.encode(key))?;
                debug!("generated new master key in keyring");
                Ok(key.to_vec())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn file_master_key(path: &Path) -> Result<Vec<u8>> {
        if let Some(parent) = path.parent() {
            crate::core::config::ensure_private_dir(parent)?;
        }

        for _ in 0..KEY_FILE_ATTEMPTS {
            match create_key_file(path) {
                Ok(key) => {
                    debug!(path = %path.display(), "generated new key file");
                    return Ok(key.to_vec());
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            let key = fs::read(path)?;
            if key.len() == KEY_LEN {
                return Ok(key);
            }
            // Another process may still be writing it
            thread::sleep(KEY_FILE_POLL);
        }

        warn!(path = %path.display(), "key file is damaged, generating a new one");
        fs::remove_file(path)?;
        Ok(create_key_file(path)?.to_vec())
    }

    /// Encrypt and authenticate `plaintext`
    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let mut iv = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut iv);

        let ciphertext = Aes256CbcEnc::new_from_slices(&self.enc_key, &iv)
            .map_err(|e| FnosError::StorageCorrupt(e.to_string()))?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
        let tag = self.mac(&iv, &ciphertext)?;

        Ok(format!(
            "{}{}|{}|{}",
            SEALED_PREFIX,
            STANDARD.encode(iv),
            STANDARD.encode(&ciphertext),
            STANDARD.encode(tag)
        ))
    }

    /// Verify and decrypt a value produced by [`Vault::seal`]
    pub fn unseal(&self, sealed: &str) -> Result<SecretString> {
        let body = sealed
            .strip_prefix(SEALED_PREFIX)
            .ok_or_else(|| corrupt("unknown secret format"))?;

        let mut parts = body.split('|');
        let (Some(iv), Some(ciphertext), Some(tag), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(corrupt("malformed secret"));
        };

        let iv = STANDARD.decode(iv).map_err(|_| corrupt("bad iv"))?;
        let ciphertext = STANDARD
            .decode(ciphertext)
            .map_err(|_| corrupt("bad ciphertext"))?;
        let tag = STANDARD.decode(tag).map_err(|_| corrupt("bad mac"))?;

        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.mac_key)
            .map_err(|e| FnosError::StorageCorrupt(e.to_string()))?;
        mac.update(&iv);
        mac.update(&ciphertext);
        mac.verify_slice(&tag)
            .map_err(|_| corrupt("secret was sealed with a different key or was modified"))?;

        let plaintext = Aes256CbcDec::new_from_slices(&self.enc_key, &iv)
            .map_err(|_| corrupt("bad iv length"))?
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| corrupt("bad padding"))?;

        String::from_utf8(plaintext)
            .map(SecretString::from)
            .map_err(|_| corrupt("secret is not valid UTF-8"))
    }

    fn mac(&self, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.mac_key)
            .map_err(|e| FnosError::StorageCorrupt(e.to_string()))?;
        mac.update(iv);
        mac.update(ciphertext);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

fn derive(master: &[u8], label: &[u8]) -> Result<[u8; 32]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(master)
        .map_err(|e| FnosError::StorageCorrupt(e.to_string()))?;
    mac.update(label);

    let mut key = [0u8; 32];
    key.copy_from_slice(&mac.finalize().into_bytes());
    Ok(key)
}

/// Write a fresh key to `path`, failing if the file already exists
fn create_key_file(path: &Path) -> io::Result<[u8; KEY_LEN]> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    let key = random_key();
    if let Err(e) = file.write_all(&key).and_then(|_| file.sync_all()) {
        let _ = fs::remove_file(path);
        return Err(e);
    }
    Ok(key)
}

fn random_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

fn corrupt(reason: &str) -> FnosError {
    FnosError::StorageCorrupt(reason.to_string())
}
