//! Cryptographic primitives of the fnOS login handshake
//!
//! - RSA (PKCS#1 v1.5) wraps the per-connection AES key for the server
//! - AES-256-CBC carries the login request and returns the signing secret
//! - HMAC-SHA256 signs every request sent after login

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use rand::{distributions::Alphanumeric, Rng, RngCore};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Encrypt, RsaPublicKey};
use serde_json::{json, Value};
use sha2::Sha256;

use crate::error::{FnosError, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Requests the server accepts without a signature
const UNSIGNED_REQUESTS: &[&str] = &["encrypted", "util.getSI", "util.crypto.getRSAPub", "ping"];

/// Generate the 32-character AES key used for one connection
pub fn random_aes_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

/// Generate a 16-byte CBC initialisation vector
pub fn random_iv() -> [u8; 16] {
    let mut iv = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

fn parse_public_key(pem: &str) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| FnosError::ProtocolMismatch(format!("invalid RSA public key: {}", e)))
}

/// RSA-encrypt `plaintext` with the server's PEM key, base64 encoded
pub fn rsa_encrypt(public_key_pem: &str, plaintext: &[u8]) -> Result<String> {
    let key = parse_public_key(public_key_pem)?;
    let ciphertext = key
        .encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, plaintext)
        .map_err(|e| FnosError::ProtocolMismatch(format!("RSA encryption failed: {}", e)))?;
    Ok(STANDARD.encode(ciphertext))
}

/// AES-256-CBC encrypt `data`, base64 encoded
pub fn aes_encrypt(data: &str, key: &str, iv: &[u8; 16]) -> Result<String> {
    let ciphertext = Aes256CbcEnc::new_from_slices(key.as_bytes(), iv)
        .map_err(|_| FnosError::ProtocolMismatch("AES key must be 32 bytes".into()))?
        .encrypt_padded_vec_mut::<Pkcs7>(data.as_bytes());
    Ok(STANDARD.encode(ciphertext))
}

/// AES-256-CBC decrypt a base64 ciphertext, returning the plaintext bytes
/// base64 encoded (the form in which signing keys are used)
pub fn aes_decrypt(ciphertext: &str, key: &str, iv: &[u8; 16]) -> Result<String> {
    let raw = STANDARD
        .decode(ciphertext)
        .map_err(|_| FnosError::ProtocolMismatch("secret is not base64".into()))?;
    let plaintext = Aes256CbcDec::new_from_slices(key.as_bytes(), iv)
        .map_err(|_| FnosError::ProtocolMismatch("AES key must be 32 bytes".into()))?
        .decrypt_padded_vec_mut::<Pkcs7>(&raw)
        .map_err(|_| FnosError::ProtocolMismatch("secret could not be decrypted".into()))?;
    Ok(STANDARD.encode(plaintext))
}

/// Wrap a login request so the password never travels in clear
pub fn encrypt_login_request(
    json: &str,
    public_key_pem: &str,
    aes_key: &str,
    iv: &[u8; 16],
) -> Result<Value> {
    Ok(json!({
        "req": "encrypted",
        "iv": STANDARD.encode(iv),
        "rsa": rsa_encrypt(public_key_pem, aes_key.as_bytes())?,
        "aes": aes_encrypt(json, aes_key, iv)?,
    }))
}

/// HMAC-SHA256 of `data` under a base64 key, base64 encoded
pub fn signature(data: &str, key_b64: &str) -> Result<String> {
    let key = STANDARD
        .decode(key_b64)
        .map_err(|_| FnosError::ProtocolMismatch("signing key is not base64".into()))?;
    let mut mac = <HmacSha256 as Mac>::new_from_slice(&key)
        .map_err(|e| FnosError::ProtocolMismatch(e.to_string()))?;
    mac.update(data.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Serialize a request, prefixing the signature when one is required
pub fn sign_request(data: &Value, sign_key: Option<&str>) -> Result<String> {
    let json = serde_json::to_string(data)?;
    let req = data.get("req").and_then(Value::as_str).unwrap_or_default();

    match sign_key {
        Some(key) if !UNSIGNED_REQUESTS.contains(&req) => Ok(signature(&json, key)? + &json),
        _ => Ok(json),
    }
}
