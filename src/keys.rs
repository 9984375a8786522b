use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::{
    error::{Error, Result},
    exec,
};

const CMD_WG: &str = "wg";
const KEY_LEN: usize = 32;

/// A WireGuard keypair. `Debug` never prints the private half.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .finish()
    }
}

pub trait KeyPairProvider: Send + Sync {
    fn generate_keypair(&self) -> Result<KeyPair>;
}

/// Shells out to `wg genkey` / `wg pubkey`.
#[derive(Debug, Clone)]
pub struct WgToolKeys {
    pub timeout: Duration,
}

impl WgToolKeys {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn derive_public_key(&self, private_key: &str) -> Result<String> {
        let output = exec::run_checked(CMD_WG, &["pubkey"], Some(private_key.as_bytes()), self.timeout)?;
        let key = exec::stdout_trimmed(&output);
        checked_tool_key(&key, "wg pubkey")?;
        Ok(key)
    }
}

impl KeyPairProvider for WgToolKeys {
    fn generate_keypair(&self) -> Result<KeyPair> {
        let output = exec::run_checked(CMD_WG, &["genkey"], None, self.timeout)?;
        let private_key = exec::stdout_trimmed(&output);
        checked_tool_key(&private_key, "wg genkey")?;
        let public_key = self.derive_public_key(&private_key)?;
        Ok(KeyPair {
            private_key,
            public_key,
        })
    }
}

/// In-process Curve25519 keys, for hosts without `wg` installed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeKeys;

impl KeyPairProvider for NativeKeys {
    fn generate_keypair(&self) -> Result<KeyPair> {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        Ok(KeyPair {
            private_key: general_purpose::STANDARD.encode(secret.to_bytes()),
            public_key: general_purpose::STANDARD.encode(public.as_bytes()),
        })
    }
}

fn checked_tool_key(key: &str, command: &str) -> Result<()> {
    validate_key_b64(key).map_err(|e| Error::ExternalTool {
        command: command.into(),
        detail: format!("returned a malformed key: {e}"),
    })
}

/**
 * @brief Validate a Base64 WireGuard key decodes to 32 bytes.
 * @param b64 Base64-encoded key.
 */
pub fn validate_key_b64(b64: &str) -> Result<()> {
    let bytes = general_purpose::STANDARD
        .decode(b64.trim())
        .map_err(|e| Error::Validation(format!("invalid key encoding: {e}")))?;
    if bytes.len() != KEY_LEN {
        return Err(Error::Validation(format!(
            "invalid key length: {} bytes, expected {KEY_LEN}",
            bytes.len()
        )));
    }
    Ok(())
}

/**
 * @brief Derive the public key for a Base64 private key.
 * @param private_b64 Base64-encoded Curve25519 private key.
 * @return Base64-encoded public key.
 */
pub fn public_from_private(private_b64: &str) -> Result<String> {
    validate_key_b64(private_b64)?;
    let bytes = general_purpose::STANDARD
        .decode(private_b64.trim())
        .map_err(|e| Error::Validation(e.to_string()))?;
    let bytes: [u8; KEY_LEN] = bytes
        .try_into()
        .map_err(|_| Error::Validation("invalid key length".into()))?;
    let public = PublicKey::from(&StaticSecret::from(bytes));
    Ok(general_purpose::STANDARD.encode(public.as_bytes()))
}

/// First characters of a key, for log lines.
pub fn short(key: &str) -> &str {
    key.get(..8).unwrap_or(key)
}
