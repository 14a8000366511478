//! Encryption key management for the cache store.
//!
//! Keys are 256-bit values, base64-encoded for storage and transport, and
//! resolved in priority order:
//! 1. OS keyring (Secret Service / Keychain / Credential Manager)
//! 2. `M365_MCP_CACHE_KEY` environment variable (headless deployments)
//! 3. Freshly generated, then best-effort persisted back to the keyring
//!
//! Key material never appears in log output or error messages.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Keyring service name under which the cache key is stored.
pub const KEYRING_SERVICE: &str = "m365-mcp-cache";

/// Keyring username under which the cache key is stored.
pub const KEYRING_USERNAME: &str = "encryption-key";

/// Environment variable fallback for headless deployments.
pub const KEY_ENV_VAR: &str = "M365_MCP_CACHE_KEY";

const KEY_BYTES: usize = 32;

/// Key management errors
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("random key generation failed: {0}")]
    Generation(String),
}

/// A base64-encoded 256-bit encryption key.
///
/// Wraps the encoded key so it is zeroized on drop and redacted from any
/// `Debug` output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey(String);

impl EncryptionKey {
    /// Borrow the base64-encoded key for binding to a database connection.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

/// Resolves and persists the cache encryption key.
pub struct KeyManager;

impl KeyManager {
    /// Generate a new base64-encoded 256-bit key from the OS random source.
    pub fn generate_key() -> Result<EncryptionKey, KeyError> {
        let mut bytes = [0u8; KEY_BYTES];
        rand::rngs::OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| KeyError::Generation(e.to_string()))?;

        let encoded = BASE64.encode(bytes);
        bytes.zeroize();

        log::debug!("Generated new 256-bit encryption key");
        Ok(EncryptionKey(encoded))
    }

    /// Get the encryption key, falling back through keyring, environment
    /// variable, and fresh generation.
    ///
    /// A newly generated key is stored in the keyring when possible; the key
    /// is returned either way. Keyring unavailability is never fatal.
    pub fn get_or_create_key() -> Result<EncryptionKey, KeyError> {
        if let Some(key) = Self::key_from_keyring() {
            log::info!("Encryption key loaded from system keyring");
            return Ok(key);
        }

        if let Some(key) = Self::key_from_env() {
            log::info!("Encryption key loaded from environment variable");
            return Ok(key);
        }

        log::info!("No existing encryption key found, generating new key");
        let key = Self::generate_key()?;

        if Self::store_key_in_keyring(&key) {
            log::info!("New encryption key generated and stored in system keyring");
        } else {
            log::warn!(
                "New encryption key could not be stored in the keyring; set {} to persist it across sessions",
                KEY_ENV_VAR
            );
        }

        Ok(key)
    }

    /// Delete the stored key from the system keyring.
    ///
    /// Administrative helper; the existing encrypted database becomes
    /// unreadable once the key is gone.
    pub fn delete_key_from_keyring() -> bool {
        match keyring::Entry::new(KEYRING_SERVICE, KEYRING_USERNAME) {
            Ok(entry) => match entry.delete_credential() {
                Ok(()) => {
                    log::info!("Encryption key deleted from system keyring");
                    true
                }
                Err(keyring::Error::NoEntry) => true,
                Err(e) => {
                    log::warn!("Could not delete key from keyring: {}", e);
                    false
                }
            },
            Err(e) => {
                log::warn!("System keyring unavailable: {}", e);
                false
            }
        }
    }

    fn key_from_keyring() -> Option<EncryptionKey> {
        let entry = match keyring::Entry::new(KEYRING_SERVICE, KEYRING_USERNAME) {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("System keyring unavailable: {}", e);
                return None;
            }
        };

        match entry.get_password() {
            Ok(raw) => validate_key(&raw).or_else(|| {
                log::warn!("Invalid key format found in keyring, ignoring");
                None
            }),
            Err(keyring::Error::NoEntry) => None,
            Err(e) => {
                log::warn!("System keyring unavailable: {}", e);
                None
            }
        }
    }

    fn key_from_env() -> Option<EncryptionKey> {
        let raw = std::env::var(KEY_ENV_VAR).ok()?;
        validate_key(&raw).or_else(|| {
            log::warn!("Invalid key format in {} environment variable", KEY_ENV_VAR);
            None
        })
    }

    fn store_key_in_keyring(key: &EncryptionKey) -> bool {
        match keyring::Entry::new(KEYRING_SERVICE, KEYRING_USERNAME) {
            Ok(entry) => match entry.set_password(key.expose()) {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("Could not store key in keyring: {}", e);
                    false
                }
            },
            Err(e) => {
                log::warn!("System keyring unavailable: {}", e);
                false
            }
        }
    }
}

/// Accept a candidate key only if it decodes to exactly 32 bytes.
fn validate_key(raw: &str) -> Option<EncryptionKey> {
    match BASE64.decode(raw) {
        Ok(mut bytes) if bytes.len() == KEY_BYTES => {
            bytes.zeroize();
            Some(EncryptionKey(raw.to_string()))
        }
        Ok(bytes) => {
            log::warn!(
                "Invalid key length: {} bytes (expected {})",
                bytes.len(),
                KEY_BYTES
            );
            None
        }
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_key_is_256_bits() {
        let key = KeyManager::generate_key().unwrap();
        let decoded = BASE64.decode(key.expose()).unwrap();
        assert_eq!(decoded.len(), 32);
    }

    #[test]
    fn test_generated_keys_are_unique() {
        let a = KeyManager::generate_key().unwrap();
        let b = KeyManager::generate_key().unwrap();
        assert_ne!(a.expose(), b.expose());
    }

    #[test]
    fn test_validate_key_accepts_valid() {
        let key = KeyManager::generate_key().unwrap();
        assert!(validate_key(key.expose()).is_some());
    }

    #[test]
    fn test_validate_key_rejects_wrong_length() {
        let short = BASE64.encode([0u8; 16]);
        assert!(validate_key(&short).is_none());

        let long = BASE64.encode([0u8; 48]);
        assert!(validate_key(&long).is_none());
    }

    #[test]
    fn test_validate_key_rejects_bad_base64() {
        assert!(validate_key("not!!valid@@base64").is_none());
    }

    #[test]
    fn test_debug_redacts_key_material() {
        let key = KeyManager::generate_key().unwrap();
        let printed = format!("{:?}", key);
        assert!(!printed.contains(key.expose()));
        assert!(printed.contains("redacted"));
    }
}
