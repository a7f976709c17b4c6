//! Ephemeral AEAD key manager with forward secrecy.
//!
//! The current key is derived as `SHA3-256(master_key || salt)` with a fresh
//! 32-byte salt drawn at every rotation, so compromise of a past ephemeral
//! key (or even the derivation salt alone) does not expose future keys, and
//! rotating forward makes past ciphertexts permanently undecryptable with
//! the current key.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha3::{Digest, Sha3_256};
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;

use crate::chain_log::{ChainLog, Metadata};
use crate::error::{CoreError, CoreResult};

type HmacSha3_256 = Hmac<Sha3_256>;

const MASTER_KEY_LEN: usize = 32;
const SALT_LEN: usize = 32;
const AEAD_NONCE_LEN: usize = 12;
const SIGN_NONCE_LEN: usize = 16;

/// An immutable snapshot of the current ephemeral key. Rotation replaces this
/// record wholesale under the write lock; nothing ever mutates a field of an
/// existing record in place.
struct EphemeralKeyRecord {
    key: [u8; MASTER_KEY_LEN],
    salt: [u8; SALT_LEN],
    created_at: Instant,
    rotation_index: u64,
}

fn derive_key(master_key: &[u8; MASTER_KEY_LEN], salt: &[u8; SALT_LEN]) -> [u8; MASTER_KEY_LEN] {
    let mut hasher = Sha3_256::new();
    hasher.update(master_key);
    hasher.update(salt);
    let digest = hasher.finalize();
    let mut out = [0u8; MASTER_KEY_LEN];
    out.copy_from_slice(&digest);
    out
}

fn key_hash_prefix(key: &[u8; MASTER_KEY_LEN]) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(key);
    hex::encode(hasher.finalize())[..16].to_string()
}

fn salt_hash_prefix(salt: &[u8; SALT_LEN]) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(salt);
    hex::encode(hasher.finalize())[..16].to_string()
}

/// Bounded first-in-first-out record of seen `(rotation_index, nonce)` pairs,
/// consulted by [`KeyManager::verify`] only when a replay guard is enabled.
struct ReplayGuard {
    capacity: usize,
    seen: VecDeque<(u64, Vec<u8>)>,
}

impl ReplayGuard {
    fn new(capacity: usize) -> Self {
        ReplayGuard {
            capacity,
            seen: VecDeque::new(),
        }
    }

    fn check_and_record(&mut self, rotation_index: u64, nonce: &[u8]) -> bool {
        let key = (rotation_index, nonce.to_vec());
        if self.seen.contains(&key) {
            return false;
        }
        if self.seen.len() >= self.capacity {
            self.seen.pop_front();
        }
        self.seen.push_back(key);
        true
    }
}

/// Ephemeral-key manager: current key under a reader/writer lock, optional
/// replay guard, rotation driven externally via [`KeyManager::rotate`].
pub struct KeyManager {
    master_key: [u8; MASTER_KEY_LEN],
    rotation_interval: Duration,
    current: RwLock<EphemeralKeyRecord>,
    replay_guard: Option<RwLock<ReplayGuard>>,
    chain: Arc<ChainLog>,
    rotation_count: std::sync::atomic::AtomicU64,
}

impl KeyManager {
    /// Construct with the first ephemeral key already derived; callers still
    /// must drive rotation (no background task is started here).
    pub fn new(master_key: [u8; MASTER_KEY_LEN], rotation_interval: Duration, chain: Arc<ChainLog>) -> Self {
        let salt = random_salt();
        let key = derive_key(&master_key, &salt);
        let record = EphemeralKeyRecord {
            key,
            salt,
            created_at: Instant::now(),
            rotation_index: 0,
        };
        KeyManager {
            master_key,
            rotation_interval,
            current: RwLock::new(record),
            replay_guard: None,
            chain,
            rotation_count: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Opt in to a bounded replay guard. Disabled by default: the core
    /// treats nonce-uniqueness as the caller's responsibility, this is a
    /// convenience for callers who would rather not track it themselves.
    pub fn with_replay_guard(mut self, capacity: usize) -> Self {
        self.replay_guard = Some(RwLock::new(ReplayGuard::new(capacity)));
        self
    }

    pub fn rotation_count(&self) -> u64 {
        self.rotation_count.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub async fn current_key_age(&self) -> Duration {
        self.current.read().await.created_at.elapsed()
    }

    /// Derive and atomically install a new ephemeral key, logging the
    /// rotation to the chain. The raw key is never logged, only hash
    /// prefixes of the key and salt.
    #[tracing::instrument(skip(self))]
    pub async fn rotate(&self) -> CoreResult<()> {
        let salt = random_salt();
        let key = derive_key(&self.master_key, &salt);
        let rotation_index = self.rotation_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;

        let key_hash = key_hash_prefix(&key);
        let salt_hash = salt_hash_prefix(&salt);
        let valid_until_secs = self.rotation_interval.as_secs();

        {
            let mut current = self.current.write().await;
            *current = EphemeralKeyRecord {
                key,
                salt,
                created_at: Instant::now(),
                rotation_index,
            };
        }

        let mut metadata = Metadata::new();
        metadata.insert("rotation_index".to_string(), rotation_index.into());
        metadata.insert("key_hash_sha3".to_string(), key_hash.into());
        metadata.insert("salt_hash_sha3".to_string(), salt_hash.into());
        metadata.insert("valid_until_secs".to_string(), valid_until_secs.into());
        self.chain
            .append(format!("Key rotation #{rotation_index}"), metadata)
            .await?;
        tracing::info!(rotation_index, "ephemeral key rotated");
        Ok(())
    }

    /// Encrypt with the current key. Output format is `nonce || ct || tag`.
    #[tracing::instrument(skip(self, plaintext))]
    pub async fn encrypt(&self, plaintext: &[u8]) -> CoreResult<Vec<u8>> {
        let current = self.current.read().await;
        if current.created_at.elapsed() > self.rotation_interval.mul_f64(1.5) {
            tracing::warn!("current key aged past 1.5x rotation interval");
            return Err(CoreError::RotationStalled(
                "current key has aged well past its rotation interval".to_string(),
            ));
        }
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&current.key));
        let mut nonce_bytes = [0u8; AEAD_NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CoreError::AuthFailure(format!("encryption failed: {e}")))?;
        let mut out = Vec::with_capacity(AEAD_NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt with the current key only — rotation invalidates any
    /// ciphertext produced under a prior key.
    pub async fn decrypt(&self, data: &[u8]) -> CoreResult<Vec<u8>> {
        if data.len() <= AEAD_NONCE_LEN {
            return Err(CoreError::AuthFailure("ciphertext too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = data.split_at(AEAD_NONCE_LEN);
        let current = self.current.read().await;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&current.key));
        let nonce = Nonce::from_slice(nonce_bytes);
        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CoreError::AuthFailure("AEAD tag mismatch".to_string()))
    }

    /// `HMAC-SHA3-256(current_key, data || nonce)`, returned as
    /// (base64url signature, hex nonce).
    pub async fn sign(&self, data: &[u8]) -> CoreResult<(String, String)> {
        let current = self.current.read().await;
        let mut nonce = [0u8; SIGN_NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut mac = HmacSha3_256::new_from_slice(&current.key)
            .map_err(|e| CoreError::AuthFailure(format!("invalid hmac key: {e}")))?;
        mac.update(data);
        mac.update(&nonce);
        let sig = mac.finalize().into_bytes();

        use base64::Engine;
        let sig_b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(sig);
        Ok((sig_b64, hex::encode(nonce)))
    }

    /// Verify a signature produced by [`KeyManager::sign`]. Comparison is
    /// constant-time; any parse failure returns `Ok(false)` rather than an
    /// error, matching the "never throw on malformed input" contract.
    pub async fn verify(&self, data: &[u8], signature_b64: &str, nonce_hex: &str) -> CoreResult<bool> {
        use base64::Engine;
        let signature = match base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(signature_b64) {
            Ok(s) => s,
            Err(_) => return Ok(false),
        };
        let nonce = match hex::decode(nonce_hex) {
            Ok(n) => n,
            Err(_) => return Ok(false),
        };

        let current = self.current.read().await;

        if let Some(guard) = &self.replay_guard {
            let mut guard = guard.write().await;
            if !guard.check_and_record(current.rotation_index, &nonce) {
                return Ok(false);
            }
        }

        let mut mac = match HmacSha3_256::new_from_slice(&current.key) {
            Ok(m) => m,
            Err(_) => return Ok(false),
        };
        mac.update(data);
        mac.update(&nonce);
        let expected = mac.finalize().into_bytes();

        Ok(bool::from(expected.as_slice().ct_eq(&signature)))
    }
}

fn random_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn manager(dir: &std::path::Path) -> KeyManager {
        let chain = Arc::new(ChainLog::open(dir.join("chain.log")).await.unwrap());
        KeyManager::new([7u8; MASTER_KEY_LEN], Duration::from_secs(300), chain)
    }

    #[tokio::test]
    async fn encrypt_then_decrypt_round_trips() {
        let dir = TempDir::new().unwrap();
        let km = manager(dir.path()).await;
        let plaintext = b"secret message";
        let ciphertext = km.encrypt(plaintext).await.unwrap();
        let decrypted = km.decrypt(&ciphertext).await.unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[tokio::test]
    async fn decrypt_fails_after_rotation() {
        let dir = TempDir::new().unwrap();
        let km = manager(dir.path()).await;
        let ciphertext = km.encrypt(b"pre-rotation").await.unwrap();
        km.rotate().await.unwrap();
        let result = km.decrypt(&ciphertext).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn sign_and_verify_round_trip() {
        let dir = TempDir::new().unwrap();
        let km = manager(dir.path()).await;
        let data = b"content to sign";
        let (sig, nonce) = km.sign(data).await.unwrap();
        assert!(km.verify(data, &sig, &nonce).await.unwrap());
    }

    #[tokio::test]
    async fn verify_rejects_tampered_data() {
        let dir = TempDir::new().unwrap();
        let km = manager(dir.path()).await;
        let (sig, nonce) = km.sign(b"original").await.unwrap();
        assert!(!km.verify(b"tampered", &sig, &nonce).await.unwrap());
    }

    #[tokio::test]
    async fn rotation_logs_to_chain_without_leaking_raw_key() {
        let dir = TempDir::new().unwrap();
        let km = manager(dir.path()).await;
        km.rotate().await.unwrap();
        assert_eq!(km.rotation_count(), 1);
    }

    #[tokio::test]
    async fn replay_guard_rejects_reused_nonce_when_enabled() {
        let dir = TempDir::new().unwrap();
        let chain = Arc::new(ChainLog::open(dir.path().join("chain.log")).await.unwrap());
        let km = KeyManager::new([9u8; MASTER_KEY_LEN], Duration::from_secs(300), chain)
            .with_replay_guard(16);
        let (sig, nonce) = km.sign(b"data").await.unwrap();
        assert!(km.verify(b"data", &sig, &nonce).await.unwrap());
        assert!(!km.verify(b"data", &sig, &nonce).await.unwrap());
    }

    #[tokio::test]
    async fn replay_is_allowed_by_default() {
        let dir = TempDir::new().unwrap();
        let km = manager(dir.path()).await;
        let (sig, nonce) = km.sign(b"data").await.unwrap();
        assert!(km.verify(b"data", &sig, &nonce).await.unwrap());
        assert!(km.verify(b"data", &sig, &nonce).await.unwrap());
    }
}
