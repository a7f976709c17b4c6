//! Facade combining the Key Manager, Chain Log, and Kill-Switch into the
//! single security surface most callers interact with.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::chain_log::{ChainLog, Metadata};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::key_manager::KeyManager;
use crate::kill_switch::KillSwitch;

const MASTER_KEY_LEN: usize = 32;

/// Status fields reported by [`AutoHeal::status`].
#[derive(Debug, Clone, Serialize)]
pub struct AutoHealStatus {
    pub active: bool,
    pub rotation_count: u64,
    pub current_key_age_secs: u64,
    pub merkle_root: String,
    pub chain_length: usize,
    pub chain_integrity: bool,
}

/// Combines ephemeral-key management, the hash-chained audit log, and the
/// kill switch. Inert on construction: rotation only runs once [`AutoHeal::start`]
/// is called.
pub struct AutoHeal {
    pub key_manager: Arc<KeyManager>,
    pub chain: Arc<ChainLog>,
    pub kill_switch: Arc<KillSwitch>,
    rotation_interval: Duration,
    running: AtomicBool,
    rotation_task: Mutex<Option<JoinHandle<()>>>,
}

impl AutoHeal {
    /// Load or create the master key at `config.master_key_path`, open the
    /// chain log, and construct the kill switch and key manager from config.
    pub async fn new(config: &Config) -> CoreResult<Self> {
        let master_key = load_or_create_master_key(&config.master_key_path).await?;
        let chain = Arc::new(ChainLog::open(&config.chain_log_path).await?);
        let key_manager = Arc::new(KeyManager::new(
            master_key,
            config.rotation_interval,
            chain.clone(),
        ));
        let kill_switch = Arc::new(KillSwitch::new(
            config.kill_switch_threshold,
            config.kill_switch_window,
            chain.clone(),
        ));

        Ok(AutoHeal {
            key_manager,
            chain,
            kill_switch,
            rotation_interval: config.rotation_interval,
            running: AtomicBool::new(false),
            rotation_task: Mutex::new(None),
        })
    }

    /// Launch the background rotation task. Idempotent. Rotation failures
    /// (entropy exhaustion is the only realistic cause) are retried with
    /// exponential backoff, capped at `rotation_interval`, and reported as
    /// suspicious to the kill switch rather than silently skipping a cycle.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let key_manager = self.key_manager.clone();
        let kill_switch = self.kill_switch.clone();
        let interval = self.rotation_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                let mut backoff = Duration::from_millis(100);
                loop {
                    match key_manager.rotate().await {
                        Ok(()) => break,
                        Err(err) => {
                            tracing::error!(error = %err, "ephemeral key rotation failed, retrying");
                            let mut details = Metadata::new();
                            details.insert("error".to_string(), err.to_string().into());
                            let _ = kill_switch.report("rotation_stalled", details).await;
                            if !kill_switch.is_armed() {
                                return;
                            }
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(interval);
                        }
                    }
                }
            }
        });
        *self.rotation_task.lock().await = Some(handle);
    }

    /// Join and drop the rotation task. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.rotation_task.lock().await.take() {
            handle.abort();
        }
    }

    fn check_armed(&self) -> CoreResult<()> {
        if !self.kill_switch.is_armed() {
            return Err(CoreError::KillSwitchTripped);
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, plaintext))]
    pub async fn encrypt(&self, plaintext: &[u8]) -> CoreResult<Vec<u8>> {
        self.check_armed()?;
        self.key_manager.encrypt(plaintext).await
    }

    #[tracing::instrument(skip(self, ciphertext))]
    pub async fn decrypt(&self, ciphertext: &[u8]) -> CoreResult<Vec<u8>> {
        self.check_armed()?;
        self.key_manager.decrypt(ciphertext).await
    }

    pub async fn sign(&self, data: &[u8]) -> CoreResult<(String, String)> {
        self.check_armed()?;
        self.key_manager.sign(data).await
    }

    pub async fn verify(&self, data: &[u8], signature_b64: &str, nonce_hex: &str) -> CoreResult<bool> {
        self.check_armed()?;
        self.key_manager.verify(data, signature_b64, nonce_hex).await
    }

    /// Report a suspicious event to the kill switch.
    #[tracing::instrument(skip(self, details))]
    pub async fn report_suspicious(&self, event_type: &str, details: Metadata) -> CoreResult<bool> {
        self.kill_switch.report(event_type, details).await
    }

    pub async fn verify_integrity(&self) -> bool {
        self.chain.verify().await.is_ok()
    }

    pub async fn status(&self) -> AutoHealStatus {
        AutoHealStatus {
            active: self.kill_switch.is_armed(),
            rotation_count: self.key_manager.rotation_count(),
            current_key_age_secs: self.key_manager.current_key_age().await.as_secs(),
            merkle_root: self.chain.current_root().await,
            chain_length: self.chain.len().await,
            chain_integrity: self.verify_integrity().await,
        }
    }
}

async fn load_or_create_master_key(path: &std::path::Path) -> CoreResult<[u8; MASTER_KEY_LEN]> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.len() == MASTER_KEY_LEN => {
            let mut key = [0u8; MASTER_KEY_LEN];
            key.copy_from_slice(&bytes);
            Ok(key)
        }
        Ok(_) => Err(CoreError::Config(format!(
            "master key at {} has unexpected length",
            path.display()
        ))),
        Err(_) => {
            use rand::RngCore;
            let mut key = [0u8; MASTER_KEY_LEN];
            rand::thread_rng().fill_bytes(&mut key);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| CoreError::Config(e.to_string()))?;
            }
            tokio::fs::write(path, key)
                .await
                .map_err(|e| CoreError::Config(e.to_string()))?;
            set_owner_only_permissions(path).await?;
            Ok(key)
        }
    }
}

#[cfg(unix)]
async fn set_owner_only_permissions(path: &std::path::Path) -> CoreResult<()> {
    use std::os::unix::fs::PermissionsExt;
    let permissions = std::fs::Permissions::from_mode(0o600);
    tokio::fs::set_permissions(path, permissions)
        .await
        .map_err(|e| CoreError::Config(e.to_string()))?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_owner_only_permissions(_path: &std::path::Path) -> CoreResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn autoheal(dir: &std::path::Path) -> AutoHeal {
        let config = Config::for_dir(dir);
        AutoHeal::new(&config).await.unwrap()
    }

    #[tokio::test]
    async fn creates_master_key_on_first_use() {
        let dir = TempDir::new().unwrap();
        let _ah = autoheal(dir.path()).await;
        assert!(dir.path().join("master.key").exists());
    }

    #[tokio::test]
    async fn reuses_existing_master_key() {
        let dir = TempDir::new().unwrap();
        {
            let ah = autoheal(dir.path()).await;
            ah.encrypt(b"data").await.unwrap();
        }
        let bytes_first = tokio::fs::read(dir.path().join("master.key")).await.unwrap();
        let _ah2 = autoheal(dir.path()).await;
        let bytes_second = tokio::fs::read(dir.path().join("master.key")).await.unwrap();
        assert_eq!(bytes_first, bytes_second);
    }

    #[tokio::test]
    async fn encrypt_decrypt_round_trip() {
        let dir = TempDir::new().unwrap();
        let ah = autoheal(dir.path()).await;
        let ciphertext = ah.encrypt(b"hello world").await.unwrap();
        let plaintext = ah.decrypt(&ciphertext).await.unwrap();
        assert_eq!(plaintext, b"hello world");
    }

    #[tokio::test]
    async fn kill_switch_blocks_further_operations() {
        let dir = TempDir::new().unwrap();
        let ah = autoheal(dir.path()).await;
        ah.kill_switch.activate().await.unwrap();
        assert!(matches!(
            ah.encrypt(b"x").await,
            Err(CoreError::KillSwitchTripped)
        ));
    }

    #[tokio::test]
    async fn status_reflects_chain_and_rotation_state() {
        let dir = TempDir::new().unwrap();
        let ah = autoheal(dir.path()).await;
        ah.key_manager.rotate().await.unwrap();
        let status = ah.status().await;
        assert!(status.active);
        assert_eq!(status.rotation_count, 1);
        assert!(status.chain_integrity);
    }
}
