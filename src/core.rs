//! Single owned assembly of every subsystem. Replaces the source's
//! process-wide singletons (`get_autoheal()`, `get_stabilizer()`, ...): one
//! `Core` value is constructed at startup and its components are shared by
//! reference from there on. Nothing here is reachable through a hidden
//! global lookup.

use std::sync::Arc;

use crate::autoheal::AutoHeal;
use crate::chain_log::Metadata;
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::monitor::{StatusSnapshot, UnifiedMonitor};
use crate::omega_gate::{Components, OmegaGate};
use crate::stabilizer::{Stabilizer, SystemState};
use crate::thermodynamics::{compute_full_state, ThermodynamicState};

/// The four subsystems, wired together and ready for `start()`. Construction
/// never spawns a background task; call [`Core::start`] to launch rotation
/// and the supervisor loop, and [`Core::stop`] to join them.
pub struct Core {
    pub autoheal: Arc<AutoHeal>,
    pub omega_gate: Arc<OmegaGate>,
    pub stabilizer: Arc<Stabilizer>,
    pub monitor: Arc<UnifiedMonitor>,
    config: Config,
}

impl Core {
    /// Build every component from `config`. Loads or creates the master key,
    /// opens (and replays) the chain log, but starts no background tasks.
    pub async fn new(config: Config) -> CoreResult<Self> {
        let autoheal = Arc::new(AutoHeal::new(&config).await?);
        let omega_gate = Arc::new(OmegaGate::new(config.omega_threshold));
        let stabilizer = Arc::new(Stabilizer::new());
        let monitor = Arc::new(UnifiedMonitor::new(
            autoheal.clone(),
            omega_gate.clone(),
            stabilizer.clone(),
            config.monitor_interval,
        ));

        Ok(Core {
            autoheal,
            omega_gate,
            stabilizer,
            monitor,
            config,
        })
    }

    /// Load configuration from the environment and build from it.
    pub async fn from_env() -> CoreResult<Self> {
        Core::new(Config::from_env()?).await
    }

    /// Launch the key-rotation task and the supervisor loop. Idempotent —
    /// safe to call more than once.
    pub async fn start(&self) -> CoreResult<()> {
        self.autoheal.start().await;
        self.monitor.start().await?;
        Ok(())
    }

    /// Join both background tasks and log a shutdown entry.
    pub async fn stop(&self) -> CoreResult<()> {
        self.monitor.stop().await?;
        self.autoheal.stop().await;
        Ok(())
    }

    /// Record an observation that feeds the Ω-Gate, then run the admission
    /// check against the current window contents.
    pub async fn record_action(&self, confidence: f64) {
        self.omega_gate.record_action(confidence).await;
    }

    pub async fn record_validation(&self, passed: bool) {
        self.omega_gate.record_validation(passed).await;
        if !passed {
            self.autoheal
                .chain
                .append("validation failed", Metadata::new())
                .await
                .ok();
        }
    }

    pub async fn record_error(&self) {
        self.omega_gate.record_error().await;
    }

    pub async fn record_webhook(&self, is_idempotent: bool) {
        self.omega_gate.record_webhook(is_idempotent).await;
    }

    /// Encrypt through AutoHeal. An `AuthFailure` is recorded as a failed
    /// Ω-Gate validation — components never borrow each other's state
    /// directly, so `Core` is where that cross-cutting wiring lives.
    pub async fn encrypt(&self, plaintext: &[u8]) -> CoreResult<Vec<u8>> {
        let result = self.autoheal.encrypt(plaintext).await;
        self.record_auth_outcome(&result).await;
        result
    }

    /// Decrypt through AutoHeal, with the same Ω-Gate validation wiring as
    /// [`Core::encrypt`].
    pub async fn decrypt(&self, ciphertext: &[u8]) -> CoreResult<Vec<u8>> {
        let result = self.autoheal.decrypt(ciphertext).await;
        self.record_auth_outcome(&result).await;
        result
    }

    /// Verify a signature through AutoHeal. A `false` verdict (not just an
    /// error) is also a validation failure by the same disposition.
    pub async fn verify(&self, data: &[u8], signature_b64: &str, nonce_hex: &str) -> CoreResult<bool> {
        let result = self.autoheal.verify(data, signature_b64, nonce_hex).await;
        match &result {
            Ok(true) => self.omega_gate.record_validation(true).await,
            Ok(false) => self.omega_gate.record_validation(false).await,
            Err(_) => self.omega_gate.record_validation(false).await,
        }
        result
    }

    async fn record_auth_outcome<T>(&self, result: &CoreResult<T>) {
        if let Err(CoreError::AuthFailure(_)) = result {
            self.omega_gate.record_validation(false).await;
        }
    }

    /// Run the Ω-Gate admission check and feed its CVaR component into the
    /// Stabilizer in the same call, mirroring how the source's call sites
    /// always consult both together.
    #[tracing::instrument(skip(self))]
    pub async fn check_admission(&self) -> (bool, Components) {
        let (pass, components) = self.omega_gate.check().await;
        self.stabilizer.update_cvar(components.cvar).await;
        self.stabilizer.try_relax().await;
        (pass, components)
    }

    pub async fn adjusted_price(&self, base: f64) -> f64 {
        self.stabilizer.adjusted_price(base).await
    }

    pub async fn should_accept(&self, quality: f64) -> bool {
        self.stabilizer.should_accept(quality).await
    }

    pub async fn stabilizer_state(&self) -> SystemState {
        self.stabilizer.state().await
    }

    /// Derived thermodynamic scalars for the current Ω reading and
    /// Stabilizer state, with no prior-sample context (use
    /// [`crate::thermodynamics::compute_full_state`] directly for a
    /// time-series view).
    pub async fn thermodynamic_snapshot(&self) -> ThermodynamicState {
        let (_, components) = self.omega_gate.check().await;
        let psi = crate::thermodynamics::compute_psi(components.omega, components.cvar);
        compute_full_state(&components, psi, psi, 1.0, 1.0, 0.0, 0)
    }

    pub async fn status(&self) -> StatusSnapshot {
        self.monitor.status().await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
