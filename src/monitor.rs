//! Periodic supervisor wiring AutoHeal, the Ω-Gate, and the Stabilizer
//! together, feeding suspicious observations back into the kill switch.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::autoheal::{AutoHeal, AutoHealStatus};
use crate::chain_log::Metadata;
use crate::error::CoreResult;
use crate::omega_gate::OmegaGate;
use crate::stabilizer::{Stabilizer, SystemState, CVAR_HI};

const SUSPICIOUS_EVENT_TYPES: &[&str] = &[
    "failed_auth",
    "invalid_signature",
    "rate_limit_exceeded",
    "unauthorized_access",
    "tampering_detected",
];

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub running: bool,
    pub uptime_secs: u64,
    pub total_events: u64,
    pub security_events: u64,
    pub recalibrations: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub monitor: MonitorStatus,
    pub autoheal: AutoHealStatus,
    pub stabilizer: SystemState,
    pub omega_threshold: f64,
    pub generated_at: DateTime<Utc>,
}

struct Counters {
    total_events: AtomicU64,
    security_events: AtomicU64,
    recalibrations_seen: AtomicU64,
}

/// Polls AutoHeal, Ω-Gate, and Stabilizer on a fixed period and escalates
/// anomalies (chain tamper, sustained high CVaR) back to the kill switch.
pub struct UnifiedMonitor {
    autoheal: Arc<AutoHeal>,
    omega_gate: Arc<OmegaGate>,
    stabilizer: Arc<Stabilizer>,
    interval: Duration,
    running: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    counters: Counters,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UnifiedMonitor {
    pub fn new(
        autoheal: Arc<AutoHeal>,
        omega_gate: Arc<OmegaGate>,
        stabilizer: Arc<Stabilizer>,
        interval: Duration,
    ) -> Self {
        UnifiedMonitor {
            autoheal,
            omega_gate,
            stabilizer,
            interval,
            running: AtomicBool::new(false),
            started_at: Mutex::new(None),
            counters: Counters {
                total_events: AtomicU64::new(0),
                security_events: AtomicU64::new(0),
                recalibrations_seen: AtomicU64::new(0),
            },
            task: Mutex::new(None),
        }
    }

    /// Launch the supervisor loop. Idempotent.
    pub async fn start(self: &Arc<Self>) -> CoreResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        *self.started_at.lock().await = Some(Instant::now());

        let mut metadata = Metadata::new();
        metadata.insert("monitor_interval_secs".to_string(), self.interval.as_secs().into());
        self.autoheal
            .chain
            .append("UnifiedMonitor started", metadata)
            .await?;

        let this = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(this.interval).await;
                if !this.running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(err) = this.check_system_health().await {
                    tracing::error!(error = %err, "error during monitor health check");
                    let _ = this
                        .autoheal
                        .report_suspicious("monitor_error", Metadata::new())
                        .await;
                }
                if !this.running.load(Ordering::SeqCst) {
                    tracing::info!("kill switch tripped, supervisor loop standing down");
                    break;
                }
            }
        });
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    /// Join the supervisor loop and log a shutdown entry. Idempotent.
    pub async fn stop(&self) -> CoreResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }

        let mut metadata = Metadata::new();
        metadata.insert(
            "total_events".to_string(),
            self.counters.total_events.load(Ordering::SeqCst).into(),
        );
        metadata.insert(
            "security_events".to_string(),
            self.counters.security_events.load(Ordering::SeqCst).into(),
        );
        self.autoheal
            .chain
            .append("UnifiedMonitor stopped", metadata)
            .await?;
        Ok(())
    }

    async fn check_system_health(&self) -> CoreResult<()> {
        let ah_status = self.autoheal.status().await;
        if !ah_status.active {
            tracing::error!("kill switch already tripped, monitor standing down");
            self.running.store(false, Ordering::SeqCst);
            return Ok(());
        }

        if !ah_status.chain_integrity {
            tracing::error!("chain integrity compromised");
            let mut metadata = Metadata::new();
            metadata.insert("chain_length".to_string(), (ah_status.chain_length as u64).into());
            self.autoheal
                .report_suspicious("chain_integrity_failure", metadata)
                .await?;
            self.counters.security_events.fetch_add(1, Ordering::SeqCst);
        }

        let stabilizer_state = self.stabilizer.state().await;
        if stabilizer_state.cvar > CVAR_HI {
            tracing::warn!(cvar = stabilizer_state.cvar, "high cvar observed");
            let mut metadata = Metadata::new();
            metadata.insert("cvar".to_string(), stabilizer_state.cvar.into());
            metadata.insert("psi_target".to_string(), stabilizer_state.psi_target.into());
            metadata.insert("attack_mode".to_string(), stabilizer_state.attack_mode.into());
            self.autoheal.report_suspicious("high_cvar", metadata).await?;
            self.counters.security_events.fetch_add(1, Ordering::SeqCst);
        }

        let previously_seen = self.counters.recalibrations_seen.load(Ordering::SeqCst);
        if stabilizer_state.recalibration_count > previously_seen {
            self.counters
                .recalibrations_seen
                .store(stabilizer_state.recalibration_count, Ordering::SeqCst);
            tracing::info!(total = stabilizer_state.recalibration_count, "stabilizer recalibrated");
            let mut metadata = Metadata::new();
            metadata.insert(
                "recalibration_count".to_string(),
                stabilizer_state.recalibration_count.into(),
            );
            metadata.insert("psi_target".to_string(), stabilizer_state.psi_target.into());
            metadata.insert(
                "price_multiplier".to_string(),
                stabilizer_state.price_multiplier.into(),
            );
            self.autoheal.chain.append("recalibration", metadata).await?;
        }

        let (_, omega_components) = self.omega_gate.check().await;
        if omega_components.omega < 0.85 {
            tracing::warn!(omega = omega_components.omega, "low omega observed");
            let mut metadata = Metadata::new();
            metadata.insert("omega".to_string(), omega_components.omega.into());
            self.autoheal.report_suspicious("low_omega", metadata).await?;
        }

        self.counters.total_events.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Accept a caller-reported event. Always logged to the chain; events in
    /// a fixed suspicious set are additionally forwarded to the kill switch.
    pub async fn report_event(&self, event_type: &str, details: Metadata) -> CoreResult<()> {
        self.autoheal
            .chain
            .append(format!("Event: {event_type}"), details.clone())
            .await?;

        if SUSPICIOUS_EVENT_TYPES.contains(&event_type) {
            self.autoheal.report_suspicious(event_type, details).await?;
            self.counters.security_events.fetch_add(1, Ordering::SeqCst);
        }
        self.counters.total_events.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub async fn status(&self) -> StatusSnapshot {
        let uptime_secs = self
            .started_at
            .lock()
            .await
            .map(|start| start.elapsed().as_secs())
            .unwrap_or(0);

        StatusSnapshot {
            monitor: MonitorStatus {
                running: self.running.load(Ordering::SeqCst),
                uptime_secs,
                total_events: self.counters.total_events.load(Ordering::SeqCst),
                security_events: self.counters.security_events.load(Ordering::SeqCst),
                recalibrations: self.counters.recalibrations_seen.load(Ordering::SeqCst),
            },
            autoheal: self.autoheal.status().await,
            stabilizer: self.stabilizer.state().await,
            omega_threshold: self.omega_gate.threshold(),
            generated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;

    async fn monitor(dir: &std::path::Path) -> Arc<UnifiedMonitor> {
        let config = Config::for_dir(dir);
        let autoheal = Arc::new(AutoHeal::new(&config).await.unwrap());
        let omega_gate = Arc::new(OmegaGate::new(config.omega_threshold));
        let stabilizer = Arc::new(Stabilizer::new());
        Arc::new(UnifiedMonitor::new(
            autoheal,
            omega_gate,
            stabilizer,
            Duration::from_millis(20),
        ))
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let monitor = monitor(dir.path()).await;
        monitor.start().await.unwrap();
        monitor.start().await.unwrap();
        assert!(monitor.status().await.monitor.running);
        monitor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn report_event_forwards_suspicious_types_to_kill_switch() {
        let dir = TempDir::new().unwrap();
        let monitor = monitor(dir.path()).await;
        monitor
            .report_event("failed_auth", Metadata::new())
            .await
            .unwrap();
        let status = monitor.status().await;
        assert_eq!(status.monitor.security_events, 1);
        assert_eq!(status.monitor.total_events, 1);
    }

    #[tokio::test]
    async fn report_event_ignores_benign_types() {
        let dir = TempDir::new().unwrap();
        let monitor = monitor(dir.path()).await;
        monitor
            .report_event("normal_operation", Metadata::new())
            .await
            .unwrap();
        let status = monitor.status().await;
        assert_eq!(status.monitor.security_events, 0);
        assert_eq!(status.monitor.total_events, 1);
    }

    #[tokio::test]
    async fn health_check_escalates_high_cvar() {
        let dir = TempDir::new().unwrap();
        let monitor = monitor(dir.path()).await;
        monitor.stabilizer.update_cvar(0.5).await;
        monitor.check_system_health().await.unwrap();
        let status = monitor.status().await;
        assert_eq!(status.monitor.security_events, 1);
    }

    #[tokio::test]
    async fn stop_before_start_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let monitor = monitor(dir.path()).await;
        monitor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn health_check_logs_recalibration_to_chain_on_increase() {
        let dir = TempDir::new().unwrap();
        let monitor = monitor(dir.path()).await;
        for _ in 0..5 {
            monitor.stabilizer.update_cvar(0.20).await;
        }
        monitor.check_system_health().await.unwrap();
        let tail = monitor.autoheal.chain.tail(20).await;
        assert!(tail.iter().any(|e| e.event == "recalibration"));
    }

    #[tokio::test]
    async fn health_check_stands_down_once_kill_switch_is_tripped() {
        let dir = TempDir::new().unwrap();
        let monitor = monitor(dir.path()).await;
        monitor.running.store(true, Ordering::SeqCst);
        monitor.autoheal.kill_switch.activate().await.unwrap();
        monitor.check_system_health().await.unwrap();
        assert!(!monitor.running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn supervisor_loop_terminates_after_kill_switch_trips() {
        let dir = TempDir::new().unwrap();
        let monitor = monitor(dir.path()).await;
        monitor.start().await.unwrap();
        monitor.autoheal.kill_switch.activate().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!monitor.status().await.monitor.running);
    }
}
