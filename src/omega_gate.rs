//! Rolling probabilistic confidence score and admission gate.
//!
//! `Ω = 0.4·(1 − CVaR_α) + 0.3·(1 − β) + 0.2·(1 − ERR_5m) + 0.1·Idem`
//!
//! Weights, `α`, and the window size are fixed; only the admission threshold
//! is configurable (see [`crate::config::Config::omega_threshold`]).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;

const WEIGHT_CVAR: f64 = 0.4;
const WEIGHT_BETA: f64 = 0.3;
const WEIGHT_ERR: f64 = 0.2;
const WEIGHT_IDEM: f64 = 0.1;
const ALPHA: f64 = 0.05;
const WINDOW_SIZE: usize = 100;
const ACTION_HISTORY_CAP: usize = WINDOW_SIZE * 2;
const ERROR_WINDOW: Duration = Duration::from_secs(5 * 60);

struct ActionRecord {
    confidence: f64,
}

/// Snapshot of the four inputs to Ω, plus Ω itself.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct Components {
    pub cvar: f64,
    pub beta: f64,
    pub err_5m: f64,
    pub idem: f64,
    pub omega: f64,
}

struct Windows {
    actions: VecDeque<ActionRecord>,
    validations: VecDeque<bool>,
    error_timestamps: VecDeque<Instant>,
    action_timestamps: VecDeque<Instant>,
    webhooks_total: u64,
    webhooks_idempotent: u64,
}

/// Rolling estimator feeding the admission decision.
pub struct OmegaGate {
    threshold: f64,
    windows: Mutex<Windows>,
}

impl OmegaGate {
    pub fn new(threshold: f64) -> Self {
        OmegaGate {
            threshold,
            windows: Mutex::new(Windows {
                actions: VecDeque::new(),
                validations: VecDeque::new(),
                error_timestamps: VecDeque::new(),
                action_timestamps: VecDeque::new(),
                webhooks_total: 0,
                webhooks_idempotent: 0,
            }),
        }
    }

    pub async fn record_action(&self, confidence: f64) {
        let mut w = self.windows.lock().await;
        w.actions.push_back(ActionRecord {
            confidence: confidence.clamp(0.0, 1.0),
        });
        if w.actions.len() > ACTION_HISTORY_CAP {
            w.actions.pop_front();
        }
        let now = Instant::now();
        w.action_timestamps.push_back(now);
        prune_before(&mut w.action_timestamps, now, ERROR_WINDOW);
    }

    pub async fn record_error(&self) {
        let mut w = self.windows.lock().await;
        let now = Instant::now();
        w.error_timestamps.push_back(now);
        prune_before(&mut w.error_timestamps, now, ERROR_WINDOW);
    }

    pub async fn record_validation(&self, passed: bool) {
        let mut w = self.windows.lock().await;
        w.validations.push_back(passed);
        if w.validations.len() > WINDOW_SIZE {
            w.validations.pop_front();
        }
    }

    pub async fn record_webhook(&self, is_idempotent: bool) {
        let mut w = self.windows.lock().await;
        w.webhooks_total += 1;
        if is_idempotent {
            w.webhooks_idempotent += 1;
        }
    }

    /// Derive the current Ω and its four components from a consistent
    /// snapshot of the rolling windows.
    pub async fn compute(&self) -> Components {
        let mut w = self.windows.lock().await;
        let now = Instant::now();
        prune_before(&mut w.error_timestamps, now, ERROR_WINDOW);
        prune_before(&mut w.action_timestamps, now, ERROR_WINDOW);

        let cvar = compute_cvar(&w.actions);
        let beta = compute_beta(&w.validations);
        let err_5m = compute_err_5m(w.error_timestamps.len(), w.action_timestamps.len());
        let idem = compute_idem(w.webhooks_idempotent, w.webhooks_total);

        let omega = WEIGHT_CVAR * (1.0 - cvar)
            + WEIGHT_BETA * (1.0 - beta)
            + WEIGHT_ERR * (1.0 - err_5m)
            + WEIGHT_IDEM * idem;

        Components {
            cvar,
            beta,
            err_5m,
            idem,
            omega: omega.clamp(0.0, 1.0),
        }
    }

    /// `pass ⇔ Ω ≥ threshold`.
    #[tracing::instrument(skip(self))]
    pub async fn check(&self) -> (bool, Components) {
        let components = self.compute().await;
        let pass = components.omega >= self.threshold;
        if !pass {
            tracing::warn!(omega = components.omega, threshold = self.threshold, "admission denied");
        }
        (pass, components)
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

fn prune_before(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    let cutoff = now.checked_sub(window).unwrap_or(now);
    while let Some(front) = timestamps.front() {
        if *front < cutoff {
            timestamps.pop_front();
        } else {
            break;
        }
    }
}

fn compute_cvar(actions: &VecDeque<ActionRecord>) -> f64 {
    let recent: Vec<f64> = actions
        .iter()
        .rev()
        .take(WINDOW_SIZE)
        .map(|a| 1.0 - a.confidence)
        .collect();
    if recent.is_empty() {
        return 0.0;
    }
    let mut losses = recent;
    losses.sort_by(|a, b| b.partial_cmp(a).unwrap());
    let k = ((losses.len() as f64) * ALPHA).ceil() as usize;
    let k = k.max(1).min(losses.len());
    losses[..k].iter().sum::<f64>() / k as f64
}

fn compute_beta(validations: &VecDeque<bool>) -> f64 {
    if validations.is_empty() {
        return 0.0;
    }
    let failures = validations.iter().filter(|v| !**v).count();
    failures as f64 / validations.len() as f64
}

fn compute_err_5m(errors: usize, actions: usize) -> f64 {
    if actions == 0 {
        return 0.0;
    }
    (errors as f64 / actions as f64).min(1.0)
}

fn compute_idem(idempotent: u64, total: u64) -> f64 {
    if total == 0 {
        return 1.0;
    }
    idempotent as f64 / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn perfect_stream_yields_high_omega() {
        let gate = OmegaGate::new(0.90);
        for _ in 0..100 {
            gate.record_action(1.0).await;
            gate.record_validation(true).await;
            gate.record_webhook(true).await;
        }
        let (pass, components) = gate.check().await;
        assert!(pass);
        assert!(components.omega >= 0.99);
        assert_eq!(components.cvar, 0.0);
        assert_eq!(components.idem, 1.0);
    }

    #[tokio::test]
    async fn tail_risk_burst_denies_admission() {
        let gate = OmegaGate::new(0.90);
        for _ in 0..95 {
            gate.record_action(1.0).await;
        }
        for _ in 0..5 {
            gate.record_action(0.10).await;
        }
        let (pass, components) = gate.check().await;
        assert!(!pass);
        assert!((components.cvar - 0.90).abs() < 1e-9);
        assert!((components.omega - 0.64).abs() < 1e-6);
    }

    #[tokio::test]
    async fn empty_windows_yield_neutral_defaults() {
        let gate = OmegaGate::new(0.90);
        let components = gate.compute().await;
        assert_eq!(components.cvar, 0.0);
        assert_eq!(components.beta, 0.0);
        assert_eq!(components.err_5m, 0.0);
        assert_eq!(components.idem, 1.0);
    }

    #[tokio::test]
    async fn cvar_takes_ceiling_of_alpha_times_window_on_partial_windows() {
        // 37 actions: alpha*37 = 1.85, non-integer, so k must be ceil(1.85) = 2,
        // not floor(1.85) = 1. Two distinct tail losses (1.0 and 0.5) make the
        // two choices of k disagree on the resulting CVaR.
        let gate = OmegaGate::new(0.90);
        for _ in 0..35 {
            gate.record_action(1.0).await;
        }
        gate.record_action(0.5).await;
        gate.record_action(0.0).await;
        let components = gate.compute().await;
        assert!((components.cvar - 0.75).abs() < 1e-9);
    }

    #[tokio::test]
    async fn components_always_bounded() {
        let gate = OmegaGate::new(0.90);
        for i in 0..200 {
            gate.record_action((i % 3) as f64 / 2.0).await;
            gate.record_validation(i % 5 != 0).await;
            gate.record_webhook(i % 2 == 0).await;
        }
        let components = gate.compute().await;
        for v in [
            components.cvar,
            components.beta,
            components.err_5m,
            components.idem,
            components.omega,
        ] {
            assert!((0.0..=1.0).contains(&v));
        }
    }
}
