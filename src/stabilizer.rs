//! Antifragile feedback controller: tightens admission quality and price
//! under sustained tail risk, relaxes once stability is confirmed.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

/// Bifurcation marker reserved for derived thermodynamic metrics.
pub const K_BIFURCATION: f64 = 0.5;
pub const CVAR_HI: f64 = 0.15;
pub const CVAR_LO: f64 = 0.10;
const CONFIRM_WINDOW: Duration = Duration::from_secs(5);
const RELAX_WINDOW: Duration = Duration::from_secs(30);
pub const PSI_MIN: f64 = 0.85;
pub const PSI_DEFAULT: f64 = 0.90;
pub const PSI_MAX: f64 = 0.98;
const DELTA_PSI: f64 = 0.02;
const DELTA_PRICE: f64 = 0.20;
pub const PRICE_MAX: f64 = 3.0;
const CONFIRM_MIN_SAMPLES: usize = 3;
const RELAX_MIN_SAMPLES: usize = 10;

/// Current controller state, mirroring the source's `SystemState`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SystemState {
    pub psi_target: f64,
    pub cvar: f64,
    pub price_multiplier: f64,
    pub last_recalibration: Option<DateTime<Utc>>,
    pub recalibration_count: u64,
    pub attack_mode: bool,
}

impl Default for SystemState {
    fn default() -> Self {
        SystemState {
            psi_target: PSI_DEFAULT,
            cvar: 0.0,
            price_multiplier: 1.0,
            last_recalibration: None,
            recalibration_count: 0,
            attack_mode: false,
        }
    }
}

struct Inner {
    state: SystemState,
    cvar_history: VecDeque<(Instant, f64)>,
    last_recalibration_at: Option<Instant>,
}

/// NORMAL/ATTACK controller over a CVaR time series.
pub struct Stabilizer {
    inner: Mutex<Inner>,
}

impl Default for Stabilizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Stabilizer {
    pub fn new() -> Self {
        Stabilizer {
            inner: Mutex::new(Inner {
                state: SystemState::default(),
                cvar_history: VecDeque::new(),
                last_recalibration_at: None,
            }),
        }
    }

    pub async fn state(&self) -> SystemState {
        self.inner.lock().await.state
    }

    /// Push a new CVaR sample. Returns `true` if this call caused a
    /// recalibration (transition into, or further tightening within, ATTACK).
    ///
    /// A non-finite input (NaN/infinite) is treated as worse than `CVAR_HI`
    /// so an unreadable risk signal cannot be used to stay silently calm.
    #[tracing::instrument(skip(self))]
    pub async fn update_cvar(&self, cvar: f64) -> bool {
        let cvar = if cvar.is_finite() { cvar } else { CVAR_HI + f64::EPSILON };
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.cvar_history.push_back((now, cvar));
        prune_older_than(&mut inner.cvar_history, now, RELAX_WINDOW.max(CONFIRM_WINDOW));
        inner.state.cvar = cvar;

        let cooled_down = inner
            .last_recalibration_at
            .map(|at| now.duration_since(at) >= CONFIRM_WINDOW)
            .unwrap_or(true);

        if cooled_down && should_recalibrate(&inner.cvar_history, now) {
            recalibrate(&mut inner.state, now);
            inner.last_recalibration_at = Some(now);
            true
        } else {
            false
        }
    }

    /// Attempt to relax Ψ-target and price multiplier back toward baseline.
    /// Only has an effect while `attack_mode` is set.
    pub async fn try_relax(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.state.attack_mode {
            return false;
        }
        let now = Instant::now();
        if !should_relax(&inner.cvar_history, now) {
            return false;
        }
        relax(&mut inner.state);
        true
    }

    pub async fn adjusted_price(&self, base: f64) -> f64 {
        base * self.inner.lock().await.state.price_multiplier
    }

    pub async fn should_accept(&self, quality: f64) -> bool {
        quality >= self.inner.lock().await.state.psi_target
    }
}

fn prune_older_than(history: &mut VecDeque<(Instant, f64)>, now: Instant, window: Duration) {
    let cutoff = now.checked_sub(window).unwrap_or(now);
    while let Some((ts, _)) = history.front() {
        if *ts < cutoff {
            history.pop_front();
        } else {
            break;
        }
    }
}

fn should_recalibrate(history: &VecDeque<(Instant, f64)>, now: Instant) -> bool {
    let cutoff = now.checked_sub(CONFIRM_WINDOW).unwrap_or(now);
    let recent: Vec<f64> = history
        .iter()
        .filter(|(ts, _)| *ts >= cutoff)
        .map(|(_, c)| *c)
        .collect();
    recent.len() >= CONFIRM_MIN_SAMPLES && recent.iter().all(|c| *c > CVAR_HI)
}

fn should_relax(history: &VecDeque<(Instant, f64)>, now: Instant) -> bool {
    let cutoff = now.checked_sub(RELAX_WINDOW).unwrap_or(now);
    let recent: Vec<f64> = history
        .iter()
        .filter(|(ts, _)| *ts >= cutoff)
        .map(|(_, c)| *c)
        .collect();
    recent.len() >= RELAX_MIN_SAMPLES && recent.iter().all(|c| *c < CVAR_LO)
}

fn recalibrate(state: &mut SystemState, now: Instant) {
    let (old_psi, old_price) = (state.psi_target, state.price_multiplier);
    state.psi_target = (state.psi_target + DELTA_PSI).min(PSI_MAX);
    state.price_multiplier = (state.price_multiplier * (1.0 + DELTA_PRICE)).min(PRICE_MAX);
    state.recalibration_count += 1;
    state.attack_mode = true;
    state.last_recalibration = Some(Utc::now());
    tracing::warn!(
        old_psi,
        new_psi = state.psi_target,
        old_price,
        new_price = state.price_multiplier,
        "stabilizer tightened under sustained tail risk"
    );
    let _ = now;
}

fn relax(state: &mut SystemState) {
    let (old_psi, old_price) = (state.psi_target, state.price_multiplier);
    state.psi_target = (state.psi_target - DELTA_PSI).max(PSI_DEFAULT);
    state.price_multiplier = (state.price_multiplier / (1.0 + DELTA_PRICE)).max(1.0);
    if state.psi_target <= PSI_DEFAULT && state.price_multiplier <= 1.0 {
        state.attack_mode = false;
    }
    tracing::info!(
        old_psi,
        new_psi = state.psi_target,
        old_price,
        new_price = state.price_multiplier,
        "stabilizer relaxed after confirmed stability"
    );
}
