//! Derived scalar metrics for reporting and testing. None of these feed
//! back into admission decisions — they are observational only.

use serde::Serialize;

use crate::omega_gate::Components;

/// Boltzmann constant, J/K.
pub const K_BOLTZMANN: f64 = 1.380649e-23;
/// Reduced Planck constant, J·s.
pub const HBAR: f64 = 1.054571817e-34;
const DEFAULT_DIFFICULTY_FACTOR: f64 = 100.0;

/// The seven derived scalars, taken together as one reporting snapshot.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ThermodynamicState {
    pub psi: f64,
    pub s_psi: f64,
    pub p_rev: f64,
    pub i_qir: f64,
    pub lambda_af: f64,
    pub phi_jump: f64,
    pub s_info: f64,
}

/// `Ψ = clamp(Ω·(1−CVaR), 0, 1)`.
pub fn compute_psi(omega: f64, cvar: f64) -> f64 {
    (omega * (1.0 - cvar)).clamp(0.0, 1.0)
}

/// Binary-entropy-shaped uncertainty measure over Ψ, scaled by `k_B`. Zero
/// at the endpoints where there is no uncertainty left to measure.
pub fn compute_s_psi(psi: f64) -> f64 {
    if psi <= 0.0 || psi >= 1.0 {
        return 0.0;
    }
    -K_BOLTZMANN * (psi * psi.ln() + (1.0 - psi) * (1.0 - psi).ln())
}

/// Probability that accumulated energy reverses before `blocks_passed`
/// elapses, at an effective temperature proportional to `blocks_passed`.
/// `1.0` (certain reversal / no defense yet) when there is no accumulated
/// energy or no blocks have passed.
pub fn compute_prob_reversal(
    cumulative_energy: f64,
    blocks_passed: u64,
    difficulty_factor: Option<f64>,
) -> f64 {
    if cumulative_energy <= 0.0 || blocks_passed == 0 {
        return 1.0;
    }
    let difficulty_factor = difficulty_factor.unwrap_or(DEFAULT_DIFFICULTY_FACTOR);
    let t_eff = difficulty_factor * blocks_passed as f64;
    let exponent = (-cumulative_energy / (K_BOLTZMANN * t_eff)).clamp(-100.0, 0.0);
    exponent.exp()
}

/// Quantum-information-rate-flavored ratio of Ψ to its own entropy. Zero
/// when there is no entropy to divide by.
pub fn compute_i_qir(psi: f64, s_psi: f64) -> f64 {
    if s_psi <= 0.0 {
        return 0.0;
    }
    HBAR * psi / s_psi
}

/// Antifragility coefficient: relative change in Ψ per unit of attack
/// strength. Zero when there is no baseline Ψ or no attack to normalize by.
pub fn compute_lambda_af(psi_before: f64, psi_after: f64, attack_strength: f64) -> f64 {
    if psi_before <= 0.0 || attack_strength <= 0.0 {
        return 0.0;
    }
    ((psi_after - psi_before) / psi_before) / attack_strength
}

/// Normalized rate of change of Ψ between two samples `dt` apart.
pub fn compute_phi_jump(psi_t: f64, psi_t_minus_1: f64, dt: f64) -> f64 {
    if psi_t <= 0.0 || dt <= 0.0 {
        return 0.0;
    }
    ((psi_t - psi_t_minus_1).abs() / dt) / psi_t
}

/// Shannon-style entropy (scaled by `k_B`) over the normalized Ω components.
pub fn compute_s_info(components: &Components) -> f64 {
    let raw = [components.cvar, components.beta, components.err_5m, components.idem];
    let sum: f64 = raw.iter().sum::<f64>() + 1e-10;
    let mut entropy = 0.0;
    for p in raw {
        let normalized = p / sum;
        if normalized > 0.0 {
            entropy -= normalized * normalized.ln();
        }
    }
    K_BOLTZMANN * entropy
}

/// Compute the full seven-scalar snapshot from one Ω-components reading and
/// the energy/blocks context for the reversal-probability term (both
/// default to the zero-guarded case when a caller has no such context yet).
#[allow(clippy::too_many_arguments)]
pub fn compute_full_state(
    components: &Components,
    psi_before: f64,
    psi_t_minus_1: f64,
    dt: f64,
    attack_strength: f64,
    cumulative_energy: f64,
    blocks_passed: u64,
) -> ThermodynamicState {
    let psi = compute_psi(components.omega, components.cvar);
    let s_psi = compute_s_psi(psi);
    let p_rev = compute_prob_reversal(cumulative_energy, blocks_passed, None);
    let i_qir = compute_i_qir(psi, s_psi);
    let lambda_af = compute_lambda_af(psi_before, psi, attack_strength);
    let phi_jump = compute_phi_jump(psi, psi_t_minus_1, dt);
    let s_info = compute_s_info(components);

    ThermodynamicState {
        psi,
        s_psi,
        p_rev,
        i_qir,
        lambda_af,
        phi_jump,
        s_info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn psi_endpoints_are_clamped() {
        assert_eq!(compute_psi(1.5, 0.0), 1.0);
        assert_eq!(compute_psi(0.0, 0.0), 0.0);
    }

    #[test]
    fn s_psi_vanishes_at_endpoints() {
        assert_eq!(compute_s_psi(0.0), 0.0);
        assert_eq!(compute_s_psi(1.0), 0.0);
        assert!(compute_s_psi(0.5) > 0.0);
    }

    #[test]
    fn prob_reversal_is_certain_without_energy_or_blocks() {
        assert_eq!(compute_prob_reversal(0.0, 10, None), 1.0);
        assert_eq!(compute_prob_reversal(5.0, 0, None), 1.0);
    }

    #[test]
    fn i_qir_is_zero_without_entropy() {
        assert_eq!(compute_i_qir(0.9, 0.0), 0.0);
    }

    #[test]
    fn lambda_af_is_zero_without_baseline_or_attack() {
        assert_eq!(compute_lambda_af(0.0, 0.9, 1.0), 0.0);
        assert_eq!(compute_lambda_af(0.9, 0.8, 0.0), 0.0);
    }

    #[test]
    fn phi_jump_reflects_normalized_rate_of_change() {
        let jump = compute_phi_jump(0.9, 0.8, 1.0);
        assert!((jump - (0.1f64 / 0.9)).abs() < 1e-9);
    }

    #[test]
    fn full_state_is_internally_consistent() {
        let components = Components {
            cvar: 0.05,
            beta: 0.0,
            err_5m: 0.0,
            idem: 1.0,
            omega: 0.95,
        };
        let state = compute_full_state(&components, 0.90, 0.93, 1.0, 1.0, 0.0, 0);
        assert!((state.psi - compute_psi(0.95, 0.05)).abs() < 1e-12);
        assert_eq!(state.p_rev, 1.0);
    }
}
