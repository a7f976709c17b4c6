//! Self-defending security and antifragility substrate.
//!
//! Four subsystems, each usable on its own and also wired together by
//! [`Core`]:
//!
//! - [`autoheal`]: ephemeral-key AEAD manager, hash-chained audit log, and
//!   kill switch, combined behind the [`autoheal::AutoHeal`] facade.
//! - [`omega_gate`]: the Ω confidence score and admission threshold.
//! - [`stabilizer`]: the antifragile Ψ/price controller.
//! - [`monitor`]: the periodic supervisor tying the other three together.
//!
//! [`thermodynamics`] derives a handful of reporting-only scalars from the
//! above; it never feeds back into an admission decision.

pub mod autoheal;
pub mod canonical_json;
pub mod chain_log;
pub mod config;
pub mod core;
pub mod error;
pub mod key_manager;
pub mod kill_switch;
pub mod monitor;
pub mod omega_gate;
pub mod stabilizer;
pub mod thermodynamics;

pub use autoheal::{AutoHeal, AutoHealStatus};
pub use chain_log::{ChainEntry, ChainLog, MetaValue, Metadata};
pub use config::Config;
pub use core::Core;
pub use error::{CoreError, CoreResult};
pub use key_manager::KeyManager;
pub use kill_switch::KillSwitch;
pub use monitor::{MonitorStatus, StatusSnapshot, UnifiedMonitor};
pub use omega_gate::{Components, OmegaGate};
pub use stabilizer::{Stabilizer, SystemState};
pub use thermodynamics::ThermodynamicState;
