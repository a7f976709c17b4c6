//! Environment-driven configuration, loaded once at startup.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{CoreError, CoreResult};

const DEFAULT_ROTATION_INTERVAL_SECS: u64 = 300;
const DEFAULT_KILL_SWITCH_THRESHOLD: u32 = 3;
const DEFAULT_KILL_SWITCH_WINDOW_SECS: u64 = 60;
const DEFAULT_OMEGA_THRESHOLD: f64 = 0.90;
const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 5;
const CONFIG_DIR_NAME: &str = ".xi-lua";
const MASTER_KEY_FILE_NAME: &str = "master.key";
const CHAIN_LOG_FILE_NAME: &str = "autoheal.log";

/// Every tunable named in the environment-variable interface. Constructed
/// once via [`Config::from_env`] and then shared immutably.
#[derive(Debug, Clone)]
pub struct Config {
    pub rotation_interval: Duration,
    pub kill_switch_threshold: u32,
    pub kill_switch_window: Duration,
    pub omega_threshold: f64,
    pub chain_log_path: PathBuf,
    pub master_key_path: PathBuf,
    pub monitor_interval: Duration,
}

impl Config {
    /// Load configuration from the environment, applying defaults and
    /// validating ranges. Returns a `CoreError::Config` rather than panicking
    /// on any malformed or out-of-range value.
    pub fn from_env() -> CoreResult<Self> {
        let rotation_interval = Duration::from_secs(parse_env_u64(
            "ROTATION_INTERVAL_SECS",
            DEFAULT_ROTATION_INTERVAL_SECS,
        )?);
        let kill_switch_threshold =
            parse_env_u32("KILL_SWITCH_THRESHOLD", DEFAULT_KILL_SWITCH_THRESHOLD)?;
        if kill_switch_threshold < 1 {
            return Err(CoreError::Config(
                "KILL_SWITCH_THRESHOLD must be >= 1".to_string(),
            ));
        }
        let kill_switch_window = Duration::from_secs(parse_env_u64(
            "KILL_SWITCH_WINDOW_SECS",
            DEFAULT_KILL_SWITCH_WINDOW_SECS,
        )?);
        let omega_threshold = parse_env_f64("OMEGA_THRESHOLD", DEFAULT_OMEGA_THRESHOLD)?;
        if !(0.0..=1.0).contains(&omega_threshold) {
            return Err(CoreError::Config(
                "OMEGA_THRESHOLD must be in [0, 1]".to_string(),
            ));
        }
        let monitor_interval = Duration::from_secs(parse_env_u64(
            "MONITOR_INTERVAL_SECS",
            DEFAULT_MONITOR_INTERVAL_SECS,
        )?);

        let home = dirs::home_dir()
            .ok_or_else(|| CoreError::Config("could not resolve home directory".to_string()))?;
        let default_dir = home.join(CONFIG_DIR_NAME);

        let chain_log_path = std::env::var("CHAIN_LOG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_dir.join(CHAIN_LOG_FILE_NAME));
        let master_key_path = std::env::var("MASTER_KEY_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_dir.join(MASTER_KEY_FILE_NAME));

        Ok(Config {
            rotation_interval,
            kill_switch_threshold,
            kill_switch_window,
            omega_threshold,
            chain_log_path,
            master_key_path,
            monitor_interval,
        })
    }

    /// Configuration with paths rooted under `dir` rather than the real home
    /// directory. Used by tests and by callers who want an isolated sandbox.
    pub fn for_dir(dir: &std::path::Path) -> Self {
        Config {
            rotation_interval: Duration::from_secs(DEFAULT_ROTATION_INTERVAL_SECS),
            kill_switch_threshold: DEFAULT_KILL_SWITCH_THRESHOLD,
            kill_switch_window: Duration::from_secs(DEFAULT_KILL_SWITCH_WINDOW_SECS),
            omega_threshold: DEFAULT_OMEGA_THRESHOLD,
            chain_log_path: dir.join(CHAIN_LOG_FILE_NAME),
            master_key_path: dir.join(MASTER_KEY_FILE_NAME),
            monitor_interval: Duration::from_secs(DEFAULT_MONITOR_INTERVAL_SECS),
        }
    }
}

fn parse_env_u64(name: &str, default: u64) -> CoreResult<u64> {
    match std::env::var(name) {
        Ok(val) => val
            .parse()
            .map_err(|_| CoreError::Config(format!("{name} must be a non-negative integer"))),
        Err(_) => Ok(default),
    }
}

fn parse_env_u32(name: &str, default: u32) -> CoreResult<u32> {
    match std::env::var(name) {
        Ok(val) => val
            .parse()
            .map_err(|_| CoreError::Config(format!("{name} must be a non-negative integer"))),
        Err(_) => Ok(default),
    }
}

fn parse_env_f64(name: &str, default: f64) -> CoreResult<f64> {
    match std::env::var(name) {
        Ok(val) => val
            .parse()
            .map_err(|_| CoreError::Config(format!("{name} must be a floating point number"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_dir_roots_paths_under_given_directory() {
        let dir = std::path::Path::new("/tmp/xi-core-test");
        let cfg = Config::for_dir(dir);
        assert_eq!(cfg.chain_log_path, dir.join(CHAIN_LOG_FILE_NAME));
        assert_eq!(cfg.master_key_path, dir.join(MASTER_KEY_FILE_NAME));
        assert_eq!(cfg.omega_threshold, DEFAULT_OMEGA_THRESHOLD);
    }

    #[test]
    fn rejects_out_of_range_omega_threshold() {
        std::env::set_var("OMEGA_THRESHOLD", "1.5");
        let result = Config::from_env();
        std::env::remove_var("OMEGA_THRESHOLD");
        assert!(matches!(result, Err(CoreError::Config(_))));
    }

    #[test]
    fn rejects_zero_kill_switch_threshold() {
        std::env::set_var("KILL_SWITCH_THRESHOLD", "0");
        let result = Config::from_env();
        std::env::remove_var("KILL_SWITCH_THRESHOLD");
        assert!(matches!(result, Err(CoreError::Config(_))));
    }
}
