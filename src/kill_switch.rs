//! Sliding-window counter that trips a permanent, one-shot kill switch.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::chain_log::{ChainLog, Metadata};
use crate::error::CoreResult;

struct Window {
    events: VecDeque<Instant>,
    threshold: u32,
    window: Duration,
}

/// Tracks suspicious events in a sliding window and trips once `threshold`
/// of them land within `window`. Tripping is terminal: once armed is false,
/// it stays false for the life of the process.
pub struct KillSwitch {
    armed: AtomicBool,
    window: Mutex<Window>,
    chain: Arc<ChainLog>,
}

impl KillSwitch {
    pub fn new(threshold: u32, window: Duration, chain: Arc<ChainLog>) -> Self {
        KillSwitch {
            armed: AtomicBool::new(true),
            window: Mutex::new(Window {
                events: VecDeque::new(),
                threshold,
                window,
            }),
            chain,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Report a suspicious event. Returns `true` if this call caused (or
    /// confirms) the kill switch being tripped.
    #[tracing::instrument(skip(self, details))]
    pub async fn report(&self, event_type: &str, details: Metadata) -> CoreResult<bool> {
        if !self.is_armed() {
            return Ok(true);
        }

        let mut metadata = details;
        metadata.insert("event_type".to_string(), event_type.to_string().into());
        self.chain
            .append(format!("Suspicious: {event_type}"), metadata)
            .await?;

        let tripped = {
            let mut window = self.window.lock().await;
            let now = Instant::now();
            window.events.push_back(now);
            let cutoff = now - window.window;
            while let Some(front) = window.events.front() {
                if *front < cutoff {
                    window.events.pop_front();
                } else {
                    break;
                }
            }
            window.events.len() as u32 >= window.threshold
        };

        if tripped {
            self.activate().await?;
        }
        Ok(tripped)
    }

    /// Idempotent: logs and disarms on first call, a no-op afterward.
    #[tracing::instrument(skip(self))]
    pub async fn activate(&self) -> CoreResult<()> {
        let was_armed = self.armed.swap(false, Ordering::SeqCst);
        if was_armed {
            tracing::error!("kill switch activated");
            self.chain
                .append("KILL-SWITCH ACTIVATED", Metadata::new())
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn kill_switch(dir: &std::path::Path, threshold: u32, window: Duration) -> KillSwitch {
        let chain = Arc::new(ChainLog::open(dir.join("chain.log")).await.unwrap());
        KillSwitch::new(threshold, window, chain)
    }

    #[tokio::test]
    async fn trips_after_threshold_events_in_window() {
        let dir = TempDir::new().unwrap();
        let ks = kill_switch(dir.path(), 3, Duration::from_secs(60)).await;
        assert!(!ks.report("x", Metadata::new()).await.unwrap());
        assert!(!ks.report("x", Metadata::new()).await.unwrap());
        assert!(ks.report("x", Metadata::new()).await.unwrap());
        assert!(!ks.is_armed());
    }

    #[tokio::test]
    async fn stays_tripped_after_activation() {
        let dir = TempDir::new().unwrap();
        let ks = kill_switch(dir.path(), 1, Duration::from_secs(60)).await;
        assert!(ks.report("x", Metadata::new()).await.unwrap());
        assert!(ks.report("y", Metadata::new()).await.unwrap());
    }

    #[tokio::test]
    async fn activate_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let ks = kill_switch(dir.path(), 1, Duration::from_secs(60)).await;
        ks.activate().await.unwrap();
        ks.activate().await.unwrap();
        let tail = ks.chain.tail(10).await;
        let activations = tail.iter().filter(|e| e.event == "KILL-SWITCH ACTIVATED").count();
        assert_eq!(activations, 1);
    }

    #[tokio::test]
    async fn under_threshold_never_trips() {
        let dir = TempDir::new().unwrap();
        let ks = kill_switch(dir.path(), 5, Duration::from_secs(60)).await;
        for _ in 0..4 {
            assert!(!ks.report("x", Metadata::new()).await.unwrap());
        }
        assert!(ks.is_armed());
    }
}
