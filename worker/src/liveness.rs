//! Heartbeat tracking and the oneshot self-termination watchdog.
//!
//! A oneshot worker is launched by a client over SSH and must not outlive it.
//! Every `heartbeat` command calls [`Liveness::touch`]; [`watchdog`] resolves
//! once no heartbeat has arrived for longer than the configured threshold,
//! at which point [`crate::serve`] stops serving and returns.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Shared "last seen" timestamp, cloned into every connection.
#[derive(Clone)]
pub struct Liveness {
    last_seen: Arc<Mutex<Instant>>,
}

impl Liveness {
    pub fn new() -> Self {
        Self {
            last_seen: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Record a heartbeat.
    pub fn touch(&self) {
        *self
            .last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Time since the last heartbeat (or since startup if none arrived yet).
    pub fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait until the worker has been idle for strictly longer than `timeout`,
/// checking every `check_every`.
pub async fn watchdog(liveness: Liveness, timeout: Duration, check_every: Duration) {
    let mut interval = tokio::time::interval(check_every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately.
    interval.tick().await;

    loop {
        interval.tick().await;
        let idle = liveness.idle_for();
        if idle > timeout {
            info!(
                "No heartbeat for {}s (limit {}s), shutting down",
                idle.as_secs(),
                timeout.as_secs()
            );
            return;
        }
        debug!("Watchdog: idle {}ms", idle.as_millis());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(30);
    const CHECK: Duration = Duration::from_secs(5);

    #[tokio::test(start_paused = true)]
    async fn expires_without_heartbeats() {
        let start = Instant::now();
        watchdog(Liveness::new(), TIMEOUT, CHECK).await;
        let elapsed = start.elapsed();
        assert!(elapsed > TIMEOUT, "fired too early: {elapsed:?}");
        assert!(elapsed <= TIMEOUT + CHECK, "fired too late: {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_before_threshold_resets_timer() {
        let liveness = Liveness::new();
        let start = Instant::now();
        let beat = liveness.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(25)).await;
            beat.touch();
        });

        watchdog(liveness, TIMEOUT, CHECK).await;
        // Reset at 25s, so expiry cannot come before 55s.
        assert!(start.elapsed() > Duration::from_secs(55));
    }

    #[tokio::test(start_paused = true)]
    async fn steady_heartbeats_keep_worker_alive() {
        let liveness = Liveness::new();
        let beat = liveness.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(10)).await;
                beat.touch();
            }
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(300),
            watchdog(liveness, TIMEOUT, CHECK),
        )
        .await;
        assert!(outcome.is_err(), "watchdog fired despite heartbeats");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_for_tracks_touch() {
        let liveness = Liveness::new();
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert!(liveness.idle_for() >= Duration::from_secs(7));
        liveness.touch();
        assert!(liveness.idle_for() < Duration::from_secs(1));
    }
}
