use std::{
    future::Future,
    time::{Duration, Instant},
};

use crate::tunnel::shutdown::{self, ShutdownRx};

/// A run that lasted at least this long counts as healthy and resets the backoff.
const HEALTHY_RUN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    /// Delay to wait now; doubles the next one up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let d = self.current;
        self.current = (self.current * 2).min(self.max);
        d
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(10))
    }
}

/// Keep a listener loop alive.
///
/// `serve` is re-run after every error, with capped exponential backoff between
/// attempts. The loop ends when `serve` returns `Ok` (it was stopped) or when
/// `shutdown` fires.
pub async fn supervise<F, Fut>(name: &str, shutdown: ShutdownRx, serve: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    supervise_with(name, shutdown, Backoff::default(), serve).await
}

pub async fn supervise_with<F, Fut>(
    name: &str,
    mut shutdown: ShutdownRx,
    mut backoff: Backoff,
    mut serve: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    loop {
        if shutdown::is_set(&shutdown) {
            return;
        }

        let started = Instant::now();
        let err = match serve().await {
            Ok(()) => return,
            Err(err) => err,
        };

        if started.elapsed() >= HEALTHY_RUN {
            backoff.reset();
        }
        let delay = backoff.next_delay();
        tracing::warn!(
            listener = %name,
            err = %format!("{err:#}"),
            backoff = %humantime::format_duration(delay),
            "supervisor: listener failed; restarting"
        );

        tokio::select! {
            _ = shutdown::wait(&mut shutdown) => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
