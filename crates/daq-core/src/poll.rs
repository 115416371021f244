//! Polling/wait engine.
//!
//! Hardware transitions (motion finishing, autofocus calibrating or locking) are
//! observed by repeatedly probing the device. [`poll_until`] runs such a loop with an
//! explicit deadline and a [`CancellationToken`]:
//!
//! - the probe is never started after the deadline has passed
//! - every sleep is clamped to the remaining time, so the loop never overshoots
//! - cancellation interrupts both the sleep and an in-flight probe
//!
//! ```rust,ignore
//! let settings = PollSettings::new(Duration::from_millis(25), Duration::from_secs(3));
//! match poll_until(&settings, &cancel, || self.focus_state(), |s| matches!(s, Ok(CrifState::Locked))).await {
//!     PollOutcome::Ready(_) => { /* locked */ }
//!     PollOutcome::TimedOut(last) => { /* give up */ }
//!     PollOutcome::Cancelled => { /* stop requested */ }
//! }
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Timing of one polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Pause between probes
    pub interval: Duration,
    /// Total time budget measured from the call
    pub timeout: Duration,
    /// Wait one interval before the first probe
    pub sleep_first: bool,
}

impl PollSettings {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            sleep_first: false,
        }
    }

    pub fn sleep_first(mut self) -> Self {
        self.sleep_first = true;
        self
    }
}

/// Result of a polling loop.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome<T> {
    /// The condition held for this probe result
    Ready(T),
    /// The deadline passed; carries the last probe result if any probe ran
    TimedOut(Option<T>),
    /// The token was cancelled
    Cancelled,
}

impl<T> PollOutcome<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, PollOutcome::Ready(_))
    }
}

/// Sleep until `wake`, returning `false` if cancelled first.
async fn pause(wake: Instant, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = sleep_until(wake) => true,
    }
}

/// Probe until `done` accepts a result, the deadline passes or `cancel` fires.
pub async fn poll_until<T, F, Fut, P>(
    settings: &PollSettings,
    cancel: &CancellationToken,
    mut probe: F,
    mut done: P,
) -> PollOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = T>,
    P: FnMut(&T) -> bool,
{
    let deadline = Instant::now() + settings.timeout;
    let mut last = None;

    if settings.sleep_first && !pause((Instant::now() + settings.interval).min(deadline), cancel).await {
        return PollOutcome::Cancelled;
    }

    loop {
        let value = tokio::select! {
            biased;
            _ = cancel.cancelled() => return PollOutcome::Cancelled,
            value = probe() => value,
        };
        if done(&value) {
            return PollOutcome::Ready(value);
        }
        last = Some(value);

        let now = Instant::now();
        if now >= deadline {
            tracing::debug!(timeout_ms = settings.timeout.as_millis() as u64, "Polling deadline reached");
            return PollOutcome::TimedOut(last);
        }
        if !pause((now + settings.interval).min(deadline), cancel).await {
            return PollOutcome::Cancelled;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn ready_on_first_matching_probe() {
        let calls = AtomicU32::new(0);
        let settings = PollSettings::new(Duration::from_millis(100), Duration::from_secs(1));
        let outcome = poll_until(
            &settings,
            &CancellationToken::new(),
            || {
                let calls = &calls;
                async move { calls.fetch_add(1, Ordering::SeqCst) + 1 }
            },
            |n| *n == 3,
        )
        .await;

        assert_eq!(outcome, PollOutcome::Ready(3));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_without_overshooting() {
        let start = Instant::now();
        let settings = PollSettings::new(Duration::from_millis(300), Duration::from_secs(1));
        let outcome = poll_until(&settings, &CancellationToken::new(), || async { 'I' }, |_| false).await;

        assert_eq!(outcome, PollOutcome::TimedOut(Some('I')));
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_first_delays_first_probe() {
        let start = Instant::now();
        let settings =
            PollSettings::new(Duration::from_millis(250), Duration::from_secs(3)).sleep_first();
        let outcome = poll_until(
            &settings,
            &CancellationToken::new(),
            || async { Instant::now() },
            |_| true,
        )
        .await;

        let PollOutcome::Ready(first_probe) = outcome else {
            panic!("expected ready");
        };
        assert_eq!(first_probe - start, Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_sleep() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let probes = Arc::new(AtomicU32::new(0));
        let counter = probes.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            trigger.cancel();
        });

        let settings = PollSettings::new(Duration::from_millis(100), Duration::from_secs(10));
        let outcome = poll_until(
            &settings,
            &cancel,
            || {
                let counter = counter.clone();
                async move { counter.fetch_add(1, Ordering::SeqCst) }
            },
            |_| false,
        )
        .await;

        assert_eq!(outcome, PollOutcome::Cancelled);
        assert_eq!(probes.load(Ordering::SeqCst), 2);
    }
}
