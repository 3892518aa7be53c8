//! Periodic task scheduling for the agent components
//!
//! The scheduler fires an async task once or periodically and hands back a
//! `Cancellable` that stops future firings. Periodic schedules come in two
//! flavors: a precise fixed-rate mode that compensates drift so firings stay
//! on the `t0 + k * interval` grid, and a drifting fixed-delay mode that
//! waits a full delay after each firing completes.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use tokio::sync::watch;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error};

/// Handle to a scheduled task.
///
/// `cancel()` prevents the next firing; an in-flight firing always runs to
/// completion. The cancelled flag and the cancellation signal are updated
/// under one mutex so a concurrent firing can never observe a half-cancelled
/// handle.
#[derive(Clone)]
pub struct Cancellable {
    inner: Arc<CancelState>,
}

struct CancelState {
    cancelled: Mutex<bool>,
    signal: watch::Sender<bool>,
}

impl Cancellable {
    fn new() -> (Self, watch::Receiver<bool>) {
        let (signal, receiver) = watch::channel(false);
        let inner = Arc::new(CancelState {
            cancelled: Mutex::new(false),
            signal,
        });
        (Self { inner }, receiver)
    }

    /// Cancels the schedule. Returns `true` only for the call that performed
    /// the transition; every later call returns `false`.
    pub fn cancel(&self) -> bool {
        let mut cancelled = self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *cancelled {
            return false;
        }
        *cancelled = true;
        let _ = self.inner.signal.send(true);
        true
    }

    pub fn is_cancelled(&self) -> bool {
        *self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fires tasks once or periodically on the tokio runtime.
pub struct Scheduler;

impl Scheduler {
    /// Runs `task` exactly once after `delay`, unless cancelled first.
    pub fn schedule_once<F, Fut>(delay: Duration, task: F) -> Cancellable
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send,
    {
        let (cancellable, mut receiver) = Cancellable::new();
        let handle = cancellable.clone();
        tokio::spawn(async move {
            if cancelled_or_elapsed(&mut receiver, delay).await || handle.is_cancelled() {
                return;
            }
            if let Err(error) = task().await {
                error!("Scheduled task failed: {:#}", error);
            }
        });
        cancellable
    }

    /// Precise periodic mode: firings target the ideal times
    /// `t0 + k * interval`. A firing that overruns its period is absorbed
    /// into the drift computation; missed grid points are not replayed.
    pub fn schedule_at_fixed_rate<F, Fut>(
        initial_delay: Duration,
        interval: Duration,
        task: F,
    ) -> Cancellable
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send,
    {
        Self::spawn_periodic(initial_delay, interval, task, true)
    }

    /// Drifting periodic mode: the next firing always waits `delay` measured
    /// from the end of the previous one.
    pub fn schedule_with_fixed_delay<F, Fut>(
        initial_delay: Duration,
        delay: Duration,
        task: F,
    ) -> Cancellable
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send,
    {
        Self::spawn_periodic(initial_delay, delay, task, false)
    }

    fn spawn_periodic<F, Fut>(
        initial_delay: Duration,
        interval: Duration,
        mut task: F,
        precise: bool,
    ) -> Cancellable
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send,
    {
        let (cancellable, mut receiver) = Cancellable::new();
        let handle = cancellable.clone();
        tokio::spawn(async move {
            let started = Instant::now() + initial_delay;
            if cancelled_or_elapsed(&mut receiver, initial_delay).await {
                return;
            }
            loop {
                if handle.is_cancelled() {
                    debug!("Periodic job cancelled, stopping.");
                    return;
                }
                // First-tick guard: a firing due before the schedule's
                // start time is skipped, the chain stays armed.
                if Instant::now() >= started {
                    if let Err(error) = task().await {
                        error!("Stopping periodic job because of error: {:#}", error);
                        return;
                    }
                }
                let next_delay = next_delay(started, interval, precise);
                if cancelled_or_elapsed(&mut receiver, next_delay).await {
                    return;
                }
            }
        });
        cancellable
    }
}

/// Computes the delay until the next firing. Precise schedules (and any
/// schedule that ran ahead of its start time) aim for the ideal grid;
/// drifting schedules wait the full interval.
fn next_delay(started: Instant, interval: Duration, precise: bool) -> Duration {
    let now = Instant::now();
    if !precise && now >= started {
        return interval;
    }
    let interval_secs = interval.as_secs_f64();
    let offset = match now.checked_duration_since(started) {
        Some(elapsed) => elapsed.as_secs_f64(),
        None => -started.duration_since(now).as_secs_f64(),
    };
    let drift = offset.rem_euclid(interval_secs);
    Duration::from_secs_f64(interval_secs - drift)
}

/// Sleeps for `delay` unless the cancellation signal arrives first.
/// Returns whether the schedule was cancelled.
async fn cancelled_or_elapsed(receiver: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = receiver.changed() => true,
        _ = sleep(delay) => *receiver.borrow(),
    }
}
