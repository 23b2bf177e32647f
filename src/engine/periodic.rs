use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Behavior flags of a [`PeriodicTask`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskFlags {
    /// Apply jitter to every tick.
    pub chaotic: bool,
    /// Do not silently drop ticks when the body overruns the period; the next
    /// tick fires as soon as the body returns.
    pub critical: bool,
    /// Fire the first tick immediately on start.
    pub now: bool,
}

/// Settings of a [`PeriodicTask`]; can be replaced while the task is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub period: Duration,
    pub jitter: Duration,
    pub flags: TaskFlags,
}

impl Settings {
    pub fn new(period: Duration) -> Self {
        Settings {
            period,
            jitter: Duration::ZERO,
            flags: TaskFlags::default(),
        }
    }
}

/// A cooperatively cancellable periodic task.
///
/// The body runs on the runtime `start` was called on. `stop` cancels the body
/// at its next suspension point and does not return until it is no longer
/// running.
#[derive(Debug, Default)]
pub(crate) struct PeriodicTask {
    running: Mutex<Option<RunningTask>>,
}

#[derive(Debug)]
struct RunningTask {
    name: String,
    settings: Arc<Mutex<Settings>>,
    stop_tx: watch::Sender<()>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    pub fn start<F, Fut>(&self, name: String, settings: Settings, mut body: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut running = self.running.lock();
        debug_assert!(running.is_none(), "periodic task started twice");

        let settings = Arc::new(Mutex::new(settings));
        let (stop_tx, mut stop_rx) = watch::channel(());

        let loop_settings = Arc::clone(&settings);
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let mut first = true;
            let mut last_run: Option<(Instant, Duration)> = None;
            loop {
                let delay = {
                    let current = *loop_settings.lock();
                    next_delay(&current, first, last_run)
                };
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep(delay) => {}
                }

                let started = Instant::now();
                let period = loop_settings.lock().period;
                tokio::select! {
                    _ = stop_rx.changed() => {
                        tracing::debug!(task = %task_name, "periodic task cancelled mid-iteration");
                        break;
                    }
                    result = body() => {
                        if let Err(err) = result {
                            tracing::warn!(
                                task = %task_name,
                                error = format!("{err:#}"),
                                "periodic task iteration failed",
                            );
                        }
                    }
                }
                first = false;
                last_run = Some((started, period));
            }
        });

        *running = Some(RunningTask {
            name,
            settings,
            stop_tx,
            handle,
        });
    }

    /// Re-tunes a running task without restarting it; applies from the next
    /// scheduling decision. A no-op if the task is not running.
    pub fn set_settings(&self, settings: Settings) {
        if let Some(running) = self.running.lock().as_ref() {
            *running.settings.lock() = settings;
        }
    }

    /// Stops the task. Idempotent; on return the body is not running.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else { return };

        let _ = running.stop_tx.send(());
        if let Err(err) = running.handle.await {
            tracing::error!(
                task = %running.name,
                error = &err as &dyn std::error::Error,
                "periodic task panicked",
            );
        }
    }
}

fn next_delay(settings: &Settings, first: bool, last_run: Option<(Instant, Duration)>) -> Duration {
    if first && settings.flags.now {
        return Duration::ZERO;
    }

    let mut delay = settings.period;
    if settings.flags.chaotic && !settings.jitter.is_zero() {
        let jitter_us = settings.jitter.as_micros() as i64;
        let offset = rand::rng().random_range(-jitter_us..=jitter_us);
        delay = if offset < 0 {
            delay.saturating_sub(Duration::from_micros(offset.unsigned_abs()))
        } else {
            delay.saturating_add(Duration::from_micros(offset as u64))
        };
    }

    // A critical task keeps its cadence: time spent in the body counts against
    // the delay, so an overrunning body never causes a tick to be dropped.
    if settings.flags.critical {
        if let Some((started, period)) = last_run {
            let elapsed = started.elapsed();
            if elapsed >= period {
                return Duration::ZERO;
            }
            delay = delay.saturating_sub(elapsed);
        }
    }

    delay
}
