use crate::errors::{AppError, AppResult};
use crate::schedule::{next_fire, Clock, FireTime, SystemClock};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Upper bound on a single sleep so clock jumps and suspend are noticed.
const MAX_SLEEP_SLICE: Duration = Duration::from_secs(60);

pub type TriggerFuture = Pin<Box<dyn Future<Output = AppResult<()>> + Send>>;
pub type TriggerCallback = Arc<dyn Fn(NaiveDate) -> TriggerFuture + Send + Sync>;

/// Fires a callback once per civil day at a local wall-clock time.
#[derive(Clone)]
pub struct DailyTrigger {
    fire_time: FireTime,
    tz: Tz,
    grace: chrono::Duration,
    clock: Arc<dyn Clock>,
}

struct Shared {
    enabled: AtomicBool,
    shutdown: AtomicBool,
    notify: Notify,
    next_fire_at: Mutex<Option<DateTime<Utc>>>,
}

impl Shared {
    fn set_next_fire(&self, at: Option<DateTime<Utc>>) {
        if let Ok(mut next) = self.next_fire_at.lock() {
            *next = at;
        }
    }
}

pub struct TriggerHandle {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DailyTrigger {
    pub fn new(fire_time: FireTime, tz: Tz) -> Self {
        Self {
            fire_time,
            tz,
            grace: chrono::Duration::zero(),
            clock: Arc::new(SystemClock),
        }
    }

    /// A fire instant at most `grace` in the past still fires immediately.
    pub fn with_grace(mut self, grace: chrono::Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Spawns the firing loop on the current tokio runtime, already running.
    pub fn schedule(self, callback: TriggerCallback) -> TriggerHandle {
        let shared = Arc::new(Shared {
            enabled: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
            next_fire_at: Mutex::new(None),
        });
        tracing::info!(
            fire_time = %self.fire_time,
            timezone = %self.tz,
            "daily rollover trigger scheduled"
        );
        let task = tokio::spawn(self.run_loop(shared.clone(), callback));
        TriggerHandle {
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    /// The target picked before sleeping is kept across wake-ups and fires
    /// once the clock reaches it. A fresh target is picked only after a firing
    /// or a start/stop, and only then does the grace margin apply.
    async fn run_loop(self, shared: Arc<Shared>, callback: TriggerCallback) {
        let mut last_fired: Option<NaiveDate> = None;
        let mut pending: Option<(NaiveDate, DateTime<Utc>)> = None;
        loop {
            if shared.shutdown.load(Ordering::Acquire) {
                break;
            }
            if !shared.enabled.load(Ordering::Acquire) {
                pending = None;
                shared.set_next_fire(None);
                shared.notify.notified().await;
                continue;
            }

            let now = self.clock.now();
            let (target, at) = match pending {
                Some(chosen) => chosen,
                None => {
                    let chosen = next_fire(now, self.fire_time, self.tz, last_fired, self.grace);
                    pending = Some(chosen);
                    chosen
                }
            };
            shared.set_next_fire(Some(at));

            if now < at {
                let wait = (at - now).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(wait.min(MAX_SLEEP_SLICE)) => {}
                    _ = shared.notify.notified() => pending = None,
                }
                continue;
            }

            pending = None;
            last_fired = Some(target);
            fire(&callback, target).await;
        }
        shared.set_next_fire(None);
        tracing::info!("daily rollover trigger shut down");
    }
}

/// Errors and panics from the callback are logged; the loop keeps going.
async fn fire(callback: &TriggerCallback, target: NaiveDate) {
    tracing::info!(date = %target, "daily rollover trigger fired");
    match tokio::spawn(callback(target)).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            tracing::error!(date = %target, error = %error, "scheduled rollover failed, trigger stays armed");
        }
        Err(join_error) => {
            tracing::error!(date = %target, error = %join_error, "scheduled rollover panicked, trigger stays armed");
        }
    }
}

impl TriggerHandle {
    /// Resumes firing. Also forces the loop to re-read the clock.
    pub fn start(&self) {
        self.shared.enabled.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }

    /// Pauses firing; the schedule and the last fired date are kept.
    pub fn stop(&self) {
        self.shared.enabled.store(false, Ordering::Release);
        self.shared.notify.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.shared.enabled.load(Ordering::Acquire) && !self.shared.shutdown.load(Ordering::Acquire)
    }

    pub fn next_fire_at(&self) -> Option<DateTime<Utc>> {
        self.shared.next_fire_at.lock().ok().and_then(|next| *next)
    }

    /// Fails with a scheduling error when the firing loop is gone without
    /// having been shut down.
    pub fn ensure_alive(&self) -> AppResult<()> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(AppError::Scheduling("trigger has been shut down".to_string()));
        }
        let finished = self
            .task
            .lock()
            .map_err(|_| AppError::Internal("trigger task mutex poisoned".to_string()))?
            .as_ref()
            .map_or(true, |task| task.is_finished());
        if finished {
            return Err(AppError::Scheduling("trigger loop exited unexpectedly".to_string()));
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.notify.notify_one();
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

impl Drop for TriggerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
