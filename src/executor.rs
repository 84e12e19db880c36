use crate::db::{Attempt, Database};
use crate::errors::{AppError, AppResult};
use crate::models::{ResetOutcome, RunRecord, RunStats, RunStatus, RunTrigger};
use crate::schedule::{civil_date, Clock};
use chrono::{NaiveDate, Utc};
use chrono_tz::Tz;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Archives and resets one civil day of habit counters.
///
/// At most one execution runs at a time per executor; overlapping calls
/// return [`ResetOutcome::SkippedAlreadyRunning`] without touching storage.
pub struct ResetExecutor {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    tz: Tz,
    busy: AtomicBool,
}

struct BusyGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl ResetExecutor {
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>, tz: Tz) -> Self {
        Self {
            db,
            clock,
            tz,
            busy: AtomicBool::new(false),
        }
    }

    pub fn today(&self) -> NaiveDate {
        civil_date(self.clock.now(), self.tz)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    fn try_acquire(&self) -> Option<BusyGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard { flag: &self.busy })
    }

    /// Operator entry point; targets today in the configured timezone when no
    /// date is given. A completed date is still left alone.
    pub async fn force_reset(&self, run_date: Option<NaiveDate>) -> ResetOutcome {
        let run_date = run_date.unwrap_or_else(|| self.today());
        self.execute(run_date, RunTrigger::Manual).await
    }

    pub async fn execute(&self, run_date: NaiveDate, trigger: RunTrigger) -> ResetOutcome {
        let Some(_guard) = self.try_acquire() else {
            tracing::info!(
                event = "skipped_already_running",
                date = %run_date,
                trigger = trigger.as_str(),
                "rollover already in progress, ignoring request"
            );
            return ResetOutcome::SkippedAlreadyRunning { date: run_date };
        };

        match self.db.call(move |db| db.get_reset_run(run_date)).await {
            Ok(Some(existing)) if existing.status.is_terminal() => {
                tracing::info!(
                    event = "skipped_already_completed",
                    date = %run_date,
                    trigger = trigger.as_str(),
                    "rollover already completed for date"
                );
                return ResetOutcome::SkippedAlreadyCompleted { date: run_date };
            }
            Ok(existing) => {
                if let Some(previous) = existing {
                    tracing::info!(
                        date = %run_date,
                        previous_status = previous.status.as_str(),
                        previous_attempts = previous.attempts,
                        "retrying rollover after unsuccessful attempt"
                    );
                }
            }
            // The transaction re-checks the ledger under its write lock.
            Err(error) => {
                tracing::warn!(date = %run_date, error = %error, "ledger pre-check failed");
            }
        }

        let attempt = Attempt {
            attempt_id: Uuid::new_v4().to_string(),
            trigger,
            started: Instant::now(),
        };
        tracing::info!(
            event = "fired",
            date = %run_date,
            trigger = trigger.as_str(),
            attempt_id = %attempt.attempt_id,
            "rollover started"
        );

        match self.run_transaction(run_date, &attempt).await {
            Ok(Some(record)) => {
                tracing::info!(
                    event = "completed",
                    date = %run_date,
                    attempt_id = %attempt.attempt_id,
                    users = record.stats.users_processed,
                    points = record.stats.total_points,
                    steps = record.stats.total_steps,
                    notes = record.stats.total_notes,
                    duration_ms = record.duration_ms,
                    "rollover completed"
                );
                ResetOutcome::Completed { record }
            }
            Ok(None) => {
                tracing::info!(
                    event = "skipped_already_completed",
                    date = %run_date,
                    attempt_id = %attempt.attempt_id,
                    "rollover completed elsewhere before lock was acquired"
                );
                ResetOutcome::SkippedAlreadyCompleted { date: run_date }
            }
            Err(error) => {
                tracing::error!(
                    event = "failed",
                    date = %run_date,
                    attempt_id = %attempt.attempt_id,
                    error = %error,
                    "rollover failed, transaction rolled back"
                );
                let record = self.record_failure(run_date, &attempt, &error).await;
                ResetOutcome::Failed { record }
            }
        }
    }

    async fn run_transaction(&self, run_date: NaiveDate, attempt: &Attempt) -> AppResult<Option<RunRecord>> {
        let attempt = attempt.clone();
        self.db
            .call(move |db| db.archive_and_reset(run_date, &attempt))
            .await
    }

    /// Best effort: a ledger write failure is logged and never replaces the
    /// original execution error.
    async fn record_failure(&self, run_date: NaiveDate, attempt: &Attempt, error: &AppError) -> RunRecord {
        let record = RunRecord {
            run_date,
            attempt_id: attempt.attempt_id.clone(),
            trigger: attempt.trigger,
            status: RunStatus::Failed,
            stats: RunStats::default(),
            error_detail: Some(error.to_string()),
            duration_ms: attempt.started.elapsed().as_millis() as i64,
            attempts: 1,
            executed_at: Utc::now(),
        };

        let pending = record.clone();
        let written = self
            .db
            .call(move |db| {
                if !db.record_reset_run(&pending)? {
                    return Ok(None);
                }
                Ok(Some(db.get_reset_run(run_date).ok().flatten().unwrap_or(pending)))
            })
            .await;

        match written {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                tracing::warn!(
                    event = "ledger_write_failed",
                    date = %run_date,
                    "ledger already holds a completed run, failure not recorded"
                );
                record
            }
            Err(log_error) => {
                tracing::error!(
                    event = "ledger_write_failed",
                    date = %run_date,
                    error = %log_error,
                    "failed to record rollover failure"
                );
                record
            }
        }
    }
}
