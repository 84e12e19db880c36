use crate::db::Database;
use crate::executor::ResetExecutor;
use crate::models::{RecoveryEntry, RecoveryReport, ResetOutcome, RunTrigger};
use crate::schedule::{civil_date, deadline_for, Clock, FireTime};
use chrono::{Days, NaiveDate};
use chrono_tz::Tz;
use std::sync::Arc;

/// Startup pass that closes gaps left by downtime.
///
/// Scans `backlog_days` days before today (oldest first), then today itself.
/// A past date is run when it has no completed ledger row; today is run only
/// once its deadline plus the grace margin has passed, earlier than that the
/// trigger picks it up. Nothing here returns an error: failures are logged
/// and reported.
pub struct RecoverySentinel {
    executor: Arc<ResetExecutor>,
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    tz: Tz,
    fire_time: FireTime,
    grace: chrono::Duration,
    backlog_days: u32,
}

impl RecoverySentinel {
    pub fn new(
        executor: Arc<ResetExecutor>,
        db: Arc<Database>,
        clock: Arc<dyn Clock>,
        tz: Tz,
        fire_time: FireTime,
    ) -> Self {
        Self {
            executor,
            db,
            clock,
            tz,
            fire_time,
            grace: chrono::Duration::zero(),
            backlog_days: 1,
        }
    }

    pub fn with_grace(mut self, grace: chrono::Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_backlog_days(mut self, backlog_days: u32) -> Self {
        self.backlog_days = backlog_days.max(1);
        self
    }

    pub async fn run(&self) -> RecoveryReport {
        let now = self.clock.now();
        let today = civil_date(now, self.tz);
        let mut report = RecoveryReport::default();

        let oldest = today - Days::new(u64::from(self.backlog_days));
        tracing::info!(
            today = %today,
            oldest_scanned = %oldest,
            "recovery scan started, earlier dates are not checked"
        );

        for offset in (1..=self.backlog_days).rev() {
            let date = today - Days::new(u64::from(offset));
            if now < deadline_for(date, self.fire_time, self.tz) {
                report.entries.push(skipped(date, "deadline not reached"));
                continue;
            }
            report.entries.push(self.recover(date).await);
        }

        let today_due = deadline_for(today, self.fire_time, self.tz) + self.grace;
        if now >= today_due {
            report.entries.push(self.recover(today).await);
        } else {
            report.entries.push(skipped(today, "deadline not reached"));
        }

        tracing::info!(
            executed = report.executed_dates().len(),
            "recovery scan finished"
        );
        report
    }

    async fn recover(&self, date: NaiveDate) -> RecoveryEntry {
        match self.db.call(move |db| db.get_reset_run(date)).await {
            Ok(Some(existing)) if existing.status.is_terminal() => {
                return skipped(date, "already completed");
            }
            Ok(_) => {}
            Err(error) => {
                tracing::error!(date = %date, error = %error, "recovery could not read the run ledger");
                return skipped(date, "ledger unavailable");
            }
        }

        tracing::info!(event = "recovered", date = %date, "missed rollover detected, running now");
        let outcome = self.executor.execute(date, RunTrigger::Recovery).await;
        let reason = match &outcome {
            ResetOutcome::Completed { .. } => "recovered",
            ResetOutcome::Failed { .. } => {
                tracing::warn!(date = %date, "recovery run failed, date stays eligible for retry");
                "recovery failed"
            }
            ResetOutcome::SkippedAlreadyCompleted { .. } => "already completed",
            ResetOutcome::SkippedAlreadyRunning { .. } => "executor busy",
        };
        RecoveryEntry {
            date,
            outcome: Some(outcome),
            reason: reason.to_string(),
        }
    }
}

fn skipped(date: NaiveDate, reason: &str) -> RecoveryEntry {
    RecoveryEntry {
        date,
        outcome: None,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::RecoverySentinel;
    use crate::db::Database;
    use crate::executor::ResetExecutor;
    use crate::models::{RunRecord, RunStats, RunStatus, RunTrigger};
    use crate::schedule::{FireTime, FixedClock};
    use chrono::{DateTime, NaiveDate, TimeZone, Utc};
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<Database>,
        sentinel: RecoverySentinel,
    }

    fn fixture(now: DateTime<Utc>, backlog_days: u32) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("test.db"), Duration::from_secs(5)).expect("db"));
        let clock = Arc::new(FixedClock::new(now));
        let executor = Arc::new(ResetExecutor::new(db.clone(), clock.clone(), chrono_tz::UTC));
        let sentinel = RecoverySentinel::new(
            executor,
            db.clone(),
            clock,
            chrono_tz::UTC,
            FireTime::new(23, 0).expect("fire"),
        )
        .with_grace(chrono::Duration::minutes(5))
        .with_backlog_days(backlog_days);
        Fixture { _dir: dir, db, sentinel }
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).single().expect("utc")
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("date")
    }

    #[tokio::test]
    async fn runs_yesterday_before_today_when_both_were_missed() {
        let fx = fixture(utc(2024, 3, 11, 23, 30), 1);

        let report = fx.sentinel.run().await;
        assert_eq!(report.executed_dates(), vec![date(2024, 3, 10), date(2024, 3, 11)]);

        let history = fx.db.list_reset_runs(10).expect("history");
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|run| run.status == RunStatus::Completed));
        assert!(history.iter().all(|run| run.trigger == RunTrigger::Recovery));
        let yesterday = fx.db.get_reset_run(date(2024, 3, 10)).expect("get").expect("row");
        let today = fx.db.get_reset_run(date(2024, 3, 11)).expect("get").expect("row");
        assert!(yesterday.executed_at <= today.executed_at);
    }

    #[tokio::test]
    async fn runs_only_yesterday_before_todays_deadline() {
        let fx = fixture(utc(2024, 3, 11, 8, 0), 1);

        let report = fx.sentinel.run().await;
        assert_eq!(report.executed_dates(), vec![date(2024, 3, 10)]);
        assert!(fx.db.get_reset_run(date(2024, 3, 11)).expect("get").is_none());
    }

    #[tokio::test]
    async fn leaves_today_to_the_trigger_inside_the_grace_margin() {
        let fx = fixture(utc(2024, 3, 11, 23, 2), 1);

        let report = fx.sentinel.run().await;
        assert_eq!(report.executed_dates(), vec![date(2024, 3, 10)]);
    }

    #[tokio::test]
    async fn completed_dates_are_skipped_and_failed_dates_retried() {
        let fx = fixture(utc(2024, 3, 11, 23, 30), 1);
        fx.db
            .record_reset_run(&RunRecord {
                run_date: date(2024, 3, 10),
                attempt_id: "earlier".to_string(),
                trigger: RunTrigger::Scheduled,
                status: RunStatus::Failed,
                stats: RunStats::default(),
                error_detail: Some("connection reset".to_string()),
                duration_ms: 5,
                attempts: 1,
                executed_at: Utc::now(),
            })
            .expect("failed row");

        let first = fx.sentinel.run().await;
        assert_eq!(first.executed_dates(), vec![date(2024, 3, 10), date(2024, 3, 11)]);
        let retried = fx.db.get_reset_run(date(2024, 3, 10)).expect("get").expect("row");
        assert_eq!(retried.status, RunStatus::Completed);
        assert_eq!(retried.attempts, 2);

        let second = fx.sentinel.run().await;
        assert!(second.executed_dates().is_empty());
        assert!(second.entries.iter().all(|entry| entry.reason == "already completed"));
    }

    #[tokio::test]
    async fn wider_backlog_window_runs_oldest_first() {
        let fx = fixture(utc(2024, 3, 11, 12, 0), 3);

        let report = fx.sentinel.run().await;
        assert_eq!(
            report.executed_dates(),
            vec![date(2024, 3, 8), date(2024, 3, 9), date(2024, 3, 10)]
        );
    }

    #[tokio::test]
    async fn failed_recovery_is_reported_not_raised() {
        let fx = fixture(utc(2024, 3, 11, 8, 0), 1);
        fx.db
            .execute_batch_for_tests(
                "CREATE TRIGGER reject_reset BEFORE UPDATE ON live_daily_records
                 BEGIN SELECT RAISE(ABORT, 'database is locked'); END;",
            )
            .expect("trigger");
        fx.db
            .upsert_live_record(&crate::models::LiveDailyRecord {
                user_id: "U".to_string(),
                date: date(2024, 3, 10),
                points: 1,
                steps: 10,
                habits: Default::default(),
                updated_at: Utc::now(),
            })
            .expect("live");

        let report = fx.sentinel.run().await;
        let entry = &report.entries[0];
        assert_eq!(entry.date, date(2024, 3, 10));
        assert_eq!(entry.reason, "recovery failed");
        let ledger = fx.db.get_reset_run(date(2024, 3, 10)).expect("get").expect("row");
        assert_eq!(ledger.status, RunStatus::Failed);
    }
}
