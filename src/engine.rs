use crate::config::RolloverConfig;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::executor::ResetExecutor;
use crate::models::{RecoveryReport, ResetOutcome, RunRecord, RunTrigger};
use crate::recovery::RecoverySentinel;
use crate::schedule::{Clock, FireTime, SystemClock};
use crate::trigger::{DailyTrigger, TriggerCallback, TriggerHandle};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use std::sync::{Arc, Mutex};

/// Host-facing surface of the rollover subsystem.
pub struct RolloverEngine {
    config: RolloverConfig,
    db: Arc<Database>,
    executor: Arc<ResetExecutor>,
    clock: Arc<dyn Clock>,
    tz: Tz,
    fire_time: FireTime,
    trigger: Mutex<Option<TriggerHandle>>,
}

impl RolloverEngine {
    pub fn new(config: RolloverConfig) -> AppResult<Arc<Self>> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RolloverConfig, clock: Arc<dyn Clock>) -> AppResult<Arc<Self>> {
        config.validate()?;
        let tz = config.tz()?;
        let fire_time = config.fire_time()?;
        let db = Arc::new(Database::new(&config.database_path, config.execution_timeout())?);
        let executor = Arc::new(ResetExecutor::new(db.clone(), clock.clone(), tz));

        tracing::info!(
            database = %db.path().display(),
            fire_time = %fire_time,
            timezone = %tz,
            backlog_days = config.recovery_backlog_days,
            "rollover engine initialized"
        );

        Ok(Arc::new(Self {
            config,
            db,
            executor,
            clock,
            tz,
            fire_time,
            trigger: Mutex::new(None),
        }))
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Startup sequence: close any downtime gap, then arm the daily trigger.
    pub async fn launch(&self) -> AppResult<RecoveryReport> {
        let report = self.recover().await;
        self.start()?;
        Ok(report)
    }

    pub async fn recover(&self) -> RecoveryReport {
        RecoverySentinel::new(
            self.executor.clone(),
            self.db.clone(),
            self.clock.clone(),
            self.tz,
            self.fire_time,
        )
        .with_grace(self.config.recovery_grace())
        .with_backlog_days(self.config.recovery_backlog_days)
        .run()
        .await
    }

    /// Arms the trigger on first call; later calls resume a stopped trigger.
    pub fn start(&self) -> AppResult<()> {
        let mut trigger = self
            .trigger
            .lock()
            .map_err(|_| AppError::Internal("trigger mutex poisoned".to_string()))?;
        if trigger.is_none() {
            let handle = DailyTrigger::new(self.fire_time, self.tz)
                .with_grace(self.config.recovery_grace())
                .with_clock(self.clock.clone())
                .schedule(self.trigger_callback());
            *trigger = Some(handle);
        } else if let Some(handle) = trigger.as_ref() {
            handle.start();
        }
        trigger
            .as_ref()
            .map_or_else(|| Err(AppError::Scheduling("trigger not armed".to_string())), TriggerHandle::ensure_alive)
    }

    pub fn stop(&self) {
        if let Ok(trigger) = self.trigger.lock() {
            if let Some(handle) = trigger.as_ref() {
                handle.stop();
                tracing::info!("daily rollover trigger paused");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.trigger
            .lock()
            .ok()
            .and_then(|trigger| trigger.as_ref().map(TriggerHandle::is_running))
            .unwrap_or(false)
    }

    pub fn next_fire_at(&self) -> Option<DateTime<Utc>> {
        self.trigger
            .lock()
            .ok()
            .and_then(|trigger| trigger.as_ref().and_then(TriggerHandle::next_fire_at))
    }

    pub fn shutdown(&self) {
        if let Ok(mut trigger) = self.trigger.lock() {
            if let Some(handle) = trigger.take() {
                handle.shutdown();
            }
        }
    }

    pub async fn force_reset(&self, date: Option<NaiveDate>) -> ResetOutcome {
        self.executor.force_reset(date).await
    }

    pub async fn get_reset_history(&self, limit: u32) -> AppResult<Vec<RunRecord>> {
        let limit = limit.max(1);
        self.db.call(move |db| db.list_reset_runs(limit)).await
    }

    pub async fn get_reset_status(&self, date: NaiveDate) -> AppResult<Option<RunRecord>> {
        self.db.call(move |db| db.get_reset_run(date)).await
    }

    fn trigger_callback(&self) -> TriggerCallback {
        let weak = Arc::downgrade(&self.executor);
        Arc::new(move |date: NaiveDate| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(executor) = weak.upgrade() else {
                    return Err(AppError::Scheduling("rollover executor dropped".to_string()));
                };
                match executor.execute(date, RunTrigger::Scheduled).await {
                    ResetOutcome::Failed { record } => Err(AppError::Execution(
                        record.error_detail.unwrap_or_else(|| "rollover failed".to_string()),
                    )),
                    _ => Ok(()),
                }
            })
        })
    }
}

impl Drop for RolloverEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::RolloverEngine;
    use crate::config::RolloverConfig;
    use crate::models::{HabitFlags, LiveDailyRecord, RunRecord, RunStatus, RunTrigger};
    use crate::schedule::FixedClock;
    use chrono::{NaiveDate, TimeZone, Utc};
    use std::sync::Arc;
    use std::time::Duration;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("date")
    }

    fn engine_at_fire_instant(dir: &tempfile::TempDir) -> Arc<RolloverEngine> {
        let config = RolloverConfig {
            database_path: dir.path().join("rollover.sqlite"),
            fire_time: "22:00".to_string(),
            timezone: "UTC".to_string(),
            ..RolloverConfig::default()
        };
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 22, 0, 0).single().expect("now"),
        ));
        let engine = RolloverEngine::with_clock(config, clock).expect("engine");
        engine
            .database()
            .upsert_live_record(&LiveDailyRecord {
                user_id: "alice".to_string(),
                date: date(2024, 6, 1),
                points: 3,
                steps: 4200,
                habits: HabitFlags {
                    training: true,
                    ..HabitFlags::default()
                },
                updated_at: Utc::now(),
            })
            .expect("seed");
        engine
    }

    async fn wait_for_run(engine: &RolloverEngine, day: NaiveDate) -> RunRecord {
        for _ in 0..100 {
            if let Some(run) = engine.get_reset_status(day).await.expect("status") {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no ledger row for {day}");
    }

    #[tokio::test]
    async fn scheduled_firing_archives_and_records_the_day() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine_at_fire_instant(&dir);

        engine.start().expect("start");
        let run = wait_for_run(&engine, date(2024, 6, 1)).await;
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.trigger, RunTrigger::Scheduled);
        assert_eq!(run.stats.users_processed, 1);
        assert_eq!(run.stats.total_points, 3);

        let live = engine
            .database()
            .get_live_record("alice", date(2024, 6, 1))
            .expect("get")
            .expect("live");
        assert_eq!(live.points, 0);
        engine.shutdown();
    }

    #[tokio::test]
    async fn failed_scheduled_run_keeps_the_trigger_armed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine_at_fire_instant(&dir);
        engine
            .database()
            .execute_batch_for_tests(
                "CREATE TRIGGER reject_archive BEFORE INSERT ON archived_daily_records
                 BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
            )
            .expect("install trigger");

        engine.start().expect("start");
        let run = wait_for_run(&engine, date(2024, 6, 1)).await;
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.trigger, RunTrigger::Scheduled);
        assert!(run.error_detail.as_deref().is_some_and(|detail| detail.contains("disk I/O error")));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.is_running());
        assert!(engine.start().is_ok());
        assert_eq!(
            engine.next_fire_at(),
            Utc.with_ymd_and_hms(2024, 6, 2, 22, 0, 0).single()
        );
        engine.shutdown();
    }
}
