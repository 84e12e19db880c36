use crate::errors::{AppError, AppResult};
use crate::models::{
    ArchivedDailyRecord, HabitFlags, LiveDailyRecord, RunRecord, RunStats, RunStatus, RunTrigger,
};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

const SCHEMA_SQL: &str = include_str!("schema.sql");
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

const RUN_COLUMNS: &str = "run_date, attempt_id, trigger_source, status, users_processed, total_points, total_steps, total_notes, error_detail, duration_ms, attempts, executed_at";

/// Identity of one executor attempt, carried into the ledger row it produces.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub attempt_id: String,
    pub trigger: RunTrigger,
    pub started: Instant,
}

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    stall_timeout: Duration,
}

impl Database {
    /// `stall_timeout` bounds both the wait for the in-process connection and
    /// SQLite's wait on another connection's write lock.
    pub fn new(path: &Path, stall_timeout: Duration) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
            }
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.busy_timeout(stall_timeout)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
            stall_timeout,
        })
    }

    /// Runs `work` on the blocking pool so async callers never wait on the
    /// connection from a runtime worker.
    pub async fn call<T, F>(self: &Arc<Self>, work: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> AppResult<T> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || work(&db))
            .await
            .map_err(|error| AppError::Internal(format!("database task aborted: {}", error)))?
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        let deadline = Instant::now() + self.stall_timeout;
        loop {
            match self.conn.try_lock() {
                Ok(conn) => return Ok(conn),
                Err(TryLockError::Poisoned(_)) => {
                    return Err(AppError::Internal("database mutex poisoned".to_string()))
                }
                Err(TryLockError::WouldBlock) if Instant::now() >= deadline => {
                    return Err(AppError::Execution(format!(
                        "database connection busy for more than {}ms",
                        self.stall_timeout.as_millis()
                    )))
                }
                Err(TryLockError::WouldBlock) => std::thread::sleep(LOCK_POLL_INTERVAL),
            }
        }
    }

    pub fn get_reset_run(&self, run_date: NaiveDate) -> AppResult<Option<RunRecord>> {
        let conn = self.lock()?;
        select_run(&conn, run_date).map_err(AppError::from)
    }

    pub fn list_reset_runs(&self, limit: u32) -> AppResult<Vec<RunRecord>> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(&format!(
            "SELECT {} FROM reset_runs ORDER BY run_date DESC LIMIT ?1",
            RUN_COLUMNS
        ))?;
        let rows = statement.query_map([limit], parse_run_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Writes the outcome of an attempt. A completed row is never replaced;
    /// returns `false` when the write was refused for that reason.
    pub fn record_reset_run(&self, record: &RunRecord) -> AppResult<bool> {
        let conn = self.lock()?;
        let changed = upsert_run(&conn, record).map_err(|err| AppError::Logging(err.to_string()))?;
        Ok(changed > 0)
    }

    /// Archives, zeroes and clears every row for `run_date` in one immediate
    /// transaction, committing the completed ledger row alongside.
    ///
    /// Returns `Ok(None)` when the ledger already shows the date completed
    /// once the write lock is held.
    pub fn archive_and_reset(&self, run_date: NaiveDate, attempt: &Attempt) -> AppResult<Option<RunRecord>> {
        let mut conn = self.lock()?;
        archive_and_reset_tx(&mut conn, run_date, attempt).map_err(|err| AppError::Execution(err.to_string()))
    }

    pub fn upsert_live_record(&self, record: &LiveDailyRecord) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO live_daily_records (
               user_id, record_date, points, steps, training, nutrition, movement, meditation, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(user_id, record_date) DO UPDATE SET
               points = excluded.points,
               steps = excluded.steps,
               training = excluded.training,
               nutrition = excluded.nutrition,
               movement = excluded.movement,
               meditation = excluded.meditation,
               updated_at = excluded.updated_at",
            params![
                record.user_id,
                record.date.to_string(),
                record.points,
                record.steps,
                record.habits.training,
                record.habits.nutrition,
                record.habits.movement,
                record.habits.meditation,
                record.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_live_record(&self, user_id: &str, date: NaiveDate) -> AppResult<Option<LiveDailyRecord>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT user_id, record_date, points, steps, training, nutrition, movement, meditation, updated_at
             FROM live_daily_records WHERE user_id = ?1 AND record_date = ?2",
            params![user_id, date.to_string()],
            |row| {
                Ok(LiveDailyRecord {
                    user_id: row.get(0)?,
                    date: parse_date(&row.get::<_, String>(1)?)?,
                    points: row.get(2)?,
                    steps: row.get(3)?,
                    habits: parse_habits(row, 4)?,
                    updated_at: parse_time(&row.get::<_, String>(8)?)?,
                })
            },
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn save_note(&self, user_id: &str, date: NaiveDate, content: &str) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO daily_notes (user_id, note_date, content, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, note_date) DO UPDATE SET content = excluded.content, updated_at = excluded.updated_at",
            params![user_id, date.to_string(), content, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_note(&self, user_id: &str, date: NaiveDate) -> AppResult<Option<String>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT content FROM daily_notes WHERE user_id = ?1 AND note_date = ?2",
            params![user_id, date.to_string()],
            |row| row.get(0),
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn get_archived_record(&self, user_id: &str, date: NaiveDate) -> AppResult<Option<ArchivedDailyRecord>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT user_id, record_date, points, steps, training, nutrition, movement, meditation, note, archived_at
             FROM archived_daily_records WHERE user_id = ?1 AND record_date = ?2",
            params![user_id, date.to_string()],
            parse_archived_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_archived_records(&self, date: NaiveDate) -> AppResult<Vec<ArchivedDailyRecord>> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(
            "SELECT user_id, record_date, points, steps, training, nutrition, movement, meditation, note, archived_at
             FROM archived_daily_records WHERE record_date = ?1 ORDER BY user_id ASC",
        )?;
        let records = statement
            .query_map([date.to_string()], parse_archived_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    #[cfg(test)]
    pub(crate) fn execute_batch_for_tests(&self, sql: &str) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(sql)?;
        Ok(())
    }
}

struct ArchiveSource {
    user_id: String,
    points: i64,
    steps: i64,
    habits: HabitFlags,
    note: Option<String>,
}

fn archive_and_reset_tx(
    conn: &mut Connection,
    run_date: NaiveDate,
    attempt: &Attempt,
) -> rusqlite::Result<Option<RunRecord>> {
    let date_key = run_date.to_string();
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let current_status: Option<String> = tx
        .query_row(
            "SELECT status FROM reset_runs WHERE run_date = ?1",
            [&date_key],
            |row| row.get(0),
        )
        .optional()?;
    if current_status.as_deref() == Some(RunStatus::Completed.as_str()) {
        return Ok(None);
    }

    // Notes without a live row are archived with zero counters so the delete
    // below never drops unarchived text.
    let mut stmt = tx.prepare(
        "SELECT l.user_id, l.points, l.steps, l.training, l.nutrition, l.movement, l.meditation, n.content
         FROM live_daily_records l
         LEFT JOIN daily_notes n ON n.user_id = l.user_id AND n.note_date = l.record_date
         WHERE l.record_date = ?1
         UNION ALL
         SELECT n.user_id, 0, 0, 0, 0, 0, 0, n.content
         FROM daily_notes n
         WHERE n.note_date = ?1
           AND NOT EXISTS (
             SELECT 1 FROM live_daily_records l
             WHERE l.user_id = n.user_id AND l.record_date = n.note_date
           )
         ORDER BY 1",
    )?;
    let sources = stmt
        .query_map([&date_key], |row| {
            Ok(ArchiveSource {
                user_id: row.get(0)?,
                points: row.get(1)?,
                steps: row.get(2)?,
                habits: parse_habits(row, 3)?,
                note: row.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);

    let archived_at = Utc::now().to_rfc3339();
    let mut stats = RunStats::default();
    for source in &sources {
        tx.execute(
            "INSERT INTO archived_daily_records (
               user_id, record_date, points, steps, training, nutrition, movement, meditation, note, archived_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(user_id, record_date) DO UPDATE SET
               points = excluded.points,
               steps = excluded.steps,
               training = excluded.training,
               nutrition = excluded.nutrition,
               movement = excluded.movement,
               meditation = excluded.meditation,
               note = excluded.note,
               archived_at = excluded.archived_at",
            params![
                source.user_id,
                date_key,
                source.points,
                source.steps,
                source.habits.training,
                source.habits.nutrition,
                source.habits.movement,
                source.habits.meditation,
                source.note,
                archived_at,
            ],
        )?;
        stats.users_processed += 1;
        stats.total_points += source.points;
        stats.total_steps += source.steps;
        if source.note.as_deref().is_some_and(|note| !note.trim().is_empty()) {
            stats.total_notes += 1;
        }
    }

    tx.execute(
        "UPDATE live_daily_records
         SET points = 0, steps = 0, training = 0, nutrition = 0, movement = 0, meditation = 0, updated_at = ?2
         WHERE record_date = ?1",
        params![date_key, archived_at],
    )?;
    tx.execute("DELETE FROM daily_notes WHERE note_date = ?1", [&date_key])?;

    let record = RunRecord {
        run_date,
        attempt_id: attempt.attempt_id.clone(),
        trigger: attempt.trigger,
        status: RunStatus::Completed,
        stats,
        error_detail: None,
        duration_ms: attempt.started.elapsed().as_millis() as i64,
        attempts: 1,
        executed_at: Utc::now(),
    };
    upsert_run(&tx, &record)?;
    let stored = select_run(&tx, run_date)?;
    tx.commit()?;
    Ok(stored)
}

fn upsert_run(conn: &Connection, record: &RunRecord) -> rusqlite::Result<usize> {
    conn.execute(
        &format!(
            "INSERT INTO reset_runs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1, ?11)
             ON CONFLICT(run_date) DO UPDATE SET
               attempt_id = excluded.attempt_id,
               trigger_source = excluded.trigger_source,
               status = excluded.status,
               users_processed = excluded.users_processed,
               total_points = excluded.total_points,
               total_steps = excluded.total_steps,
               total_notes = excluded.total_notes,
               error_detail = excluded.error_detail,
               duration_ms = excluded.duration_ms,
               attempts = reset_runs.attempts + 1,
               executed_at = excluded.executed_at
             WHERE reset_runs.status != 'completed'",
            RUN_COLUMNS
        ),
        params![
            record.run_date.to_string(),
            record.attempt_id,
            record.trigger.as_str(),
            record.status.as_str(),
            record.stats.users_processed,
            record.stats.total_points,
            record.stats.total_steps,
            record.stats.total_notes,
            record.error_detail,
            record.duration_ms,
            record.executed_at.to_rfc3339(),
        ],
    )
}

fn select_run(conn: &Connection, run_date: NaiveDate) -> rusqlite::Result<Option<RunRecord>> {
    conn.query_row(
        &format!("SELECT {} FROM reset_runs WHERE run_date = ?1", RUN_COLUMNS),
        [run_date.to_string()],
        parse_run_row,
    )
    .optional()
}

fn parse_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        run_date: parse_date(&row.get::<_, String>(0)?)?,
        attempt_id: row.get(1)?,
        trigger: parse_trigger(&row.get::<_, String>(2)?),
        status: parse_status(&row.get::<_, String>(3)?),
        stats: RunStats {
            users_processed: row.get(4)?,
            total_points: row.get(5)?,
            total_steps: row.get(6)?,
            total_notes: row.get(7)?,
        },
        error_detail: row.get(8)?,
        duration_ms: row.get(9)?,
        attempts: row.get(10)?,
        executed_at: parse_time(&row.get::<_, String>(11)?)?,
    })
}

fn parse_archived_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ArchivedDailyRecord> {
    Ok(ArchivedDailyRecord {
        user_id: row.get(0)?,
        date: parse_date(&row.get::<_, String>(1)?)?,
        points: row.get(2)?,
        steps: row.get(3)?,
        habits: parse_habits(row, 4)?,
        note: row.get(8)?,
        archived_at: parse_time(&row.get::<_, String>(9)?)?,
    })
}

fn parse_habits(row: &rusqlite::Row<'_>, first: usize) -> rusqlite::Result<HabitFlags> {
    Ok(HabitFlags {
        training: row.get::<_, i32>(first)? != 0,
        nutrition: row.get::<_, i32>(first + 1)? != 0,
        movement: row.get::<_, i32>(first + 2)? != 0,
        meditation: row.get::<_, i32>(first + 3)? != 0,
    })
}

fn parse_status(raw: &str) -> RunStatus {
    match raw {
        "completed" => RunStatus::Completed,
        "partial" => RunStatus::Partial,
        _ => RunStatus::Failed,
    }
}

fn parse_trigger(raw: &str) -> RunTrigger {
    match raw {
        "scheduled" => RunTrigger::Scheduled,
        "recovery" => RunTrigger::Recovery,
        _ => RunTrigger::Manual,
    }
}

fn parse_date(raw: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|error| conversion_error(error.to_string()))
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| conversion_error(error.to_string()))
}

fn conversion_error(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}
