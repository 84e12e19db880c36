use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Completed,
    Failed,
    /// Never written by the executor; reserved for external writers and
    /// treated like `Failed`.
    Partial,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Partial => "partial",
        }
    }

    /// Only a completed run blocks further attempts for its date.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunTrigger {
    Scheduled,
    Recovery,
    Manual,
}

impl RunTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Recovery => "recovery",
            Self::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    pub users_processed: i64,
    pub total_points: i64,
    pub total_steps: i64,
    pub total_notes: i64,
}

/// One row of the run ledger. At most one exists per `run_date`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_date: NaiveDate,
    pub attempt_id: String,
    pub trigger: RunTrigger,
    pub status: RunStatus,
    pub stats: RunStats,
    pub error_detail: Option<String>,
    pub duration_ms: i64,
    pub attempts: i64,
    pub executed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HabitFlags {
    pub training: bool,
    pub nutrition: bool,
    pub movement: bool,
    pub meditation: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveDailyRecord {
    pub user_id: String,
    pub date: NaiveDate,
    pub points: i64,
    pub steps: i64,
    pub habits: HabitFlags,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedDailyRecord {
    pub user_id: String,
    pub date: NaiveDate,
    pub points: i64,
    pub steps: i64,
    pub habits: HabitFlags,
    pub note: Option<String>,
    pub archived_at: DateTime<Utc>,
}

/// What a single executor invocation did for its target date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum ResetOutcome {
    Completed { record: RunRecord },
    Failed { record: RunRecord },
    SkippedAlreadyCompleted { date: NaiveDate },
    SkippedAlreadyRunning { date: NaiveDate },
}

impl ResetOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    pub fn record(&self) -> Option<&RunRecord> {
        match self {
            Self::Completed { record } | Self::Failed { record } => Some(record),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryEntry {
    pub date: NaiveDate,
    pub outcome: Option<ResetOutcome>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub entries: Vec<RecoveryEntry>,
}

impl RecoveryReport {
    pub fn executed_dates(&self) -> Vec<NaiveDate> {
        self.entries
            .iter()
            .filter(|entry| entry.outcome.is_some())
            .map(|entry| entry.date)
            .collect()
    }
}
