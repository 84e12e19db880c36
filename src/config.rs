use crate::errors::{AppError, AppResult};
use crate::schedule::FireTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "HABIT_ROLLOVER_CONFIG";
pub const TIMEZONE_ENV: &str = "HABIT_ROLLOVER_TZ";
const DEFAULT_CONFIG_PATH: &str = "rollover.yaml";
const MAX_BACKLOG_DAYS: u32 = 31;
const MAX_GRACE_SECS: u64 = 24 * 60 * 60;
const MAX_EXECUTION_TIMEOUT_SECS: u64 = 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct RolloverConfig {
    pub database_path: PathBuf,
    pub fire_time: String,
    pub timezone: String,
    pub recovery_grace_secs: u64,
    pub recovery_backlog_days: u32,
    pub execution_timeout_secs: u64,
    pub log_dir: Option<PathBuf>,
}

impl Default for RolloverConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("rollover.sqlite"),
            fire_time: "00:00".to_string(),
            timezone: "UTC".to_string(),
            recovery_grace_secs: 60,
            recovery_backlog_days: 1,
            execution_timeout_secs: 30,
            log_dir: None,
        }
    }
}

impl RolloverConfig {
    /// Loads the file named by `HABIT_ROLLOVER_CONFIG` (or `rollover.yaml`).
    /// A missing file falls back to defaults; a malformed one is an error.
    pub fn from_env() -> AppResult<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = if Path::new(&path).exists() {
            Self::load(Path::new(&path))?
        } else {
            tracing::info!(path = %path, "config file not found, using defaults");
            Self::default()
        };
        if let Ok(timezone) = std::env::var(TIMEZONE_ENV) {
            config.timezone = timezone;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = fs::read_to_string(path)?;
        let config = Self::parse(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(raw: &str) -> AppResult<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn validate(&self) -> AppResult<()> {
        self.tz()?;
        self.fire_time()?;
        if self.recovery_backlog_days == 0 || self.recovery_backlog_days > MAX_BACKLOG_DAYS {
            return Err(AppError::Config(format!(
                "recovery_backlog_days must be between 1 and {}, got {}",
                MAX_BACKLOG_DAYS, self.recovery_backlog_days
            )));
        }
        if self.recovery_grace_secs > MAX_GRACE_SECS {
            return Err(AppError::Config(format!(
                "recovery_grace_secs must be at most {}, got {}",
                MAX_GRACE_SECS, self.recovery_grace_secs
            )));
        }
        if self.execution_timeout_secs == 0 || self.execution_timeout_secs > MAX_EXECUTION_TIMEOUT_SECS {
            return Err(AppError::Config(format!(
                "execution_timeout_secs must be between 1 and {}, got {}",
                MAX_EXECUTION_TIMEOUT_SECS, self.execution_timeout_secs
            )));
        }
        Ok(())
    }

    pub fn tz(&self) -> AppResult<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| AppError::Config(format!("unknown timezone '{}'", self.timezone)))
    }

    pub fn fire_time(&self) -> AppResult<FireTime> {
        self.fire_time.parse()
    }

    pub fn recovery_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.recovery_grace_secs.min(MAX_GRACE_SECS) as i64)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }
}
