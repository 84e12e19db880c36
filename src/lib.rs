pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod models;
pub mod recovery;
pub mod schedule;
pub mod trigger;

use crate::config::RolloverConfig;
use crate::engine::RolloverEngine;
use crate::errors::{AppError, AppResult};
use chrono::NaiveDate;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

const DEFAULT_HISTORY_LIMIT: u32 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCommand {
    Serve,
    Force(Option<NaiveDate>),
    History(u32),
    Status(NaiveDate),
}

impl HostCommand {
    pub fn parse(args: &[String]) -> AppResult<Self> {
        let mut args = args.iter().map(String::as_str);
        let command = match args.next() {
            None | Some("serve") => Self::Serve,
            Some("force") => Self::Force(args.next().map(parse_date).transpose()?),
            Some("history") => Self::History(
                args.next()
                    .map(|raw| {
                        raw.parse::<u32>()
                            .map_err(|_| AppError::Config(format!("invalid history limit '{}'", raw)))
                    })
                    .transpose()?
                    .unwrap_or(DEFAULT_HISTORY_LIMIT),
            ),
            Some("status") => {
                let raw = args
                    .next()
                    .ok_or_else(|| AppError::Config("status requires a YYYY-MM-DD date".to_string()))?;
                Self::Status(parse_date(raw)?)
            }
            Some(other) => {
                return Err(AppError::Config(format!(
                    "unknown command '{}', expected serve, force, history or status",
                    other
                )))
            }
        };
        if let Some(extra) = args.next() {
            return Err(AppError::Config(format!("unexpected argument '{}'", extra)));
        }
        Ok(command)
    }
}

fn parse_date(raw: &str) -> AppResult<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| AppError::Config(format!("invalid date '{}', expected YYYY-MM-DD", raw)))
}

pub async fn run(args: Vec<String>) -> AppResult<()> {
    let command = HostCommand::parse(&args)?;
    let config = RolloverConfig::from_env()?;
    init_tracing(config.log_dir.as_deref())?;
    let engine = RolloverEngine::new(config)?;

    match command {
        HostCommand::Serve => {
            let report = engine.launch().await?;
            tracing::info!(
                recovered = report.executed_dates().len(),
                next_fire_at = ?engine.next_fire_at(),
                "rollover host running"
            );
            tokio::signal::ctrl_c().await?;
            tracing::info!("shutdown requested");
            engine.stop();
            engine.shutdown();
        }
        HostCommand::Force(date) => {
            let outcome = engine.force_reset(date).await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        HostCommand::History(limit) => {
            let history = engine.get_reset_history(limit).await?;
            println!("{}", serde_json::to_string_pretty(&history)?);
        }
        HostCommand::Status(date) => {
            let status = engine.get_reset_status(date).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }
    Ok(())
}

fn init_tracing(log_dir: Option<&Path>) -> AppResult<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let installed = match log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir)?;
            let file_appender = tracing_appender::rolling::daily(log_dir, "rollover.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let _ = LOG_GUARD.set(guard);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .with_writer(non_blocking)
                .try_init()
        }
        None => tracing_subscriber::fmt().with_env_filter(filter).json().try_init(),
    };
    installed.map_err(|error| AppError::Internal(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::HostCommand;
    use chrono::NaiveDate;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn parses_host_commands() {
        assert_eq!(HostCommand::parse(&[]).expect("empty"), HostCommand::Serve);
        assert_eq!(HostCommand::parse(&args(&["force"])).expect("force"), HostCommand::Force(None));
        assert_eq!(
            HostCommand::parse(&args(&["force", "2024-03-10"])).expect("force date"),
            HostCommand::Force(NaiveDate::from_ymd_opt(2024, 3, 10))
        );
        assert_eq!(HostCommand::parse(&args(&["history"])).expect("history"), HostCommand::History(30));
        assert_eq!(HostCommand::parse(&args(&["history", "7"])).expect("limit"), HostCommand::History(7));
    }

    #[test]
    fn rejects_malformed_commands() {
        assert!(HostCommand::parse(&args(&["status"])).is_err());
        assert!(HostCommand::parse(&args(&["status", "10/03/2024"])).is_err());
        assert!(HostCommand::parse(&args(&["history", "many"])).is_err());
        assert!(HostCommand::parse(&args(&["rewind"])).is_err());
        assert!(HostCommand::parse(&args(&["force", "2024-03-10", "extra"])).is_err());
    }
}
