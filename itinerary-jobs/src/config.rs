//! Process configuration, read from the environment.
use std::{path::PathBuf, str::FromStr, time::Duration};

use serde::Deserialize;
use thiserror::Error;

use crate::file_manager::LOCAL;

pub const FILE_MANAGER: &str = "ITINERARY_FILE_MANAGER";
pub const FILES_ROOT: &str = "ITINERARY_FILES_ROOT";
pub const TASK_TIMEOUT_MINUTES: &str = "ITINERARY_TASK_TIMEOUT_MINUTES";
pub const TASK_MAX_ATTEMPTS: &str = "ITINERARY_TASK_MAX_ATTEMPTS";
pub const WORKER_CONCURRENCY: &str = "ITINERARY_WORKER_CONCURRENCY";
pub const MAX_JOBS_PER_USER: &str = "ITINERARY_MAX_JOBS_PER_USER";
pub const REAPER_SCHEDULE: &str = "ITINERARY_REAPER_SCHEDULE";
pub const REAPER_BATCH_SIZE: &str = "ITINERARY_REAPER_BATCH_SIZE";
pub const LLM_BASE_URL: &str = "LLM_BASE_URL";
pub const LLM_API_KEY: &str = "LLM_API_KEY";
pub const LLM_MODEL: &str = "LLM_MODEL";
pub const DATABASE_URL: &str = "DATABASE_URL";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage backend for newly prepared jobs.
    pub file_manager: String,
    pub files_root: PathBuf,
    pub task_timeout_minutes: u64,
    pub task_max_attempts: u16,
    pub worker_concurrency: usize,
    /// Jobs a user may have in flight at once. Zero disables the limit.
    pub max_jobs_per_user: u32,
    pub reaper_schedule: String,
    pub reaper_batch_size: u32,
    pub llm: LlmConfig,
    pub database_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            file_manager: LOCAL.to_owned(),
            files_root: PathBuf::from("./data/itinerary_files"),
            task_timeout_minutes: 5,
            task_max_attempts: 1,
            worker_concurrency: 10,
            max_jobs_per_user: 3,
            reaper_schedule: "0 */10 * * * *".to_owned(),
            reaper_batch_size: 50,
            llm: LlmConfig::default(),
            database_url: None,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_owned(),
            api_key: None,
            model: "gpt-4o-mini".to_owned(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from `lookup`, falling back to defaults for unset or empty keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();

        let config = Self {
            file_manager: lookup(FILE_MANAGER).unwrap_or(defaults.file_manager),
            files_root: lookup(FILES_ROOT)
                .map(PathBuf::from)
                .unwrap_or(defaults.files_root),
            task_timeout_minutes: parse(&lookup, TASK_TIMEOUT_MINUTES)?
                .unwrap_or(defaults.task_timeout_minutes),
            task_max_attempts: parse(&lookup, TASK_MAX_ATTEMPTS)?
                .unwrap_or(defaults.task_max_attempts),
            worker_concurrency: parse(&lookup, WORKER_CONCURRENCY)?
                .unwrap_or(defaults.worker_concurrency),
            max_jobs_per_user: parse(&lookup, MAX_JOBS_PER_USER)?
                .unwrap_or(defaults.max_jobs_per_user),
            reaper_schedule: lookup(REAPER_SCHEDULE).unwrap_or(defaults.reaper_schedule),
            reaper_batch_size: parse(&lookup, REAPER_BATCH_SIZE)?
                .unwrap_or(defaults.reaper_batch_size),
            llm: LlmConfig {
                base_url: lookup(LLM_BASE_URL).unwrap_or(defaults.llm.base_url),
                api_key: lookup(LLM_API_KEY),
                model: lookup(LLM_MODEL).unwrap_or(defaults.llm.model),
            },
            database_url: lookup(DATABASE_URL),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check values that parse but cannot be used.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.task_timeout_minutes == 0 {
            return Err(invalid(TASK_TIMEOUT_MINUTES, "0", "must be at least one minute"));
        }
        if self.task_max_attempts == 0 {
            return Err(invalid(TASK_MAX_ATTEMPTS, "0", "must be at least one"));
        }
        if self.worker_concurrency == 0 {
            return Err(invalid(WORKER_CONCURRENCY, "0", "must be at least one"));
        }
        self.reaper_schedule()?;
        Ok(())
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_minutes.saturating_mul(60))
    }

    pub fn reaper_schedule(&self) -> Result<cron::Schedule, ConfigError> {
        cron::Schedule::from_str(&self.reaper_schedule)
            .map_err(|err| invalid(REAPER_SCHEDULE, &self.reaper_schedule, err))
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|err| invalid(key, &value, err))
        })
        .transpose()
}

fn invalid(key: &'static str, value: &str, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_owned(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::*;
    use assert_matches::assert_matches;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<HashMap<_, _>>();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = config_from(&[]).unwrap();

        assert_eq!(config, Config::default());
        assert_eq!(config.file_manager, "local");
        assert_eq!(config.task_timeout(), Duration::from_secs(300));
        assert!(config.reaper_schedule().is_ok());
    }

    #[test]
    fn reads_values() {
        let config = config_from(&[
            (FILE_MANAGER, "s3"),
            (TASK_TIMEOUT_MINUTES, "15"),
            (TASK_MAX_ATTEMPTS, "3"),
            (WORKER_CONCURRENCY, "4"),
            (MAX_JOBS_PER_USER, "0"),
            (REAPER_BATCH_SIZE, "10"),
            (LLM_API_KEY, "secret"),
        ])
        .unwrap();

        assert_eq!(config.file_manager, "s3");
        assert_eq!(config.task_timeout(), Duration::from_secs(900));
        assert_eq!(config.task_max_attempts, 3);
        assert_eq!(config.worker_concurrency, 4);
        assert_eq!(config.max_jobs_per_user, 0);
        assert_eq!(config.reaper_batch_size, 10);
        assert_eq!(config.llm.api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn empty_file_manager_defaults_to_local() {
        let config = config_from(&[(FILE_MANAGER, "  ")]).unwrap();
        assert_eq!(config.file_manager, "local");
    }

    #[test]
    fn invalid_timeout_is_an_error() {
        assert_matches!(
            config_from(&[(TASK_TIMEOUT_MINUTES, "five")]),
            Err(ConfigError::Invalid { key: TASK_TIMEOUT_MINUTES, value, .. }) if value == "five"
        );
        assert_matches!(
            config_from(&[(TASK_TIMEOUT_MINUTES, "0")]),
            Err(ConfigError::Invalid {
                key: TASK_TIMEOUT_MINUTES,
                ..
            })
        );
        assert_matches!(
            config_from(&[(TASK_TIMEOUT_MINUTES, "-1")]),
            Err(ConfigError::Invalid {
                key: TASK_TIMEOUT_MINUTES,
                ..
            })
        );
    }

    #[test]
    fn invalid_schedule_is_an_error() {
        assert_matches!(
            config_from(&[(REAPER_SCHEDULE, "every so often")]),
            Err(ConfigError::Invalid {
                key: REAPER_SCHEDULE,
                ..
            })
        );
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"file_manager":"s3","llm":{"model":"local-model"}}"#).unwrap();

        assert_eq!(config.file_manager, "s3");
        assert_eq!(config.task_timeout_minutes, 5);
        assert_eq!(config.llm.model, "local-model");
        assert_eq!(config.llm.base_url, LlmConfig::default().base_url);
    }
}
