use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub telegram: TelegramConfig,
    #[serde(default = "default_storage_config")]
    pub storage: StorageConfig,
    #[serde(default = "default_polling_config")]
    pub polling: PollingConfig,
    #[serde(default = "default_manager_config")]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Seeded as an admin user with a private chat on startup
    #[serde(default)]
    pub admin_user_id: Option<i64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub database_path: PathBuf,
    /// Running functions untouched for longer than this are discarded at startup
    #[serde(default = "default_stale_after_hours")]
    pub stale_after_hours: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollingConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ManagerConfig {
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default = "default_shutdown_keyword")]
    pub shutdown_keyword: String,
    #[serde(default = "default_onboarding_keyword")]
    pub onboarding_keyword: String,
    #[serde(default = "default_command_marker")]
    pub command_marker: String,
    #[serde(default = "default_true")]
    pub shutdown_requires_admin: bool,
    /// Sent once to the user when a handler fails. An empty string keeps failures silent.
    #[serde(default = "default_failure_notice")]
    pub failure_notice: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    /// Six-field cron expression (seconds first)
    pub cron: String,
    pub command: String,
    pub chat_ids: Vec<i64>,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("sessionbot.db")
}

/// Ten years; larger thresholds cannot be turned into a cutoff timestamp
const MAX_STALE_AFTER_HOURS: u64 = 24 * 365 * 10;

fn default_stale_after_hours() -> u64 {
    48
}

fn default_timeout_secs() -> u32 {
    30
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_app_name() -> String {
    "sessionbot".to_string()
}

fn default_shutdown_keyword() -> String {
    "end".to_string()
}

fn default_onboarding_keyword() -> String {
    "start".to_string()
}

fn default_command_marker() -> String {
    "/".to_string()
}

fn default_true() -> bool {
    true
}

fn default_failure_notice() -> Option<String> {
    Some("Something went wrong, please try again.".to_string())
}

fn default_storage_config() -> StorageConfig {
    StorageConfig {
        database_path: default_db_path(),
        stale_after_hours: default_stale_after_hours(),
    }
}

fn default_polling_config() -> PollingConfig {
    PollingConfig {
        timeout_secs: default_timeout_secs(),
        retry_delay_ms: default_retry_delay_ms(),
    }
}

pub(crate) fn default_manager_config() -> ManagerConfig {
    ManagerConfig {
        app_name: default_app_name(),
        shutdown_keyword: default_shutdown_keyword(),
        onboarding_keyword: default_onboarding_keyword(),
        command_marker: default_command_marker(),
        shutdown_requires_admin: default_true(),
        failure_notice: default_failure_notice(),
    }
}

impl StorageConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_hours.saturating_mul(3600))
    }
}

impl PollingConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config file")?;

        if config.telegram.bot_token.trim().is_empty() {
            anyhow::bail!("telegram.bot_token must not be empty");
        }
        if config.storage.stale_after_hours > MAX_STALE_AFTER_HOURS {
            anyhow::bail!(
                "storage.stale_after_hours must be at most {}",
                MAX_STALE_AFTER_HOURS
            );
        }
        if config.manager.command_marker.is_empty() {
            anyhow::bail!("manager.command_marker must not be empty");
        }
        for schedule in &config.schedules {
            if schedule.chat_ids.is_empty() {
                anyhow::bail!(
                    "schedule '{}' for command '{}' has no chat_ids",
                    schedule.cron,
                    schedule.command
                );
            }
        }

        Ok(config)
    }
}
