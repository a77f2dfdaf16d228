//! Configuration loader and validator for the clinic notification bot.
use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub app: App,
    #[serde(default)]
    pub telegram: Telegram,
    #[serde(default)]
    pub bitrix24: Bitrix24,
    #[serde(default)]
    pub webhook: Webhook,
    #[serde(default)]
    pub scheduler: Scheduler,
    #[serde(default)]
    pub review: Review,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    #[serde(default)]
    pub data_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Overrides the SQLite file under `data_dir`.
    #[serde(default)]
    pub database_url: Option<String>,
}

impl Default for App {
    fn default() -> Self {
        Self {
            data_dir: String::new(),
            log_level: default_log_level(),
            poll_interval_ms: default_poll_interval_ms(),
            database_url: None,
        }
    }
}

/// Telegram bot settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telegram {
    #[serde(default)]
    pub bot_token: String,
    /// Chats notified about handler failures and low ratings.
    #[serde(default)]
    pub admin_ids: Vec<i64>,
}

/// Bitrix24 inbound webhook and CRM conventions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Bitrix24 {
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default = "default_cancelled_stage")]
    pub cancelled_stage_id: String,
}

impl Default for Bitrix24 {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            cancelled_stage_id: default_cancelled_stage(),
        }
    }
}

/// HTTP listener for CRM events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Webhook {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Expected `X-Webhook-Secret` value. No check when unset.
    #[serde(default)]
    pub secret: Option<String>,
}

impl Default for Webhook {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            secret: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scheduler {
    /// Clinic local time as a fixed offset, e.g. `+03:00`.
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default = "default_reminder_lead_hours")]
    pub reminder_lead_hours: i64,
    #[serde(default = "default_survey_delay_days")]
    pub survey_delay_days: i64,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            utc_offset: default_utc_offset(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            reminder_lead_hours: default_reminder_lead_hours(),
            survey_delay_days: default_survey_delay_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Review {
    #[serde(default = "default_organization")]
    pub organization: String,
}

impl Default for Review {
    fn default() -> Self {
        Self {
            organization: default_organization(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_cancelled_stage() -> String {
    "CANCELED".into()
}
fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_utc_offset() -> String {
    "+03:00".into()
}
fn default_max_concurrent_jobs() -> usize {
    20
}
fn default_reminder_lead_hours() -> i64 {
    24
}
fn default_survey_delay_days() -> i64 {
    3
}
fn default_organization() -> String {
    "Uclinic".into()
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const MAX_REMINDER_LEAD_HOURS: i64 = 24 * 30;
const MAX_SURVEY_DELAY_DAYS: i64 = 365;

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn database_url(&self) -> String {
        match &self.app.database_url {
            Some(url) if !url.trim().is_empty() => url.clone(),
            _ => format!(
                "sqlite://{}/clinic-bot.db",
                self.app.data_dir.trim_end_matches('/')
            ),
        }
    }

    /// Clinic offset. Falls back to UTC only if validation was skipped.
    pub fn utc_offset(&self) -> FixedOffset {
        parse_utc_offset(&self.scheduler.utc_offset).unwrap_or_else(|| Utc.fix())
    }

    /// Replace secrets and endpoints with values from the environment when present.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(token) = get("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = token;
        }
        if let Some(url) = get("BITRIX24_WEBHOOK_URL") {
            self.bitrix24.webhook_url = url;
        }
        if let Some(secret) = get("WEBHOOK_SECRET") {
            self.webhook.secret = Some(secret);
        }
        if let Some(url) = get("DATABASE_URL") {
            self.app.database_url = Some(url);
        }
    }
}

/// Parse `+HH:MM`, `-HH:MM`, `+HH`, `Z` or `UTC`.
pub fn parse_utc_offset(raw: &str) -> Option<FixedOffset> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = if let Some(rest) = raw.strip_prefix('+') {
        (1, rest)
    } else if let Some(rest) = raw.strip_prefix('-') {
        (-1, rest)
    } else {
        return None;
    };
    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h, m),
        None => (rest, "0"),
    };
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if hours > 14 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Load configuration from a YAML file, apply environment overrides and validate.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    parse(&content, |key| std::env::var(key).ok())
}

/// Parse YAML, apply overrides from `lookup` and validate. Missing sections
/// fall back to empty values so that `validate` can name each of them.
pub fn parse<F>(content: &str, lookup: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut cfg: Config = serde_yaml::from_str(content)?;
    cfg.apply_env_overrides(lookup);
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance, reporting every violation at once.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();
    let mut require = |ok: bool, msg: &str| {
        if !ok {
            errors.push(msg.to_string());
        }
    };

    require(!cfg.app.data_dir.trim().is_empty(), "app.data_dir must be non-empty");
    require(cfg.app.poll_interval_ms > 0, "app.poll_interval_ms must be > 0");
    require(
        LOG_LEVELS.contains(&cfg.app.log_level.to_ascii_lowercase().as_str()),
        "app.log_level must be one of trace, debug, info, warn, error",
    );

    require(
        !cfg.telegram.bot_token.trim().is_empty(),
        "telegram.bot_token must be non-empty (or set TELEGRAM_BOT_TOKEN)",
    );

    let url = cfg.bitrix24.webhook_url.trim();
    require(
        !url.is_empty(),
        "bitrix24.webhook_url must be non-empty (or set BITRIX24_WEBHOOK_URL)",
    );
    require(
        url.is_empty() || url.starts_with("https://") || url.starts_with("http://"),
        "bitrix24.webhook_url must be an http(s) URL",
    );
    require(
        !cfg.bitrix24.cancelled_stage_id.trim().is_empty(),
        "bitrix24.cancelled_stage_id must be non-empty",
    );

    require(!cfg.webhook.host.trim().is_empty(), "webhook.host must be non-empty");
    require(cfg.webhook.port > 0, "webhook.port must be > 0");

    require(
        parse_utc_offset(&cfg.scheduler.utc_offset).is_some(),
        "scheduler.utc_offset must look like +03:00",
    );
    require(
        cfg.scheduler.max_concurrent_jobs > 0,
        "scheduler.max_concurrent_jobs must be > 0",
    );
    require(
        (1..=MAX_REMINDER_LEAD_HOURS).contains(&cfg.scheduler.reminder_lead_hours),
        "scheduler.reminder_lead_hours must be between 1 and 720",
    );
    require(
        (1..=MAX_SURVEY_DELAY_DAYS).contains(&cfg.scheduler.survey_delay_days),
        "scheduler.survey_delay_days must be between 1 and 365",
    );

    require(
        !cfg.review.organization.trim().is_empty(),
        "review.organization must be non-empty",
    );

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Invalid(errors))
    }
}

/// Returns the canonical example YAML.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  log_level: "info"
  poll_interval_ms: 1000

telegram:
  bot_token: "YOUR_TELEGRAM_BOT_TOKEN"
  admin_ids:
    - 123456789

bitrix24:
  webhook_url: "https://your-portal.bitrix24.ru/rest/1/your-webhook-code/"
  cancelled_stage_id: "CANCELED"

webhook:
  host: "0.0.0.0"
  port: 8080
  secret: "change-me"

scheduler:
  utc_offset: "+03:00"
  max_concurrent_jobs: 20
  reminder_lead_hours: 24
  survey_delay_days: 3

review:
  organization: "Uclinic"
"#
}
