use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::timeutil;

/// Half-width of the "due now" window around a reminder's lead time, in
/// seconds (±2.5 minutes). A reminder fires when the event is within this
/// distance of the configured lead time. The fast poll interval must stay
/// strictly below the window's full width (2 × this value) or a due window
/// can fall entirely between two ticks; `validate()` enforces that.
pub const DUE_TOLERANCE_SECS: i64 = 150;

/// How long sent-notification fingerprints are remembered.
pub const NOTIFICATION_RETENTION_HOURS: i64 = 24;

/// How long per-recipient chart timestamps are remembered.
pub const CHART_RETENTION_HOURS: i64 = 12;

/// How long dispatch outcome rows are kept before the maintenance tick
/// prunes them.
pub const OUTCOME_RETENTION_DAYS: i64 = 30;

/// Top-level config (pipwatch.toml + PIPWATCH_* env overrides, with `__`
/// separating section from key: PIPWATCH_TELEGRAM__BOT_TOKEN).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipwatchConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub charts: ChartsConfig,
    #[serde(default)]
    pub digest: DigestConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

impl Default for PipwatchConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            database: DatabaseConfig::default(),
            telegram: TelegramConfig::default(),
            charts: ChartsConfig::default(),
            digest: DigestConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

/// Scheduling and dispatch tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Fast-poll interval for event reminders, in minutes.
    #[serde(default = "default_poll_minutes")]
    pub reminder_poll_minutes: u64,
    /// How often the digest job table is reconciled against the
    /// preference store, in minutes.
    #[serde(default = "default_resync_minutes")]
    pub resync_minutes: u64,
    /// Concurrency cap for per-recipient dispatch within one tick.
    #[serde(default = "default_max_concurrent_sends")]
    pub max_concurrent_sends: usize,
    /// Immediate retries after a transient transport failure.
    #[serde(default = "default_send_retries")]
    pub send_retries: u32,
    /// Timeout for a single transport call, in seconds.
    #[serde(default = "default_transport_timeout_secs")]
    pub transport_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reminder_poll_minutes: default_poll_minutes(),
            resync_minutes: default_resync_minutes(),
            max_concurrent_sends: default_max_concurrent_sends(),
            send_retries: default_send_retries(),
            transport_timeout_secs: default_transport_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelegramConfig {
    /// Bot API token. Usually set via PIPWATCH_TELEGRAM__BOT_TOKEN.
    #[serde(default)]
    pub bot_token: String,
}

/// Chart-service client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartsConfig {
    #[serde(default = "default_charts_base_url")]
    pub base_url: String,
    /// Render call timeout, in seconds.
    #[serde(default = "default_chart_timeout_secs")]
    pub timeout_secs: u64,
    /// Minimum spacing between two charts to the same recipient.
    #[serde(default = "default_chart_cooldown_minutes")]
    pub cooldown_minutes: i64,
}

impl Default for ChartsConfig {
    fn default() -> Self {
        Self {
            base_url: default_charts_base_url(),
            timeout_secs: default_chart_timeout_secs(),
            cooldown_minutes: default_chart_cooldown_minutes(),
        }
    }
}

/// Broadcast digest for a public channel; per-recipient digests are driven
/// by preferences, this one is static config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestConfig {
    /// Channel chat id; None disables the broadcast digest.
    #[serde(default)]
    pub broadcast_chat_id: Option<i64>,
    #[serde(default = "default_broadcast_time")]
    pub broadcast_time: String,
    #[serde(default = "default_broadcast_timezone")]
    pub broadcast_timezone: String,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            broadcast_chat_id: None,
            broadcast_time: default_broadcast_time(),
            broadcast_timezone: default_broadcast_timezone(),
        }
    }
}

/// Bind address for the monitoring endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_bind")]
    pub bind: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_http_bind(),
            port: default_http_port(),
        }
    }
}

impl PipwatchConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: PipwatchConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("PIPWATCH_").split("__"))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Reject configurations that would break scheduling invariants.
    /// Called once at startup; a failure here is fatal on purpose, since a
    /// mis-scheduled engine silently stops reminding people.
    pub fn validate(&self) -> Result<()> {
        if self.engine.reminder_poll_minutes == 0 {
            return Err(CoreError::Config(
                "engine.reminder_poll_minutes must be at least 1".to_string(),
            ));
        }
        let poll_secs = (self.engine.reminder_poll_minutes * 60) as i64;
        if poll_secs >= 2 * DUE_TOLERANCE_SECS {
            return Err(CoreError::Config(format!(
                "engine.reminder_poll_minutes = {} is too coarse: the poll \
                 interval must be under {} seconds or reminders can fall \
                 between ticks",
                self.engine.reminder_poll_minutes,
                2 * DUE_TOLERANCE_SECS
            )));
        }
        if self.engine.resync_minutes == 0 {
            return Err(CoreError::Config(
                "engine.resync_minutes must be at least 1".to_string(),
            ));
        }
        if self.engine.max_concurrent_sends == 0 {
            return Err(CoreError::Config(
                "engine.max_concurrent_sends must be at least 1".to_string(),
            ));
        }
        if self.charts.cooldown_minutes <= 0 {
            return Err(CoreError::Config(
                "charts.cooldown_minutes must be positive".to_string(),
            ));
        }
        timeutil::parse_zone(&self.digest.broadcast_timezone)?;
        timeutil::parse_time_of_day(&self.digest.broadcast_time)?;
        Ok(())
    }
}

fn default_poll_minutes() -> u64 {
    2
}

fn default_resync_minutes() -> u64 {
    15
}

fn default_max_concurrent_sends() -> usize {
    8
}

fn default_send_retries() -> u32 {
    1
}

fn default_transport_timeout_secs() -> u64 {
    15
}

fn default_db_path() -> String {
    "pipwatch.db".to_string()
}

fn default_charts_base_url() -> String {
    "http://127.0.0.1:8391".to_string()
}

fn default_chart_timeout_secs() -> u64 {
    20
}

fn default_chart_cooldown_minutes() -> i64 {
    120
}

fn default_broadcast_time() -> String {
    "07:00".to_string()
}

fn default_broadcast_timezone() -> String {
    "Europe/Prague".to_string()
}

fn default_http_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_http_port() -> u16 {
    8090
}

fn default_config_path() -> String {
    "pipwatch.toml".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_passes_validation() {
        let config = PipwatchConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_poll_interval_wider_than_due_window() {
        let mut config = PipwatchConfig::default();
        config.engine.reminder_poll_minutes = 15;
        assert!(config.validate().is_err());

        // 4 minutes is still under the 300-second ceiling.
        config.engine.reminder_poll_minutes = 4;
        assert!(config.validate().is_ok());

        // 5 minutes equals the ceiling exactly and must be rejected.
        config.engine.reminder_poll_minutes = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_broadcast_settings() {
        let mut config = PipwatchConfig::default();
        config.digest.broadcast_timezone = "Atlantis/Capital".to_string();
        assert!(config.validate().is_err());

        let mut config = PipwatchConfig::default();
        config.digest.broadcast_time = "late morning".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_workers() {
        let mut config = PipwatchConfig::default();
        config.engine.max_concurrent_sends = 0;
        assert!(config.validate().is_err());
    }
}
