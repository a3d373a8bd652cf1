use crate::errors::{EngineError, EngineResult};
use crate::risk::quota::QuotaLimit;
use crate::state::TradingSettings;
use chrono::{FixedOffset, Offset, Utc};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub server_port: u16,
    pub poll_interval: Duration,
    /// Reference timezone for the daily quota boundary.
    pub quota_offset: FixedOffset,
    pub max_daily_attempts: QuotaLimit,
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub store_timeout: Duration,
    pub sweep_batch_limit: usize,
    pub min_duration_secs: i64,
    pub max_duration_secs: i64,
    pub default_settings: TradingSettings,
}

impl AppConfig {
    pub fn from_env() -> EngineResult<Self> {
        dotenvy::dotenv().ok();

        let server_port = parse_var::<u16>("SERVER_PORT", "3001")?;
        let poll_interval_secs = parse_var::<u64>("POLL_INTERVAL_SECS", "5")?;
        let offset_minutes = parse_var::<i32>("QUOTA_TZ_OFFSET_MINUTES", "0")?;
        let quota_offset = FixedOffset::east_opt(offset_minutes * 60).ok_or_else(|| {
            EngineError::Config(format!("QUOTA_TZ_OFFSET_MINUTES out of range: {offset_minutes}"))
        })?;

        let max_daily_attempts = match env_var_or("MAX_DAILY_ATTEMPTS", "20").as_str() {
            "unlimited" | "none" => QuotaLimit::Unlimited,
            raw => QuotaLimit::Limited(
                raw.parse::<u32>()
                    .map_err(|e| EngineError::Config(format!("MAX_DAILY_ATTEMPTS: {e}")))?,
            ),
        };

        let default_settings = TradingSettings {
            win_probability: parse_var("DEFAULT_WIN_PROBABILITY", "0.5")?,
            min_profit_pct: parse_var("DEFAULT_MIN_PROFIT_PCT", "70")?,
            max_profit_pct: parse_var("DEFAULT_MAX_PROFIT_PCT", "90")?,
            min_loss_pct: parse_var("DEFAULT_MIN_LOSS_PCT", "0")?,
            max_loss_pct: parse_var("DEFAULT_MAX_LOSS_PCT", "100")?,
        };
        default_settings
            .validate()
            .map_err(|e| EngineError::Config(format!("default trading settings: {e}")))?;

        let min_duration_secs = parse_var::<i64>("MIN_DURATION_SECS", "30")?;
        let max_duration_secs = parse_var::<i64>("MAX_DURATION_SECS", "86400")?;
        if min_duration_secs <= 0 || max_duration_secs < min_duration_secs {
            return Err(EngineError::Config(format!(
                "duration bounds invalid: [{min_duration_secs}, {max_duration_secs}]"
            )));
        }

        Ok(Self {
            data_dir: PathBuf::from(env_var_or("DATA_DIR", "data")),
            server_port,
            poll_interval: Duration::from_secs(poll_interval_secs.max(1)),
            quota_offset,
            max_daily_attempts,
            retry_max_attempts: parse_var("RETRY_MAX_ATTEMPTS", "3")?,
            retry_base_delay: Duration::from_millis(parse_var("RETRY_BASE_DELAY_MS", "2000")?),
            store_timeout: Duration::from_millis(parse_var("STORE_TIMEOUT_MS", "5000")?),
            sweep_batch_limit: parse_var("SWEEP_BATCH_LIMIT", "500")?,
            min_duration_secs,
            max_duration_secs,
            default_settings,
        })
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            server_port: 3001,
            poll_interval: Duration::from_secs(5),
            quota_offset: Utc.fix(),
            max_daily_attempts: QuotaLimit::Limited(20),
            retry_max_attempts: 3,
            retry_base_delay: Duration::from_secs(2),
            store_timeout: Duration::from_secs(5),
            sweep_batch_limit: 500,
            min_duration_secs: 30,
            max_duration_secs: 86_400,
            default_settings: TradingSettings::default(),
        }
    }
}

fn parse_var<T>(key: &str, default: &str) -> EngineResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    env_var_or(key, default)
        .parse::<T>()
        .map_err(|e| EngineError::Config(format!("{key}: {e}")))
}

fn env_var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
