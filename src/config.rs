use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::queue::jobs::AnalysisModule;
use crate::types::{AppError, AppResult, LLMProvider};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub queue: QueueConfig,
    pub llm: LLMConfig,
    pub delivery: DeliveryConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub cors_allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    /// Use Redis for the job queue; the in-memory queue is used otherwise
    pub enabled: bool,
    pub key_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Jobs processed at once per queue
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_delay_ms: u64,
    /// Visibility timeout for an active job before it counts as stalled
    pub lease_ms: u64,
    pub analysis_timeout_ms: u64,
    pub rate_limit_max: u32,
    pub rate_limit_window_ms: u64,
    pub idle_poll_ms: u64,
    pub maintenance_interval_ms: u64,
    pub completed_retention_secs: u64,
    pub completed_retention_count: usize,
    pub failed_retention_secs: u64,
    pub failed_retention_count: usize,
    pub modules: Vec<AnalysisModule>,
    pub conversation_priority: u32,
    pub analysis_priority: u32,
    pub summary_priority: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LLMConfig {
    pub api_key: String,
    pub provider: LLMProvider,
    pub default_model: String,
    pub reasoning_model: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    pub poll_interval_ms: u64,
    /// Consecutive `not_found` observations before an id is dropped
    pub not_found_limit: u32,
    pub outstanding_ttl_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub dir: Option<String>,
    pub filter: String,
}

impl QueueConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_millis(self.analysis_timeout_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    /// Durations feed timers and tickers, so none of them may be zero.
    pub fn validate(&self) -> AppResult<()> {
        require_positive("JOB_LEASE_MS", self.lease_ms)?;
        require_positive("ANALYSIS_TIMEOUT_MS", self.analysis_timeout_ms)?;
        require_positive("WORKER_IDLE_POLL_MS", self.idle_poll_ms)?;
        require_positive("QUEUE_MAINTENANCE_MS", self.maintenance_interval_ms)?;
        require_positive("WORKER_CONCURRENCY", self.concurrency as u64)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 50,
            max_attempts: 3,
            backoff_delay_ms: 1000,
            lease_ms: 150_000,
            analysis_timeout_ms: 120_000,
            rate_limit_max: 100,
            rate_limit_window_ms: 1000,
            idle_poll_ms: 500,
            maintenance_interval_ms: 5000,
            completed_retention_secs: 24 * 3600,
            completed_retention_count: 1000,
            failed_retention_secs: 7 * 24 * 3600,
            failed_retention_count: 1000,
            modules: AnalysisModule::ALL.to_vec(),
            conversation_priority: 1,
            analysis_priority: 2,
            summary_priority: 5,
        }
    }
}

impl DeliveryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn outstanding_ttl(&self) -> Duration {
        Duration::from_millis(self.outstanding_ttl_ms)
    }

    pub fn validate(&self) -> AppResult<()> {
        require_positive("POLL_INTERVAL_MS", self.poll_interval_ms)?;
        require_positive("NOT_FOUND_LIMIT", u64::from(self.not_found_limit))?;
        require_positive("OUTSTANDING_TTL_MS", self.outstanding_ttl_ms)
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            not_found_limit: 3,
            outstanding_ttl_ms: 10 * 60 * 1000,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            host: "0.0.0.0".to_string(),
            cors_allowed_origins: vec!["http://localhost:3000".to_string()],
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            enabled: false,
            key_prefix: "booth".to_string(),
        }
    }
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            provider: LLMProvider::OpenAI,
            default_model: "gpt-4o".to_string(),
            reasoning_model: "o3-mini".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: None,
            filter: "blue_booth=debug,tower_http=debug,axum=debug".to_string(),
        }
    }
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(key: &str, default: T) -> AppResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| AppError::Config(format!("{} is invalid: {}", key, e))),
        Err(_) => Ok(default),
    }
}

fn require_positive(key: &str, value: u64) -> AppResult<()> {
    if value == 0 {
        return Err(AppError::Config(format!("{} must be greater than zero", key)));
    }
    Ok(())
}

fn parse_modules(raw: &str) -> AppResult<Vec<AnalysisModule>> {
    let modules = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect::<AppResult<Vec<AnalysisModule>>>()?;
    if modules.is_empty() {
        return Err(AppError::Config("ANALYSIS_MODULES must name at least one module".into()));
    }
    Ok(modules)
}

impl Config {
    pub fn from_env() -> AppResult<Self> {
        dotenvy::dotenv().ok();

        let queue_defaults = QueueConfig::default();
        let delivery_defaults = DeliveryConfig::default();

        let modules = match env::var("ANALYSIS_MODULES") {
            Ok(raw) => parse_modules(&raw)?,
            Err(_) => queue_defaults.modules.clone(),
        };

        let config = Self {
            server: ServerConfig {
                port: parse_var("PORT", 3000)?,
                host: var_or("HOST", "0.0.0.0"),
                cors_allowed_origins: var_or("ALLOWED_ORIGINS", "http://localhost:3000")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .collect(),
            },
            redis: RedisConfig {
                url: var_or("REDIS_URL", "redis://localhost:6379"),
                enabled: parse_var("USE_JOB_QUEUE", false)?,
                key_prefix: var_or("QUEUE_PREFIX", "booth"),
            },
            queue: QueueConfig {
                concurrency: parse_var("WORKER_CONCURRENCY", queue_defaults.concurrency)?,
                max_attempts: parse_var("JOB_MAX_ATTEMPTS", queue_defaults.max_attempts)?,
                backoff_delay_ms: parse_var("JOB_BACKOFF_MS", queue_defaults.backoff_delay_ms)?,
                lease_ms: parse_var("JOB_LEASE_MS", queue_defaults.lease_ms)?,
                analysis_timeout_ms: parse_var(
                    "ANALYSIS_TIMEOUT_MS",
                    queue_defaults.analysis_timeout_ms,
                )?,
                rate_limit_max: parse_var("RATE_LIMIT_MAX", queue_defaults.rate_limit_max)?,
                rate_limit_window_ms: parse_var(
                    "RATE_LIMIT_WINDOW_MS",
                    queue_defaults.rate_limit_window_ms,
                )?,
                idle_poll_ms: parse_var("WORKER_IDLE_POLL_MS", queue_defaults.idle_poll_ms)?,
                maintenance_interval_ms: parse_var(
                    "QUEUE_MAINTENANCE_MS",
                    queue_defaults.maintenance_interval_ms,
                )?,
                completed_retention_secs: parse_var(
                    "COMPLETED_RETENTION_SECS",
                    queue_defaults.completed_retention_secs,
                )?,
                completed_retention_count: parse_var(
                    "COMPLETED_RETENTION_COUNT",
                    queue_defaults.completed_retention_count,
                )?,
                failed_retention_secs: parse_var(
                    "FAILED_RETENTION_SECS",
                    queue_defaults.failed_retention_secs,
                )?,
                failed_retention_count: parse_var(
                    "FAILED_RETENTION_COUNT",
                    queue_defaults.failed_retention_count,
                )?,
                modules,
                conversation_priority: queue_defaults.conversation_priority,
                analysis_priority: queue_defaults.analysis_priority,
                summary_priority: queue_defaults.summary_priority,
            },
            llm: LLMConfig {
                api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
                provider: var_or("REPLY_LLM_PROVIDER", "openai").parse()?,
                default_model: var_or("REPLY_LLM_MODEL", "gpt-4o"),
                reasoning_model: var_or("REASONING_LLM_MODEL", "o3-mini"),
            },
            delivery: DeliveryConfig {
                poll_interval_ms: parse_var("POLL_INTERVAL_MS", delivery_defaults.poll_interval_ms)?,
                not_found_limit: parse_var("NOT_FOUND_LIMIT", delivery_defaults.not_found_limit)?,
                outstanding_ttl_ms: parse_var(
                    "OUTSTANDING_TTL_MS",
                    delivery_defaults.outstanding_ttl_ms,
                )?,
            },
            logging: LoggingConfig {
                dir: env::var("LOG_DIR").ok().filter(|d| !d.trim().is_empty()),
                filter: var_or("RUST_LOG", "blue_booth=debug,tower_http=debug,axum=debug"),
            },
        };
        config.queue.validate()?;
        config.delivery.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_modules() {
        let modules = parse_modules("roughOverview, hypothesisGeneration").unwrap();
        assert_eq!(
            modules,
            vec![AnalysisModule::RoughOverview, AnalysisModule::HypothesisGeneration]
        );
        assert!(parse_modules(" , ").is_err());
        assert!(parse_modules("roughOverview,unknown").is_err());
    }

    #[test]
    fn test_queue_defaults() {
        let queue = QueueConfig::default();
        assert_eq!(queue.concurrency, 50);
        assert_eq!(queue.max_attempts, 3);
        assert!(queue.lease() > queue.analysis_timeout());
        assert!(queue.conversation_priority < queue.summary_priority);
    }

    #[test]
    fn test_defaults_pass_validation() {
        assert!(QueueConfig::default().validate().is_ok());
        assert!(DeliveryConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_intervals_are_rejected() {
        let queue = QueueConfig {
            maintenance_interval_ms: 0,
            ..Default::default()
        };
        match queue.validate() {
            Err(AppError::Config(message)) => assert!(message.contains("QUEUE_MAINTENANCE_MS")),
            other => panic!("expected config error, got {:?}", other),
        }

        for queue in [
            QueueConfig { lease_ms: 0, ..Default::default() },
            QueueConfig { analysis_timeout_ms: 0, ..Default::default() },
            QueueConfig { idle_poll_ms: 0, ..Default::default() },
        ] {
            assert!(matches!(queue.validate(), Err(AppError::Config(_))));
        }

        let delivery = DeliveryConfig {
            poll_interval_ms: 0,
            ..Default::default()
        };
        match delivery.validate() {
            Err(AppError::Config(message)) => assert!(message.contains("POLL_INTERVAL_MS")),
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_from_env_rejects_zero_maintenance_interval() {
        std::env::set_var("QUEUE_MAINTENANCE_MS", "0");
        let result = Config::from_env();
        std::env::remove_var("QUEUE_MAINTENANCE_MS");
        assert!(matches!(result, Err(AppError::Config(_))));
    }
}
