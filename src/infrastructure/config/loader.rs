use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::Config;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid max_concurrent: {0}. Must be between 1 and 1000")]
    InvalidMaxConcurrent(usize),

    #[error("Invalid priority_queues: {0}. Must be between 1 and 5")]
    InvalidPriorityQueues(usize),

    #[error("Invalid circuit_breaker_threshold: {0}. Must be in (0, 1]")]
    InvalidBreakerThreshold(f64),

    #[error("Invalid throttling rate: {0}. Must be at least 1")]
    InvalidThrottleRate(u32),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Audit base_path cannot be empty")]
    EmptyAuditPath,

    #[error("Invalid audit max_file_size: {0}. Must be at least 4096 bytes")]
    InvalidAuditFileSize(u64),

    #[error("Invalid retry_multiplier: {0}. Must be at least 1.0")]
    InvalidRetryMultiplier(f64),

    #[error("Invalid overcommit_ratio: {0}. Must be at least 1.0")]
    InvalidOvercommit(f64),

    #[error(
        "Invalid auto_scaling bounds: min_runners ({0}) must not exceed max_runners ({1})"
    )]
    InvalidScalingBounds(u32, u32),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .runnerhub/config.yaml (project config)
    /// 3. .runnerhub/local.yaml (local overrides, optional)
    /// 4. Environment variables (RUNNERHUB_* prefix, highest priority)
    ///
    /// Unknown keys fail extraction: every config struct denies them.
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".runnerhub/config.yaml"))
            .merge(Yaml::file(".runnerhub/local.yaml"))
            .merge(Env::prefixed("RUNNERHUB_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.executor.max_concurrent == 0 || config.executor.max_concurrent > 1000 {
            return Err(ConfigError::InvalidMaxConcurrent(
                config.executor.max_concurrent,
            ));
        }
        if config.executor.retry_multiplier < 1.0 {
            return Err(ConfigError::InvalidRetryMultiplier(
                config.executor.retry_multiplier,
            ));
        }

        let lb = &config.load_balancer;
        if lb.priority_queues == 0 || lb.priority_queues > 5 {
            return Err(ConfigError::InvalidPriorityQueues(lb.priority_queues));
        }
        if lb.circuit_breaker_threshold <= 0.0 || lb.circuit_breaker_threshold > 1.0 {
            return Err(ConfigError::InvalidBreakerThreshold(
                lb.circuit_breaker_threshold,
            ));
        }
        if lb.throttling.requests_per_second == 0 {
            return Err(ConfigError::InvalidThrottleRate(
                lb.throttling.requests_per_second,
            ));
        }
        if lb.throttling.requests_per_minute == 0 {
            return Err(ConfigError::InvalidThrottleRate(
                lb.throttling.requests_per_minute,
            ));
        }
        if lb.max_queue_size < lb.priority_queues {
            return Err(ConfigError::ValidationFailed(format!(
                "max_queue_size ({}) must be at least priority_queues ({})",
                lb.max_queue_size, lb.priority_queues
            )));
        }

        let auto = &config.scheduler.auto_scaling;
        if auto.min_runners > auto.max_runners {
            return Err(ConfigError::InvalidScalingBounds(
                auto.min_runners,
                auto.max_runners,
            ));
        }

        if config.security.overcommit_ratio < 1.0 {
            return Err(ConfigError::InvalidOvercommit(config.security.overcommit_ratio));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        if config.audit.base_path.is_empty() {
            return Err(ConfigError::EmptyAuditPath);
        }
        if config.audit.max_file_size < 4096 {
            return Err(ConfigError::InvalidAuditFileSize(config.audit.max_file_size));
        }

        Ok(())
    }
}
