//! Configuration loading and validation.
//!
//! Hierarchical merging, lowest to highest precedence: programmatic
//! defaults, `flotilla.yaml` in the working directory, then
//! `FLOTILLA_`-prefixed environment variables (nested fields separated by
//! `__`, e.g. `FLOTILLA_SCHEDULER__FITNESS_GOOD_ENOUGH=0.9`).

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scheduler::{AutoscalerConfig, PlacementConfig};
use crate::reconciler::FrameworkConfig;

/// Configuration validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid timeouts: active_timeout_ms ({0}) must be positive and <= idle_timeout_ms ({1})")]
    InvalidTimeouts(u64, u64),

    #[error("Invalid fitness_good_enough: {0}. Must be within [0, 1]")]
    InvalidFitnessThreshold(f64),

    #[error("Invalid task_failures_queue_capacity: {0}. Must be at least 1")]
    InvalidFailureQueueCapacity(usize),

    #[error("Invalid scheduler_iteration_interval_ms: {0}. Must be positive")]
    InvalidIterationInterval(u64),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),
}

/// Placement loop knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub scheduler_iteration_interval_ms: u64,
    pub max_delay_ms_between_iterations: u64,
    pub lease_offer_expiry_secs: u64,
    pub task_failures_queue_capacity: usize,
    pub fitness_good_enough: f64,
    pub multi_task_per_offer: bool,
    pub exit_on_scheduling_error_enabled: bool,
    pub autoscale_by_attribute_name: String,
    pub active_agent_attribute_name: String,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            scheduler_iteration_interval_ms: 500,
            max_delay_ms_between_iterations: 5000,
            lease_offer_expiry_secs: 300,
            task_failures_queue_capacity: 5,
            fitness_good_enough: 1.0,
            multi_task_per_offer: false,
            exit_on_scheduling_error_enabled: false,
            autoscale_by_attribute_name: "asg".to_string(),
            active_agent_attribute_name: "active".to_string(),
        }
    }
}

/// Reconciliation loop knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerSection {
    pub active_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub store_update_timeout_ms: u64,
}

impl Default for ReconcilerSection {
    fn default() -> Self {
        Self {
            active_timeout_ms: 50,
            idle_timeout_ms: 500,
            store_update_timeout_ms: 5000,
        }
    }
}

/// Autoscaling hysteresis knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscalerSection {
    pub delay_autoscale_up_by_secs: u64,
    pub delay_autoscale_down_by_secs: u64,
    pub optimizing_shortfall_evaluator_enabled: bool,
}

impl Default for AutoscalerSection {
    fn default() -> Self {
        Self {
            delay_autoscale_up_by_secs: 60,
            delay_autoscale_down_by_secs: 300,
            optimizing_shortfall_evaluator_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub format: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerSection,
    pub reconciler: ReconcilerSection,
    pub autoscaler: AutoscalerSection,
    pub logging: LoggingSection,
}

impl Config {
    pub fn placement_config(&self) -> PlacementConfig {
        PlacementConfig {
            scheduler_iteration_interval_ms: self.scheduler.scheduler_iteration_interval_ms,
            max_delay_ms_between_iterations: self.scheduler.max_delay_ms_between_iterations,
            task_failures_queue_capacity: self.scheduler.task_failures_queue_capacity,
            fitness_good_enough: self.scheduler.fitness_good_enough,
            multi_task_per_offer: self.scheduler.multi_task_per_offer,
            exit_on_scheduling_error_enabled: self.scheduler.exit_on_scheduling_error_enabled,
            autoscale_by_attribute_name: self.scheduler.autoscale_by_attribute_name.clone(),
            active_agent_attribute_name: self.scheduler.active_agent_attribute_name.clone(),
        }
    }

    pub fn framework_config(&self) -> FrameworkConfig {
        FrameworkConfig {
            active_timeout_ms: self.reconciler.active_timeout_ms,
            idle_timeout_ms: self.reconciler.idle_timeout_ms,
        }
    }

    pub fn autoscaler_config(&self) -> AutoscalerConfig {
        AutoscalerConfig {
            delay_autoscale_up_by_secs: self.autoscaler.delay_autoscale_up_by_secs,
            delay_autoscale_down_by_secs: self.autoscaler.delay_autoscale_down_by_secs,
            optimizing_shortfall_evaluator_enabled: self
                .autoscaler
                .optimizing_shortfall_evaluator_enabled,
            ..AutoscalerConfig::default()
        }
    }
}

/// Configuration loader with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file("flotilla.yaml"))
            .merge(Env::prefixed("FLOTILLA_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;
        Self::validate(&config)?;
        Ok(config)
    }

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

    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        let r = &config.reconciler;
        if r.active_timeout_ms == 0 || r.active_timeout_ms > r.idle_timeout_ms {
            return Err(ConfigError::InvalidTimeouts(
                r.active_timeout_ms,
                r.idle_timeout_ms,
            ));
        }

        let s = &config.scheduler;
        if !(0.0..=1.0).contains(&s.fitness_good_enough) {
            return Err(ConfigError::InvalidFitnessThreshold(s.fitness_good_enough));
        }
        if s.task_failures_queue_capacity == 0 {
            return Err(ConfigError::InvalidFailureQueueCapacity(
                s.task_failures_queue_capacity,
            ));
        }
        if s.scheduler_iteration_interval_ms == 0 {
            return Err(ConfigError::InvalidIterationInterval(
                s.scheduler_iteration_interval_ms,
            ));
        }

        match config.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => return Err(ConfigError::InvalidLogLevel(other.to_string())),
        }
        match config.logging.format.as_str() {
            "json" | "pretty" => {}
            other => return Err(ConfigError::InvalidLogFormat(other.to_string())),
        }
        Ok(())
    }
}
