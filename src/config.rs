use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::admission::{
    BudgetLimits, DEFAULT_DAILY_TOKEN_CAP, DEFAULT_MAX_PARALLEL_WORKERS, DEFAULT_MAX_QUEUE_DEPTH,
    DEFAULT_PER_REQUEST_TOKEN_CAP, DEFAULT_REQUESTS_PER_HOUR, DEFAULT_REQUESTS_PER_MINUTE,
    DEFAULT_WARNING_THRESHOLD,
};
use crate::orchestration::{
    CoordinatorConfig, ProjectRequirements, Strategy, StrategyRegistry, DEFAULT_EXECUTION_TIMEOUT,
    DEFAULT_INIT_TIMEOUT, DEFAULT_LIVENESS_WINDOW, DEFAULT_MAX_ITERATIONS, DEFAULT_SWEEP_INTERVAL,
};
use crate::queue::{
    QueueConfig, DEFAULT_COMPLETED_HISTORY, DEFAULT_ITEM_TOKENS, DEFAULT_MAX_CONCURRENT,
    DEFAULT_MAX_RETRIES, DEFAULT_MAX_SIZE, DEFAULT_RETRY_BASE_DELAY,
};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetSection {
    pub daily_token_cap: u64,
    pub per_request_token_cap: u64,
    pub requests_per_minute: usize,
    pub requests_per_hour: usize,
    pub max_queue_depth: usize,
    pub max_parallel_workers: usize,
    pub warning_threshold: f64,
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self {
            daily_token_cap: DEFAULT_DAILY_TOKEN_CAP,
            per_request_token_cap: DEFAULT_PER_REQUEST_TOKEN_CAP,
            requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
            requests_per_hour: DEFAULT_REQUESTS_PER_HOUR,
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
            max_parallel_workers: DEFAULT_MAX_PARALLEL_WORKERS,
            warning_threshold: DEFAULT_WARNING_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub max_concurrent: usize,
    /// Hard capacity of the queue, live items of every status.
    pub max_size: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub completed_history: usize,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_size: DEFAULT_MAX_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY.as_millis() as u64,
            completed_history: DEFAULT_COMPLETED_HISTORY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersSection {
    pub liveness_window_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for WorkersSection {
    fn default() -> Self {
        Self {
            liveness_window_secs: DEFAULT_LIVENESS_WINDOW.as_secs(),
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSection {
    pub timeout_secs: u64,
    pub init_timeout_secs: u64,
    pub command: String,
    pub default_phase_tokens: u64,
    pub strategy: String,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_EXECUTION_TIMEOUT.as_secs(),
            init_timeout_secs: DEFAULT_INIT_TIMEOUT.as_secs(),
            command: "claude".to_string(),
            default_phase_tokens: DEFAULT_ITEM_TOKENS,
            strategy: Strategy::LoadBalanced.name().to_string(),
        }
    }
}

/// Process-wide settings, loaded once at startup and passed down.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub budget: BudgetSection,
    pub queue: QueueSection,
    pub workers: WorkersSection,
    pub execution: ExecutionSection,
}

impl Config {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conductor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    pub fn state_dir() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("state"))
    }

    pub fn log_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.log"))
    }

    /// Load the config file (defaults when absent), apply environment
    /// overrides and validate.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_file()?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_file() -> Result<Self> {
        let path = Self::config_path()?;
        tracing::debug!(path = %path.display(), "loading config");
        if !path.exists() {
            tracing::debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::parse(&fs::read_to_string(&path)?)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::conductor_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "config saved");
        Ok(())
    }

    /// Apply `CONDUCTOR_*` overrides. `lookup` returns the raw value of a
    /// variable, if set.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        override_with(&lookup, "CONDUCTOR_DAILY_TOKEN_CAP", &mut self.budget.daily_token_cap)?;
        override_with(&lookup, "CONDUCTOR_PER_REQUEST_TOKEN_CAP", &mut self.budget.per_request_token_cap)?;
        override_with(&lookup, "CONDUCTOR_REQUESTS_PER_MINUTE", &mut self.budget.requests_per_minute)?;
        override_with(&lookup, "CONDUCTOR_REQUESTS_PER_HOUR", &mut self.budget.requests_per_hour)?;
        override_with(&lookup, "CONDUCTOR_MAX_QUEUE_DEPTH", &mut self.budget.max_queue_depth)?;
        override_with(&lookup, "CONDUCTOR_MAX_PARALLEL_WORKERS", &mut self.budget.max_parallel_workers)?;
        override_with(&lookup, "CONDUCTOR_MAX_RETRIES", &mut self.queue.max_retries)?;
        override_with(&lookup, "CONDUCTOR_RETRY_BASE_DELAY_MS", &mut self.queue.retry_base_delay_ms)?;
        override_with(&lookup, "CONDUCTOR_LIVENESS_WINDOW_SECS", &mut self.workers.liveness_window_secs)?;
        override_with(&lookup, "CONDUCTOR_EXECUTION_TIMEOUT_SECS", &mut self.execution.timeout_secs)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let b = &self.budget;
        let nonzero = [
            ("budget.daily_token_cap", b.daily_token_cap),
            ("budget.per_request_token_cap", b.per_request_token_cap),
            ("budget.requests_per_minute", b.requests_per_minute as u64),
            ("budget.requests_per_hour", b.requests_per_hour as u64),
            ("budget.max_queue_depth", b.max_queue_depth as u64),
            ("budget.max_parallel_workers", b.max_parallel_workers as u64),
            ("queue.max_concurrent", self.queue.max_concurrent as u64),
            ("workers.liveness_window_secs", self.workers.liveness_window_secs),
            ("workers.sweep_interval_secs", self.workers.sweep_interval_secs),
            ("execution.timeout_secs", self.execution.timeout_secs),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(Error::Config(format!("{} must be greater than zero", name)));
        }
        if !(b.warning_threshold > 0.0 && b.warning_threshold <= 1.0) {
            return Err(Error::Config(format!(
                "budget.warning_threshold must be in (0, 1], got {}",
                b.warning_threshold
            )));
        }
        if self.queue.max_size < b.max_queue_depth {
            return Err(Error::Config(format!(
                "queue.max_size ({}) must be at least budget.max_queue_depth ({})",
                self.queue.max_size, b.max_queue_depth
            )));
        }
        StrategyRegistry::default().get(&self.execution.strategy)?;
        Ok(())
    }

    pub fn budget_limits(&self) -> BudgetLimits {
        let b = &self.budget;
        BudgetLimits {
            daily_token_cap: b.daily_token_cap,
            per_request_token_cap: b.per_request_token_cap,
            requests_per_minute: b.requests_per_minute,
            requests_per_hour: b.requests_per_hour,
            max_queue_depth: b.max_queue_depth,
            max_parallel_workers: b.max_parallel_workers,
            warning_threshold: b.warning_threshold,
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_concurrent: self.queue.max_concurrent,
            max_size: self.queue.max_size,
            max_retries: self.queue.max_retries,
            retry_base_delay: Duration::from_millis(self.queue.retry_base_delay_ms),
            completed_history: self.queue.completed_history,
            default_tokens: self.execution.default_phase_tokens,
        }
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.workers.liveness_window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.workers.sweep_interval_secs)
    }

    pub fn coordinator_config(&self) -> Result<CoordinatorConfig> {
        Ok(CoordinatorConfig {
            queue: self.queue_config(),
            limits: self.budget_limits(),
            strategy: StrategyRegistry::default().get(&self.execution.strategy)?,
            requirements: ProjectRequirements::default(),
            execution_timeout: Duration::from_secs(self.execution.timeout_secs),
            init_timeout: Duration::from_secs(self.execution.init_timeout_secs),
            max_iterations: DEFAULT_MAX_ITERATIONS,
        })
    }
}

fn override_with<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) -> Result<()> {
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{} has an invalid value: {}", key, raw)))?;
        tracing::debug!(key, "config override from environment");
    }
    Ok(())
}
