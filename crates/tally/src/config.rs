//! Configuration management for Tally.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::Path;

use tally_common::constants::{
    DEFAULT_CAPTCHA_BLOCK_RECENCY, DEFAULT_EXPORT_INTERVAL_SECS, DEFAULT_LISTEN_ADDR,
    DEFAULT_RECALCULATE_INTERVAL_SECS, DEFAULT_REDIS_URL, DEFAULT_REQUIRED_NUMBER_OF_SOLUTIONS,
    DEFAULT_SOLUTION_WINNING_PERCENTAGE,
};

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Redis connection URL (primary store)
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Ops HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Primary store backend
    #[serde(default)]
    pub store: StoreBackend,

    /// Where exported commitments go. Export is skipped when unset.
    #[serde(default)]
    pub external_sink_uri: Option<String>,

    /// Dataset acceptance thresholds
    #[serde(default)]
    pub captchas: CaptchaThresholds,

    /// Consensus parameters
    #[serde(default)]
    pub captcha_solutions: CaptchaSolutionsConfig,

    /// Task intervals
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Task coordination
    #[serde(default)]
    pub tasks: TaskConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Redis,
    /// Non-persistent, single process
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptchaThresholds {
    #[serde(default = "default_solved")]
    pub solved: CaptchaCount,
    #[serde(default = "default_unsolved")]
    pub unsolved: CaptchaCount,
}

impl Default for CaptchaThresholds {
    fn default() -> Self {
        Self {
            solved: default_solved(),
            unsolved: default_unsolved(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CaptchaCount {
    pub count: usize,
}

/// Majority-vote parameters
#[derive(Debug, Clone, Deserialize)]
pub struct CaptchaSolutionsConfig {
    /// Distinct commitments needed before an answer is accepted
    #[serde(default = "default_required_solutions")]
    pub required_number_of_solutions: usize,

    /// Share of the sample the leading answer must hold (0-100]
    #[serde(default = "default_winning_percentage")]
    pub solution_winning_percentage: f64,

    /// Number of most recent blocks whose commitments are counted
    #[serde(default = "default_block_recency")]
    pub captcha_block_recency: u64,
}

impl Default for CaptchaSolutionsConfig {
    fn default() -> Self {
        Self {
            required_number_of_solutions: default_required_solutions(),
            solution_winning_percentage: default_winning_percentage(),
            captcha_block_recency: default_block_recency(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_recalculate_interval")]
    pub recalculate_interval_secs: u64,

    #[serde(default = "default_export_interval")]
    pub export_interval_secs: u64,

    /// Run each task once at startup instead of waiting a full interval
    #[serde(default = "default_true")]
    pub run_on_start: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            recalculate_interval_secs: default_recalculate_interval(),
            export_interval_secs: default_export_interval(),
            run_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskConfig {
    /// Fail a Running record older than this when a new run is requested.
    /// Unset: a crashed run blocks its task until an operator intervenes.
    #[serde(default)]
    pub stale_after_secs: Option<u64>,
}

// Default value functions
fn default_redis_url() -> String { DEFAULT_REDIS_URL.to_string() }
fn default_listen_addr() -> String { DEFAULT_LISTEN_ADDR.to_string() }
fn default_solved() -> CaptchaCount { CaptchaCount { count: 1 } }
fn default_unsolved() -> CaptchaCount { CaptchaCount { count: 1 } }
fn default_required_solutions() -> usize { DEFAULT_REQUIRED_NUMBER_OF_SOLUTIONS }
fn default_winning_percentage() -> f64 { DEFAULT_SOLUTION_WINNING_PERCENTAGE }
fn default_block_recency() -> u64 { DEFAULT_CAPTCHA_BLOCK_RECENCY }
fn default_recalculate_interval() -> u64 { DEFAULT_RECALCULATE_INTERVAL_SECS }
fn default_export_interval() -> u64 { DEFAULT_EXPORT_INTERVAL_SECS }
fn default_true() -> bool { true }

impl AppConfig {
    /// Load configuration from file, with CLI overrides
    pub fn load(config_path: &str, args: &super::Args) -> Result<Self> {
        let mut config = if Path::new(config_path).exists() {
            let settings = config::Config::builder()
                .add_source(config::File::with_name(config_path))
                .build()
                .context("Failed to load config file")?;

            settings
                .try_deserialize()
                .context("Failed to parse config")?
        } else {
            // Use defaults if config file doesn't exist
            tracing::warn!("Config file not found, using defaults");
            Self::default()
        };

        // Apply CLI overrides
        if let Some(ref redis_url) = args.redis_url {
            config.redis_url = redis_url.clone();
        }
        if let Some(ref listen) = args.listen {
            config.listen_addr = listen.clone();
        }
        if let Some(ref sink) = args.external_sink_uri {
            config.external_sink_uri = Some(sink.clone());
        }
        if args.memory_store {
            config.store = StoreBackend::Memory;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject parameter combinations consensus cannot work with
    pub fn validate(&self) -> Result<()> {
        let solutions = &self.captcha_solutions;
        if solutions.required_number_of_solutions < 2 {
            bail!("captcha_solutions.required_number_of_solutions must be at least 2");
        }
        if !(solutions.solution_winning_percentage > 0.0
            && solutions.solution_winning_percentage <= 100.0)
        {
            bail!("captcha_solutions.solution_winning_percentage must be in (0, 100]");
        }
        if solutions.captcha_block_recency < 2 {
            bail!("captcha_solutions.captcha_block_recency must be at least 2");
        }
        if self.captchas.solved.count == 0 {
            bail!("captchas.solved.count must be positive");
        }
        if self.schedule.recalculate_interval_secs == 0 || self.schedule.export_interval_secs == 0 {
            bail!("schedule intervals must be positive");
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            listen_addr: default_listen_addr(),
            store: StoreBackend::default(),
            external_sink_uri: None,
            captchas: CaptchaThresholds::default(),
            captcha_solutions: CaptchaSolutionsConfig::default(),
            schedule: ScheduleConfig::default(),
            tasks: TaskConfig::default(),
        }
    }
}
