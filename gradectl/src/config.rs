//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable
//! overrides. The file path defaults to `config.yaml` but can be specified
//! via `-f` flag or `GRADECTL_CONFIG` environment variable.
//!
//! ## Loading Priority
//!
//! Sources are merged in order, later sources overriding earlier ones:
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `GRADECTL_`
//!
//! For nested values, use double underscores: `GRADECTL_CREDITS__GRADING_COST=2.00`
//! sets `credits.grading_cost`.
//!
//! The `grading` section feeds the per-invocation ensemble config resolver.
//! Its tiers are evaluated first match wins: operator override models >
//! testing configuration (when `grading.testing_mode` is on) > production
//! configuration > the hardcoded fallback.

use clap::Parser;
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::grading::config::{resolve_config, GradingConfig, RunSpec};
use crate::grading::daemon::DaemonConfig;
use crate::grading::provider::{ProviderConfig, ReasoningEffort};
use crate::grading::retry::RetryPolicy;
use crate::money::Money;

/// Simple CLI args - just for specifying the config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "GRADECTL_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the daemon.
    /// Useful for CI/CD pipelines to catch config errors before deployment.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub credits: CreditsConfig,
    pub grading: GradingSettings,
    pub daemon: DaemonConfig,
    pub provider: ProviderConfig,
}

/// Credit system configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CreditsConfig {
    /// Credit reserved per grading job.
    pub grading_cost: Money,
    /// Credit granted to newly created accounts.
    pub signup_bonus: Money,
}

impl Default for CreditsConfig {
    fn default() -> Self {
        Self {
            grading_cost: Money::parse("1.00").unwrap_or(Money::ZERO),
            signup_bonus: Money::parse("3.00").unwrap_or(Money::ZERO),
        }
    }
}

/// Layered sources for the grading ensemble configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GradingSettings {
    /// Operator override model list for emergency bypass. Takes precedence
    /// over every other tier when present and non-empty.
    pub override_models: Option<Vec<String>>,
    /// Global testing flag: routes gradings to the low-cost testing tier.
    pub testing_mode: bool,
    /// Explicit testing tier; a built-in low-cost default applies when this
    /// is absent and `testing_mode` is on.
    pub testing: Option<GradingTier>,
    /// Production tier.
    pub production: Option<GradingTier>,
}

impl GradingSettings {
    /// The ordered tier list consumed by the resolver.
    pub fn tiers(&self) -> Vec<Option<GradingConfig>> {
        vec![
            self.override_tier(),
            self.testing_tier(),
            self.production.as_ref().map(GradingTier::to_config),
        ]
    }

    /// Resolve the effective ensemble configuration for one invocation.
    pub fn resolve(&self) -> GradingConfig {
        resolve_config(self.tiers())
    }

    fn override_tier(&self) -> Option<GradingConfig> {
        let models = self.override_models.as_deref().filter(|m| !m.is_empty())?;
        // Overrides replace the run list; sampling and retry parameters come
        // from the production tier (or the fallback) unchanged.
        let base = self
            .production
            .as_ref()
            .map(GradingTier::to_config)
            .unwrap_or_else(GradingConfig::fallback);
        Some(GradingConfig {
            runs: models.iter().map(|model| RunSpec::new(model.as_str())).collect(),
            ..base
        })
    }

    fn testing_tier(&self) -> Option<GradingConfig> {
        if !self.testing_mode {
            return None;
        }
        Some(
            self.testing
                .as_ref()
                .map(GradingTier::to_config)
                .unwrap_or_else(GradingConfig::testing),
        )
    }
}

/// One configurable grading tier, as written in the config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GradingTier {
    pub runs: Vec<RunEntry>,
    pub temperature: f64,
    pub max_tokens: u32,
    pub outlier_threshold_percent: f64,
    pub max_retries: u32,
    pub backoff_ms: Vec<u64>,
    pub synthesis_model: Option<String>,
}

impl Default for GradingTier {
    fn default() -> Self {
        let defaults = GradingConfig::fallback();
        Self {
            runs: Vec::new(),
            temperature: defaults.temperature,
            max_tokens: defaults.max_tokens,
            outlier_threshold_percent: defaults.outlier_threshold_percent,
            max_retries: defaults.retry.max_retries,
            backoff_ms: defaults
                .retry
                .backoff
                .iter()
                .map(|d| d.as_millis() as u64)
                .collect(),
            synthesis_model: None,
        }
    }
}

impl GradingTier {
    pub fn to_config(&self) -> GradingConfig {
        GradingConfig {
            runs: self
                .runs
                .iter()
                .map(|entry| RunSpec {
                    model: entry.model.clone(),
                    reasoning_effort: entry.reasoning_effort,
                })
                .collect(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            outlier_threshold_percent: self.outlier_threshold_percent,
            retry: RetryPolicy {
                max_retries: self.max_retries,
                backoff: self
                    .backoff_ms
                    .iter()
                    .map(|ms| std::time::Duration::from_millis(*ms))
                    .collect(),
            },
            synthesis_model: self.synthesis_model.clone(),
        }
    }
}

/// One run entry in a tier.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunEntry {
    pub model: String,
    #[serde(default)]
    pub reasoning_effort: Option<ReasoningEffort>,
}

impl Config {
    /// Load configuration from the YAML file and environment.
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config
            .validate()
            .map_err(figment::Error::from)?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("GRADECTL_").split("__"))
    }

    fn validate(&self) -> Result<(), String> {
        if !self.credits.grading_cost.is_positive() {
            return Err("credits.grading_cost must be positive".to_string());
        }
        if self.credits.signup_bonus.is_negative() {
            return Err("credits.signup_bonus must not be negative".to_string());
        }
        if self.daemon.claim_batch_size == 0 {
            return Err("daemon.claim_batch_size must be at least 1".to_string());
        }
        if self.daemon.max_concurrent_jobs == 0 {
            return Err("daemon.max_concurrent_jobs must be at least 1".to_string());
        }
        Ok(())
    }
}
