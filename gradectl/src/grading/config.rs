//! Grading ensemble configuration and the layered resolver.
//!
//! Configuration is resolved per invocation from an ordered list of tiers,
//! first match wins: operator override > testing configuration (when the
//! global testing flag is on) > production configuration > hardcoded
//! fallback. The resolved value is fixed before any network call is issued.

use super::provider::ReasoningEffort;
use super::retry::RetryPolicy;

/// Minimum and maximum ensemble size. Run lists are clamped into this range:
/// short lists pad by repeating the first model, long lists truncate.
pub const MIN_RUNS: usize = 3;
pub const MAX_RUNS: usize = 5;

/// Model used when no configuration tier is present at all.
pub const FALLBACK_MODEL: &str = "anthropic/claude-sonnet-4";

/// Low-cost model used by the built-in testing tier.
pub const TESTING_MODEL: &str = "google/gemini-3-flash-preview";

/// Maximum allowed deviation from the mean score before a run is excluded.
pub const DEFAULT_OUTLIER_THRESHOLD_PERCENT: f64 = 10.0;

/// One ensemble run: a model plus its reasoning policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    pub model: String,
    pub reasoning_effort: Option<ReasoningEffort>,
}

impl RunSpec {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            reasoning_effort: None,
        }
    }
}

/// Fully resolved ensemble configuration, treated as a value object.
#[derive(Debug, Clone, PartialEq)]
pub struct GradingConfig {
    pub runs: Vec<RunSpec>,
    pub temperature: f64,
    pub max_tokens: u32,
    pub outlier_threshold_percent: f64,
    pub retry: RetryPolicy,
    /// Enables the synthesis pass when set.
    pub synthesis_model: Option<String>,
}

impl GradingConfig {
    /// Hardcoded last-resort configuration: the fallback model repeated three
    /// times, default sampling and retry parameters.
    pub fn fallback() -> Self {
        Self {
            runs: vec![RunSpec::new(FALLBACK_MODEL); MIN_RUNS],
            temperature: 0.2,
            max_tokens: 8192,
            outlier_threshold_percent: DEFAULT_OUTLIER_THRESHOLD_PERCENT,
            retry: RetryPolicy::default(),
            synthesis_model: None,
        }
    }

    /// Low-cost configuration selected when the global testing flag is on.
    pub fn testing() -> Self {
        Self {
            runs: vec![RunSpec::new(TESTING_MODEL); MIN_RUNS],
            temperature: 0.2,
            max_tokens: 2048,
            outlier_threshold_percent: DEFAULT_OUTLIER_THRESHOLD_PERCENT,
            retry: RetryPolicy::default(),
            synthesis_model: None,
        }
    }

    /// Clamp the run count into `[MIN_RUNS, MAX_RUNS]`.
    fn clamp_runs(mut self) -> Self {
        self.runs.truncate(MAX_RUNS);
        if self.runs.len() < MIN_RUNS {
            if let Some(first) = self.runs.first().cloned() {
                while self.runs.len() < MIN_RUNS {
                    self.runs.push(first.clone());
                }
            } else {
                self.runs = vec![RunSpec::new(FALLBACK_MODEL); MIN_RUNS];
            }
        }
        self
    }
}

/// Resolve the effective configuration from ordered tiers.
///
/// Tiers are evaluated in sequence and the first present value wins; when no
/// tier is present the hardcoded fallback applies. The winner's run list is
/// clamped, so the result never has a partial or ambiguous shape.
pub fn resolve_config(tiers: impl IntoIterator<Item = Option<GradingConfig>>) -> GradingConfig {
    tiers
        .into_iter()
        .flatten()
        .next()
        .unwrap_or_else(GradingConfig::fallback)
        .clamp_runs()
}
