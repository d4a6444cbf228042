//! Prometheus counters for grading outcomes and credit settlement.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, Histogram, IntCounter,
    IntCounterVec,
};

/// Counter for gradings that completed with a defensible grade
static GRADINGS_COMPLETED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "gradectl_gradings_completed_total",
        "Total grading jobs completed successfully"
    )
    .expect("Failed to register gradectl_gradings_completed_total metric")
});

/// Counter for gradings that exhausted every run and were refunded
static GRADINGS_FAILED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "gradectl_gradings_failed_total",
        "Total grading jobs that failed and were refunded"
    )
    .expect("Failed to register gradectl_gradings_failed_total metric")
});

/// Counter for ensemble runs excluded as outliers, by model
static RUNS_EXCLUDED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "gradectl_runs_excluded_total",
        "Total ensemble runs excluded by the outlier detector",
        &["model"]
    )
    .expect("Failed to register gradectl_runs_excluded_total metric")
});

/// Counter for credits settled as spent (in cents)
static CREDITS_SPENT: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "gradectl_credits_spent_cents_total",
        "Total credits settled as spent for completed gradings (in cents)"
    )
    .expect("Failed to register gradectl_credits_spent_cents_total metric")
});

/// Counter for credits refunded after failed gradings (in cents)
static CREDITS_REFUNDED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "gradectl_credits_refunded_cents_total",
        "Total credits refunded for failed gradings (in cents)"
    )
    .expect("Failed to register gradectl_credits_refunded_cents_total metric")
});

/// Histogram for end-to-end grading duration
/// Buckets: 5s, 15s, 30s, 60s, 120s, 300s, 600s
static GRADING_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "gradectl_grading_duration_seconds",
        "Time from claim to terminal grade state (seconds)",
        vec![5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]
    )
    .expect("Failed to register gradectl_grading_duration_seconds metric")
});

pub fn record_grading_completed(cost_cents: i64) {
    GRADINGS_COMPLETED.inc();
    CREDITS_SPENT.inc_by(cost_cents.max(0) as u64);
}

pub fn record_grading_failed(refund_cents: i64) {
    GRADINGS_FAILED.inc();
    CREDITS_REFUNDED.inc_by(refund_cents.max(0) as u64);
}

pub fn record_run_excluded(model: &str) {
    RUNS_EXCLUDED.with_label_values(&[model]).inc();
}

pub fn record_grading_duration(seconds: f64) {
    GRADING_DURATION_SECONDS.observe(seconds);
}
