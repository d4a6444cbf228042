//! Settlement glue: ties ensemble outcomes to grade persistence and the
//! credit ledger.
//!
//! Ordering matters for crash safety: the grade reaches its terminal state
//! first, then the ledger settles. The grade is the source of truth; ledger
//! settlement is replay-idempotent, so resuming after a crash between the two
//! steps cannot double-settle.

use crate::errors::Result;
use crate::grading::ensemble::EnsembleExhausted;
use crate::grading::job::{Grade, GradeReport, Processing};
use crate::metrics;
use crate::storage::{Settlement, Storage};

/// Persist a completed grade, then clear the credit reservation.
pub async fn settle_success<S: Storage>(
    storage: &S,
    grade: Grade<Processing>,
    report: GradeReport,
) -> Result<()> {
    let grade_id = grade.data.id;
    let cost = grade.data.cost;
    let started_at = grade.state.started_at;

    for result in &report.model_results {
        if !result.included && result.percentage.is_some() {
            metrics::record_run_excluded(&result.model);
        }
    }

    let completed = grade.complete(report, storage).await?;

    match storage.settle_cleared(grade_id).await? {
        Settlement::Applied => {
            metrics::record_grading_completed(cost.minor_units());
        }
        Settlement::AlreadySettled => {
            tracing::debug!(grade_id = %grade_id, "reservation already settled, skipping");
        }
    }

    let duration = (completed.state.completed_at - started_at)
        .to_std()
        .unwrap_or_default();
    metrics::record_grading_duration(duration.as_secs_f64());

    tracing::info!(
        grade_id = %grade_id,
        lower = completed.state.report.percentage_range.lower,
        upper = completed.state.report.percentage_range.upper,
        "grading complete, reservation cleared"
    );
    Ok(())
}

/// Persist a failed grade with the generic user message, then refund.
///
/// The exhausted ensemble's internal failure causes are logged here for
/// operators and go nowhere else.
pub async fn settle_failure<S: Storage>(
    storage: &S,
    grade: Grade<Processing>,
    exhausted: &EnsembleExhausted,
) -> Result<()> {
    let grade_id = grade.data.id;
    let cost = grade.data.cost;

    for (model, error) in &exhausted.failures {
        tracing::error!(grade_id = %grade_id, model = %model, error = %error, "ensemble run failed");
    }

    grade.fail(storage).await?;

    match storage.settle_refunded(grade_id).await? {
        Settlement::Applied => {
            metrics::record_grading_failed(cost.minor_units());
        }
        Settlement::AlreadySettled => {
            tracing::debug!(grade_id = %grade_id, "reservation already settled, skipping");
        }
    }

    tracing::warn!(grade_id = %grade_id, runs = exhausted.runs, "grading failed, reservation refunded");
    Ok(())
}
