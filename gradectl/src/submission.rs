//! Submission flow: reserve credit and enqueue the grading job.
//!
//! The caller arrives with an already-validated essay payload; uploads,
//! sessions, and text extraction happen upstream. Reservation and job
//! creation are one atomic storage operation, so a job can only exist with
//! its credit already held.

use crate::errors::{Error, Result};
use crate::grading::job::EssaySubmission;
use crate::money::Money;
use crate::storage::Storage;
use crate::types::{GradeId, UserId};

/// Reserve `cost` from the user's balance and enqueue a grading job.
///
/// Fails with `InsufficientCredit` before any state changes when the balance
/// does not cover the cost. The returned id can be handed to the grading
/// daemon for direct dispatch; the daemon's claim loop will also pick the job
/// up on its own.
pub async fn submit_essay<S: Storage>(
    storage: &S,
    user_id: UserId,
    essay: EssaySubmission,
    cost: Money,
) -> Result<GradeId> {
    if essay.body_text.trim().is_empty() {
        return Err(Error::BadRequest {
            message: "essay body is empty".to_string(),
        });
    }

    let grade = storage.enqueue_grading(user_id, essay, cost).await?;
    tracing::info!(
        grade_id = %grade.data.id,
        user_id = %user_id,
        cost = %cost,
        "essay queued for grading"
    );
    Ok(grade.data.id)
}
