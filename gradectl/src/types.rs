//! Shared identifier types.

use uuid::Uuid;

/// Identifier of a user account.
pub type UserId = Uuid;

/// Identifier of a grading job.
pub type GradeId = Uuid;

/// Identifier of a grading daemon instance.
pub type DaemonId = Uuid;
