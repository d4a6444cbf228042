//! Core types for the grading lifecycle.
//!
//! This module defines the type-safe grade lifecycle using the typestate
//! pattern. Each grading job progresses through distinct states, enforced at
//! compile time: `Queued -> Processing -> {Complete, Failed}`.
//!
//! The `Queued -> Processing` transition is the idempotency guard: it happens
//! atomically in storage, and a job that is not `Queued` when picked up is
//! simply not claimable, making re-delivery of the same job a no-op. Terminal
//! states are immutable; regrading creates a new job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::grading::verdict::{CategoryScore, Feedback};
use crate::money::Money;
use crate::types::{DaemonId, GradeId, UserId};

/// The one user-visible failure message. Internal error detail goes to the
/// operator log, never into a persisted grade.
pub const FAILED_USER_MESSAGE: &str = "Grading failed. You have not been charged.";

/// Marker trait for valid grade states.
pub trait GradeState: Send + Sync {}

/// A grading job in state `T`.
#[derive(Debug, Clone)]
pub struct Grade<T: GradeState> {
    pub state: T,
    pub data: GradeData,
}

/// Submission-time data, fixed for the life of the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeData {
    pub id: GradeId,
    pub user_id: UserId,
    pub essay: EssaySubmission,
    /// Credit reserved for this job at submission.
    pub cost: Money,
    pub queued_at: DateTime<Utc>,
}

/// An already-validated essay payload, as handed over by the upload pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EssaySubmission {
    /// Assignment instructions given to the student.
    pub instructions: String,
    /// Rubric text, when the assignment has one.
    pub rubric_text: Option<String>,
    /// Aspects the student asked the graders to focus on.
    #[serde(default)]
    pub focus_areas: Vec<String>,
    pub academic_level: AcademicLevel,
    /// The essay body itself.
    pub body_text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcademicLevel {
    HighSchool,
    Undergraduate,
    Masters,
    Doctoral,
}

impl AcademicLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AcademicLevel::HighSchool => "high school",
            AcademicLevel::Undergraduate => "undergraduate",
            AcademicLevel::Masters => "masters",
            AcademicLevel::Doctoral => "doctoral",
        }
    }
}

// ============================================================================
// Grade states
// ============================================================================

/// Waiting to be picked up by a grading daemon.
#[derive(Debug, Clone)]
pub struct Queued {}

impl GradeState for Queued {}

/// Claimed by a daemon; the ensemble is running.
#[derive(Debug, Clone)]
pub struct Processing {
    pub daemon_id: DaemonId,
    pub started_at: DateTime<Utc>,
}

impl GradeState for Processing {}

/// The ensemble produced a defensible grade.
#[derive(Debug, Clone)]
pub struct Complete {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub report: GradeReport,
}

impl GradeState for Complete {}

/// Every run failed or was excluded; the user was refunded.
#[derive(Debug, Clone)]
pub struct Failed {
    pub failed_at: DateTime<Utc>,
    /// Always [`FAILED_USER_MESSAGE`].
    pub error_message: String,
}

impl GradeState for Failed {}

// ============================================================================
// Aggregated result
// ============================================================================

/// The reconciled output of one grading ensemble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeReport {
    pub percentage_range: PercentageRange,
    pub category_scores: Vec<CategoryScore>,
    pub feedback: Feedback,
    pub model_results: Vec<ModelResult>,
    /// Token total across all runs, including excluded runs and the synthesis
    /// pass. Money was spent on those calls regardless of inclusion.
    pub total_tokens: Option<u64>,
    /// Provider-reported cost total in dollars, same coverage as
    /// `total_tokens`.
    pub api_cost: Option<f64>,
    pub prompt_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentageRange {
    pub lower: f64,
    pub upper: f64,
}

/// Outcome of one ensemble run, recorded once at orchestration end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResult {
    pub model: String,
    /// Raw score before outlier filtering; `None` when the run produced no
    /// usable output.
    pub percentage: Option<f64>,
    /// Outlier-detector decision.
    pub included: bool,
    /// Why the run was excluded or failed, when it was.
    pub reason: Option<String>,
    pub duration_ms: u64,
    /// Provider-reported cost of this run in dollars.
    pub cost: Option<f64>,
    /// True when the verdict was salvaged from malformed output.
    pub recovered: bool,
}

// ============================================================================
// Unified representation
// ============================================================================

/// A grade in any state, for storage and queries.
#[derive(Debug, Clone)]
pub enum AnyGrade {
    Queued(Grade<Queued>),
    Processing(Grade<Processing>),
    Complete(Grade<Complete>),
    Failed(Grade<Failed>),
}

impl AnyGrade {
    pub fn id(&self) -> GradeId {
        self.data().id
    }

    pub fn data(&self) -> &GradeData {
        match self {
            AnyGrade::Queued(g) => &g.data,
            AnyGrade::Processing(g) => &g.data,
            AnyGrade::Complete(g) => &g.data,
            AnyGrade::Failed(g) => &g.data,
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            AnyGrade::Queued(_) => "queued",
            AnyGrade::Processing(_) => "processing",
            AnyGrade::Complete(_) => "complete",
            AnyGrade::Failed(_) => "failed",
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, AnyGrade::Queued(_))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AnyGrade::Complete(_) | AnyGrade::Failed(_))
    }

    pub fn as_complete(&self) -> Option<&Grade<Complete>> {
        match self {
            AnyGrade::Complete(g) => Some(g),
            _ => None,
        }
    }

    pub fn as_failed(&self) -> Option<&Grade<Failed>> {
        match self {
            AnyGrade::Failed(g) => Some(g),
            _ => None,
        }
    }
}

impl From<Grade<Queued>> for AnyGrade {
    fn from(g: Grade<Queued>) -> Self {
        AnyGrade::Queued(g)
    }
}

impl From<Grade<Processing>> for AnyGrade {
    fn from(g: Grade<Processing>) -> Self {
        AnyGrade::Processing(g)
    }
}

impl From<Grade<Complete>> for AnyGrade {
    fn from(g: Grade<Complete>) -> Self {
        AnyGrade::Complete(g)
    }
}

impl From<Grade<Failed>> for AnyGrade {
    fn from(g: Grade<Failed>) -> Self {
        AnyGrade::Failed(g)
    }
}

// ============================================================================
// Transitions
// ============================================================================

use crate::errors::Result;
use crate::storage::Storage;

impl Grade<Processing> {
    /// Terminal success: persist the aggregated report.
    pub async fn complete<S: Storage + ?Sized>(
        self,
        report: GradeReport,
        storage: &S,
    ) -> Result<Grade<Complete>> {
        let grade = Grade {
            state: Complete {
                started_at: self.state.started_at,
                completed_at: Utc::now(),
                report,
            },
            data: self.data,
        };
        storage.persist(&grade).await?;
        Ok(grade)
    }

    /// Terminal failure: persist with the generic user-facing message.
    pub async fn fail<S: Storage + ?Sized>(self, storage: &S) -> Result<Grade<Failed>> {
        let grade = Grade {
            state: Failed {
                failed_at: Utc::now(),
                error_message: FAILED_USER_MESSAGE.to_string(),
            },
            data: self.data,
        };
        storage.persist(&grade).await?;
        Ok(grade)
    }
}
