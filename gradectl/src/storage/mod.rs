use std::future::Future;

use crate::credits::{CreditAccount, CreditTransaction, CreditTransactionType};
use crate::errors::Result;
use crate::grading::job::{AnyGrade, EssaySubmission, Grade, GradeState, Processing, Queued};
use crate::money::Money;
use crate::types::{DaemonId, GradeId, UserId};

pub mod in_memory;

/// Outcome of a settlement attempt.
///
/// Settlement is replay-idempotent: the second attempt for the same grade is
/// a no-op, so a crash between grade persistence and ledger settlement can be
/// resumed safely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Applied,
    AlreadySettled,
}

/// Storage trait for accounts, the transaction ledger, and grading jobs.
///
/// Every account mutation is a single atomic read-modify-write: there is no
/// gap between reading a balance and patching it, so two concurrent
/// reservations can never over-draw an account. Account patches and their
/// transaction records commit together or not at all.
pub trait Storage: Send + Sync {
    // ------------------------------------------------------------------
    // Accounts and ledger
    // ------------------------------------------------------------------

    /// Create a credit account, crediting the signup bonus when non-zero.
    ///
    /// # Errors
    /// - `AlreadyExists` if the user already has an account
    fn create_account(
        &self,
        user_id: UserId,
        signup_bonus: Money,
    ) -> impl Future<Output = Result<CreditAccount>> + Send;

    /// Current account snapshot.
    fn account(&self, user_id: UserId) -> impl Future<Output = Result<CreditAccount>> + Send;

    /// Credit a completed purchase to the balance.
    fn apply_purchase(
        &self,
        user_id: UserId,
        amount: Money,
        description: Option<String>,
    ) -> impl Future<Output = Result<CreditTransaction>> + Send;

    /// Apply a signed admin adjustment. Rejected if it would push the
    /// balance negative.
    fn apply_adjustment(
        &self,
        user_id: UserId,
        amount: Money,
        description: Option<String>,
    ) -> impl Future<Output = Result<CreditTransaction>> + Send;

    /// All transactions for a user, most recent first.
    fn list_transactions(
        &self,
        user_id: UserId,
    ) -> impl Future<Output = Result<Vec<CreditTransaction>>> + Send;

    /// Find the transaction of the given type linked to a grading job, if one
    /// was recorded. This is the settlement replay check.
    fn find_grade_transaction(
        &self,
        grade_id: GradeId,
        transaction_type: CreditTransactionType,
    ) -> impl Future<Output = Result<Option<CreditTransaction>>> + Send;

    // ------------------------------------------------------------------
    // Grading lifecycle
    // ------------------------------------------------------------------

    /// Reserve `cost` from the user's balance and enqueue a grading job, as
    /// one atomic operation. Records the grading charge transaction.
    ///
    /// # Errors
    /// - `Ledger(InsufficientCredit)` if the balance does not cover the cost;
    ///   no job is created and no state changes
    fn enqueue_grading(
        &self,
        user_id: UserId,
        essay: EssaySubmission,
        cost: Money,
    ) -> impl Future<Output = Result<Grade<Queued>>> + Send;

    /// Atomically claim one specific grade for processing.
    ///
    /// Returns `None` when the grade exists but is not `Queued`; re-delivery
    /// of an already-claimed job is therefore a no-op for the caller.
    fn claim(
        &self,
        grade_id: GradeId,
        daemon_id: DaemonId,
    ) -> impl Future<Output = Result<Option<Grade<Processing>>>> + Send;

    /// Atomically claim up to `limit` queued grades, oldest first.
    fn claim_queued(
        &self,
        limit: usize,
        daemon_id: DaemonId,
    ) -> impl Future<Output = Result<Vec<Grade<Processing>>>> + Send;

    /// Update an existing grade's state in storage.
    ///
    /// The type system ensures valid state transitions; terminal states are
    /// immutable and may not be overwritten.
    fn persist<T: GradeState + Clone>(
        &self,
        grade: &Grade<T>,
    ) -> impl Future<Output = Result<()>> + Send
    where
        AnyGrade: From<Grade<T>>;

    /// Get a grade in whatever state it currently is.
    fn grade(&self, grade_id: GradeId) -> impl Future<Output = Result<AnyGrade>> + Send;

    // ------------------------------------------------------------------
    // Settlement
    // ------------------------------------------------------------------

    /// Success path: drop the in-flight marker for the grade's reservation.
    /// The balance was already deducted at reservation time.
    fn settle_cleared(&self, grade_id: GradeId)
        -> impl Future<Output = Result<Settlement>> + Send;

    /// Failure path: restore the reserved amount to the balance and record
    /// the refund transaction.
    fn settle_refunded(
        &self,
        grade_id: GradeId,
    ) -> impl Future<Output = Result<Settlement>> + Send;
}
