//! In-memory storage implementation.
//!
//! Stores accounts, the transaction ledger, and grades in memory behind one
//! lock, so every ledger mutation is a single atomic read-modify-write and an
//! account patch commits together with its transaction record. Suitable for
//! tests and single-process deployments; state is lost on restart.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;

use crate::credits::{CreditAccount, CreditTransaction, CreditTransactionType, LedgerError};
use crate::errors::{Error, Result};
use crate::grading::job::{
    AnyGrade, EssaySubmission, Grade, GradeData, GradeState, Processing, Queued,
};
use crate::money::Money;
use crate::types::{DaemonId, GradeId, UserId};

use super::{Settlement, Storage};

/// Money held in flight for a grading job that has not settled yet.
#[derive(Debug, Clone, Copy)]
struct OpenReservation {
    user_id: UserId,
    cost: Money,
}

#[derive(Default)]
struct State {
    accounts: HashMap<UserId, CreditAccount>,
    transactions: Vec<CreditTransaction>,
    grades: HashMap<GradeId, AnyGrade>,
    reservations: HashMap<GradeId, OpenReservation>,
}

/// In-memory implementation of the [`Storage`] trait.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    state: Arc<RwLock<State>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for InMemoryStorage {
    async fn create_account(&self, user_id: UserId, signup_bonus: Money) -> Result<CreditAccount> {
        let mut state = self.state.write();
        if state.accounts.contains_key(&user_id) {
            return Err(Error::AlreadyExists {
                resource: "account",
                id: user_id.to_string(),
            });
        }

        let account = if signup_bonus.is_positive() {
            let account = CreditAccount::new().apply_purchase(signup_bonus);
            state.transactions.push(CreditTransaction::record(
                user_id,
                CreditTransactionType::SignupBonus,
                signup_bonus,
                account.balance,
                None,
                Some("signup bonus".to_string()),
            ));
            account
        } else {
            CreditAccount::new()
        };

        state.accounts.insert(user_id, account);
        Ok(account)
    }

    async fn account(&self, user_id: UserId) -> Result<CreditAccount> {
        let state = self.state.read();
        state
            .accounts
            .get(&user_id)
            .copied()
            .ok_or_else(|| Error::NotFound {
                resource: "account",
                id: user_id.to_string(),
            })
    }

    async fn apply_purchase(
        &self,
        user_id: UserId,
        amount: Money,
        description: Option<String>,
    ) -> Result<CreditTransaction> {
        let mut state = self.state.write();
        let account = get_account(&state, user_id)?;

        let updated = account.apply_purchase(amount);
        let transaction = CreditTransaction::record(
            user_id,
            CreditTransactionType::Purchase,
            amount,
            updated.balance,
            None,
            description,
        );
        state.accounts.insert(user_id, updated);
        state.transactions.push(transaction.clone());
        Ok(transaction)
    }

    async fn apply_adjustment(
        &self,
        user_id: UserId,
        amount: Money,
        description: Option<String>,
    ) -> Result<CreditTransaction> {
        let mut state = self.state.write();
        let account = get_account(&state, user_id)?;

        let updated = account.apply_purchase(amount);
        if updated.balance.is_negative() {
            return Err(Error::Ledger(LedgerError::InsufficientCredit {
                balance: account.balance,
                required: amount.negate(),
            }));
        }
        let transaction = CreditTransaction::record(
            user_id,
            CreditTransactionType::AdminAdjustment,
            amount,
            updated.balance,
            None,
            description,
        );
        state.accounts.insert(user_id, updated);
        state.transactions.push(transaction.clone());
        Ok(transaction)
    }

    async fn list_transactions(&self, user_id: UserId) -> Result<Vec<CreditTransaction>> {
        let state = self.state.read();
        let mut transactions: Vec<CreditTransaction> = state
            .transactions
            .iter()
            .filter(|tx| tx.user_id == user_id)
            .cloned()
            .collect();
        transactions.reverse();
        Ok(transactions)
    }

    async fn find_grade_transaction(
        &self,
        grade_id: GradeId,
        transaction_type: CreditTransactionType,
    ) -> Result<Option<CreditTransaction>> {
        let state = self.state.read();
        Ok(state
            .transactions
            .iter()
            .find(|tx| tx.grade_id == Some(grade_id) && tx.transaction_type == transaction_type)
            .cloned())
    }

    async fn enqueue_grading(
        &self,
        user_id: UserId,
        essay: EssaySubmission,
        cost: Money,
    ) -> Result<Grade<Queued>> {
        let mut state = self.state.write();
        let account = get_account(&state, user_id)?;

        // Reserve, insert the job, and record the charge under one lock, so
        // concurrent submissions cannot over-draw the account.
        let reserved = account.reserve(cost)?;

        let grade = Grade {
            state: Queued {},
            data: GradeData {
                id: GradeId::new_v4(),
                user_id,
                essay,
                cost,
                queued_at: Utc::now(),
            },
        };

        state.accounts.insert(user_id, reserved);
        state.reservations.insert(
            grade.data.id,
            OpenReservation { user_id, cost },
        );
        state.transactions.push(CreditTransaction::record(
            user_id,
            CreditTransactionType::Grading,
            cost.negate(),
            reserved.balance,
            Some(grade.data.id),
            None,
        ));
        state.grades.insert(grade.data.id, grade.clone().into());
        Ok(grade)
    }

    async fn claim(
        &self,
        grade_id: GradeId,
        daemon_id: DaemonId,
    ) -> Result<Option<Grade<Processing>>> {
        let mut state = self.state.write();
        let existing = state.grades.get(&grade_id).ok_or_else(|| Error::NotFound {
            resource: "grade",
            id: grade_id.to_string(),
        })?;

        let queued = match existing {
            AnyGrade::Queued(grade) => grade.clone(),
            // Already claimed, completed, or failed: re-delivery is a no-op.
            _ => return Ok(None),
        };

        let claimed = Grade {
            state: Processing {
                daemon_id,
                started_at: Utc::now(),
            },
            data: queued.data,
        };
        state.grades.insert(grade_id, claimed.clone().into());
        Ok(Some(claimed))
    }

    async fn claim_queued(
        &self,
        limit: usize,
        daemon_id: DaemonId,
    ) -> Result<Vec<Grade<Processing>>> {
        let mut state = self.state.write();
        let now = Utc::now();

        let mut queued: Vec<(GradeId, chrono::DateTime<Utc>)> = state
            .grades
            .iter()
            .filter(|(_, grade)| grade.is_queued())
            .map(|(id, grade)| (*id, grade.data().queued_at))
            .collect();
        queued.sort_by_key(|(_, queued_at)| *queued_at);

        let mut claimed = Vec::new();
        for (id, _) in queued.into_iter().take(limit) {
            let data = match state.grades.get(&id) {
                Some(AnyGrade::Queued(grade)) => grade.data.clone(),
                _ => continue,
            };
            let processing = Grade {
                state: Processing {
                    daemon_id,
                    started_at: now,
                },
                data,
            };
            state.grades.insert(id, processing.clone().into());
            claimed.push(processing);
        }
        Ok(claimed)
    }

    async fn persist<T: GradeState + Clone>(&self, grade: &Grade<T>) -> Result<()>
    where
        AnyGrade: From<Grade<T>>,
    {
        let grade_id = grade.data.id;
        let mut state = self.state.write();

        match state.grades.get(&grade_id) {
            None => Err(Error::NotFound {
                resource: "grade",
                id: grade_id.to_string(),
            }),
            // Terminal states are immutable; regrading creates a new job.
            Some(existing) if existing.is_terminal() => Err(Error::InvalidState {
                grade: grade_id,
                expected: "non-terminal",
                actual: existing.status(),
            }),
            Some(_) => {
                state.grades.insert(grade_id, grade.clone().into());
                Ok(())
            }
        }
    }

    async fn grade(&self, grade_id: GradeId) -> Result<AnyGrade> {
        let state = self.state.read();
        state
            .grades
            .get(&grade_id)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                resource: "grade",
                id: grade_id.to_string(),
            })
    }

    async fn settle_cleared(&self, grade_id: GradeId) -> Result<Settlement> {
        let mut state = self.state.write();
        let Some(reservation) = state.reservations.remove(&grade_id) else {
            return Ok(Settlement::AlreadySettled);
        };

        let account = get_account(&state, reservation.user_id)?;
        let updated = account.clear_reservation(reservation.cost);
        state.accounts.insert(reservation.user_id, updated);
        Ok(Settlement::Applied)
    }

    async fn settle_refunded(&self, grade_id: GradeId) -> Result<Settlement> {
        let mut state = self.state.write();
        let Some(reservation) = state.reservations.remove(&grade_id) else {
            return Ok(Settlement::AlreadySettled);
        };

        let account = get_account(&state, reservation.user_id)?;
        let updated = account.refund_reservation(reservation.cost);
        state.accounts.insert(reservation.user_id, updated);
        state.transactions.push(CreditTransaction::record(
            reservation.user_id,
            CreditTransactionType::Refund,
            reservation.cost,
            updated.balance,
            Some(grade_id),
            None,
        ));
        Ok(Settlement::Applied)
    }
}

fn get_account(state: &State, user_id: UserId) -> Result<CreditAccount> {
    state
        .accounts
        .get(&user_id)
        .copied()
        .ok_or_else(|| Error::NotFound {
            resource: "account",
            id: user_id.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grading::job::AcademicLevel;

    fn m(s: &str) -> Money {
        Money::parse(s).unwrap()
    }

    fn sample_essay() -> EssaySubmission {
        EssaySubmission {
            instructions: "Analyse the assigned text.".to_string(),
            rubric_text: Some("Analysis 50%, Evidence 30%, Writing 20%".to_string()),
            focus_areas: vec!["structure".to_string()],
            academic_level: AcademicLevel::Undergraduate,
            body_text: "In this essay I argue that...".to_string(),
        }
    }

    async fn seeded(balance: &str) -> (InMemoryStorage, UserId) {
        let storage = InMemoryStorage::new();
        let user_id = UserId::new_v4();
        storage.create_account(user_id, m(balance)).await.unwrap();
        (storage, user_id)
    }

    #[tokio::test]
    async fn signup_bonus_recorded_once() {
        let (storage, user_id) = seeded("3.00").await;
        let account = storage.account(user_id).await.unwrap();
        assert_eq!(account.balance, m("3.00"));

        let transactions = storage.list_transactions(user_id).await.unwrap();
        assert_eq!(transactions.len(), 1);
        assert_eq!(
            transactions[0].transaction_type,
            CreditTransactionType::SignupBonus
        );
        assert_eq!(transactions[0].balance_after, m("3.00"));
    }

    #[tokio::test]
    async fn duplicate_account_rejected() {
        let (storage, user_id) = seeded("0.00").await;
        assert!(matches!(
            storage.create_account(user_id, m("0.00")).await,
            Err(Error::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn enqueue_reserves_and_records_charge() {
        let (storage, user_id) = seeded("10.00").await;
        let grade = storage
            .enqueue_grading(user_id, sample_essay(), m("1.00"))
            .await
            .unwrap();

        let account = storage.account(user_id).await.unwrap();
        assert_eq!(account.balance, m("9.00"));
        assert_eq!(account.reserved, m("1.00"));

        let charge = storage
            .find_grade_transaction(grade.data.id, CreditTransactionType::Grading)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(charge.amount, m("-1.00"));
        assert_eq!(charge.balance_after, m("9.00"));

        let stored = storage.grade(grade.data.id).await.unwrap();
        assert!(stored.is_queued());
    }

    #[tokio::test]
    async fn enqueue_with_insufficient_credit_changes_nothing() {
        let (storage, user_id) = seeded("0.50").await;
        let result = storage
            .enqueue_grading(user_id, sample_essay(), m("1.00"))
            .await;
        assert!(matches!(
            result,
            Err(Error::Ledger(LedgerError::InsufficientCredit { .. }))
        ));

        let account = storage.account(user_id).await.unwrap();
        assert_eq!(account.balance, m("0.50"));
        assert_eq!(account.reserved, m("0.00"));
        // Only the signup bonus transaction exists.
        assert_eq!(storage.list_transactions(user_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn claim_is_idempotent_across_redelivery() {
        let (storage, user_id) = seeded("10.00").await;
        let grade = storage
            .enqueue_grading(user_id, sample_essay(), m("1.00"))
            .await
            .unwrap();
        let daemon_id = DaemonId::new_v4();

        let first = storage.claim(grade.data.id, daemon_id).await.unwrap();
        assert!(first.is_some());

        let second = storage.claim(grade.data.id, daemon_id).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn claim_queued_is_exclusive_between_daemons() {
        let (storage, user_id) = seeded("10.00").await;
        for _ in 0..2 {
            storage
                .enqueue_grading(user_id, sample_essay(), m("1.00"))
                .await
                .unwrap();
        }

        let daemon1 = DaemonId::new_v4();
        let daemon2 = DaemonId::new_v4();

        let claimed = storage.claim_queued(10, daemon1).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert!(claimed.iter().all(|g| g.state.daemon_id == daemon1));

        let claimed_again = storage.claim_queued(10, daemon2).await.unwrap();
        assert!(claimed_again.is_empty());
    }

    #[tokio::test]
    async fn terminal_grades_are_immutable() {
        let (storage, user_id) = seeded("10.00").await;
        let grade = storage
            .enqueue_grading(user_id, sample_essay(), m("1.00"))
            .await
            .unwrap();
        let daemon_id = DaemonId::new_v4();

        let processing = storage.claim(grade.data.id, daemon_id).await.unwrap().unwrap();
        let failed = processing.clone().fail(&storage).await.unwrap();

        // Re-persisting anything over a terminal state is rejected.
        let result = storage.persist(&failed).await;
        assert!(matches!(result, Err(Error::InvalidState { .. })));
    }

    #[tokio::test]
    async fn settlement_replays_are_no_ops() {
        let (storage, user_id) = seeded("10.00").await;
        let grade = storage
            .enqueue_grading(user_id, sample_essay(), m("1.00"))
            .await
            .unwrap();

        assert_eq!(
            storage.settle_refunded(grade.data.id).await.unwrap(),
            Settlement::Applied
        );
        assert_eq!(
            storage.settle_refunded(grade.data.id).await.unwrap(),
            Settlement::AlreadySettled
        );
        assert_eq!(
            storage.settle_cleared(grade.data.id).await.unwrap(),
            Settlement::AlreadySettled
        );

        // Exactly one refund transaction despite the replays.
        let refunds: Vec<_> = storage
            .list_transactions(user_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|tx| tx.transaction_type == CreditTransactionType::Refund)
            .collect();
        assert_eq!(refunds.len(), 1);

        let account = storage.account(user_id).await.unwrap();
        assert_eq!(account.balance, m("10.00"));
        assert_eq!(account.reserved, m("0.00"));
    }

    #[tokio::test]
    async fn adjustment_cannot_push_balance_negative() {
        let (storage, user_id) = seeded("1.00").await;
        let result = storage
            .apply_adjustment(user_id, m("-2.00"), Some("manual correction".to_string()))
            .await;
        assert!(matches!(result, Err(Error::Ledger(_))));
        assert_eq!(storage.account(user_id).await.unwrap().balance, m("1.00"));
    }

    #[tokio::test]
    async fn purchase_credits_balance() {
        let (storage, user_id) = seeded("1.00").await;
        let tx = storage
            .apply_purchase(user_id, m("5.00"), Some("starter pack".to_string()))
            .await
            .unwrap();
        assert_eq!(tx.transaction_type, CreditTransactionType::Purchase);
        assert_eq!(tx.balance_after, m("6.00"));
        assert_eq!(storage.account(user_id).await.unwrap().balance, m("6.00"));
    }
}
