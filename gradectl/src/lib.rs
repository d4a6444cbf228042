//! Pay-per-use essay grading control layer.
//!
//! This crate pairs a credit ledger with a grading ensemble orchestrator:
//! - A submission reserves prepaid credit and enqueues a grading job.
//! - A daemon claims the job and fans out several independent model calls,
//!   each with its own retry and malformed-output recovery.
//! - Outlier scores are excluded and the survivors are aggregated into a
//!   percentage range, averaged category scores, and narrative feedback.
//! - The outcome settles the credit: cleared on success, refunded on failure,
//!   exactly once either way.
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use gradectl::{
//!     config::GradingSettings,
//!     grading::daemon::{DaemonConfig, GradingDaemon},
//!     grading::provider::{OpenRouterClient, ProviderConfig},
//!     storage::in_memory::InMemoryStorage,
//! };
//!
//! let storage = Arc::new(InMemoryStorage::new());
//! let client = Arc::new(OpenRouterClient::new(ProviderConfig::default()));
//! let daemon = Arc::new(GradingDaemon::new(
//!     storage.clone(),
//!     client,
//!     GradingSettings::default(),
//!     DaemonConfig::default(),
//! ));
//!
//! // Submit essays...
//! let grade_id = gradectl::submission::submit_essay(
//!     storage.as_ref(), user_id, essay, cost,
//! ).await?;
//!
//! // ...and let the daemon grade and settle them.
//! tokio::spawn(daemon.run());
//! ```

pub mod config;
pub mod credits;
pub mod errors;
pub mod grading;
pub mod metrics;
pub mod money;
pub mod settlement;
pub mod storage;
pub mod submission;
pub mod types;

// Re-export commonly used types
pub use credits::{CreditAccount, CreditTransaction, CreditTransactionType, LedgerError};
pub use errors::{Error, Result};
pub use grading::config::{resolve_config, GradingConfig, RunSpec};
pub use grading::daemon::{DaemonConfig, GradingDaemon};
pub use grading::job::{AnyGrade, EssaySubmission, Grade, GradeReport, FAILED_USER_MESSAGE};
pub use grading::provider::{GraderClient, MockGraderClient, OpenRouterClient, ProviderError};
pub use money::Money;
pub use storage::in_memory::InMemoryStorage;
pub use storage::Storage;
