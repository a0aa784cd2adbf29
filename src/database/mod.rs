use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::{Classify, ErrorKind};

pub mod contract;
pub mod memory;
pub mod pg;
pub mod user;
pub mod user_contract;

pub use contract::{CompletionReason, Contract};
pub use memory::MemoryStore;
pub use pg::PgStore;
pub use user::User;
pub use user_contract::{NewUserContract, UserContract, UserContractStatus};

pub type Result<T> = std::result::Result<T, DatabaseError>;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("row not found")]
    NotFound,

    #[error("duplicate key")]
    Conflict,

    #[error("operation timed out")]
    TimedOut,

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl Classify for DatabaseError {
    fn kind(&self) -> ErrorKind {
        match self {
            DatabaseError::NotFound => ErrorKind::NotFound,
            DatabaseError::Conflict => ErrorKind::Conflict,
            DatabaseError::TimedOut => ErrorKind::Transient,
            DatabaseError::Sqlx(e) => match e {
                sqlx::Error::RowNotFound => ErrorKind::NotFound,
                sqlx::Error::Database(db) if db.is_unique_violation() => ErrorKind::Conflict,
                sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::WorkerCrashed => ErrorKind::Transient,
                _ => ErrorKind::Fatal,
            },
        }
    }
}

/// Persistence port for everything the core reads and writes.
///
/// Per-row atomicity is assumed; total ordering across rows is not.
/// Implementations must be shareable across tasks ([`PgStore`] for Postgres,
/// [`MemoryStore`] for tests and offline runs).
#[async_trait]
pub trait ContractStore: Send + Sync {
    async fn contract(&self, id: i64) -> Result<Option<Contract>>;

    /// Contracts with `is_completed = false`, oldest first.
    async fn pending_contracts(&self) -> Result<Vec<Contract>>;

    /// Completion fence: sets `is_completed`, `completion_reason` and
    /// `completed_at` in one write, guarded on `is_completed = false`.
    /// Returns `false` when some other writer already completed the row.
    async fn mark_contract_completed(
        &self,
        id: i64,
        reason: CompletionReason,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn user_contract(&self, contract_id: i64, address: &str)
    -> Result<Option<UserContract>>;

    async fn user_contracts_by_contract(&self, contract_id: i64) -> Result<Vec<UserContract>>;

    /// Fails with [`DatabaseError::Conflict`] when `(contract_id, address)`
    /// already has a row.
    async fn create_user_contract(&self, row: NewUserContract) -> Result<UserContract>;

    /// One-way exit out of `InProgress`; returns `false` when the row had
    /// already left `InProgress` (or does not exist).
    async fn update_user_contract_status(
        &self,
        contract_id: i64,
        address: &str,
        status: UserContractStatus,
    ) -> Result<bool>;

    /// Moves every row of `contract_id` currently in `from` to `to`,
    /// returning how many rows changed.
    async fn bulk_update_status(
        &self,
        contract_id: i64,
        from: UserContractStatus,
        to: UserContractStatus,
    ) -> Result<u64>;

    async fn user(&self, address: &str) -> Result<Option<User>>;

    async fn upsert_user(&self, address: &str) -> Result<User>;

    /// Atomic read-modify-write of the raw score; returns the new value.
    async fn update_user_score(&self, address: &str, delta: f64) -> Result<f64>;
}
