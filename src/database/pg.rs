use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::{
    CompletionReason, Contract, ContractStore, DatabaseError, NewUserContract, Result, User,
    UserContract, UserContractStatus,
};

/// Postgres-backed [`ContractStore`].
///
/// Queries are plain SQL with binds; the schema itself (three tables:
/// `contracts`, `user_contracts`, `users`) is owned by the host.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContractStore for PgStore {
    async fn contract(&self, id: i64) -> Result<Option<Contract>> {
        let q = "SELECT * FROM contracts WHERE id = $1";

        sqlx::query_as(q)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::Sqlx)
    }

    async fn pending_contracts(&self) -> Result<Vec<Contract>> {
        let q = "SELECT * FROM contracts WHERE is_completed = false ORDER BY created_at";

        sqlx::query_as(q)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::Sqlx)
    }

    async fn mark_contract_completed(
        &self,
        id: i64,
        reason: CompletionReason,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let q = "UPDATE contracts
            SET is_completed = true, completion_reason = $2, completed_at = $3
            WHERE id = $1 AND is_completed = false";

        let affected = sqlx::query(q)
            .bind(id)
            .bind(reason)
            .bind(at)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(affected == 1)
    }

    async fn user_contract(
        &self,
        contract_id: i64,
        address: &str,
    ) -> Result<Option<UserContract>> {
        let q = "SELECT * FROM user_contracts WHERE contract_id = $1 AND user_address = $2";

        sqlx::query_as(q)
            .bind(contract_id)
            .bind(address)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::Sqlx)
    }

    async fn user_contracts_by_contract(&self, contract_id: i64) -> Result<Vec<UserContract>> {
        let q = "SELECT * FROM user_contracts WHERE contract_id = $1 ORDER BY signed_at";

        sqlx::query_as(q)
            .bind(contract_id)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::Sqlx)
    }

    async fn create_user_contract(&self, row: NewUserContract) -> Result<UserContract> {
        let q = "INSERT INTO user_contracts (contract_id, user_address, supply, status, signed_at)
            VALUES ($1, $2, $3, $4, NOW())
            RETURNING *";

        sqlx::query_as(q)
            .bind(row.contract_id)
            .bind(&row.user_address)
            .bind(row.supply)
            .bind(UserContractStatus::InProgress)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(db) = &e
                    && db.is_unique_violation()
                {
                    DatabaseError::Conflict
                } else {
                    DatabaseError::Sqlx(e)
                }
            })
    }

    async fn update_user_contract_status(
        &self,
        contract_id: i64,
        address: &str,
        status: UserContractStatus,
    ) -> Result<bool> {
        // Guarded on InProgress so an exit can happen at most once.
        let q = "UPDATE user_contracts SET status = $3
            WHERE contract_id = $1 AND user_address = $2 AND status = $4";

        let affected = sqlx::query(q)
            .bind(contract_id)
            .bind(address)
            .bind(status)
            .bind(UserContractStatus::InProgress)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(affected == 1)
    }

    async fn bulk_update_status(
        &self,
        contract_id: i64,
        from: UserContractStatus,
        to: UserContractStatus,
    ) -> Result<u64> {
        let q = "UPDATE user_contracts SET status = $3 WHERE contract_id = $1 AND status = $2";

        let affected = sqlx::query(q)
            .bind(contract_id)
            .bind(from)
            .bind(to)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(affected)
    }

    async fn user(&self, address: &str) -> Result<Option<User>> {
        let q = "SELECT * FROM users WHERE address = $1";

        sqlx::query_as(q)
            .bind(address)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::Sqlx)
    }

    async fn upsert_user(&self, address: &str) -> Result<User> {
        let q = "INSERT INTO users (address, score, created_at)
            VALUES ($1, 0, NOW())
            ON CONFLICT (address) DO UPDATE SET address = EXCLUDED.address
            RETURNING *";

        sqlx::query_as(q)
            .bind(address)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::Sqlx)
    }

    async fn update_user_score(&self, address: &str, delta: f64) -> Result<f64> {
        let q = "UPDATE users SET score = score + $2 WHERE address = $1 RETURNING score";

        sqlx::query_scalar(q)
            .bind(address)
            .bind(delta)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DatabaseError::NotFound)
    }
}
