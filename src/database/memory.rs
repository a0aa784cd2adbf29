use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{
    CompletionReason, Contract, ContractStore, DatabaseError, NewUserContract, Result, User,
    UserContract, UserContractStatus,
};

/// In-memory [`ContractStore`] with the same observable semantics as
/// [`PgStore`](super::PgStore). Used by the test suite and for offline runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    contracts: DashMap<i64, Contract>,
    user_contracts: DashMap<(i64, String), UserContract>,
    users: DashMap<String, User>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a contract row directly; the CRUD layer owning creation sits
    /// outside the core.
    pub fn insert_contract(&self, contract: Contract) {
        self.contracts.insert(contract.id, contract);
    }
}

#[async_trait]
impl ContractStore for MemoryStore {
    async fn contract(&self, id: i64) -> Result<Option<Contract>> {
        Ok(self.contracts.get(&id).map(|c| c.clone()))
    }

    async fn pending_contracts(&self) -> Result<Vec<Contract>> {
        let mut pending: Vec<Contract> = self
            .contracts
            .iter()
            .filter(|c| !c.is_completed)
            .map(|c| c.clone())
            .collect();
        pending.sort_by_key(|c| c.created_at);

        Ok(pending)
    }

    async fn mark_contract_completed(
        &self,
        id: i64,
        reason: CompletionReason,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(mut contract) = self.contracts.get_mut(&id) else {
            return Ok(false);
        };
        if contract.is_completed {
            return Ok(false);
        }

        contract.is_completed = true;
        contract.completion_reason = Some(reason);
        contract.completed_at = Some(at);

        Ok(true)
    }

    async fn user_contract(
        &self,
        contract_id: i64,
        address: &str,
    ) -> Result<Option<UserContract>> {
        Ok(self
            .user_contracts
            .get(&(contract_id, address.to_owned()))
            .map(|uc| uc.clone()))
    }

    async fn user_contracts_by_contract(&self, contract_id: i64) -> Result<Vec<UserContract>> {
        let mut rows: Vec<UserContract> = self
            .user_contracts
            .iter()
            .filter(|uc| uc.contract_id == contract_id)
            .map(|uc| uc.clone())
            .collect();
        rows.sort_by_key(|uc| uc.signed_at);

        Ok(rows)
    }

    async fn create_user_contract(&self, row: NewUserContract) -> Result<UserContract> {
        let key = (row.contract_id, row.user_address.clone());

        match self.user_contracts.entry(key) {
            Entry::Occupied(_) => Err(DatabaseError::Conflict),
            Entry::Vacant(slot) => {
                let created = UserContract {
                    contract_id: row.contract_id,
                    user_address: row.user_address,
                    supply: row.supply,
                    status: UserContractStatus::InProgress,
                    signed_at: Utc::now(),
                };
                slot.insert(created.clone());

                Ok(created)
            }
        }
    }

    async fn update_user_contract_status(
        &self,
        contract_id: i64,
        address: &str,
        status: UserContractStatus,
    ) -> Result<bool> {
        let Some(mut row) = self
            .user_contracts
            .get_mut(&(contract_id, address.to_owned()))
        else {
            return Ok(false);
        };
        if row.status != UserContractStatus::InProgress {
            return Ok(false);
        }

        row.status = status;

        Ok(true)
    }

    async fn bulk_update_status(
        &self,
        contract_id: i64,
        from: UserContractStatus,
        to: UserContractStatus,
    ) -> Result<u64> {
        let mut changed = 0;
        for mut row in self.user_contracts.iter_mut() {
            if row.contract_id == contract_id && row.status == from {
                row.status = to;
                changed += 1;
            }
        }

        Ok(changed)
    }

    async fn user(&self, address: &str) -> Result<Option<User>> {
        Ok(self.users.get(address).map(|u| u.clone()))
    }

    async fn upsert_user(&self, address: &str) -> Result<User> {
        let user = self
            .users
            .entry(address.to_owned())
            .or_insert_with(|| User {
                address: address.to_owned(),
                score: 0.0,
                created_at: Utc::now(),
            })
            .clone();

        Ok(user)
    }

    async fn update_user_score(&self, address: &str, delta: f64) -> Result<f64> {
        let mut user = self
            .users
            .get_mut(address)
            .ok_or(DatabaseError::NotFound)?;
        user.score += delta;

        Ok(user.score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::dec;

    fn pending_contract(id: i64, mint: &str) -> Contract {
        Contract {
            id,
            mint: mint.to_owned(),
            condition1: dec!(1_000_000),
            condition2: Utc::now() + chrono::TimeDelta::hours(1),
            is_completed: false,
            completion_reason: None,
            completed_at: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn duplicate_sign_is_a_conflict() {
        let store = MemoryStore::new();
        store.insert_contract(pending_contract(1, "M"));

        store
            .create_user_contract(NewUserContract::new(1, "A", dec!(100)))
            .await
            .expect("first sign");

        let second = store
            .create_user_contract(NewUserContract::new(1, "A", dec!(100)))
            .await;
        assert!(matches!(second, Err(DatabaseError::Conflict)));

        let rows = store.user_contracts_by_contract(1).await.expect("rows");
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn completion_fence_is_won_exactly_once() {
        let store = MemoryStore::new();
        store.insert_contract(pending_contract(7, "M"));

        let now = Utc::now();
        assert!(
            store
                .mark_contract_completed(7, CompletionReason::MarketCap, now)
                .await
                .expect("first completion")
        );
        assert!(
            !store
                .mark_contract_completed(7, CompletionReason::TimeExpired, now)
                .await
                .expect("second completion")
        );

        let contract = store.contract(7).await.expect("read").expect("row");
        assert_eq!(contract.completion_reason, Some(CompletionReason::MarketCap));
        assert_eq!(contract.completed_at, Some(now));
    }

    #[tokio::test]
    async fn status_exits_in_progress_at_most_once() {
        let store = MemoryStore::new();
        store.insert_contract(pending_contract(2, "M"));
        store
            .create_user_contract(NewUserContract::new(2, "A", dec!(500)))
            .await
            .expect("sign");

        assert!(
            store
                .update_user_contract_status(2, "A", UserContractStatus::Broken)
                .await
                .expect("first exit")
        );
        assert!(
            !store
                .update_user_contract_status(2, "A", UserContractStatus::CompletedCondition1)
                .await
                .expect("second exit")
        );

        let row = store.user_contract(2, "A").await.expect("read").expect("row");
        assert_eq!(row.status, UserContractStatus::Broken);
    }

    #[tokio::test]
    async fn score_updates_accumulate_on_the_raw_value() {
        let store = MemoryStore::new();
        store.upsert_user("A").await.expect("upsert");
        store.upsert_user("A").await.expect("upsert again");

        let after_first = store.update_user_score("A", 30.0).await.expect("update");
        let after_second = store.update_user_score("A", -12.5).await.expect("update");

        assert_eq!(after_first, 30.0);
        assert_eq!(after_second, 17.5);
        assert!(matches!(
            store.update_user_score("missing", 1.0).await,
            Err(DatabaseError::NotFound)
        ));
    }
}
