use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One signer's stake in a contract, compound-keyed by
/// `(contract_id, user_address)`.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct UserContract {
    pub contract_id: i64,
    pub user_address: String,
    /// Committed token amount in human units. Positive.
    pub supply: Decimal,
    pub status: UserContractStatus,
    pub signed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewUserContract {
    pub contract_id: i64,
    pub user_address: String,
    pub supply: Decimal,
}

impl NewUserContract {
    pub fn new(contract_id: i64, user_address: impl Into<String>, supply: Decimal) -> Self {
        Self {
            contract_id,
            user_address: user_address.into(),
            supply,
        }
    }
}

/// Status transitions are one-way: a row leaves `InProgress` at most once
/// and never comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
#[serde(rename_all = "snake_case")]
pub enum UserContractStatus {
    InProgress = 0,
    CompletedCondition1 = 1,
    CompletedCondition2 = 2,
    Broken = 3,
}

impl UserContractStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, UserContractStatus::InProgress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_progress_is_the_only_non_terminal_status() {
        assert!(!UserContractStatus::InProgress.is_terminal());
        assert!(UserContractStatus::CompletedCondition1.is_terminal());
        assert!(UserContractStatus::CompletedCondition2.is_terminal());
        assert!(UserContractStatus::Broken.is_terminal());
    }

    #[test]
    fn statuses_keep_their_wire_codes() {
        assert_eq!(UserContractStatus::InProgress as i16, 0);
        assert_eq!(UserContractStatus::CompletedCondition1 as i16, 1);
        assert_eq!(UserContractStatus::CompletedCondition2 as i16, 2);
        assert_eq!(UserContractStatus::Broken as i16, 3);
    }
}
