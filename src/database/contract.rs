use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A holding commitment on one mint: signers win together when the market cap
/// reaches `condition1` USD before the `condition2` deadline.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Contract {
    pub id: i64,
    pub mint: String,
    /// USD market-cap target. Non-negative.
    pub condition1: Decimal,
    /// Wall-clock deadline, UTC.
    pub condition2: DateTime<Utc>,
    pub is_completed: bool,
    pub completion_reason: Option<CompletionReason>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Contract {
    /// A deadline equal to `now` counts as elapsed.
    pub fn deadline_elapsed(&self, now: DateTime<Utc>) -> bool {
        now >= self.condition2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "completion_reason", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    /// Condition 1: the USD market-cap target was reached.
    MarketCap,
    /// Condition 2: the deadline elapsed first.
    TimeExpired,
    /// Every signer broke their commitment before either condition.
    AllBroken,
    /// Operator-forced completion.
    Manual,
}

impl CompletionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CompletionReason::MarketCap => "market_cap",
            CompletionReason::TimeExpired => "time_expired",
            CompletionReason::AllBroken => "all_broken",
            CompletionReason::Manual => "manual",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn deadline_at_now_counts_as_elapsed() {
        let now = Utc::now();
        let contract = Contract {
            id: 1,
            mint: "M".into(),
            condition1: Decimal::ZERO,
            condition2: now,
            is_completed: false,
            completion_reason: None,
            completed_at: None,
            created_at: now,
        };

        assert!(contract.deadline_elapsed(now));
        assert!(!contract.deadline_elapsed(now - TimeDelta::seconds(1)));
    }

    #[test]
    fn reason_codes_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&CompletionReason::AllBroken).expect("serialize"),
            r#""all_broken""#
        );
        assert_eq!(CompletionReason::TimeExpired.as_str(), "time_expired");
    }
}
