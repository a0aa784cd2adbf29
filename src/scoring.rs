//! Pure scoring engine applied at contract close.
//!
//! The engine stores nothing: it turns one terminal user transition into a
//! raw score delta. Raw scores are unbounded and accumulate in persistence;
//! user-facing reads go through [`display`], which saturates near
//! ±[`ASYMPTOTE_LIMIT`].

use chrono::{DateTime, Utc};

pub const MAX_BUY_AMOUNT_FOR_BONUS: f64 = 30_000_000.0;
pub const PENALTY_MULTIPLIER: f64 = 2.0;
pub const BASE_SCORE_MULTIPLIER: f64 = 0.000003;
pub const ASYMPTOTE_LIMIT: f64 = 1_000_000.0;
pub const ASYMPTOTE_SCALING_FACTOR: f64 = 1_000_000.0;
pub const C2_MIN_SCORE: f64 = 0.0;
pub const C2_WEEK_SCORE: f64 = 1.0;
pub const C2_MAX_SCORE: f64 = 25.0;
pub const C2_WEEK_THRESHOLD_DAYS: f64 = 7.0;
pub const C2_MAX_THRESHOLD_DAYS: f64 = 180.0;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Which winning condition closed the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosingCondition {
    /// The USD market-cap target was reached (or the contract closed with
    /// every signer broken, which settles on the same path).
    Condition1,
    /// The deadline elapsed.
    Condition2,
}

/// One terminal user transition, as seen at settlement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreEvent {
    /// True iff the user ended in `CompletedCondition1`.
    pub contract_respected: bool,
    /// Committed supply, in tokens.
    pub buy_amount: f64,
    /// Signed percentage deviation of the outcome vs the target.
    pub diff_with_condition: f64,
    pub true_condition: ClosingCondition,
    /// Only consulted for deadline closures.
    pub signed_at: DateTime<Utc>,
}

/// Raw score delta for one terminal transition. Deterministic: replaying
/// the same event against the same close time yields the same delta.
pub fn apply(event: &ScoreEvent, closed_at: DateTime<Utc>) -> f64 {
    match event.true_condition {
        ClosingCondition::Condition2 => age_score(event.signed_at, closed_at),
        ClosingCondition::Condition1 => {
            let capped = event.buy_amount.clamp(0.0, MAX_BUY_AMOUNT_FOR_BONUS);
            let base = capped * BASE_SCORE_MULTIPLIER;
            let unsigned = base * (1.0 + event.diff_with_condition / 100.0);

            if event.contract_respected {
                unsigned
            } else {
                -PENALTY_MULTIPLIER * unsigned
            }
        }
    }
}

/// Display score shown to users: monotone in the raw score, saturating
/// near ±[`ASYMPTOTE_LIMIT`].
pub fn display(raw: f64) -> f64 {
    (raw / ASYMPTOTE_SCALING_FACTOR).tanh() * ASYMPTOTE_LIMIT
}

/// Deadline closures score purely by how long the signature stood: nothing
/// under a week, 1 at exactly a week, then linear up to 25 at 180 days.
fn age_score(signed_at: DateTime<Utc>, closed_at: DateTime<Utc>) -> f64 {
    let days = (closed_at - signed_at).num_seconds() as f64 / SECONDS_PER_DAY;

    if days < C2_WEEK_THRESHOLD_DAYS {
        C2_MIN_SCORE
    } else if days >= C2_MAX_THRESHOLD_DAYS {
        C2_MAX_SCORE
    } else {
        let span = C2_MAX_THRESHOLD_DAYS - C2_WEEK_THRESHOLD_DAYS;
        C2_WEEK_SCORE + (days - C2_WEEK_THRESHOLD_DAYS) * (C2_MAX_SCORE - C2_WEEK_SCORE) / span
    }
}
