use chrono::{DateTime, Utc};

use crate::scoring;

/// A wallet known to the system. `score` is the raw, unbounded value the
/// scoring engine accumulates; the bounded display score is derived on read.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct User {
    pub address: String,
    pub score: f64,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn display_score(&self) -> f64 {
        scoring::display(self.score)
    }
}
