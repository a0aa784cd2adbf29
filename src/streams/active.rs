use std::collections::HashSet;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Observable progress of one evaluator, published over a watch channel.
/// Only the owning evaluator task ever writes it; the ATH is monotone.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StreamProgress {
    pub ath_market_cap_sol: f64,
    pub events_lost: u64,
}

/// Registry entry for one live stream. The evaluator task owns the ATH and
/// every terminal decision; this handle only observes and can signal a stop.
pub(crate) struct ActiveStream {
    pub contract_id: i64,
    /// Distinguishes this stream instance from earlier ones for the same
    /// contract, so a stale exit cannot deregister a fresh restart.
    pub epoch: u64,
    pub mint: String,
    pub started_at: DateTime<Utc>,
    pub signers: HashSet<String>,
    pub condition1: Decimal,
    pub condition2: DateTime<Utc>,
    pub progress: watch::Receiver<StreamProgress>,
    pub stop: watch::Sender<bool>,
    pub task: Mutex<Option<JoinHandle<()>>>,
}

impl ActiveStream {
    pub fn snapshot(&self) -> StreamSnapshot {
        let progress = *self.progress.borrow();

        StreamSnapshot {
            contract_id: self.contract_id,
            mint: self.mint.clone(),
            started_at: self.started_at,
            signers: self.signers.len(),
            condition1: self.condition1,
            condition2: self.condition2,
            ath_market_cap_sol: progress.ath_market_cap_sol,
            events_lost: progress.events_lost,
        }
    }
}

/// Plain-data view of a stream, safe to hand to operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamSnapshot {
    pub contract_id: i64,
    pub mint: String,
    pub started_at: DateTime<Utc>,
    pub signers: usize,
    pub condition1: Decimal,
    pub condition2: DateTime<Utc>,
    pub ath_market_cap_sol: f64,
    pub events_lost: u64,
}
