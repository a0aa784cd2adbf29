use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, timeout};
use tokio_retry2::strategy::FixedInterval;
use tokio_retry2::{Retry, RetryError};

use super::active::StreamProgress;
use crate::database::{
    CompletionReason, Contract, ContractStore, DatabaseError, UserContract, UserContractStatus,
};
use crate::errors::{Classify, ErrorKind};
use crate::feed::TradeEvent;
use crate::oracle::{OracleError, SolPriceSource};

/// Bounded retry for persistence/oracle hiccups while handling one event.
const EVENT_RETRIES: usize = 3;
const EVENT_RETRY_DELAY_MS: u64 = 200;
/// How long to wait before re-attempting a deadline close that the store
/// refused transiently.
const CLOSE_RETRY_REARM: Duration = Duration::from_secs(1);

/// Why an evaluator task ended.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StreamOutcome {
    /// The USD market-cap target was reached.
    MarketCap { ath_usd: f64 },
    /// The deadline elapsed first.
    Deadline,
    /// Every signer broke before either condition.
    AllBroken { last_ath_usd: Option<f64> },
    /// Someone else completed the contract; nothing was written here.
    Superseded,
    /// Operator stop.
    Stopped,
    /// The feed channel closed underneath the stream.
    FeedLost,
    /// Unrecoverable store or oracle failure; only this stream halts.
    Failed,
}

#[derive(Debug)]
pub(crate) struct StreamExit {
    pub contract_id: i64,
    /// Stream instance that produced this exit.
    pub epoch: u64,
    pub mint: String,
    pub outcome: StreamOutcome,
}

/// Terminal-write attempts distinguish "done" from "worth retrying".
enum Close {
    Done(StreamOutcome),
    Retry,
}

/// How a retried operation ultimately failed.
enum OpFailure {
    /// Retries exhausted on transient errors; the event is dropped and the
    /// stream continues.
    GaveUp,
    /// Stop this stream; the supervisor stays up.
    Fatal,
}

/// Per-stream state machine. Owns the ATH and all terminal decisions; runs
/// as a single task so every state update for the mint is serialised.
pub(crate) struct Evaluator {
    pub contract_id: i64,
    pub epoch: u64,
    pub mint: String,
    pub condition1: Decimal,
    pub condition2: DateTime<Utc>,
    pub signers: HashSet<String>,
    pub store: Arc<dyn ContractStore>,
    pub price: Arc<dyn SolPriceSource>,
    pub op_timeout: Duration,
    pub progress: watch::Sender<StreamProgress>,
    pub exits: mpsc::UnboundedSender<StreamExit>,
}

impl Evaluator {
    pub(crate) async fn run(
        self,
        events: broadcast::Receiver<TradeEvent>,
        stop: watch::Receiver<bool>,
    ) {
        let outcome = self.event_loop(events, stop).await;
        tracing::info!(
            contract_id = self.contract_id,
            mint = %self.mint,
            outcome = ?outcome,
            "stream finished"
        );

        let _ = self.exits.send(StreamExit {
            contract_id: self.contract_id,
            epoch: self.epoch,
            mint: self.mint.clone(),
            outcome,
        });
    }

    async fn event_loop(
        &self,
        mut events: broadcast::Receiver<TradeEvent>,
        mut stop: watch::Receiver<bool>,
    ) -> StreamOutcome {
        let mut ath = 0.0_f64;
        let mut events_lost = 0_u64;
        let mut last_ath_usd: Option<f64> = None;

        let deadline = tokio::time::sleep(remaining_until(self.condition2));
        tokio::pin!(deadline);

        // The deadline arm sits behind the event arm, so the standalone
        // timer only fires in the absence of events.
        loop {
            tokio::select! {
                biased;

                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow_and_update() {
                        break StreamOutcome::Stopped;
                    }
                }

                event = events.recv() => match event {
                    Ok(event) => {
                        let step = self
                            .process(event, &mut ath, &mut last_ath_usd, events_lost)
                            .await;
                        if let Some(outcome) = step {
                            break outcome;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        events_lost += skipped;
                        self.publish(ath, events_lost);
                        tracing::warn!(
                            contract_id = self.contract_id,
                            skipped,
                            "event buffer overflowed, stale trades dropped"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break StreamOutcome::FeedLost,
                },

                _ = &mut deadline => {
                    match self.close_deadline().await {
                        Close::Done(outcome) => break outcome,
                        Close::Retry => deadline.as_mut().reset(Instant::now() + CLOSE_RETRY_REARM),
                    }
                }
            }
        }
    }

    /// Applies one trade. `Some(outcome)` ends the stream; `None` keeps it
    /// alive (including dropped events after exhausted retries).
    async fn process(
        &self,
        event: TradeEvent,
        ath: &mut f64,
        last_ath_usd: &mut Option<f64>,
        events_lost: u64,
    ) -> Option<StreamOutcome> {
        // Deadline is evaluated at ingress only: once past this gate the
        // event may still complete C1 even if the clock crosses the
        // deadline mid-processing.
        if Utc::now() >= self.condition2 {
            return match self.close_deadline().await {
                Close::Done(outcome) => Some(outcome),
                Close::Retry => None,
            };
        }

        // ATH never decreases.
        if event.market_cap_sol > *ath {
            *ath = event.market_cap_sol;
            self.publish(*ath, events_lost);
        }

        // C1 check, re-querying the spot price.
        match self.fetch_price().await {
            Ok(price) => {
                let ath_usd = *ath * price;
                *last_ath_usd = Some(ath_usd);
                if ath_usd >= self.condition1.to_f64().unwrap_or(f64::INFINITY) {
                    return match self.close_market_cap(ath_usd).await {
                        Close::Done(outcome) => Some(outcome),
                        Close::Retry => None,
                    };
                }
            }
            Err(OpFailure::Fatal) => return Some(StreamOutcome::Failed),
            Err(OpFailure::GaveUp) => return None,
        }

        // Only signer trades matter for per-user accounting.
        if !self.signers.contains(&event.trader) {
            return None;
        }

        // Break check, strict `<` in human units.
        let row = match self.load_row(&event.trader).await {
            Ok(Some(row)) => row,
            Ok(None) => {
                tracing::warn!(
                    contract_id = self.contract_id,
                    trader = %event.trader,
                    "signer has no user_contract row"
                );
                return None;
            }
            Err(OpFailure::Fatal) => return Some(StreamOutcome::Failed),
            Err(OpFailure::GaveUp) => return None,
        };
        if row.status != UserContractStatus::InProgress {
            return None;
        }
        let Some(balance) = Decimal::from_f64(event.new_token_balance) else {
            tracing::warn!(
                balance = event.new_token_balance,
                "unusable balance on trade event"
            );
            return None;
        };
        if balance >= row.supply {
            return None;
        }

        let broke = match self
            .set_status(&event.trader, UserContractStatus::Broken)
            .await
        {
            Ok(changed) => changed,
            Err(OpFailure::Fatal) => return Some(StreamOutcome::Failed),
            Err(OpFailure::GaveUp) => return None,
        };
        if !broke {
            // The row left InProgress through another write.
            return None;
        }
        tracing::info!(
            contract_id = self.contract_id,
            trader = %event.trader,
            "signer fell below the committed supply"
        );

        // All-broken check: no InProgress rows left closes the contract.
        let rows = match self.load_rows().await {
            Ok(rows) => rows,
            Err(OpFailure::Fatal) => return Some(StreamOutcome::Failed),
            Err(OpFailure::GaveUp) => return None,
        };
        if rows
            .iter()
            .any(|r| r.status == UserContractStatus::InProgress)
        {
            return None;
        }

        match self.close_all_broken(*last_ath_usd).await {
            Close::Done(outcome) => Some(outcome),
            Close::Retry => None,
        }
    }

    async fn close_deadline(&self) -> Close {
        match self
            .complete(
                CompletionReason::TimeExpired,
                Some(UserContractStatus::CompletedCondition2),
            )
            .await
        {
            Ok(true) => Close::Done(StreamOutcome::Deadline),
            Ok(false) => Close::Done(StreamOutcome::Superseded),
            Err(OpFailure::Fatal) => Close::Done(StreamOutcome::Failed),
            Err(OpFailure::GaveUp) => Close::Retry,
        }
    }

    async fn close_market_cap(&self, ath_usd: f64) -> Close {
        match self
            .complete(
                CompletionReason::MarketCap,
                Some(UserContractStatus::CompletedCondition1),
            )
            .await
        {
            Ok(true) => Close::Done(StreamOutcome::MarketCap { ath_usd }),
            Ok(false) => Close::Done(StreamOutcome::Superseded),
            Err(OpFailure::Fatal) => Close::Done(StreamOutcome::Failed),
            Err(OpFailure::GaveUp) => Close::Retry,
        }
    }

    async fn close_all_broken(&self, last_ath_usd: Option<f64>) -> Close {
        // No bulk move: nothing is InProgress on this path.
        match self.complete(CompletionReason::AllBroken, None).await {
            Ok(true) => Close::Done(StreamOutcome::AllBroken { last_ath_usd }),
            Ok(false) => Close::Done(StreamOutcome::Superseded),
            Err(OpFailure::Fatal) => Close::Done(StreamOutcome::Failed),
            Err(OpFailure::GaveUp) => Close::Retry,
        }
    }

    /// Terminal transition. Re-reads the contract to detect concurrent
    /// completion, moves the remaining `InProgress` rows, then takes the
    /// `mark_contract_completed` fence. Returns whether this stream won.
    async fn complete(
        &self,
        reason: CompletionReason,
        bulk_to: Option<UserContractStatus>,
    ) -> Result<bool, OpFailure> {
        let Some(contract) = self.load_contract().await? else {
            tracing::warn!(
                contract_id = self.contract_id,
                "contract row vanished, stopping the stream"
            );
            return Ok(false);
        };
        if contract.is_completed {
            return Ok(false);
        }

        if let Some(to) = bulk_to {
            let moved = self.bulk_status(UserContractStatus::InProgress, to).await?;
            tracing::debug!(contract_id = self.contract_id, moved, "user contracts resolved");
        }

        let won = self.mark_completed(reason).await?;
        if !won {
            tracing::warn!(
                contract_id = self.contract_id,
                "lost the completion race to a concurrent writer"
            );
        }

        Ok(won)
    }

    fn publish(&self, ath: f64, events_lost: u64) {
        self.progress.send_replace(StreamProgress {
            ath_market_cap_sol: ath,
            events_lost,
        });
    }

    async fn fetch_price(&self) -> Result<f64, OpFailure> {
        let price = &self.price;
        let op_timeout = self.op_timeout;
        let action = async || match timeout(op_timeout, price.sol_price_usd()).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(classify_retry(e)),
            Err(_) => Err(classify_retry(OracleError::TimedOut)),
        };

        Retry::spawn(retry_strategy(), action)
            .await
            .map_err(|e| op_failure("sol_price", e))
    }

    async fn load_contract(&self) -> Result<Option<Contract>, OpFailure> {
        let store = &self.store;
        let id = self.contract_id;
        let op_timeout = self.op_timeout;
        let action = async || match timeout(op_timeout, store.contract(id)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(classify_retry(e)),
            Err(_) => Err(classify_retry(DatabaseError::TimedOut)),
        };

        Retry::spawn(retry_strategy(), action)
            .await
            .map_err(|e| op_failure("load_contract", e))
    }

    async fn load_row(&self, address: &str) -> Result<Option<UserContract>, OpFailure> {
        let store = &self.store;
        let id = self.contract_id;
        let op_timeout = self.op_timeout;
        let action = async || match timeout(op_timeout, store.user_contract(id, address)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(classify_retry(e)),
            Err(_) => Err(classify_retry(DatabaseError::TimedOut)),
        };

        Retry::spawn(retry_strategy(), action)
            .await
            .map_err(|e| op_failure("load_user_contract", e))
    }

    async fn load_rows(&self) -> Result<Vec<UserContract>, OpFailure> {
        let store = &self.store;
        let id = self.contract_id;
        let op_timeout = self.op_timeout;
        let action = async || match timeout(op_timeout, store.user_contracts_by_contract(id)).await
        {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(classify_retry(e)),
            Err(_) => Err(classify_retry(DatabaseError::TimedOut)),
        };

        Retry::spawn(retry_strategy(), action)
            .await
            .map_err(|e| op_failure("load_user_contracts", e))
    }

    async fn set_status(
        &self,
        address: &str,
        status: UserContractStatus,
    ) -> Result<bool, OpFailure> {
        let store = &self.store;
        let id = self.contract_id;
        let op_timeout = self.op_timeout;
        let action = async || {
            match timeout(op_timeout, store.update_user_contract_status(id, address, status)).await
            {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(classify_retry(e)),
                Err(_) => Err(classify_retry(DatabaseError::TimedOut)),
            }
        };

        Retry::spawn(retry_strategy(), action)
            .await
            .map_err(|e| op_failure("update_status", e))
    }

    async fn bulk_status(
        &self,
        from: UserContractStatus,
        to: UserContractStatus,
    ) -> Result<u64, OpFailure> {
        let store = &self.store;
        let id = self.contract_id;
        let op_timeout = self.op_timeout;
        let action = async || match timeout(op_timeout, store.bulk_update_status(id, from, to))
            .await
        {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(classify_retry(e)),
            Err(_) => Err(classify_retry(DatabaseError::TimedOut)),
        };

        Retry::spawn(retry_strategy(), action)
            .await
            .map_err(|e| op_failure("bulk_update_status", e))
    }

    async fn mark_completed(&self, reason: CompletionReason) -> Result<bool, OpFailure> {
        let store = &self.store;
        let id = self.contract_id;
        let op_timeout = self.op_timeout;
        let action = async || {
            match timeout(op_timeout, store.mark_contract_completed(id, reason, Utc::now())).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(classify_retry(e)),
                Err(_) => Err(classify_retry(DatabaseError::TimedOut)),
            }
        };

        Retry::spawn(retry_strategy(), action)
            .await
            .map_err(|e| op_failure("mark_completed", e))
    }
}

fn retry_strategy() -> std::iter::Take<FixedInterval> {
    FixedInterval::from_millis(EVENT_RETRY_DELAY_MS).take(EVENT_RETRIES)
}

fn classify_retry<E: Classify>(error: E) -> RetryError<E> {
    if error.kind().is_retryable() {
        RetryError::transient(error)
    } else {
        RetryError::permanent(error)
    }
}

fn op_failure<E: Classify + std::fmt::Display>(op: &'static str, error: E) -> OpFailure {
    if error.kind() == ErrorKind::Fatal {
        tracing::error!(%error, op, "unrecoverable failure, stopping the stream");
        OpFailure::Fatal
    } else {
        tracing::warn!(%error, op, "giving up after retries, event dropped");
        OpFailure::GaveUp
    }
}

fn remaining_until(deadline: DateTime<Utc>) -> Duration {
    (deadline - Utc::now()).to_std().unwrap_or_default()
}
