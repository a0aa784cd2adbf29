//! Stream supervision: the authoritative registry of live streams, their
//! lifecycle (start/stop/restart, bulk startup, reconnect-safe teardown),
//! and score settlement when a contract closes.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::future::join_all;
use rust_decimal::prelude::ToPrimitive;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_retry2::strategy::ExponentialBackoff;
use tokio_retry2::{Retry, RetryError};

use crate::config::Config;
use crate::database::{
    CompletionReason, Contract, ContractStore, DatabaseError, UserContractStatus,
};
use crate::errors::{Classify, ErrorKind};
use crate::feed::{FeedError, FeedStatus, TradeFeed};
use crate::oracle::SolPriceSource;
use crate::scoring::{self, ClosingCondition, ScoreEvent};

mod active;
mod evaluator;

pub use active::{StreamProgress, StreamSnapshot};

use active::ActiveStream;
use evaluator::{Evaluator, StreamExit, StreamOutcome};

/// Grace period for an evaluator to drain after a stop signal.
const STOP_GRACE: Duration = Duration::from_secs(2);
/// Pause between the stop and start halves of a restart.
const RESTART_GAP: Duration = Duration::from_secs(1);
/// Bulk-startup stagger per contract, capped so large backlogs do not push
/// the tail out indefinitely.
const STAGGER_STEP: Duration = Duration::from_millis(100);
const STAGGER_CAP: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("contract {0} not found")]
    ContractNotFound(i64),

    #[error("contract {0} is already completed")]
    AlreadyCompleted(i64),

    #[error("contract {0} deadline has already passed")]
    DeadlinePassed(i64),

    #[error("contract {0} has no signers")]
    NoSigners(i64),

    #[error("mint {0} is already watched by another stream")]
    MintBusy(String),

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl Classify for StreamError {
    fn kind(&self) -> ErrorKind {
        match self {
            StreamError::ContractNotFound(_) => ErrorKind::NotFound,
            StreamError::AlreadyCompleted(_)
            | StreamError::DeadlinePassed(_)
            | StreamError::NoSigners(_) => ErrorKind::InvalidInput,
            StreamError::MintBusy(_) => ErrorKind::Conflict,
            StreamError::Feed(e) => e.kind(),
            StreamError::Database(e) => e.kind(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// A stream for this contract already exists; start is idempotent.
    AlreadyActive,
}

/// Owns the registry `contract_id → ActiveStream`. One per process; handed
/// around as an `Arc` and explicitly constructed at startup.
pub struct StreamSupervisor {
    store: Arc<dyn ContractStore>,
    price: Arc<dyn SolPriceSource>,
    feed: Arc<dyn TradeFeed>,
    registry: DashMap<i64, ActiveStream>,
    /// Active mint → owning contract. The feed key space is 1:1 with
    /// streams, so a second contract on a watched mint is refused.
    mints: DashMap<String, i64>,
    exits: mpsc::UnboundedSender<StreamExit>,
    /// Self-reference for background launches; never keeps the supervisor
    /// alive on its own.
    me: Weak<StreamSupervisor>,
    next_epoch: AtomicU64,
    max_retries: usize,
    base_retry_delay: Duration,
    op_timeout: Duration,
}

impl StreamSupervisor {
    pub fn new(
        store: Arc<dyn ContractStore>,
        price: Arc<dyn SolPriceSource>,
        feed: Arc<dyn TradeFeed>,
        config: &Config,
    ) -> Arc<Self> {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new_cyclic(|me| Self {
            store,
            price,
            feed,
            registry: DashMap::new(),
            mints: DashMap::new(),
            exits: exit_tx,
            me: me.clone(),
            next_epoch: AtomicU64::new(0),
            max_retries: config.max_retries,
            base_retry_delay: config.base_retry_delay,
            op_timeout: config.op_timeout,
        });
        tokio::spawn(reap_exits(Arc::downgrade(&supervisor), exit_rx));

        supervisor
    }

    /// Starts a stream for `contract_id`, retrying transient failures with
    /// exponential backoff. Refusals (completed, expired, no signers, busy
    /// mint) are permanent for this invocation.
    pub async fn start(&self, contract_id: i64) -> Result<StartOutcome, StreamError> {
        let strategy = ExponentialBackoff::from_millis(2)
            .factor((self.base_retry_delay.as_millis() as u64).max(2) / 2)
            .take(self.max_retries.saturating_sub(1));
        let this = self;
        let action = async || {
            this.try_start(contract_id).await.map_err(|e| {
                if e.kind().is_retryable() {
                    RetryError::transient(e)
                } else {
                    RetryError::permanent(e)
                }
            })
        };

        Retry::spawn(strategy, action).await
    }

    async fn try_start(&self, contract_id: i64) -> Result<StartOutcome, StreamError> {
        if self.registry.contains_key(&contract_id) {
            return Ok(StartOutcome::AlreadyActive);
        }

        let contract = self
            .store_op(self.store.contract(contract_id))
            .await?
            .ok_or(StreamError::ContractNotFound(contract_id))?;
        if contract.is_completed {
            return Err(StreamError::AlreadyCompleted(contract_id));
        }
        if contract.deadline_elapsed(Utc::now()) {
            return Err(StreamError::DeadlinePassed(contract_id));
        }

        let rows = self
            .store_op(self.store.user_contracts_by_contract(contract_id))
            .await?;
        let signers: HashSet<String> = rows.iter().map(|r| r.user_address.clone()).collect();
        if signers.is_empty() {
            return Err(StreamError::NoSigners(contract_id));
        }

        match self.mints.entry(contract.mint.clone()) {
            Entry::Occupied(existing) => {
                if *existing.get() != contract_id {
                    return Err(StreamError::MintBusy(contract.mint));
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(contract_id);
            }
        }

        let events = match self.feed.subscribe(&contract.mint).await {
            Ok(events) => events,
            Err(error) => {
                self.release_mint(&contract.mint, contract_id);
                return Err(error.into());
            }
        };

        match self.registry.entry(contract_id) {
            Entry::Occupied(_) => Ok(StartOutcome::AlreadyActive),
            Entry::Vacant(slot) => {
                let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
                let (stop_tx, stop_rx) = watch::channel(false);
                let (progress_tx, progress_rx) = watch::channel(StreamProgress::default());
                let evaluator = Evaluator {
                    contract_id,
                    epoch,
                    mint: contract.mint.clone(),
                    condition1: contract.condition1,
                    condition2: contract.condition2,
                    signers: signers.clone(),
                    store: self.store.clone(),
                    price: self.price.clone(),
                    op_timeout: self.op_timeout,
                    progress: progress_tx,
                    exits: self.exits.clone(),
                };
                let task = tokio::spawn(evaluator.run(events, stop_rx));

                slot.insert(ActiveStream {
                    contract_id,
                    epoch,
                    mint: contract.mint.clone(),
                    started_at: Utc::now(),
                    signers,
                    condition1: contract.condition1,
                    condition2: contract.condition2,
                    progress: progress_rx,
                    stop: stop_tx,
                    task: std::sync::Mutex::new(Some(task)),
                });
                tracing::info!(contract_id, mint = %contract.mint, "stream started");

                Ok(StartOutcome::Started)
            }
        }
    }

    /// Idempotent: returns whether a stream was actually stopped.
    pub async fn stop(&self, contract_id: i64) -> bool {
        let Some((_, stream)) = self.registry.remove(&contract_id) else {
            return false;
        };
        tracing::info!(contract_id, "stopping stream");
        self.teardown(stream).await;

        true
    }

    /// Stop, a settling pause, then a fresh start with `ath = 0`.
    pub async fn restart(&self, contract_id: i64) -> Result<StartOutcome, StreamError> {
        self.stop(contract_id).await;
        tokio::time::sleep(RESTART_GAP).await;

        self.start(contract_id).await
    }

    /// Enumerates pending contracts and schedules a staggered start for
    /// each; already-expired contracts are reconciled to a deadline close
    /// instead. Returns how many starts were scheduled.
    pub async fn start_all_pending(&self) -> usize {
        let pending = match self.store_op(self.store.pending_contracts()).await {
            Ok(pending) => pending,
            Err(error) => {
                tracing::error!(%error, "could not enumerate pending contracts");
                return 0;
            }
        };

        let now = Utc::now();
        let mut scheduled = 0;
        for (index, contract) in pending.into_iter().enumerate() {
            if contract.deadline_elapsed(now) {
                self.close_expired(&contract).await;
                continue;
            }
            let Some(supervisor) = self.me.upgrade() else {
                break;
            };

            let stagger = (STAGGER_STEP * index as u32).min(STAGGER_CAP);
            tokio::spawn(async move {
                tokio::time::sleep(stagger).await;
                if let Err(error) = supervisor.start(contract.id).await {
                    tracing::warn!(contract_id = contract.id, %error, "startup launch failed");
                }
            });
            scheduled += 1;
        }
        tracing::info!(scheduled, "bulk stream startup scheduled");

        scheduled
    }

    pub async fn stop_all(&self) {
        let ids: Vec<i64> = self.registry.iter().map(|s| *s.key()).collect();
        join_all(ids.into_iter().map(|id| self.stop(id))).await;
    }

    /// Stops every stream and closes the feed client.
    pub async fn shutdown(&self) {
        tracing::info!("supervisor shutting down");
        self.stop_all().await;
        self.feed.shutdown().await;
    }

    pub fn list_active(&self) -> Vec<StreamSnapshot> {
        self.registry.iter().map(|s| s.snapshot()).collect()
    }

    pub fn get(&self, contract_id: i64) -> Option<StreamSnapshot> {
        self.registry.get(&contract_id).map(|s| s.snapshot())
    }

    pub fn is_active(&self, contract_id: i64) -> bool {
        self.registry.contains_key(&contract_id)
    }

    pub async fn feed_status(&self) -> Option<FeedStatus> {
        self.feed.status().await.ok()
    }

    /// Channel for contract-created notifications from the host CRUD layer:
    /// each id gets a background start whose failure only logs.
    pub fn creation_notifier(&self) -> mpsc::Sender<i64> {
        let (tx, mut rx) = mpsc::channel::<i64>(25);
        let weak = self.me.clone();
        tokio::spawn(async move {
            while let Some(contract_id) = rx.recv().await {
                let Some(supervisor) = weak.upgrade() else {
                    break;
                };
                tokio::spawn(async move {
                    if let Err(error) = supervisor.start(contract_id).await {
                        tracing::warn!(contract_id, %error, "auto-start failed");
                    }
                });
            }
        });

        tx
    }

    async fn teardown(&self, stream: ActiveStream) {
        let _ = stream.stop.send(true);
        let task = stream
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task
            && timeout(STOP_GRACE, task).await.is_err()
        {
            tracing::warn!(
                contract_id = stream.contract_id,
                "evaluator did not stop in time, deregistering anyway"
            );
        }

        self.release_mint(&stream.mint, stream.contract_id);
        self.unsubscribe_if_unused(&stream.mint).await;
    }

    /// Evaluator-initiated exits deregister here; operator stops have
    /// already removed the registry entry by the time the exit arrives.
    /// The epoch guard keeps a stale exit from tearing down a stream that
    /// was restarted in the meantime.
    async fn handle_exit(&self, exit: StreamExit) {
        let removed = self
            .registry
            .remove_if(&exit.contract_id, |_, stream| stream.epoch == exit.epoch);
        if let Some((_, stream)) = removed {
            self.release_mint(&stream.mint, stream.contract_id);
            self.unsubscribe_if_unused(&stream.mint).await;
        }

        match exit.outcome {
            StreamOutcome::MarketCap { ath_usd } => {
                self.settle(exit.contract_id, ClosingCondition::Condition1, Some(ath_usd))
                    .await;
            }
            StreamOutcome::Deadline => {
                self.settle(exit.contract_id, ClosingCondition::Condition2, None)
                    .await;
            }
            StreamOutcome::AllBroken { last_ath_usd } => {
                self.settle(exit.contract_id, ClosingCondition::Condition1, last_ath_usd)
                    .await;
            }
            StreamOutcome::Superseded | StreamOutcome::Stopped => {}
            StreamOutcome::FeedLost | StreamOutcome::Failed => {
                tracing::warn!(
                    contract_id = exit.contract_id,
                    outcome = ?exit.outcome,
                    "stream halted without completing its contract"
                );
            }
        }
    }

    /// Applies the scoring engine to every terminal row of a closed
    /// contract. Settlement failures only log; scores are advisory next to
    /// the contract resolution itself.
    async fn settle(&self, contract_id: i64, condition: ClosingCondition, ath_usd: Option<f64>) {
        let rows = match self
            .store_op(self.store.user_contracts_by_contract(contract_id))
            .await
        {
            Ok(rows) => rows,
            Err(error) => {
                tracing::error!(contract_id, %error, "cannot settle scores");
                return;
            }
        };
        let contract = match self.store_op(self.store.contract(contract_id)).await {
            Ok(contract) => contract,
            Err(error) => {
                tracing::error!(contract_id, %error, "cannot settle scores");
                return;
            }
        };

        let (closed_at, target) = match &contract {
            Some(c) => (
                c.completed_at.unwrap_or_else(Utc::now),
                c.condition1.to_f64().unwrap_or(0.0),
            ),
            None => (Utc::now(), 0.0),
        };
        let diff = match ath_usd {
            Some(ath_usd) if target > 0.0 => (ath_usd / target - 1.0) * 100.0,
            _ => 0.0,
        };

        for row in rows {
            if row.status == UserContractStatus::InProgress {
                continue;
            }
            let event = ScoreEvent {
                contract_respected: row.status == UserContractStatus::CompletedCondition1,
                buy_amount: row.supply.to_f64().unwrap_or(0.0),
                diff_with_condition: diff,
                true_condition: condition,
                signed_at: row.signed_at,
            };
            let delta = scoring::apply(&event, closed_at);

            if let Err(error) = self.store_op(self.store.upsert_user(&row.user_address)).await {
                tracing::warn!(user = %row.user_address, %error, "upsert failed during settlement");
                continue;
            }
            match self
                .store_op(self.store.update_user_score(&row.user_address, delta))
                .await
            {
                Ok(raw) => {
                    tracing::info!(
                        user = %row.user_address,
                        delta,
                        display = scoring::display(raw),
                        "score settled"
                    );
                }
                Err(error) => {
                    tracing::warn!(user = %row.user_address, %error, "score update failed");
                }
            }
        }
    }

    /// Reconciliation for contracts whose deadline passed while no stream
    /// was running.
    async fn close_expired(&self, contract: &Contract) {
        if let Err(error) = self
            .store_op(self.store.bulk_update_status(
                contract.id,
                UserContractStatus::InProgress,
                UserContractStatus::CompletedCondition2,
            ))
            .await
        {
            tracing::warn!(contract_id = contract.id, %error, "expired reconciliation failed");
            return;
        }

        match self
            .store_op(self.store.mark_contract_completed(
                contract.id,
                CompletionReason::TimeExpired,
                Utc::now(),
            ))
            .await
        {
            Ok(true) => {
                tracing::info!(contract_id = contract.id, "expired contract reconciled");
                self.settle(contract.id, ClosingCondition::Condition2, None)
                    .await;
            }
            Ok(false) => {}
            Err(error) => {
                tracing::warn!(contract_id = contract.id, %error, "expired reconciliation failed");
            }
        }
    }

    async fn store_op<T>(
        &self,
        op: impl Future<Output = Result<T, DatabaseError>>,
    ) -> Result<T, DatabaseError> {
        timeout(self.op_timeout, op)
            .await
            .unwrap_or(Err(DatabaseError::TimedOut))
    }

    fn release_mint(&self, mint: &str, contract_id: i64) {
        self.mints.remove_if(mint, |_, owner| *owner == contract_id);
    }

    async fn unsubscribe_if_unused(&self, mint: &str) {
        // A restart or racing start may have re-claimed the mint already.
        if self.mints.contains_key(mint) {
            return;
        }
        if let Err(error) = self.feed.unsubscribe(mint).await {
            tracing::warn!(%error, mint, "unsubscribe failed");
        }
    }
}

async fn reap_exits(
    supervisor: Weak<StreamSupervisor>,
    mut exits: mpsc::UnboundedReceiver<StreamExit>,
) {
    while let Some(exit) = exits.recv().await {
        let Some(supervisor) = supervisor.upgrade() else {
            break;
        };
        supervisor.handle_exit(exit).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{MemoryStore, NewUserContract};
    use crate::feed::testing::ChannelFeed;
    use crate::feed::{TradeEvent, TxType};
    use crate::oracle::StaticPrice;
    use chrono::{DateTime, TimeDelta};
    use rust_decimal::{Decimal, dec};

    struct World {
        supervisor: Arc<StreamSupervisor>,
        store: Arc<MemoryStore>,
        feed: Arc<ChannelFeed>,
    }

    fn world() -> World {
        let store = Arc::new(MemoryStore::new());
        let feed = Arc::new(ChannelFeed::new());
        let config = Config {
            max_retries: 2,
            base_retry_delay: Duration::from_millis(10),
            op_timeout: Duration::from_millis(500),
            ..Config::default()
        };
        let supervisor = StreamSupervisor::new(
            store.clone(),
            Arc::new(StaticPrice(100.0)),
            feed.clone(),
            &config,
        );

        World {
            supervisor,
            store,
            feed,
        }
    }

    fn contract(
        id: i64,
        mint: &str,
        condition1: Decimal,
        condition2: DateTime<Utc>,
    ) -> Contract {
        Contract {
            id,
            mint: mint.to_owned(),
            condition1,
            condition2,
            is_completed: false,
            completion_reason: None,
            completed_at: None,
            created_at: Utc::now(),
        }
    }

    async fn seed(world: &World, contract: Contract, signers: &[(&str, Decimal)]) {
        let id = contract.id;
        world.store.insert_contract(contract);
        for (address, supply) in signers {
            world
                .store
                .create_user_contract(NewUserContract::new(id, *address, *supply))
                .await
                .expect("seed signer");
        }
    }

    fn trade(mint: &str, trader: &str, market_cap_sol: f64, new_token_balance: f64) -> TradeEvent {
        TradeEvent {
            signature: "sig".to_owned(),
            mint: mint.to_owned(),
            trader: trader.to_owned(),
            tx_type: TxType::Buy,
            token_amount: 1.0,
            sol_amount: 0.1,
            new_token_balance,
            market_cap_sol,
            v_tokens_in_bonding_curve: None,
            v_sol_in_bonding_curve: None,
            pool: None,
        }
    }

    async fn wait_for_completion(store: &Arc<MemoryStore>, id: i64) -> Contract {
        timeout(Duration::from_secs(2), async {
            loop {
                if let Some(c) = store.contract(id).await.expect("read")
                    && c.is_completed
                {
                    return c;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("contract completes in time")
    }

    async fn wait_for_score(store: &Arc<MemoryStore>, address: &str, expected: f64, tol: f64) {
        timeout(Duration::from_secs(2), async {
            loop {
                if let Some(user) = store.user(address).await.expect("read")
                    && (user.score - expected).abs() <= tol
                {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("score for {address} never reached {expected}"));
    }

    async fn wait_for_ath(supervisor: &Arc<StreamSupervisor>, id: i64, ath: f64) {
        timeout(Duration::from_secs(2), async {
            loop {
                if supervisor.get(id).map(|s| s.ath_market_cap_sol) == Some(ath) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("ath observed in time");
    }

    #[tokio::test]
    async fn market_cap_success_completes_all_active_signers() {
        let world = world();
        seed(
            &world,
            contract(1, "M", dec!(1_000_000), Utc::now() + TimeDelta::hours(1)),
            &[("A", dec!(1000)), ("B", dec!(2000))],
        )
        .await;

        assert_eq!(
            world.supervisor.start(1).await.expect("start"),
            StartOutcome::Started
        );

        // A non-signer trade counts for the ATH but never for breaks.
        world.feed.emit(trade("M", "C", 5000.0, 0.0));
        // Balance == supply: not a break; $12k SOL cap * $100 crosses $1M.
        world.feed.emit(trade("M", "A", 12_000.0, 1000.0));

        let completed = wait_for_completion(&world.store, 1).await;
        assert_eq!(completed.completion_reason, Some(CompletionReason::MarketCap));

        for address in ["A", "B"] {
            let row = world
                .store
                .user_contract(1, address)
                .await
                .expect("read")
                .expect("row");
            assert_eq!(row.status, UserContractStatus::CompletedCondition1);
        }

        // diff = (1.2M / 1M - 1) * 100 = 20%.
        wait_for_score(&world.store, "A", 1000.0 * 0.000003 * 1.2, 1e-12).await;
        wait_for_score(&world.store, "B", 2000.0 * 0.000003 * 1.2, 1e-12).await;

        // The stream is gone and the feed subscription released.
        timeout(Duration::from_secs(2), async {
            while world.supervisor.is_active(1) || !world.feed.subscribed_mints().is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("stream deregistered");
    }

    #[tokio::test]
    async fn sole_signer_breaking_closes_the_contract_all_broken() {
        let world = world();
        seed(
            &world,
            contract(2, "M2", dec!(1_000_000), Utc::now() + TimeDelta::hours(1)),
            &[("A", dec!(500))],
        )
        .await;
        world.supervisor.start(2).await.expect("start");

        world.feed.emit(trade("M2", "A", 10.0, 499.0));

        let completed = wait_for_completion(&world.store, 2).await;
        assert_eq!(completed.completion_reason, Some(CompletionReason::AllBroken));
        let row = world
            .store
            .user_contract(2, "A")
            .await
            .expect("read")
            .expect("row");
        assert_eq!(row.status, UserContractStatus::Broken);

        // Penalty: -2 * 500 * 0.000003 * (1 + (1000/1M - 1) * 100 / 100).
        wait_for_score(&world.store, "A", -2.0 * 500.0 * 0.000003 * 0.001, 1e-12).await;
    }

    #[tokio::test]
    async fn deadline_fires_without_events() {
        let world = world();
        seed(
            &world,
            contract(3, "M3", dec!(1_000_000), Utc::now() + TimeDelta::milliseconds(200)),
            &[("A", dec!(10))],
        )
        .await;
        world.supervisor.start(3).await.expect("start");

        let completed = wait_for_completion(&world.store, 3).await;
        assert_eq!(
            completed.completion_reason,
            Some(CompletionReason::TimeExpired)
        );
        let row = world
            .store
            .user_contract(3, "A")
            .await
            .expect("read")
            .expect("row");
        assert_eq!(row.status, UserContractStatus::CompletedCondition2);

        // Signed minutes ago: the age score is zero.
        wait_for_score(&world.store, "A", 0.0, 0.0).await;
    }

    #[tokio::test]
    async fn restart_resets_the_ath() {
        let world = world();
        seed(
            &world,
            contract(5, "M5", dec!(1_000_000_000), Utc::now() + TimeDelta::hours(1)),
            &[("A", dec!(10))],
        )
        .await;
        world.supervisor.start(5).await.expect("start");

        world.feed.emit(trade("M5", "B", 800.0, 0.0));
        wait_for_ath(&world.supervisor, 5, 800.0).await;

        world.supervisor.restart(5).await.expect("restart");
        let snapshot = world.supervisor.get(5).expect("active after restart");
        assert_eq!(snapshot.ath_market_cap_sol, 0.0);

        // A lower cap after the restart does not resurrect the old high.
        world.feed.emit(trade("M5", "B", 700.0, 0.0));
        wait_for_ath(&world.supervisor, 5, 700.0).await;

        let row = world.store.contract(5).await.expect("read").expect("row");
        assert!(!row.is_completed);
        assert!(world.supervisor.is_active(5));
    }

    #[tokio::test]
    async fn start_refuses_unstartable_contracts() {
        let world = world();

        assert!(matches!(
            world.supervisor.start(10).await,
            Err(StreamError::ContractNotFound(10))
        ));

        let mut done = contract(11, "M11", dec!(1), Utc::now() + TimeDelta::hours(1));
        done.is_completed = true;
        done.completion_reason = Some(CompletionReason::Manual);
        done.completed_at = Some(Utc::now());
        seed(&world, done, &[("A", dec!(1))]).await;
        assert!(matches!(
            world.supervisor.start(11).await,
            Err(StreamError::AlreadyCompleted(11))
        ));

        seed(
            &world,
            contract(12, "M12", dec!(1), Utc::now() - TimeDelta::seconds(1)),
            &[("A", dec!(1))],
        )
        .await;
        assert!(matches!(
            world.supervisor.start(12).await,
            Err(StreamError::DeadlinePassed(12))
        ));

        seed(
            &world,
            contract(13, "M13", dec!(1), Utc::now() + TimeDelta::hours(1)),
            &[],
        )
        .await;
        assert!(matches!(
            world.supervisor.start(13).await,
            Err(StreamError::NoSigners(13))
        ));
    }

    #[tokio::test]
    async fn one_stream_per_contract_and_per_mint() {
        let world = world();
        seed(
            &world,
            contract(20, "SHARED", dec!(1_000_000), Utc::now() + TimeDelta::hours(1)),
            &[("A", dec!(1))],
        )
        .await;
        seed(
            &world,
            contract(21, "SHARED", dec!(1_000_000), Utc::now() + TimeDelta::hours(1)),
            &[("B", dec!(1))],
        )
        .await;

        assert_eq!(
            world.supervisor.start(20).await.expect("start"),
            StartOutcome::Started
        );
        assert_eq!(
            world.supervisor.start(20).await.expect("idempotent start"),
            StartOutcome::AlreadyActive
        );
        assert!(matches!(
            world.supervisor.start(21).await,
            Err(StreamError::MintBusy(_))
        ));

        assert_eq!(world.supervisor.list_active().len(), 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_start_again_is_fresh() {
        let world = world();
        seed(
            &world,
            contract(30, "M30", dec!(1_000_000), Utc::now() + TimeDelta::hours(1)),
            &[("A", dec!(1))],
        )
        .await;

        world.supervisor.start(30).await.expect("start");
        assert!(world.supervisor.stop(30).await);
        assert!(!world.supervisor.stop(30).await);
        assert!(!world.supervisor.is_active(30));
        assert!(world.feed.subscribed_mints().is_empty());

        // start → stop → start yields an equivalent stream.
        assert_eq!(
            world.supervisor.start(30).await.expect("restartable"),
            StartOutcome::Started
        );
        let snapshot = world.supervisor.get(30).expect("snapshot");
        assert_eq!(snapshot.contract_id, 30);
        assert_eq!(snapshot.mint, "M30");
        assert_eq!(snapshot.ath_market_cap_sol, 0.0);
        assert_eq!(snapshot.signers, 1);
    }

    #[tokio::test]
    async fn bulk_startup_reconciles_expired_contracts() {
        let world = world();
        seed(
            &world,
            contract(40, "M40", dec!(1_000_000), Utc::now() + TimeDelta::hours(1)),
            &[("A", dec!(1))],
        )
        .await;
        seed(
            &world,
            contract(41, "M41", dec!(1_000_000), Utc::now() - TimeDelta::hours(1)),
            &[("B", dec!(1))],
        )
        .await;

        let scheduled = world.supervisor.start_all_pending().await;
        assert_eq!(scheduled, 1);

        // The expired contract closed without ever getting a stream.
        let reconciled = world.store.contract(41).await.expect("read").expect("row");
        assert!(reconciled.is_completed);
        assert_eq!(
            reconciled.completion_reason,
            Some(CompletionReason::TimeExpired)
        );
        let row = world
            .store
            .user_contract(41, "B")
            .await
            .expect("read")
            .expect("row");
        assert_eq!(row.status, UserContractStatus::CompletedCondition2);

        // The live one comes up in the background.
        timeout(Duration::from_secs(2), async {
            while !world.supervisor.is_active(40) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("pending contract started");
    }

    #[tokio::test]
    async fn creation_notifier_starts_streams_in_the_background() {
        let world = world();
        seed(
            &world,
            contract(50, "M50", dec!(1_000_000), Utc::now() + TimeDelta::hours(1)),
            &[("A", dec!(1))],
        )
        .await;

        let notifier = world.supervisor.creation_notifier();
        notifier.send(50).await.expect("notify");

        timeout(Duration::from_secs(2), async {
            while !world.supervisor.is_active(50) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("auto-started");

        // A failing id only logs; the notifier keeps working.
        notifier.send(999).await.expect("notify unknown");
        assert!(world.supervisor.is_active(50));
    }
}
