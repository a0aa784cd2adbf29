//! In-process operator surface: start/stop/restart/list/health translated
//! into supervisor calls, answered with plain serialisable results.

use std::sync::Arc;

use serde::Serialize;

use crate::feed::FeedState;
use crate::streams::{StartOutcome, StreamError, StreamSnapshot, StreamSupervisor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    Started,
    AlreadyActive,
    Restarted,
    Stopped,
    NotActive,
    NotFound,
    AlreadyCompleted,
    DeadlinePassed,
    NoSigners,
    MintBusy,
    FeedUnavailable,
    Storage,
}

/// Structured result of one operator command. The reason is machine
/// readable; inner error detail never crosses this boundary.
#[derive(Debug, Clone, Serialize)]
pub struct CommandOutcome {
    pub ok: bool,
    pub reason: ReasonCode,
    pub stream: Option<StreamSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub ready: bool,
    pub feed: Option<FeedState>,
    pub active_streams: usize,
}

pub struct Operator {
    supervisor: Arc<StreamSupervisor>,
}

impl Operator {
    pub fn new(supervisor: Arc<StreamSupervisor>) -> Self {
        Self { supervisor }
    }

    pub async fn start(&self, contract_id: i64) -> CommandOutcome {
        match self.supervisor.start(contract_id).await {
            Ok(StartOutcome::Started) => self.done(ReasonCode::Started, contract_id),
            Ok(StartOutcome::AlreadyActive) => self.done(ReasonCode::AlreadyActive, contract_id),
            Err(error) => self.refusal(&error, contract_id),
        }
    }

    pub async fn stop(&self, contract_id: i64) -> CommandOutcome {
        // Idempotent either way; the reason tells the two cases apart.
        let reason = if self.supervisor.stop(contract_id).await {
            ReasonCode::Stopped
        } else {
            ReasonCode::NotActive
        };

        CommandOutcome {
            ok: true,
            reason,
            stream: None,
        }
    }

    pub async fn restart(&self, contract_id: i64) -> CommandOutcome {
        match self.supervisor.restart(contract_id).await {
            Ok(_) => self.done(ReasonCode::Restarted, contract_id),
            Err(error) => self.refusal(&error, contract_id),
        }
    }

    pub fn list(&self) -> Vec<StreamSnapshot> {
        self.supervisor.list_active()
    }

    pub async fn health(&self) -> Health {
        let feed = self.supervisor.feed_status().await;

        Health {
            ready: feed.as_ref().is_some_and(|f| !f.failed),
            feed: feed.map(|f| f.state),
            active_streams: self.supervisor.list_active().len(),
        }
    }

    fn done(&self, reason: ReasonCode, contract_id: i64) -> CommandOutcome {
        CommandOutcome {
            ok: true,
            reason,
            stream: self.supervisor.get(contract_id),
        }
    }

    fn refusal(&self, error: &StreamError, contract_id: i64) -> CommandOutcome {
        let reason = match error {
            StreamError::ContractNotFound(_) => ReasonCode::NotFound,
            StreamError::AlreadyCompleted(_) => ReasonCode::AlreadyCompleted,
            StreamError::DeadlinePassed(_) => ReasonCode::DeadlinePassed,
            StreamError::NoSigners(_) => ReasonCode::NoSigners,
            StreamError::MintBusy(_) => ReasonCode::MintBusy,
            StreamError::Feed(_) => ReasonCode::FeedUnavailable,
            StreamError::Database(_) => ReasonCode::Storage,
        };

        CommandOutcome {
            ok: false,
            reason,
            stream: self.supervisor.get(contract_id),
        }
    }
}
