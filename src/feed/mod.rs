//! Client side of the upstream trade feed.
//!
//! One long-lived task owns the socket and the per-mint demux map; everything
//! else talks to it through [`FeedHandle`] command messages. Inbound frames
//! fan out over bounded broadcast channels, so a slow consumer loses the
//! oldest events (observed as `Lagged` on its receiver) instead of growing
//! memory.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::config::Config;
use crate::errors::{Classify, ErrorKind};

pub mod types;

pub use types::{ControlFrame, FeedState, FeedStatus, InboundFrame, TradeEvent, TxType};

type WsConn = WebSocketStream<MaybeTlsStream<TcpStream>>;

const COMMAND_BUFFER: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("trade feed connection attempts exhausted")]
    ReconnectExhausted,

    #[error("trade feed connection lost")]
    ConnectionLost,

    #[error("trade feed client is gone")]
    Closed,
}

impl Classify for FeedError {
    fn kind(&self) -> ErrorKind {
        match self {
            FeedError::ConnectionLost => ErrorKind::Transient,
            FeedError::ReconnectExhausted | FeedError::Closed => ErrorKind::Fatal,
        }
    }
}

/// Capability surface the supervisor depends on, so tests can swap the real
/// client for an in-process fake.
#[async_trait]
pub trait TradeFeed: Send + Sync {
    /// Idempotent: a second subscribe for the same mint returns a fresh
    /// receiver on the same channel without a duplicate control frame.
    async fn subscribe(&self, mint: &str) -> Result<broadcast::Receiver<TradeEvent>, FeedError>;

    /// Idempotent; after it returns, no further events for `mint` are
    /// delivered beyond what a consumer had already buffered.
    async fn unsubscribe(&self, mint: &str) -> Result<(), FeedError>;

    async fn status(&self) -> Result<FeedStatus, FeedError>;

    async fn shutdown(&self);
}

#[derive(Debug, Clone)]
pub struct FeedOptions {
    pub channel_capacity: usize,
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl From<&Config> for FeedOptions {
    fn from(config: &Config) -> Self {
        Self {
            channel_capacity: config.channel_capacity,
            max_attempts: config.max_retries,
            base_delay: config.base_retry_delay,
        }
    }
}

enum FeedCommand {
    Subscribe {
        mint: String,
        reply: oneshot::Sender<Result<broadcast::Receiver<TradeEvent>, FeedError>>,
    },
    Unsubscribe {
        mint: String,
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<FeedStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap, cloneable handle to the client task.
#[derive(Clone)]
pub struct FeedHandle {
    cmd_tx: mpsc::Sender<FeedCommand>,
}

pub struct FeedClient;

impl FeedClient {
    /// Spawns the client task. The connection is dialled lazily on the first
    /// subscribe.
    pub fn spawn(url: impl Into<String>, options: FeedOptions) -> FeedHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let task = ClientTask {
            url: url.into(),
            options,
            cmd_rx,
            subs: HashMap::new(),
            state: FeedState::Disconnected,
            failed: false,
            frames_dropped: 0,
        };
        tokio::spawn(task.run());

        FeedHandle { cmd_tx }
    }
}

#[async_trait]
impl TradeFeed for FeedHandle {
    async fn subscribe(&self, mint: &str) -> Result<broadcast::Receiver<TradeEvent>, FeedError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(FeedCommand::Subscribe {
                mint: mint.to_owned(),
                reply,
            })
            .await
            .map_err(|_| FeedError::Closed)?;

        rx.await.map_err(|_| FeedError::Closed)?
    }

    async fn unsubscribe(&self, mint: &str) -> Result<(), FeedError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(FeedCommand::Unsubscribe {
                mint: mint.to_owned(),
                reply,
            })
            .await
            .map_err(|_| FeedError::Closed)?;

        rx.await.map_err(|_| FeedError::Closed)
    }

    async fn status(&self) -> Result<FeedStatus, FeedError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(FeedCommand::Status { reply })
            .await
            .map_err(|_| FeedError::Closed)?;

        rx.await.map_err(|_| FeedError::Closed)
    }

    async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(FeedCommand::Shutdown { reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

/// How a connected session ended.
#[derive(Debug, PartialEq, Eq)]
enum Session {
    Lost,
    Shutdown,
}

enum Dial {
    Connected(Box<WsConn>),
    Exhausted,
    Shutdown,
}

struct ClientTask {
    url: String,
    options: FeedOptions,
    cmd_rx: mpsc::Receiver<FeedCommand>,
    subs: HashMap<String, broadcast::Sender<TradeEvent>>,
    state: FeedState,
    failed: bool,
    frames_dropped: u64,
}

impl ClientTask {
    async fn run(mut self) {
        // Disconnected: nothing to read, wait for commands.
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                FeedCommand::Subscribe { mint, reply } => {
                    let rx = self.register(&mint);
                    match self.connect_with_backoff().await {
                        Dial::Connected(conn) => {
                            let _ = reply.send(Ok(rx));
                            if self.session_loop(*conn).await == Session::Shutdown {
                                return;
                            }
                        }
                        Dial::Exhausted => {
                            self.fail_subscribers();
                            let _ = reply.send(Err(FeedError::ReconnectExhausted));
                        }
                        Dial::Shutdown => return,
                    }
                }
                FeedCommand::Unsubscribe { mint, reply } => {
                    self.subs.remove(&mint);
                    let _ = reply.send(());
                }
                FeedCommand::Status { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                FeedCommand::Shutdown { reply } => {
                    let _ = reply.send(());
                    return;
                }
            }
        }
    }

    /// Runs connected sessions until shutdown, reconnecting as long as any
    /// subscription remains. Returning `Session::Lost` here means the active
    /// set is empty or reconnects were exhausted; the caller falls back to
    /// the disconnected wait.
    async fn session_loop(&mut self, mut conn: WsConn) -> Session {
        loop {
            if !self.announce(&mut conn).await {
                tracing::warn!("connection died before subscriptions could be announced");
            } else {
                match self.drive(&mut conn).await {
                    Session::Shutdown => return Session::Shutdown,
                    Session::Lost => {}
                }
            }

            self.state = FeedState::Disconnected;
            if self.subs.is_empty() {
                return Session::Lost;
            }

            tracing::warn!("trade feed transport lost, reconnecting");
            match self.connect_with_backoff().await {
                Dial::Connected(next) => conn = *next,
                Dial::Exhausted => {
                    self.fail_subscribers();
                    return Session::Lost;
                }
                Dial::Shutdown => return Session::Shutdown,
            }
        }
    }

    /// Re-issues the whole active set in one control frame. Runs before any
    /// new command is accepted on this connection.
    async fn announce(&mut self, conn: &mut WsConn) -> bool {
        if self.subs.is_empty() {
            return true;
        }
        let keys: Vec<String> = self.subs.keys().cloned().collect();
        tracing::info!(mints = keys.len(), "announcing subscriptions");

        self.send_frame(conn, &ControlFrame::subscribe(keys)).await
    }

    async fn drive(&mut self, conn: &mut WsConn) -> Session {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        let _ = conn.close(None).await;
                        return Session::Shutdown;
                    };
                    match cmd {
                        FeedCommand::Subscribe { mint, reply } => {
                            if let Some(tx) = self.subs.get(&mint) {
                                // Already active: same channel, no extra frame.
                                let _ = reply.send(Ok(tx.subscribe()));
                                continue;
                            }
                            let rx = self.register(&mint);
                            let sent = self
                                .send_frame(conn, &ControlFrame::subscribe(vec![mint]))
                                .await;
                            let _ = reply.send(Ok(rx));
                            if !sent {
                                return Session::Lost;
                            }
                        }
                        FeedCommand::Unsubscribe { mint, reply } => {
                            let was_active = self.subs.remove(&mint).is_some();
                            if was_active {
                                let sent = self
                                    .send_frame(conn, &ControlFrame::unsubscribe(vec![mint]))
                                    .await;
                                let _ = reply.send(());
                                if !sent {
                                    return Session::Lost;
                                }
                            } else {
                                let _ = reply.send(());
                            }
                        }
                        FeedCommand::Status { reply } => {
                            let _ = reply.send(self.snapshot());
                        }
                        FeedCommand::Shutdown { reply } => {
                            self.state = FeedState::Closing;
                            let _ = conn.close(None).await;
                            self.subs.clear();
                            self.state = FeedState::Disconnected;
                            let _ = reply.send(());
                            return Session::Shutdown;
                        }
                    }
                }
                frame = conn.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => self.route(&text),
                        Some(Ok(Message::Ping(payload))) => {
                            if conn.send(Message::Pong(payload)).await.is_err() {
                                return Session::Lost;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return Session::Lost,
                        Some(Ok(_)) => {}
                        Some(Err(error)) => {
                            tracing::warn!(%error, "trade feed read error");
                            return Session::Lost;
                        }
                    }
                }
            }
        }
    }

    /// Demultiplexes one inbound text frame by mint. At-most-once: frames
    /// that fail to decode are dropped, not retried.
    fn route(&mut self, text: &str) {
        match InboundFrame::parse(text) {
            InboundFrame::Trade(event) => match self.subs.get(&event.mint) {
                // A send error only means no receiver is currently listening.
                Some(tx) => {
                    let _ = tx.send(*event);
                }
                None => {
                    tracing::debug!(mint = %event.mint, "trade for a mint with no subscription");
                }
            },
            InboundFrame::Control => {
                tracing::debug!("ignoring control-plane acknowledgement");
            }
            InboundFrame::Undecodable => {
                self.frames_dropped += 1;
                tracing::warn!(total = self.frames_dropped, "dropping undecodable feed frame");
            }
        }
    }

    /// Dials with exponential backoff: `base * 2^(attempt - 1)` between
    /// attempts, up to `max_attempts`. Stays responsive to commands while
    /// waiting so a shutdown can cancel the backoff.
    async fn connect_with_backoff(&mut self) -> Dial {
        self.state = FeedState::Connecting;

        for attempt in 1..=self.options.max_attempts {
            match connect_async(self.url.as_str()).await {
                Ok((conn, _)) => {
                    tracing::info!(attempt, "connected to trade feed");
                    self.state = FeedState::Connected;
                    self.failed = false;
                    return Dial::Connected(Box::new(conn));
                }
                Err(error) => {
                    tracing::warn!(attempt, %error, "trade feed connect failed");
                }
            }
            if attempt == self.options.max_attempts {
                break;
            }

            let delay = self.options.base_delay * 2u32.pow(attempt as u32 - 1);
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    cmd = self.cmd_rx.recv() => match cmd {
                        None => return Dial::Shutdown,
                        Some(FeedCommand::Shutdown { reply }) => {
                            let _ = reply.send(());
                            return Dial::Shutdown;
                        }
                        Some(FeedCommand::Status { reply }) => {
                            let _ = reply.send(self.snapshot());
                        }
                        // Joins the active set; announced once connected.
                        Some(FeedCommand::Subscribe { mint, reply }) => {
                            let rx = self.register(&mint);
                            let _ = reply.send(Ok(rx));
                        }
                        Some(FeedCommand::Unsubscribe { mint, reply }) => {
                            self.subs.remove(&mint);
                            let _ = reply.send(());
                        }
                    },
                }
            }
        }

        tracing::error!(
            attempts = self.options.max_attempts,
            "trade feed connection attempts exhausted"
        );
        self.state = FeedState::Disconnected;
        self.failed = true;

        Dial::Exhausted
    }

    /// Fatal path: closing the senders surfaces the failure to every
    /// subscriber as a closed channel.
    fn fail_subscribers(&mut self) {
        self.subs.clear();
        self.failed = true;
        self.state = FeedState::Disconnected;
    }

    fn register(&mut self, mint: &str) -> broadcast::Receiver<TradeEvent> {
        let capacity = self.options.channel_capacity;
        self.subs
            .entry(mint.to_owned())
            .or_insert_with(|| broadcast::channel(capacity).0)
            .subscribe()
    }

    async fn send_frame(&mut self, conn: &mut WsConn, frame: &ControlFrame) -> bool {
        let json = match serde_json::to_string(frame) {
            Ok(json) => json,
            Err(error) => {
                tracing::error!(%error, "control frame failed to serialize");
                return false;
            }
        };

        match conn.send(Message::Text(json)).await {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(%error, "control frame send failed");
                false
            }
        }
    }

    fn snapshot(&self) -> FeedStatus {
        FeedStatus {
            state: self.state,
            subscriptions: self.subs.keys().cloned().collect(),
            failed: self.failed,
            frames_dropped: self.frames_dropped,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use dashmap::DashMap;

    /// In-process [`TradeFeed`] fake: events pushed through [`Self::emit`]
    /// reach whoever subscribed to the mint.
    #[derive(Default)]
    pub struct ChannelFeed {
        channels: DashMap<String, broadcast::Sender<TradeEvent>>,
    }

    impl ChannelFeed {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn emit(&self, event: TradeEvent) {
            if let Some(tx) = self.channels.get(&event.mint) {
                let _ = tx.send(event);
            }
        }

        pub fn subscribed_mints(&self) -> Vec<String> {
            self.channels.iter().map(|e| e.key().clone()).collect()
        }
    }

    #[async_trait]
    impl TradeFeed for ChannelFeed {
        async fn subscribe(
            &self,
            mint: &str,
        ) -> Result<broadcast::Receiver<TradeEvent>, FeedError> {
            Ok(self
                .channels
                .entry(mint.to_owned())
                .or_insert_with(|| broadcast::channel(64).0)
                .subscribe())
        }

        async fn unsubscribe(&self, mint: &str) -> Result<(), FeedError> {
            self.channels.remove(mint);
            Ok(())
        }

        async fn status(&self) -> Result<FeedStatus, FeedError> {
            Ok(FeedStatus {
                state: FeedState::Connected,
                subscriptions: self.subscribed_mints(),
                failed: false,
                frames_dropped: 0,
            })
        }

        async fn shutdown(&self) {
            self.channels.clear();
        }
    }
}
