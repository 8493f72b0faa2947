//! Per-user realtime delivery channel.
//!
//! A subscription is one spawned task driving a connection state machine
//! over a [`ChangeFeed`]. The production feed is the store's broadcast
//! bus; the trait seam exists so transports (and test doubles) can be
//! swapped without touching the retry logic.
//!
//! Delivery is at-least-once and asynchronous relative to the write that
//! produced it: a lagged receiver reconnects and may re-observe changes.
//! Consumers that need exact values must ask the count/query API, which
//! is always computed from current row state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use thiserror::Error;
use tokio::sync::{broadcast, watch};

use crate::store::{Store, StoreChange};

/// Connection lifecycle. `Connecting -> Subscribed` on success;
/// `Subscribed -> ChannelError | TimedOut` on failure, back to
/// `Connecting` while the retry budget lasts; `Closed` on exhaustion or
/// explicit cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Connecting,
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

impl ChannelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelStatus::Connecting => "connecting",
            ChannelStatus::Subscribed => "subscribed",
            ChannelStatus::ChannelError => "channel_error",
            ChannelStatus::TimedOut => "timed_out",
            ChannelStatus::Closed => "closed",
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum FeedError {
    #[error("channel error: {0}")]
    Channel(String),
    #[error("connection timed out")]
    TimedOut,
    #[error("feed closed")]
    Closed,
    #[error("receiver lagged by {0} changes")]
    Lagged(u64),
}

impl FeedError {
    fn status(&self) -> ChannelStatus {
        match self {
            FeedError::TimedOut => ChannelStatus::TimedOut,
            _ => ChannelStatus::ChannelError,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum RetryPolicy {
    Fixed,
    /// Doubles the delay per consecutive failure, capped.
    Exponential { max_delay: Duration },
}

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Consecutive failed reconnect attempts allowed before giving up.
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub policy: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay: Duration::from_secs(1),
            policy: RetryPolicy::Fixed,
        }
    }
}

impl RetryConfig {
    /// Delay before retry `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.policy {
            RetryPolicy::Fixed => self.retry_delay,
            RetryPolicy::Exponential { max_delay } => {
                let exp = attempt.saturating_sub(1).min(16);
                self.retry_delay
                    .saturating_mul(2u32.saturating_pow(exp))
                    .min(max_delay)
            }
        }
    }
}

/// One live connection to a change source.
#[async_trait]
pub trait FeedConnection: Send {
    async fn next_change(&mut self) -> Result<StoreChange, FeedError>;
}

/// Factory for connections; called once per (re)connect attempt.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn connect(&self, user_id: &str) -> Result<Box<dyn FeedConnection>, FeedError>;
}

/// Production feed: subscribes a broadcast receiver to the store's
/// change bus. Lagging behind the bus surfaces as a transient error and
/// triggers a reconnect.
pub struct StoreChangeFeed {
    store: Arc<Store>,
}

impl StoreChangeFeed {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

struct StoreFeedConnection {
    rx: broadcast::Receiver<StoreChange>,
}

#[async_trait]
impl ChangeFeed for StoreChangeFeed {
    async fn connect(&self, _user_id: &str) -> Result<Box<dyn FeedConnection>, FeedError> {
        Ok(Box::new(StoreFeedConnection {
            rx: self.store.subscribe_changes(),
        }))
    }
}

#[async_trait]
impl FeedConnection for StoreFeedConnection {
    async fn next_change(&mut self) -> Result<StoreChange, FeedError> {
        match self.rx.recv().await {
            Ok(change) => Ok(change),
            Err(broadcast::error::RecvError::Lagged(n)) => Err(FeedError::Lagged(n)),
            Err(broadcast::error::RecvError::Closed) => Err(FeedError::Closed),
        }
    }
}

pub type EventCallback = Box<dyn Fn(StoreChange) + Send + Sync>;
pub type StatusCallback = Box<dyn Fn(ChannelStatus, Option<&FeedError>) + Send + Sync>;

struct SubscriptionState {
    user_id: String,
    closed: Arc<AtomicBool>,
    status: Arc<Mutex<ChannelStatus>>,
    on_event: EventCallback,
    on_status: StatusCallback,
}

impl SubscriptionState {
    fn set_status(&self, status: ChannelStatus, error: Option<&FeedError>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        *self.status.lock().unwrap() = status;
        (self.on_status)(status, error);
    }

    fn emit(&self, change: StoreChange) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        (self.on_event)(change);
    }
}

/// Handle to a live subscription. Dropping it tears the subscription
/// down (the shutdown sender goes away); call [`cleanup`] for an
/// explicit, immediate close.
///
/// [`cleanup`]: SubscriptionHandle::cleanup
pub struct SubscriptionHandle {
    closed: Arc<AtomicBool>,
    status: Arc<Mutex<ChannelStatus>>,
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn status(&self) -> ChannelStatus {
        *self.status.lock().unwrap()
    }

    /// Cancel the subscription: any pending retry timer is dropped and no
    /// callback fires after this returns. Idempotent, callable from any
    /// thread.
    pub fn cleanup(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);
        *self.status.lock().unwrap() = ChannelStatus::Closed;
        self.task.abort();
    }
}

/// Open a per-user delivery channel over `feed`. Changes visible to
/// `user_id` are forwarded to `on_event` in the order the feed yields
/// them; lifecycle transitions go to `on_status`. Must be called from
/// within a tokio runtime.
pub fn subscribe(
    feed: Arc<dyn ChangeFeed>,
    user_id: &str,
    on_event: EventCallback,
    on_status: StatusCallback,
    config: RetryConfig,
) -> SubscriptionHandle {
    let closed = Arc::new(AtomicBool::new(false));
    let status = Arc::new(Mutex::new(ChannelStatus::Connecting));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let state = Arc::new(SubscriptionState {
        user_id: user_id.to_string(),
        closed: closed.clone(),
        status: status.clone(),
        on_event,
        on_status,
    });

    let task = tokio::spawn(run(state, feed, config, shutdown_rx));

    SubscriptionHandle {
        closed,
        status,
        shutdown: shutdown_tx,
        task,
    }
}

/// Convenience wrapper binding a subscription to the store's change bus.
pub fn subscribe_to_store(
    store: Arc<Store>,
    user_id: &str,
    on_event: EventCallback,
    on_status: StatusCallback,
    config: RetryConfig,
) -> SubscriptionHandle {
    subscribe(
        Arc::new(StoreChangeFeed::new(store)),
        user_id,
        on_event,
        on_status,
        config,
    )
}

async fn run(
    state: Arc<SubscriptionState>,
    feed: Arc<dyn ChangeFeed>,
    config: RetryConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut retries: u32 = 0;
    let mut last_error: Option<FeedError> = None;
    loop {
        state.set_status(ChannelStatus::Connecting, None);
        let connected = tokio::select! {
            _ = shutdown.changed() => return,
            result = feed.connect(&state.user_id) => result,
        };
        match connected {
            Ok(mut conn) => {
                // a successful subscribe resets the consecutive-failure budget
                retries = 0;
                state.set_status(ChannelStatus::Subscribed, None);
                let failure = loop {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        item = conn.next_change() => match item {
                            Ok(change) => {
                                if change.visible_to(&state.user_id) {
                                    state.emit(change);
                                }
                            }
                            Err(e) => break e,
                        }
                    }
                };
                state.set_status(failure.status(), Some(&failure));
                last_error = Some(failure);
            }
            Err(e) => {
                state.set_status(e.status(), Some(&e));
                last_error = Some(e);
            }
        }

        if retries >= config.max_retries {
            debug!(
                "subscription for {} exhausted {} retries, closing",
                state.user_id, config.max_retries
            );
            state.set_status(ChannelStatus::Closed, last_error.as_ref());
            return;
        }
        retries += 1;
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(config.delay_for(retries)) => {}
        }
    }
}
