//! Chain watchers.
//!
//! A watcher owns one upstream connection and runs in one of two modes,
//! picked from the watch URL: a live push feed (`ws://`, `wss://`) or a
//! periodic range query (anything else). Both hand decoded events to the same
//! [`Handler`] and only move their [`Cursor`] once the handler has settled
//! the corresponding events.

use std::time::Duration;

use async_trait::async_trait;
use eyre::{eyre, Result};
use tracing::{debug, error, info, warn};

use crate::error::{DecodeError, FeedError, HandlerError};
use crate::retry::RetryConfig;
use crate::shutdown::Shutdown;

pub mod evm;
pub mod solana;

/// How a watcher receives events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Subscription,
    Polling,
}

impl Mode {
    /// Subscription for websocket endpoints, polling otherwise.
    pub fn from_url(url: &str) -> Self {
        let scheme = url.split("://").next().unwrap_or_default().to_ascii_lowercase();
        match scheme.as_str() {
            "ws" | "wss" => Mode::Subscription,
            _ => Mode::Polling,
        }
    }
}

/// Resume point of a watcher. In-memory only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    start: u64,
    last_processed: Option<u64>,
    mode: Mode,
}

impl Cursor {
    pub fn new(start: u64, mode: Mode) -> Self {
        Self {
            start,
            last_processed: None,
            mode,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Same position, driven in another mode.
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn last_processed(&self) -> Option<u64> {
        self.last_processed
    }

    /// First height not yet settled
    pub fn next_height(&self) -> u64 {
        match self.last_processed {
            Some(h) => h.saturating_add(1),
            None => self.start,
        }
    }

    /// Mark everything up to `height` as settled. Never moves backwards.
    pub fn settle(&mut self, height: u64) {
        if self.last_processed.map_or(true, |h| height > h) {
            self.last_processed = Some(height);
        }
    }
}

/// A decoded event together with where it was observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observed<E> {
    /// Block number or slot
    pub height: u64,
    /// Unique per source event; used for dedup
    pub id: [u8; 32],
    pub event: E,
}

/// A relevant log that could not be decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Undecoded {
    pub height: u64,
    pub error: DecodeError,
}

pub type Delivery<E> = std::result::Result<Observed<E>, Undecoded>;

/// Range-queryable event source
#[async_trait]
pub trait PollSource: Send {
    type Event: Send + Sync;

    /// Highest height safe to query
    async fn best_height(&mut self) -> Result<u64>;

    /// Relevant events in `[from, to]`, in chain order.
    async fn fetch(&mut self, from: u64, to: u64) -> Result<Vec<Delivery<Self::Event>>>;
}

/// Live push feed
#[async_trait]
pub trait Feed: Send {
    type Event: Send + Sync;

    /// Next delivery; `Ok(None)` once the upstream unsubscribed cleanly.
    async fn next(&mut self) -> std::result::Result<Option<Delivery<Self::Event>>, FeedError>;

    /// Unsubscribe and release the connection.
    async fn close(&mut self);
}

/// Turns decoded events into accumulator updates or submissions
#[async_trait]
pub trait Handler<E: Send + Sync>: Send {
    async fn handle(&mut self, event: &Observed<E>) -> std::result::Result<(), HandlerError>;

    /// Called once every event at or below `height` has been delivered.
    async fn on_batch_end(&mut self, _height: u64) -> std::result::Result<(), HandlerError> {
        Ok(())
    }
}

/// Result of one polling round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing new to query
    Idle,
    /// `[from, to]` settled; `behind` when more heights are already available
    Advanced { from: u64, to: u64, delivered: usize, behind: bool },
    /// The round failed and the cursor did not move
    Retry(String),
}

/// Polling-mode driver
pub struct PollingWatcher<S, H> {
    name: &'static str,
    source: S,
    handler: H,
    cursor: Cursor,
    interval: Duration,
    max_range: u64,
}

impl<S, H> PollingWatcher<S, H>
where
    S: PollSource,
    H: Handler<S::Event>,
{
    pub fn new(name: &'static str, source: S, handler: H, start: u64, interval: Duration) -> Self {
        Self {
            name,
            source,
            handler,
            cursor: Cursor::new(start, Mode::Polling),
            interval,
            max_range: u64::MAX,
        }
    }

    /// Cap the number of heights queried per round.
    pub fn with_max_range(mut self, max_range: u64) -> Self {
        self.max_range = max_range.max(1);
        self
    }

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn into_parts(self) -> (H, Cursor) {
        (self.handler, self.cursor)
    }

    /// Query and settle one range.
    pub async fn poll_once(&mut self) -> Result<PollOutcome> {
        let best = match self.source.best_height().await {
            Ok(h) => h,
            Err(e) => {
                warn!(watcher = self.name, error = %e, "Failed to fetch best height");
                return Ok(PollOutcome::Retry(e.to_string()));
            }
        };

        let from = self.cursor.next_height();
        if from > best {
            return Ok(PollOutcome::Idle);
        }
        let to = best.min(from.saturating_add(self.max_range - 1));

        let deliveries = match self.source.fetch(from, to).await {
            Ok(d) => d,
            Err(e) => {
                warn!(watcher = self.name, from, to, error = %e, "Failed to query range");
                return Ok(PollOutcome::Retry(e.to_string()));
            }
        };

        let delivered = deliveries.len();
        let mut max_observed = to;
        for delivery in deliveries {
            let observed = match delivery {
                Ok(observed) => observed,
                Err(undecoded) => {
                    warn!(
                        watcher = self.name,
                        height = undecoded.height,
                        error = %undecoded.error,
                        "Skipping undecodable event"
                    );
                    continue;
                }
            };

            match self.handler.handle(&observed).await {
                Ok(()) => {}
                Err(e) if e.is_settled() => {
                    warn!(
                        watcher = self.name,
                        height = observed.height,
                        id = %hex::encode(observed.id),
                        error = %e,
                        "Event rejected, continuing"
                    );
                }
                Err(HandlerError::Fatal(e)) => return Err(e),
                Err(e) => {
                    warn!(
                        watcher = self.name,
                        height = observed.height,
                        error = %e,
                        "Transient handler failure, range will be retried"
                    );
                    return Ok(PollOutcome::Retry(e.to_string()));
                }
            }
            max_observed = max_observed.max(observed.height);
        }

        match self.handler.on_batch_end(to).await {
            Ok(()) => {}
            Err(e) if e.is_settled() => {
                warn!(watcher = self.name, height = to, error = %e, "Batch hook rejected");
            }
            Err(HandlerError::Fatal(e)) => return Err(e),
            Err(e) => {
                warn!(watcher = self.name, height = to, error = %e, "Batch hook failed, range will be retried");
                return Ok(PollOutcome::Retry(e.to_string()));
            }
        }

        self.cursor.settle(max_observed);
        debug!(
            watcher = self.name,
            from,
            to,
            delivered,
            next = self.cursor.next_height(),
            "Range settled"
        );
        Ok(PollOutcome::Advanced {
            from,
            to,
            delivered,
            behind: to < best,
        })
    }

    /// Poll until the cursor has reached the current best height.
    ///
    /// Used to backfill history before switching to a live feed.
    pub async fn catch_up(&mut self, shutdown: &Shutdown) -> Result<()> {
        loop {
            let outcome = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                outcome = self.poll_once() => outcome?,
            };
            match outcome {
                PollOutcome::Idle => return Ok(()),
                PollOutcome::Advanced { behind: false, to, .. } => {
                    info!(watcher = self.name, height = to, "Backfill complete");
                    return Ok(());
                }
                PollOutcome::Advanced { .. } => {}
                PollOutcome::Retry(_) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.interval) => {}
                    }
                }
            }
        }
    }

    /// Poll until cancelled or a fatal error occurs.
    pub async fn run(mut self, shutdown: Shutdown) -> Result<()> {
        info!(
            watcher = self.name,
            start = self.cursor.next_height(),
            interval_ms = self.interval.as_millis() as u64,
            "Polling watcher started"
        );

        loop {
            let outcome = tokio::select! {
                _ = shutdown.cancelled() => break,
                outcome = self.poll_once() => outcome,
            };

            let catching_up = match outcome {
                Ok(PollOutcome::Advanced { behind, .. }) => behind,
                Ok(_) => false,
                Err(e) => {
                    error!(watcher = self.name, error = %e, "Polling watcher failed");
                    return Err(e);
                }
            };

            if catching_up {
                if shutdown.is_triggered() {
                    break;
                }
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!(watcher = self.name, next = self.cursor.next_height(), "Polling watcher stopped");
        Ok(())
    }
}

impl<S, H> PollingWatcher<S, H>
where
    S: PollSource,
    H: Handler<S::Event>,
{
    /// Poll whenever `feed` delivers, and at least once per poll interval.
    ///
    /// Deliveries only wake the poller. Events are always read from the
    /// source, so they honour its finality lag and nothing the feed missed
    /// is skipped. A failed feed is fatal.
    pub async fn run_triggered<F: Feed>(mut self, mut feed: F, shutdown: Shutdown) -> Result<()> {
        info!(
            watcher = self.name,
            start = self.cursor.next_height(),
            interval_ms = self.interval.as_millis() as u64,
            "Feed-triggered watcher started"
        );

        let result = self.trigger_loop(&mut feed, &shutdown).await;
        feed.close().await;

        match result {
            Ok(()) => {
                info!(
                    watcher = self.name,
                    next = self.cursor.next_height(),
                    "Feed-triggered watcher stopped"
                );
                Ok(())
            }
            Err(e) => {
                error!(watcher = self.name, error = %e, "Feed-triggered watcher failed");
                Err(e)
            }
        }
    }

    async fn trigger_loop<F: Feed>(&mut self, feed: &mut F, shutdown: &Shutdown) -> Result<()> {
        loop {
            loop {
                let outcome = tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    outcome = self.poll_once() => outcome?,
                };
                if !matches!(outcome, PollOutcome::Advanced { behind: true, .. }) {
                    break;
                }
            }

            let received = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                r = tokio::time::timeout(self.interval, feed.next()) => r,
            };
            match received {
                Err(_) | Ok(Err(FeedError::Timeout)) | Ok(Ok(Some(_))) => {}
                Ok(Err(e)) => return Err(eyre!("{} feed failed: {}", self.name, e)),
                Ok(Ok(None)) => {
                    if shutdown.is_triggered() {
                        return Ok(());
                    }
                    return Err(eyre!("{} feed ended unexpectedly", self.name));
                }
            }
        }
    }
}

/// Subscription-mode driver
pub struct SubscriptionWatcher<F, H> {
    name: &'static str,
    feed: F,
    handler: H,
    cursor: Cursor,
    recv_timeout: Duration,
    retry: RetryConfig,
}

impl<F, H> SubscriptionWatcher<F, H>
where
    F: Feed,
    H: Handler<F::Event>,
{
    pub fn new(name: &'static str, feed: F, handler: H, cursor: Cursor, recv_timeout: Duration) -> Self {
        Self {
            name,
            feed,
            handler,
            cursor: cursor.with_mode(Mode::Subscription),
            recv_timeout,
            retry: RetryConfig::default(),
        }
    }

    /// Backoff used when the handler reports a transient failure.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Receive until cancelled or the feed fails.
    ///
    /// Returns the cursor reached so a restarted watcher can resume from it.
    pub async fn run(mut self, shutdown: Shutdown) -> Result<Cursor> {
        info!(
            watcher = self.name,
            recv_timeout_ms = self.recv_timeout.as_millis() as u64,
            "Subscription watcher started"
        );

        let result = self.receive_loop(&shutdown).await;
        self.feed.close().await;

        match result {
            Ok(()) => {
                info!(watcher = self.name, next = self.cursor.next_height(), "Subscription watcher stopped");
                Ok(self.cursor)
            }
            Err(e) => {
                error!(watcher = self.name, error = %e, "Subscription watcher failed");
                Err(e)
            }
        }
    }

    async fn receive_loop(&mut self, shutdown: &Shutdown) -> Result<()> {
        loop {
            if shutdown.is_triggered() {
                return Ok(());
            }

            let received = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                r = tokio::time::timeout(self.recv_timeout, self.feed.next()) => r,
            };

            let delivery = match received {
                Err(_) | Ok(Err(FeedError::Timeout)) => {
                    debug!(watcher = self.name, "No events within receive timeout");
                    continue;
                }
                Ok(Err(e)) => return Err(eyre!("{} feed failed: {}", self.name, e)),
                Ok(Ok(None)) => {
                    if shutdown.is_triggered() {
                        return Ok(());
                    }
                    return Err(eyre!("{} feed ended unexpectedly", self.name));
                }
                Ok(Ok(Some(delivery))) => delivery,
            };

            let observed = match delivery {
                Ok(observed) => observed,
                Err(undecoded) => {
                    warn!(
                        watcher = self.name,
                        height = undecoded.height,
                        error = %undecoded.error,
                        "Skipping undecodable event"
                    );
                    continue;
                }
            };

            if !self.dispatch(&observed, shutdown).await? {
                return Ok(());
            }
            self.cursor.settle(observed.height);
        }
    }

    /// Hand one event to the handler, retrying transient failures.
    /// Returns `false` if cancelled while backing off.
    async fn dispatch(&mut self, observed: &Observed<F::Event>, shutdown: &Shutdown) -> Result<bool> {
        let mut attempt = 0;
        loop {
            let result = match self.handler.handle(observed).await {
                // Later events may still share this height.
                Ok(()) => self.handler.on_batch_end(observed.height.saturating_sub(1)).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => return Ok(true),
                Err(e) if e.is_settled() => {
                    warn!(
                        watcher = self.name,
                        height = observed.height,
                        id = %hex::encode(observed.id),
                        error = %e,
                        "Event rejected, continuing"
                    );
                    return Ok(true);
                }
                Err(HandlerError::Fatal(e)) => return Err(e),
                Err(e) => {
                    if !self.retry.should_retry(attempt) {
                        return Err(eyre!(
                            "{}: giving up on event at height {} after {} attempts: {}",
                            self.name,
                            observed.height,
                            attempt + 1,
                            e
                        ));
                    }
                    let backoff = self.retry.backoff_for_attempt(attempt);
                    warn!(
                        watcher = self.name,
                        height = observed.height,
                        attempt,
                        ?backoff,
                        error = %e,
                        "Transient handler failure, retrying"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(false),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_from_url() {
        assert_eq!(Mode::from_url("wss://base.example/ws"), Mode::Subscription);
        assert_eq!(Mode::from_url("WS://localhost:8546"), Mode::Subscription);
        assert_eq!(Mode::from_url("https://base.example"), Mode::Polling);
        assert_eq!(Mode::from_url("http://localhost:8899"), Mode::Polling);
        assert_eq!(Mode::from_url("localhost"), Mode::Polling);
    }

    #[test]
    fn test_cursor_never_moves_backwards() {
        let mut cursor = Cursor::new(10, Mode::Polling);
        assert_eq!(cursor.next_height(), 10);
        assert_eq!(cursor.last_processed(), None);

        cursor.settle(15);
        assert_eq!(cursor.next_height(), 16);
        cursor.settle(12);
        assert_eq!(cursor.next_height(), 16);
        assert_eq!(cursor.mode(), Mode::Polling);
    }
}
