//! Runs every watcher concurrently and owns process shutdown.
//!
//! The first worker to fail (or to return while no shutdown was requested)
//! triggers the shared [`Shutdown`]; every other worker observes it, closes
//! its own connection and returns. `run` only returns once all workers have
//! exited.

use std::future::Future;
use std::time::Duration;

use eyre::{eyre, Result};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::shutdown::Shutdown;

/// Default time workers get to stop after cancellation
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub struct Supervisor {
    shutdown: Shutdown,
    workers: JoinSet<(&'static str, Result<()>)>,
    grace: Duration,
}

impl Supervisor {
    pub fn new(shutdown: Shutdown) -> Self {
        Self {
            shutdown,
            workers: JoinSet::new(),
            grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// How long to wait for workers after cancellation before aborting them.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn shutdown(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Start a worker. It must return once the shared shutdown fires.
    pub fn spawn<F>(&mut self, name: &'static str, worker: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        info!(worker = name, "Starting worker");
        self.workers.spawn(async move { (name, worker.await) });
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Wait for every worker. Returns the first failure, if any.
    pub async fn run(mut self) -> Result<()> {
        let mut first_failure: Option<eyre::Report> = None;

        // Phase one: wait for cancellation or the first worker to stop.
        while !self.shutdown.is_triggered() {
            let joined = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                joined = self.workers.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };
            if let Some(failure) = self.record(joined) {
                first_failure.get_or_insert(failure);
                self.shutdown.trigger();
            }
        }

        // Phase two: every worker observes cancellation and exits.
        if !self.workers.is_empty() {
            info!(remaining = self.workers.len(), "Waiting for workers to stop");
        }
        let deadline = tokio::time::Instant::now() + self.grace;
        loop {
            let joined = match tokio::time::timeout_at(deadline, self.workers.join_next()).await {
                Ok(Some(joined)) => joined,
                Ok(None) => break,
                Err(_) => {
                    warn!(remaining = self.workers.len(), "Workers did not stop in time, aborting");
                    self.workers.abort_all();
                    while self.workers.join_next().await.is_some() {}
                    break;
                }
            };
            if let Some(failure) = self.record(joined) {
                first_failure.get_or_insert(failure);
            }
        }

        match first_failure {
            Some(e) => Err(e),
            None => {
                info!("All workers stopped");
                Ok(())
            }
        }
    }

    /// Log a finished worker. Returns the failure it represents, if any.
    fn record(
        &self,
        joined: std::result::Result<(&'static str, Result<()>), tokio::task::JoinError>,
    ) -> Option<eyre::Report> {
        match joined {
            Ok((name, Ok(()))) if self.shutdown.is_triggered() => {
                info!(worker = name, "Worker stopped");
                None
            }
            Ok((name, Ok(()))) => {
                error!(worker = name, "Worker exited unexpectedly without error");
                Some(eyre!("worker {} exited unexpectedly", name))
            }
            Ok((name, Err(e))) => {
                error!(worker = name, error = ?e, "Worker failed");
                Some(e.wrap_err(format!("worker {} failed", name)))
            }
            Err(e) => {
                error!(error = %e, "Worker task panicked");
                Some(eyre!("worker task panicked: {}", e))
            }
        }
    }
}
