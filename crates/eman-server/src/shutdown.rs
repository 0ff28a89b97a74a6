//! Coordinated stop of the HTTP listener and the broker loop.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long tasks get to stop before they are aborted.
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// A background task the server waits on at shutdown.
pub type NamedTask = (&'static str, JoinHandle<()>);

/// Which tasks stopped on their own and which had to be aborted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Tasks that returned before the deadline.
    pub finished: Vec<&'static str>,
    /// Tasks aborted at the deadline.
    pub aborted: Vec<&'static str>,
}

impl DrainReport {
    /// True when nothing had to be aborted.
    pub fn is_clean(&self) -> bool {
        self.aborted.is_empty()
    }
}

/// Owns the token every long-running task watches.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create an untriggered coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Token handed to the listener and the broker loop.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Signal every holder of the token. Idempotent.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has begun.
    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Trigger, then wait for `tasks` under one shared deadline.
    ///
    /// Tasks still running at the deadline are aborted.
    pub async fn drain(&self, tasks: Vec<NamedTask>, timeout: Option<Duration>) -> DrainReport {
        let timeout = timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT);
        let deadline = Instant::now() + timeout;
        self.trigger();
        info!(tasks = tasks.len(), ?timeout, "draining");

        let mut report = DrainReport::default();
        for (name, mut handle) in tasks {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_ok() {
                debug!(task = name, "stopped");
                report.finished.push(name);
            } else {
                warn!(task = name, "did not stop within {timeout:?}, aborting");
                handle.abort();
                report.aborted.push(name);
            }
        }
        report
    }
}
