//! Fixed-interval polling shared by every wait in the workspace.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ClusterError, Result};

/// Terminal state of a [`poll_until`] loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The predicate returned `true` before the deadline.
    Satisfied,
    /// The deadline elapsed first.
    TimedOut {
        /// The most recent retryable error raised by the check, if any.
        last_error: Option<String>,
    },
}

impl PollOutcome {
    /// Whether the condition was met.
    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::Satisfied)
    }

    /// The last retryable error seen before the deadline.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        match self {
            Self::TimedOut { last_error } => last_error.as_deref(),
            Self::Satisfied => None,
        }
    }

    /// `message` followed by the last error, when there was one.
    #[must_use]
    pub fn annotate(&self, message: impl Into<String>) -> String {
        let message = message.into();
        match self.last_error() {
            Some(e) => format!("{message} (last error: {e})"),
            None => message,
        }
    }

    /// A [`ClusterError::Timeout`] for this wait carrying the last error.
    #[must_use]
    pub fn into_timeout(self, what: impl Into<String>, after: Duration) -> ClusterError {
        let last_error = match self {
            Self::TimedOut { last_error } => last_error,
            Self::Satisfied => None,
        };
        ClusterError::Timeout {
            what: what.into(),
            after,
            last_error,
        }
    }
}

/// Interval and deadline for one wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSpec {
    /// Delay between two checks.
    pub interval: Duration,
    /// Hard upper bound on the whole wait.
    pub timeout: Duration,
}

impl PollSpec {
    /// Create a poll specification.
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Evaluate `check` immediately and then every `interval` until it returns
/// `true`, `timeout` elapses, or `cancel` fires.
///
/// The deadline is enforced on both the sleeps and the in-flight check, so a
/// slow check can never extend the wait. Transient errors from `check` (see
/// [`ClusterError::is_transient`]) are logged and retried, and the last one is
/// reported in [`PollOutcome::TimedOut`]. Any other error ends the loop.
///
/// # Errors
///
/// Returns `Cancelled` when the token fires, or the first non-transient
/// error produced by `check`.
pub async fn poll_until<F, Fut>(
    interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<PollOutcome>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + timeout;
    let mut last_error: Option<String> = None;

    loop {
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ClusterError::Cancelled),
            r = check() => r,
            () = sleep_until(deadline) => return Ok(PollOutcome::TimedOut { last_error }),
        };

        match result {
            Ok(true) => return Ok(PollOutcome::Satisfied),
            Ok(false) => {}
            Err(e) if e.is_transient() => {
                debug!(error = %e, "Poll check failed, retrying");
                last_error = Some(e.to_string());
            }
            Err(e) => return Err(e),
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(PollOutcome::TimedOut { last_error });
        }
        let nap = interval.min(deadline - now);

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ClusterError::Cancelled),
            () = sleep(nap) => {}
        }
    }
}

/// [`poll_until`] driven by a [`PollSpec`].
///
/// # Errors
///
/// See [`poll_until`].
pub async fn poll_with<F, Fut>(
    spec: PollSpec,
    cancel: &CancellationToken,
    check: F,
) -> Result<PollOutcome>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    poll_until(spec.interval, spec.timeout, cancel, check).await
}
