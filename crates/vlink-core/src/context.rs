//! Cancellation and deadlines for blocking operations.
//!
//! Every blocking step in the core (scan, connect, health probe, the sleep
//! between retries) takes an [`OpContext`] and returns the context's error as
//! soon as it is cancelled or its deadline passes.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{LinkError, Result};

/// Cancellation token plus optional deadline carried through an operation.
///
/// Contexts form a tree: [`with_timeout`](Self::with_timeout) derives a child
/// that is cancelled together with its parent and never outlives the parent's
/// deadline.
#[derive(Debug, Clone)]
pub struct OpContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for OpContext {
    fn default() -> Self {
        Self::background()
    }
}

impl OpContext {
    /// A root context that is never cancelled and has no deadline.
    #[must_use]
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A root context that expires after `timeout`.
    #[must_use]
    pub fn with_deadline_in(timeout: Duration) -> Self {
        Self::background().with_timeout(timeout)
    }

    /// Derives a child context whose deadline is at most `timeout` from now.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) if parent < candidate => parent,
            _ => candidate,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Derives a child context that can be cancelled independently.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Cancels this context and all contexts derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The instant after which this context reports a timeout.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, if there is one.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Returns the context's error if it is done, `None` while it is live.
    ///
    /// Cancellation takes precedence over an expired deadline.
    #[must_use]
    pub fn err(&self) -> Option<LinkError> {
        if self.token.is_cancelled() {
            return Some(LinkError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(LinkError::OperationTimeout),
            _ => None,
        }
    }

    /// Fails with the context's error if it is done.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Cancelled`] or [`LinkError::OperationTimeout`].
    pub fn check(&self) -> Result<()> {
        self.err().map_or(Ok(()), Err)
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> LinkError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    () = self.token.cancelled() => LinkError::Cancelled,
                    () = tokio::time::sleep_until(deadline) => LinkError::OperationTimeout,
                }
            }
            None => {
                self.token.cancelled().await;
                LinkError::Cancelled
            }
        }
    }

    /// Sleeps for `duration` unless the context finishes first.
    ///
    /// # Errors
    ///
    /// Returns the context's error if it is cancelled or times out during the
    /// wait.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.check()?;
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Runs `future` to completion unless the context finishes first.
    ///
    /// # Errors
    ///
    /// Returns the future's own error, or the context's error if the context
    /// is done before the future resolves.
    pub async fn run<T, F>(&self, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            result = future => result,
        }
    }
}
