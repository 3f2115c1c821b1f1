//! Per-call cancellation and deadline.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{KindexError, KindexResult};

/// Caller-supplied cancellation context. Cloning shares the token.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: CancellationToken) -> Self {
        Self { token, deadline: None }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }

    /// Race `fut` against cancellation and the deadline. The losing future is
    /// dropped, which aborts any in-flight request it owns.
    pub async fn run<T, F>(&self, operation: &str, fut: F) -> KindexResult<T>
    where
        F: Future<Output = KindexResult<T>>,
    {
        if self.token.is_cancelled() {
            return Err(cancelled(operation, "cancelled before start"));
        }
        let deadline = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(cancelled(operation, "cancelled by caller")),
            _ = deadline => Err(cancelled(operation, "deadline exceeded")),
            res = fut => res,
        }
    }
}

fn cancelled(operation: &str, reason: &str) -> KindexError {
    KindexError::Cancelled { operation: operation.to_string(), reason: reason.to_string() }
}
