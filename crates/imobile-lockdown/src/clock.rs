//! Time source for the pairing poll.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

/// Monotonic clock and sleep.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    async fn sleep(&self, duration: Duration);
}

/// [`Clock`] backed by the tokio timer.
///
/// Under a paused test runtime this advances virtual time only.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
