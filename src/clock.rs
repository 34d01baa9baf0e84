//! Wall-clock abstraction for media pacing
//!
//! Every timed operation in the crate goes through [`FrameClock`] so tests
//! can run against tokio's virtual time (`start_paused`) without touching
//! the components themselves.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Monotonic clock used for pacing, staggering and timeouts
#[async_trait]
pub trait FrameClock: Send + Sync {
    /// Current instant
    fn now(&self) -> Instant;

    /// Sleep for a duration
    async fn sleep(&self, duration: Duration);

    /// Sleep until a deadline
    async fn sleep_until(&self, deadline: Instant);
}

/// Clock backed by `tokio::time`
///
/// Under `#[tokio::test(start_paused = true)]` this clock is virtual.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl FrameClock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}

/// Wait for `duration`, returning `false` if cancelled first
pub async fn after(clock: &dyn FrameClock, duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = clock.sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_advances_virtual_time() {
        let clock = TokioClock;
        let before = clock.now();
        clock.sleep(Duration::from_secs(5)).await;
        assert!(clock.now() - before >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_after_completes() {
        let clock = TokioClock;
        let cancel = CancellationToken::new();
        assert!(after(&clock, Duration::from_millis(100), &cancel).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_after_cancelled() {
        let clock = TokioClock;
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!after(&clock, Duration::from_secs(60), &cancel).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_until() {
        let clock = TokioClock;
        let deadline = clock.now() + Duration::from_millis(250);
        clock.sleep_until(deadline).await;
        assert!(clock.now() >= deadline);
    }
}
