//! Batch throttle - keeps the long-run send rate under a ceiling

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Paces fixed-size batches so that `batch_size` messages take at least
/// `batch_size / messages_per_second` seconds
#[derive(Debug, Clone, Copy)]
pub struct BatchThrottle {
    batch_size: usize,
    interval: Duration,
}

impl BatchThrottle {
    pub fn new(batch_size: usize, messages_per_second: f64) -> Self {
        let batch_size = batch_size.max(1);
        let interval = if messages_per_second.is_finite() && messages_per_second > 0.0 {
            Duration::from_secs_f64(batch_size as f64 / messages_per_second)
        } else {
            Duration::ZERO
        };
        Self {
            batch_size,
            interval,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Minimum wall-clock time per batch
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Pause still owed after a batch that took `elapsed`
    pub fn pause_after(&self, elapsed: Duration) -> Duration {
        self.interval.saturating_sub(elapsed)
    }

    /// Sleep out the rest of the batch window that began at `started`.
    ///
    /// Returns false if `cancel` fired before the window closed.
    pub async fn wait(&self, started: Instant, cancel: &CancellationToken) -> bool {
        let pause = self.pause_after(started.elapsed());
        if pause.is_zero() {
            return !cancel.is_cancelled();
        }

        debug!(pause_ms = pause.as_millis() as u64, "Throttling before next batch");
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(pause) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_interval_from_rate() {
        assert_eq!(BatchThrottle::new(10, 1.0).interval(), Duration::from_secs(10));
        assert_eq!(BatchThrottle::new(10, 20.0).interval(), Duration::from_millis(500));
        assert_eq!(BatchThrottle::new(0, 1.0).batch_size(), 1);
    }

    #[test]
    fn test_pause_never_negative() {
        let throttle = BatchThrottle::new(10, 1.0);
        assert_eq!(
            throttle.pause_after(Duration::from_secs(3)),
            Duration::from_secs(7)
        );
        assert_eq!(throttle.pause_after(Duration::from_secs(12)), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_sleeps_remaining_window() {
        let throttle = BatchThrottle::new(5, 1.0);
        let started = Instant::now();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(throttle.wait(started, &CancellationToken::new()).await);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5));
        assert!(elapsed < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_cut_short_by_cancel() {
        let throttle = BatchThrottle::new(10, 1.0);
        let cancel = CancellationToken::new();
        let started = Instant::now();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        assert!(!throttle.wait(started, &cancel).await);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
