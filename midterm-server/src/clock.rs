//! Injectable time source (§6 `Clock` collaborator): `now()` for timestamps,
//! `sleep` for deadlines and backoff, both swappable in tests.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait Clock: Send + Sync + 'static {
    fn now_unix_ms(&self) -> u64;

    /// Sleep for `duration`, or return early if `token` is cancelled.
    /// Returns `true` if the sleep completed, `false` if cancelled first.
    async fn sleep(&self, duration: Duration, token: &CancellationToken) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now_unix_ms(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    async fn sleep(&self, duration: Duration, token: &CancellationToken) -> bool {
        tokio::select! {
            () = tokio::time::sleep(duration) => true,
            () = token.cancelled() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn system_clock_sleep_completes_without_cancellation() {
        let clock = SystemClock;
        let token = CancellationToken::new();
        let completed = clock.sleep(Duration::from_millis(1), &token).await;
        assert!(completed);
    }

    #[tokio::test]
    async fn system_clock_sleep_yields_to_cancellation() {
        let clock = SystemClock;
        let token = CancellationToken::new();
        token.cancel();
        let completed = clock.sleep(Duration::from_secs(30), &token).await;
        assert!(!completed);
    }

    #[test]
    fn now_unix_ms_is_plausible() {
        let clock = SystemClock;
        // Anything after 2024-01-01 in ms since epoch.
        assert!(clock.now_unix_ms() > 1_700_000_000_000);
    }
}
