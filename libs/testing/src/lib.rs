//! Helpers shared by the flotilla integration suites.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Poll interval used by [`wait_until`].
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Polls `check` until it returns true or `timeout` elapses.
///
/// Returns whether the condition was met.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// A suffix that is unique enough to keep parallel tests apart.
pub fn unique_suffix() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_nanos()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wait_until_met() {
        let calls = Arc::new(AtomicU32::new(0));
        let met = wait_until(Duration::from_secs(1), || {
            let calls = Arc::clone(&calls);
            async move { calls.fetch_add(1, Ordering::SeqCst) >= 2 }
        })
        .await;

        assert!(met);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_wait_until_times_out() {
        let met = wait_until(Duration::from_millis(30), || async { false }).await;
        assert!(!met);
    }
}
