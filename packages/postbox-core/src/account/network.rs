//! Network collaborator of the account state manager.
//!
//! Requests are made through [`retry_request`], which keeps retrying with
//! exponential backoff. The state machine above it never sees a transient
//! failure.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use super::types::{AccountSyncState, Difference, StateResetSnapshot};
use crate::error::Result;

/// Server requests the synchronization layer needs.
///
/// Implementations report transient failures as [`Error::NetworkError`];
/// every call is retried until it succeeds.
///
/// [`Error::NetworkError`]: crate::error::Error::NetworkError
#[async_trait]
pub trait AccountNetwork: Send + Sync + 'static {
    /// Everything that changed since `state`
    async fn get_difference(&self, state: AccountSyncState) -> Result<Difference>;

    /// Current server cursor
    async fn get_state(&self) -> Result<AccountSyncState>;

    /// Dialog snapshot used to rebuild local state after a too-long gap
    async fn fetch_state_reset(&self) -> Result<StateResetSnapshot>;

    /// Cheap round trip; its completion proves earlier pushes were delivered
    async fn ping(&self) -> Result<()>;
}

/// Exponential backoff bounds for [`retry_request`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    /// Delay after the first failure
    pub initial: Duration,
    /// Upper bound for the delay
    pub max: Duration,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(200),
            max: Duration::from_secs(5),
        }
    }
}

/// Run `request` until it succeeds, doubling the delay after each failure
pub async fn retry_request<T, F, Fut>(backoff: RetryBackoff, mut request: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = backoff.initial;
    loop {
        match request().await {
            Ok(value) => return value,
            Err(e) => {
                tracing::warn!("Request failed, retrying in {:?}: {}", delay, e);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(backoff.max);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_retry_backs_off_until_success() {
        let attempts = AtomicUsize::new(0);
        let started = Instant::now();

        let value = retry_request(RetryBackoff::default(), || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(Error::NetworkError("unreachable".into()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(value, 3);
        // 200 + 400 + 800 ms
        assert_eq!(started.elapsed(), Duration::from_millis(1400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_delay_is_capped() {
        let attempts = AtomicUsize::new(0);
        let started = Instant::now();
        let backoff = RetryBackoff {
            initial: Duration::from_secs(4),
            max: Duration::from_secs(5),
        };

        retry_request(backoff, || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(Error::NetworkError("ping".into()))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert_eq!(started.elapsed(), Duration::from_secs(9));
    }
}
