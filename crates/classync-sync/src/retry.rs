use std::future::Future;

use classync_storage::BackoffPolicy;
use tracing::warn;

use crate::SyncError;

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's retries are used up. `op` receives the zero-based attempt index.
pub async fn run_with_retry<T, F, Fut>(policy: BackoffPolicy, mut op: F) -> Result<T, SyncError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(attempt, ?delay, %error, "sync attempt failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}
