//! Retry of transient storage failures

use crate::config::StorageRetryPolicy;
use crate::storage::StorageError;
use std::future::Future;
use tracing::warn;

/// Run `call` until it succeeds, fails non-transiently, or attempts run out
///
/// Version conflicts and rejections are returned immediately.
pub(crate) async fn with_storage_retry<T, F, Fut>(
    policy: &StorageRetryPolicy,
    operation: &'static str,
    mut call: F,
) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Err(err) if err.is_transient() && attempt < policy.attempts => {
                warn!(operation, attempt, error = %err, "transient storage error, retrying");
                tokio::time::sleep(policy.backoff(attempt)).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}
