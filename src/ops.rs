use std::fmt::Display;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream;

/// Runs a set of operations concurrently, with a limit on the maximum
/// number running at any one time. Results come back in input order.
pub async fn run_bounded<T>(
    operations: impl IntoIterator<Item = impl Future<Output = T>>,
    max_simultaneous: usize,
) -> Vec<T> {
    stream::iter(operations)
        .buffered(max_simultaneous)
        .collect()
        .await
}

/// Runs an operation, retrying it exactly once after a fixed delay if
/// it fails. Used for transient infrastructure failures, e.g. a backing
/// store that is not provisioned yet; a second failure propagates.
pub async fn retry_once<T, E, Fut>(
    mut operation: impl FnMut() -> Fut,
    delay: Duration,
) -> Result<T, E>
where
    E: Display,
    Fut: Future<Output = Result<T, E>>,
{
    match operation().await {
        Ok(value) => Ok(value),
        Err(e) => {
            log::warn!("Operation failed, retrying once in {delay:?}: {e}");
            tokio::time::sleep(delay).await;
            operation().await
        }
    }
}
