//! Bounded fan-out with a fan-in barrier.
//!
//! Every dispatched future finishes before [`gather`] returns; progress is
//! logged while the caller waits.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Runs `f` over `items` with at most `limit` in flight.
///
/// Results come back in input order. A task that panicked leaves `None` in
/// its slot.
pub async fn gather<T, R, F, Fut>(
    items: Vec<T>,
    limit: usize,
    progress_interval: Duration,
    label: &str,
    f: F,
) -> Vec<Option<R>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = R> + Send + 'static,
{
    let total = items.len();
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut join_set = JoinSet::new();

    for (index, item) in items.into_iter().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        let fut = f(item);
        join_set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            (index, fut.await)
        });
    }

    let mut results: Vec<Option<R>> = (0..total).map(|_| None).collect();
    let mut done = 0usize;
    let mut ticker = tokio::time::interval(progress_interval.max(Duration::from_millis(10)));
    ticker.tick().await;

    loop {
        tokio::select! {
            joined = join_set.join_next() => match joined {
                Some(Ok((index, result))) => {
                    if let Some(slot) = results.get_mut(index) {
                        *slot = Some(result);
                    }
                    done += 1;
                }
                Some(Err(join_err)) => {
                    done += 1;
                    error!(?join_err, label, "fan-out task panicked");
                }
                None => break,
            },
            _ = ticker.tick() => {
                info!(label, done, total, "fan-out in progress");
            }
        }
    }

    debug!(label, total, "fan-out complete");
    results
}
