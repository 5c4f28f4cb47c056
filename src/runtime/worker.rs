use std::future::Future;

use tracing::*;

use super::queue::WorkQueue;
use crate::{Metrics, Result};

/// Consecutive failures after which a key is dropped until something else enqueues it
pub const MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Synced,
    Requeued,
    Dropped,
}

/// Drain `queue`, calling `sync` for every key until the queue shuts down.
///
/// A key that is being synced is never handed to another worker; a sync that is in progress when
/// the queue shuts down runs to completion.
pub async fn run_worker<F, Fut>(queue: WorkQueue, max_retries: u32, metrics: Metrics, sync: F)
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    while let Some(key) = queue.get().await {
        let result = sync(key.clone()).await;
        match handle_result(&queue, &key, result, max_retries) {
            Outcome::Synced => {}
            Outcome::Requeued => metrics.requeues.inc(),
            Outcome::Dropped => metrics.dropped_keys.inc(),
        }
        queue.done(&key);
    }
    debug!("Work queue shut down, stopping worker");
}

/// Decide what happens to a key after a sync attempt
pub fn handle_result(queue: &WorkQueue, key: &str, result: Result<()>, max_retries: u32) -> Outcome {
    let Err(err) = result else {
        queue.forget(key);
        return Outcome::Synced;
    };

    let retries = queue.num_requeues(key);
    if retries < max_retries {
        info!("Error syncing {key}, retry {} of {max_retries}: {err}", retries + 1);
        queue.add_rate_limited(key);
        return Outcome::Requeued;
    }

    queue.forget(key);
    error!("Dropping {key} out of the queue after {retries} retries: {err}");
    Outcome::Dropped
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use kube::core::ErrorResponse;
    use tokio::time::Instant;

    use super::*;
    use crate::runtime::queue::RateLimit;
    use crate::Error;

    fn failing_worker(
        queue: &WorkQueue,
        attempts: &Arc<Mutex<Vec<Instant>>>,
    ) -> tokio::task::JoinHandle<()> {
        let queue = queue.clone();
        let attempts = attempts.clone();
        tokio::spawn(run_worker(
            queue,
            MAX_RETRIES,
            Metrics::default(),
            move |_key| {
                let attempts = attempts.clone();
                async move {
                    attempts.lock().unwrap().push(Instant::now());
                    Err(Error::KubeError(kube::Error::Api(ErrorResponse {
                        status: "Failure".into(),
                        message: "the server is currently unable to handle the request".into(),
                        reason: "ServiceUnavailable".into(),
                        code: 503,
                    })))
                }
            },
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn failing_sync_is_retried_up_to_the_cap_with_growing_backoff() {
        let queue = WorkQueue::new(RateLimit {
            base: Duration::from_millis(10),
            max: Duration::from_secs(60),
        });
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let worker = failing_worker(&queue, &attempts);

        queue.add("default/foo");
        tokio::time::sleep(Duration::from_secs(30)).await;

        let attempts = attempts.lock().unwrap().clone();
        assert_eq!(attempts.len(), MAX_RETRIES as usize + 1);
        let gaps: Vec<_> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(
            gaps.windows(2).all(|g| g[1] > g[0]),
            "backoff should grow: {gaps:?}"
        );
        assert_eq!(queue.num_requeues("default/foo"), 0, "dropped keys are forgotten");
        assert!(queue.is_empty());

        queue.shut_down();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_key_is_retried_again_on_a_new_event() {
        let queue = WorkQueue::new(RateLimit {
            base: Duration::from_millis(10),
            max: Duration::from_secs(60),
        });
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let worker = failing_worker(&queue, &attempts);

        queue.add("default/foo");
        tokio::time::sleep(Duration::from_secs(30)).await;
        queue.add("default/foo");
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(attempts.lock().unwrap().len(), 2 * (MAX_RETRIES as usize + 1));
        queue.shut_down();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn success_resets_backoff() {
        let queue = WorkQueue::default();
        queue.add_rate_limited("default/foo");
        queue.add_rate_limited("default/foo");
        assert_eq!(queue.num_requeues("default/foo"), 2);

        let outcome = handle_result(&queue, "default/foo", Ok(()), MAX_RETRIES);
        assert_eq!(outcome, Outcome::Synced);
        assert_eq!(queue.num_requeues("default/foo"), 0);
    }

    #[tokio::test]
    async fn in_flight_sync_completes_on_shutdown() {
        let queue = WorkQueue::default();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let finished = Arc::new(Mutex::new(false));

        let worker = {
            let finished = finished.clone();
            let started_tx = Mutex::new(Some(started_tx));
            let release_rx = Mutex::new(Some(release_rx));
            tokio::spawn(run_worker(
                queue.clone(),
                MAX_RETRIES,
                Metrics::default(),
                move |_key| {
                    let started_tx = started_tx.lock().unwrap().take();
                    let release_rx = release_rx.lock().unwrap().take();
                    let finished = finished.clone();
                    async move {
                        if let Some(tx) = started_tx {
                            let _ = tx.send(());
                        }
                        if let Some(rx) = release_rx {
                            let _ = rx.await;
                        }
                        *finished.lock().unwrap() = true;
                        Ok(())
                    }
                },
            ))
        };

        queue.add("default/foo");
        started_rx.await.unwrap();
        queue.shut_down();
        release_tx.send(()).unwrap();
        worker.await.unwrap();

        assert!(*finished.lock().unwrap());
    }
}
