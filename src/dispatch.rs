use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use log::warn;
use tokio::sync::Semaphore;

use crate::models::MAX_WORKERS;

/// Live and peak worker counts, so the concurrency ceiling is observable
/// instead of assumed.
#[derive(Debug, Default)]
pub struct DispatchGauge {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl DispatchGauge {
    pub fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    pub fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Run `task` over every item with at most `limit` workers in flight.
///
/// Each worker returns its own result; `join_all` preserves spawn order, so
/// the output lines up with the input. Workers that panic are logged and
/// skipped rather than poisoning the batch.
pub async fn fan_out<I, T, F, Fut>(
    limit: usize,
    gauge: Arc<DispatchGauge>,
    items: Vec<I>,
    task: F,
) -> Vec<T>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    let limit = limit.clamp(1, MAX_WORKERS);
    let semaphore = Arc::new(Semaphore::new(limit));
    let task = Arc::new(task);

    let mut handles = Vec::with_capacity(items.len());
    for item in items {
        let semaphore = Arc::clone(&semaphore);
        let gauge = Arc::clone(&gauge);
        let task = Arc::clone(&task);
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            gauge.enter();
            let out = task(item).await;
            gauge.exit();
            out
        }));
    }

    let mut results = Vec::with_capacity(handles.len());
    for joined in join_all(handles).await {
        match joined {
            Ok(value) => results.push(value),
            Err(e) => warn!("[Dispatch] Worker failed to join: {}", e),
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrency_never_exceeds_limit() {
        let gauge = Arc::new(DispatchGauge::default());
        let observer = Arc::clone(&gauge);
        let items: Vec<u32> = (0..50).collect();

        let results = fan_out(4, Arc::clone(&gauge), items, move |n| {
            let observer = Arc::clone(&observer);
            async move {
                assert!(observer.active() <= 4, "ceiling breached");
                tokio::time::sleep(Duration::from_millis(10)).await;
                n * 2
            }
        })
        .await;

        assert_eq!(results.len(), 50);
        assert!(gauge.peak() <= 4);
        assert!(gauge.peak() >= 2, "expected some overlap, got {}", gauge.peak());
    }

    #[tokio::test]
    async fn test_results_follow_input_order() {
        let gauge = Arc::new(DispatchGauge::default());
        let items: Vec<u32> = (0..20).collect();
        let results = fan_out(8, gauge, items, |n| async move { n + 100 }).await;
        let expected: Vec<u32> = (100..120).collect();
        assert_eq!(results, expected);
    }

    #[tokio::test]
    async fn test_zero_limit_clamps_to_serial() {
        let gauge = Arc::new(DispatchGauge::default());
        let items: Vec<u32> = (0..10).collect();
        let results = fan_out(0, Arc::clone(&gauge), items, |n| async move { n }).await;
        assert_eq!(results.len(), 10);
        assert_eq!(gauge.peak(), 1);
    }
}
