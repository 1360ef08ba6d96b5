use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;

/// Fixed-size pool of fetch tasks.
///
/// `spawn` waits for a free slot before starting the task, which is what
/// pushes back on the job producer when every worker is busy.
#[derive(Debug, Clone)]
pub struct FetchPool {
    semaphore: Arc<Semaphore>,
    size: u32,
}

impl FetchPool {
    pub fn new(size: usize) -> Self {
        let size = u32::try_from(size.max(1)).unwrap_or(u32::MAX);
        Self {
            semaphore: Arc::new(Semaphore::new(size as usize)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size as usize
    }

    pub async fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
            return;
        };
        tokio::spawn(async move {
            let _permit = permit;
            fut.await;
        });
    }

    /// Waits until every spawned task has finished.
    pub async fn drain(&self) {
        if let Ok(permits) = self.semaphore.acquire_many(self.size).await {
            drop(permits);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::FetchPool;

    #[tokio::test]
    async fn never_runs_more_than_pool_size() {
        let pool = FetchPool::new(3);
        let running = std::sync::Arc::new(AtomicUsize::new(0));
        let peak = std::sync::Arc::new(AtomicUsize::new(0));

        for _ in 0..12 {
            let running = std::sync::Arc::clone(&running);
            let peak = std::sync::Arc::clone(&peak);
            pool.spawn(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            })
            .await;
        }
        pool.drain().await;

        assert_eq!(running.load(Ordering::SeqCst), 0);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn zero_size_is_clamped_to_one() {
        assert_eq!(FetchPool::new(0).size(), 1);
    }
}
