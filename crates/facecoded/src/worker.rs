use facecode_core::Extractor;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("extraction task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("worker pool closed")]
    Closed,
}

/// Clone-safe handle that runs extraction jobs on the blocking pool.
///
/// At most `max_concurrent` jobs hold a permit at once; the permit lives as
/// long as the blocking task, so an abandoned job still counts until it ends.
#[derive(Clone)]
pub struct WorkerPool {
    extractor: Arc<Extractor>,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl WorkerPool {
    pub fn new(extractor: Arc<Extractor>, max_concurrent: usize, timeout: Duration) -> Self {
        Self {
            extractor,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            timeout,
        }
    }

    /// Run `job` against the shared extractor, bounded by the request timeout
    /// (time spent waiting for a permit included).
    pub async fn run<T, F>(&self, job: F) -> Result<T, WorkerError>
    where
        F: FnOnce(&Extractor) -> T + Send + 'static,
        T: Send + 'static,
    {
        let extractor = Arc::clone(&self.extractor);
        let permits = Arc::clone(&self.permits);

        let work = async move {
            let permit = permits.acquire_owned().await.map_err(|_| WorkerError::Closed)?;
            let output = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                job(&extractor)
            })
            .await?;
            Ok(output)
        };

        tokio::time::timeout(self.timeout, work)
            .await
            .map_err(|_| WorkerError::Timeout(self.timeout))?
    }
}
