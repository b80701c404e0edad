use crate::PromoteError;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Bounded pool for blocking transfer jobs.
///
/// At most `workers` jobs run at once and at most `workers + queue` are in
/// flight; a submission beyond that is rejected with
/// [`PromoteError::PoolOverloaded`] instead of waiting.
#[derive(Debug, Clone)]
pub struct TransferPool {
    workers: Arc<Semaphore>,
    admission: Arc<Semaphore>,
    capacity: usize,
}

impl TransferPool {
    pub fn new(workers: usize, queue: usize) -> Self {
        let workers = workers.max(1);
        let capacity = workers + queue;
        Self {
            workers: Arc::new(Semaphore::new(workers)),
            admission: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// A fresh completion service submitting into this pool.
    pub fn completion<T: Send + 'static>(&self) -> Completion<T> {
        Completion {
            pool: self.clone(),
            jobs: JoinSet::new(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.admission.available_permits()
    }
}

/// Submit-many, collect-as-ready handle over a [`TransferPool`].
pub struct Completion<T> {
    pool: TransferPool,
    jobs: JoinSet<Result<T, PromoteError>>,
}

impl<T: Send + 'static> Completion<T> {
    pub fn submit<F>(&mut self, job: F) -> Result<(), PromoteError>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let admitted = Arc::clone(&self.pool.admission)
            .try_acquire_owned()
            .map_err(|_| PromoteError::PoolOverloaded {
                capacity: self.pool.capacity,
            })?;
        let workers = Arc::clone(&self.pool.workers);
        self.jobs.spawn(async move {
            let _admitted = admitted;
            let _worker = workers
                .acquire_owned()
                .await
                .map_err(|e| PromoteError::TaskFailed(e.to_string()))?;
            tokio::task::spawn_blocking(job)
                .await
                .map_err(|e| PromoteError::TaskFailed(e.to_string()))
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Wait for every submitted job, in completion order.
    pub async fn drain(mut self) -> Vec<Result<T, PromoteError>> {
        let mut out = Vec::with_capacity(self.jobs.len());
        while let Some(joined) = self.jobs.join_next().await {
            out.push(joined.unwrap_or_else(|e| Err(PromoteError::TaskFailed(e.to_string()))));
        }
        out
    }
}
