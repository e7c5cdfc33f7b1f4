use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::WorkqError;
use crate::queue::{Key, RateLimitingWorkQueue};

/// Business logic for one key.
///
/// An `Err` requeues the key through the rate limiter; `Ok` forgets its
/// failure history.
#[async_trait]
pub trait Reconciler<K>: Send + Sync {
    async fn reconcile(&self, key: &K) -> Result<(), WorkqError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerOptions {
    /// Drop a key once it has been requeued this many times. `None` retries
    /// forever.
    pub max_retries: Option<usize>,
}

/// Worker group handle.
/// - ワーカーは `get` が `None` を返す（queue の shutdown）まで回り続ける
/// - `shutdown_and_join` / `drain_and_join` で全ワーカーの終了を待てる
pub struct WorkerGroup<K: Key> {
    queue: Arc<dyn RateLimitingWorkQueue<K>>,
    joins: Vec<JoinHandle<()>>,
}

impl<K: Key> WorkerGroup<K> {
    /// Spawn `n` workers on the current tokio runtime.
    pub fn spawn<Q, R>(n: usize, queue: Arc<Q>, reconciler: Arc<R>, options: WorkerOptions) -> Self
    where
        Q: RateLimitingWorkQueue<K> + 'static,
        R: Reconciler<K> + 'static,
    {
        let queue: Arc<dyn RateLimitingWorkQueue<K>> = queue;
        let reconciler: Arc<dyn Reconciler<K>> = reconciler;
        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let q = Arc::clone(&queue);
            let r = Arc::clone(&reconciler);
            joins.push(tokio::spawn(worker_loop(worker_id, q, r, options)));
        }
        debug!(workers = n, "worker group started");

        Self { queue, joins }
    }

    /// Shut the queue down and wait for every worker. Items still queued are
    /// handed out and reconciled first; failures are no longer requeued.
    pub async fn shutdown_and_join(self) -> Result<(), WorkqError> {
        self.queue.shut_down();
        join_all(self.joins).await
    }

    /// Like [`shutdown_and_join`](Self::shutdown_and_join), but waits for
    /// in-flight items to be marked done before returning.
    pub async fn drain_and_join(self) -> Result<(), WorkqError> {
        let q = Arc::clone(&self.queue);
        let drained = tokio::task::spawn_blocking(move || q.shut_down_with_drain())
            .await
            .map_err(|e| WorkqError::Join(e.to_string()));
        let joined = join_all(self.joins).await;
        drained.and(joined)
    }
}

async fn join_all(joins: Vec<JoinHandle<()>>) -> Result<(), WorkqError> {
    let mut first_err = None;
    for join in joins {
        if let Err(e) = join.await {
            error!(error = %e, "worker task failed");
            first_err.get_or_insert(WorkqError::Join(e.to_string()));
        }
    }
    first_err.map_or(Ok(()), Err)
}

async fn worker_loop<K: Key>(
    worker_id: usize,
    queue: Arc<dyn RateLimitingWorkQueue<K>>,
    reconciler: Arc<dyn Reconciler<K>>,
    options: WorkerOptions,
) {
    loop {
        // get はブロックするので blocking pool で待つ
        let q = Arc::clone(&queue);
        let key = match tokio::task::spawn_blocking(move || q.get()).await {
            Ok(Some(key)) => key,
            Ok(None) => break,
            Err(e) => {
                error!(worker_id, error = %e, "get failed");
                break;
            }
        };

        // 別タスクで実行して、panic しても done は必ず呼ぶ
        let r = Arc::clone(&reconciler);
        let k = key.clone();
        let result = match tokio::spawn(async move { r.reconcile(&k).await }).await {
            Ok(result) => result,
            Err(e) => {
                error!(worker_id, ?key, error = %e, "reconciler panicked");
                Err(WorkqError::Reconcile(e.to_string()))
            }
        };

        match result {
            Ok(()) => queue.forget(&key),
            Err(err) => {
                let requeues = queue.num_requeues(&key);
                if options.max_retries.is_some_and(|max| requeues >= max) {
                    warn!(worker_id, ?key, requeues, error = %err, "dropping key out of the queue");
                    queue.forget(&key);
                } else {
                    debug!(worker_id, ?key, requeues, error = %err, "retrying key");
                    queue.add_rate_limited(key.clone());
                }
            }
        }
        queue.done(&key);
    }
    debug!(worker_id, "worker stopped");
}
