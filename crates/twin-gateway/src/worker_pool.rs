//! Worker pools for device work.
//!
//! [`ShardedPool`] is a fixed array of single-worker queues: tasks submitted
//! with the same key always land on the same worker and run one after another
//! in submission order, different keys spread across workers and run in
//! parallel. [`BoundedPool`] runs every task on its own tokio task, capped by
//! a number of tasks in flight, for work that may wait on other work.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, trace};

use crate::backend::BoxFuture;
use crate::error::{GatewayError, GatewayResult};

/// Default number of workers.
pub const DEFAULT_WORKERS: usize = 16;
/// Default queue depth per worker.
pub const DEFAULT_QUEUE_SIZE: usize = 1024;
/// Default number of requests handled at once.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 1024;

type Task = BoxFuture<'static, ()>;

/// Hash-routed pool of ordered workers.
#[derive(Debug)]
pub struct ShardedPool {
    name: &'static str,
    shards: Vec<mpsc::Sender<Task>>,
}

impl ShardedPool {
    /// Spawn `workers` workers, each with a queue of `queue_size` tasks.
    ///
    /// Must be called inside a tokio runtime. Workers exit once the pool is
    /// dropped and their queue is drained.
    #[must_use]
    pub fn new(name: &'static str, workers: usize, queue_size: usize) -> Self {
        let shards = (0..workers.max(1))
            .map(|index| {
                let (tx, mut rx) = mpsc::channel::<Task>(queue_size.max(1));
                tokio::spawn(async move {
                    while let Some(task) = rx.recv().await {
                        task.await;
                    }
                    trace!(pool = name, worker = index, "worker stopped");
                });
                tx
            })
            .collect();
        debug!(pool = name, workers, "worker pool started");
        Self { name, shards }
    }

    /// Number of workers.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.shards.len()
    }

    /// Worker index serving `key`.
    #[must_use]
    pub fn shard_of<K: Hash + ?Sized>(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let len = self.shards.len() as u64;
        usize::try_from(hasher.finish() % len).unwrap_or_default()
    }

    /// Queue `task` on the worker serving `key`.
    ///
    /// # Errors
    ///
    /// Returns `ServiceUnavailable` when the worker's queue is full or the
    /// worker is gone; the task is dropped.
    pub fn submit<K, F>(&self, key: &K, task: F) -> GatewayResult<()>
    where
        K: Hash + ?Sized,
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let shard = self.shard_of(key);
        self.shards[shard]
            .try_send(Box::pin(task))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => GatewayError::ServiceUnavailable(format!(
                    "{} worker {shard} queue is full",
                    self.name
                )),
                mpsc::error::TrySendError::Closed(_) => GatewayError::ServiceUnavailable(format!(
                    "{} worker {shard} stopped",
                    self.name
                )),
            })
    }
}

/// Unordered pool capped by the number of tasks in flight.
#[derive(Debug)]
pub struct BoundedPool {
    name: &'static str,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl BoundedPool {
    /// Allow up to `capacity` tasks at once.
    #[must_use]
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        debug!(pool = name, capacity, "bounded pool started");
        Self {
            name,
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Maximum number of tasks in flight.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of tasks currently running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    /// Spawn `task` unless the pool is at capacity. Must be called inside a
    /// tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `ServiceUnavailable` when `capacity` tasks are already running;
    /// the task is dropped.
    pub fn submit<F>(&self, task: F) -> GatewayResult<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .try_acquire_owned()
            .map_err(|_| {
                GatewayError::ServiceUnavailable(format!(
                    "{} pool is at capacity ({})",
                    self.name, self.capacity
                ))
            })?;
        tokio::spawn(async move {
            task.await;
            drop(permit);
        });
        Ok(())
    }
}
