use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use mio::Token;

use crate::{
    error::{NetworkError, Result},
    handler::DispatchTarget,
    net::traits::{Logger, NoOpLogger},
    worker::{PoolWorker, WorkerId},
};

pub const DEFAULT_POOL_CAPACITY: usize = 4;
pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;

pub fn get_default_capacity() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(DEFAULT_POOL_CAPACITY)
}

/// How a [`SocketPool`] picks the worker for a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerSelection {
    #[default]
    RoundRobin,
    /// Fewest attached targets; ties go to the lowest worker index.
    LeastLoaded,
}

/// Configuration for a [`SocketPool`].
#[derive(Clone)]
pub struct PoolConfig {
    /// Number of worker threads
    pub workers: usize,
    /// Capacity of each worker's event buffer
    pub events_capacity: usize,
    /// Upper bound on one multiplexer wait
    pub poll_timeout: Duration,
    pub selection: WorkerSelection,
    /// Logger for worker events
    pub logger: Arc<dyn Logger>,
}

impl PoolConfig {
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::new()
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: get_default_capacity(),
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            selection: WorkerSelection::default(),
            logger: Arc::new(NoOpLogger),
        }
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("workers", &self.workers)
            .field("events_capacity", &self.events_capacity)
            .field("poll_timeout", &self.poll_timeout)
            .field("selection", &self.selection)
            .finish()
    }
}

/// Builder for PoolConfig. Unset fields fall back to `PoolConfig::default()`.
#[derive(Default)]
pub struct PoolConfigBuilder {
    workers: Option<usize>,
    events_capacity: Option<usize>,
    poll_timeout: Option<Duration>,
    selection: Option<WorkerSelection>,
    logger: Option<Arc<dyn Logger>>,
}

impl PoolConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = Some(capacity);
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    pub fn selection(mut self, selection: WorkerSelection) -> Self {
        self.selection = Some(selection);
        self
    }

    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn build(self) -> PoolConfig {
        let default = PoolConfig::default();
        PoolConfig {
            workers: self.workers.unwrap_or(default.workers),
            events_capacity: self.events_capacity.unwrap_or(default.events_capacity),
            poll_timeout: self.poll_timeout.unwrap_or(default.poll_timeout),
            selection: self.selection.unwrap_or(default.selection),
            logger: self.logger.unwrap_or(default.logger),
        }
    }
}

/// A fixed set of [`PoolWorker`]s. Every connection is pinned to exactly one
/// of them for its whole lifetime.
pub struct SocketPool {
    workers: Vec<PoolWorker>,
    next_worker: AtomicUsize,
    selection: WorkerSelection,
}

impl SocketPool {
    pub fn new(config: PoolConfig) -> Result<Self> {
        if config.workers == 0 {
            return Err(NetworkError::Configuration(
                "a socket pool needs at least one worker".to_string(),
            ));
        }
        if config.events_capacity == 0 {
            return Err(NetworkError::Configuration(
                "events capacity must be non-zero".to_string(),
            ));
        }

        let mut workers = Vec::with_capacity(config.workers);
        for id in 0..config.workers {
            workers.push(PoolWorker::spawn(
                WorkerId(id),
                config.events_capacity,
                config.poll_timeout,
                Arc::clone(&config.logger),
            )?);
        }

        Ok(Self {
            workers,
            next_worker: AtomicUsize::new(0),
            selection: config.selection,
        })
    }

    /// Picks the worker for the next connection.
    pub fn select(&self) -> &PoolWorker {
        match self.selection {
            WorkerSelection::RoundRobin => {
                let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
                &self.workers[index]
            }
            WorkerSelection::LeastLoaded => self
                .workers
                .iter()
                .enumerate()
                .min_by_key(|(index, worker)| (worker.load(), *index))
                .map(|(_, worker)| worker)
                .unwrap_or(&self.workers[0]),
        }
    }

    /// Attaches `target` to the worker chosen by the selection policy.
    pub fn attach(&self, target: Arc<dyn DispatchTarget>) -> Result<(WorkerId, Token)> {
        let worker = self.select();
        let token = worker.attach(target)?;
        Ok((worker.id(), token))
    }

    pub fn worker(&self, id: WorkerId) -> Option<&PoolWorker> {
        self.workers.get(id.0)
    }

    pub fn workers_len(&self) -> usize {
        self.workers.len()
    }

    /// Targets attached across all workers, listeners included.
    pub fn connection_count(&self) -> usize {
        self.workers.iter().map(PoolWorker::load).sum()
    }

    /// Runs the idle sweep on every worker right away.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        self.workers.iter().map(|w| w.sweep_expired(now)).sum()
    }

    /// Stops every worker. Attached targets are force-closed.
    pub fn stop(&self) {
        for worker in &self.workers {
            worker.stop();
        }
    }
}

impl Drop for SocketPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(workers: usize, selection: WorkerSelection) -> SocketPool {
        SocketPool::new(
            PoolConfig::builder()
                .workers(workers)
                .poll_timeout(Duration::from_millis(10))
                .selection(selection)
                .build(),
        )
        .unwrap()
    }

    #[test]
    fn test_builder_defaults() {
        let config = PoolConfig::builder().workers(2).build();
        assert_eq!(config.workers, 2);
        assert_eq!(config.events_capacity, DEFAULT_EVENTS_CAPACITY);
        assert_eq!(config.poll_timeout, Duration::from_millis(100));
        assert_eq!(config.selection, WorkerSelection::RoundRobin);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let result = SocketPool::new(PoolConfig::builder().workers(0).build());
        assert!(matches!(result, Err(NetworkError::Configuration(_))));
    }

    #[test]
    fn test_round_robin_cycles() {
        let pool = pool(3, WorkerSelection::RoundRobin);
        let picked: Vec<_> = (0..6).map(|_| pool.select().id().0).collect();
        assert_eq!(picked, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_least_loaded_prefers_lowest_index_on_tie() {
        let pool = pool(3, WorkerSelection::LeastLoaded);
        assert_eq!(pool.select().id(), WorkerId(0));
        assert_eq!(pool.connection_count(), 0);
    }

    #[test]
    fn test_stop_is_repeatable() {
        let pool = pool(2, WorkerSelection::RoundRobin);
        pool.stop();
        pool.stop();
        assert!(pool.worker(WorkerId(1)).is_some_and(|w| !w.is_running()));
        assert!(pool.worker(WorkerId(2)).is_none());
    }
}
