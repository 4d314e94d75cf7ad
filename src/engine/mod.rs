//! Indexing Engine
//!
//! The time-partitioned index engine: maps each event's reference time
//! to a partition (creating partitions on demand), drives per-partition
//! writes concurrently, serves fan-out searches and dictionary reads
//! through the open-partition pool, and ages partitions out on a
//! retention schedule.
//!
//! Writers and readers share the partition registry (reader-writer
//! lock) and the pool (bounded slots); neither lock is held across
//! store I/O.

pub mod aggregate;
pub mod batcher;
pub mod partition;
pub mod pool;
mod search;

pub use batcher::{Batcher, IndexContinuation};
pub use partition::{Partition, PartitionError, PartitionRegistry};
pub use pool::{LeasedPartition, PartitionPool, PoolError};

use crate::event::{next_sequence, Event};
use crate::observe::Stats;
use crate::store::{DictEntry, QueryError, SearchRequest, SearchResult, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_NUM_SHARDS: usize = 4;
pub const DEFAULT_NUM_CACHES: usize = 2;
pub const DEFAULT_INDEX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_RETENTION_PERIOD: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const RETENTION_CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no partitions cover the requested range")]
    EmptyRange,

    #[error("operation cancelled")]
    Cancelled,

    #[error("engine is closed")]
    Closed,

    #[error("{0}")]
    BadArguments(String),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error("multiple errors:\n\t{}", join_errors(.0))]
    ErrorList(Vec<String>),
}

fn join_errors(errors: &[String]) -> String {
    errors.join("\n\t")
}

impl From<PoolError> for EngineError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Cancelled => EngineError::Cancelled,
            PoolError::Closed => EngineError::Closed,
            PoolError::NotFound => {
                EngineError::BadArguments("partition is not resident".to_string())
            }
        }
    }
}

/// Anything that can answer searches and dictionary reads over a time
/// range. Implemented by `Engine`; the continuous-query scheduler and
/// the HTTP layer depend on this rather than on the engine directly.
#[async_trait]
pub trait Searcher: Send + Sync {
    async fn query(
        &self,
        cancel: &CancellationToken,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        req: SearchRequest,
    ) -> Result<SearchResult, EngineError>;

    async fn fields(
        &self,
        cancel: &CancellationToken,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<String>, EngineError>;

    async fn field_dict(
        &self,
        cancel: &CancellationToken,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        field: &str,
    ) -> Result<Vec<DictEntry>, EngineError>;
}

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub root: PathBuf,
    pub num_shards: usize,
    pub num_caches: usize,
    pub index_duration: Duration,
    pub retention_period: Duration,
    pub retention_check_interval: Duration,
    pub stats: Arc<Stats>,
}

impl EngineConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            num_shards: DEFAULT_NUM_SHARDS,
            num_caches: DEFAULT_NUM_CACHES,
            index_duration: DEFAULT_INDEX_DURATION,
            retention_period: DEFAULT_RETENTION_PERIOD,
            retention_check_interval: RETENTION_CHECK_INTERVAL,
            stats: Arc::new(Stats::new()),
        }
    }
}

/// The component that performs all indexing and fan-out reads.
pub struct Engine {
    root: PathBuf,
    registry: PartitionRegistry,
    pool: Arc<PartitionPool>,
    index_duration: Duration,
    retention_period: Duration,
    stats: Arc<Stats>,
    shutdown: CancellationToken,
    retention_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Open the engine over `config.root`, enumerating existing
    /// partitions and starting the retention sweeper. Must be called
    /// from within a tokio runtime.
    pub fn open(config: EngineConfig) -> Result<Arc<Self>, EngineError> {
        let registry = PartitionRegistry::open(&config.root)?;
        let pool = PartitionPool::new(config.num_caches, config.num_shards);

        let engine = Arc::new(Self {
            root: config.root,
            registry,
            pool,
            index_duration: config.index_duration,
            retention_period: config.retention_period,
            stats: config.stats,
            shutdown: CancellationToken::new(),
            retention_task: parking_lot::Mutex::new(None),
        });

        let handle = tokio::spawn(retention_loop(
            Arc::clone(&engine),
            config.retention_check_interval,
        ));
        *engine.retention_task.lock() = Some(handle);

        tracing::info!("engine opened at {}", engine.root.display());
        Ok(engine)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    pub fn registry(&self) -> &PartitionRegistry {
        &self.registry
    }

    pub(crate) fn pool(&self) -> &Arc<PartitionPool> {
        &self.pool
    }

    /// Index a batch of events. The batch is de-multiplexed by
    /// reference time; each sub-batch is written concurrently. A batch
    /// that lands in exactly one partition pins its lease on the
    /// continuation for reuse by the next batch; a multi-partition
    /// batch drops the pin.
    ///
    /// A failing sub-batch does not cancel the others; all failures are
    /// aggregated into one error.
    pub async fn index(
        &self,
        continuation: &mut IndexContinuation,
        events: Vec<Event>,
    ) -> Result<usize, EngineError> {
        if events.is_empty() {
            return Ok(0);
        }

        let mut sub_batches: Vec<(Arc<Partition>, Vec<Event>)> = Vec::new();
        let mut index_of: HashMap<u64, usize> = HashMap::new();
        for mut event in events {
            if event.sequence == 0 {
                event.sequence = next_sequence();
            }
            let reference = event.reference_time();
            let partition = match self.registry.find_for(reference) {
                Some(p) => p,
                None => self.registry.find_or_create(reference, self.index_duration)?,
            };
            let slot = *index_of.entry(partition.id).or_insert_with(|| {
                sub_batches.push((Arc::clone(&partition), Vec::new()));
                sub_batches.len() - 1
            });
            sub_batches[slot].1.push(event);
        }
        let total: usize = sub_batches.iter().map(|(_, evs)| evs.len()).sum();

        if sub_batches.len() > 1 {
            // Pinning only pays off in the single-partition case.
            continuation.release();
        }

        if sub_batches.len() == 1 {
            let (partition, events) = sub_batches.pop().expect("one sub-batch");
            let docs = events.iter().map(Event::document).collect();
            match continuation.take_pinned_for(partition.id) {
                Some(pinned) => {
                    let outcome = pinned.batch_index(docs);
                    continuation.pin(pinned);
                    outcome?;
                }
                None => {
                    let leased = self.pool.load(&self.shutdown, &partition).await?;
                    leased.batch_index(docs)?;
                    continuation.pin(leased);
                }
            }
            return Ok(total);
        }

        let results = join_all(sub_batches.iter().map(|(partition, events)| async move {
            let docs = events.iter().map(Event::document).collect();
            let outcome: Result<(), EngineError> = async {
                let leased = self.pool.load(&self.shutdown, partition).await?;
                leased.batch_index(docs)?;
                Ok(())
            }
            .await;
            (partition.path.display().to_string(), outcome)
        }))
        .await;

        let errors: Vec<String> = results
            .into_iter()
            .filter_map(|(path, outcome)| outcome.err().map(|e| format!("{}: {}", path, e)))
            .collect();
        if errors.is_empty() {
            Ok(total)
        } else {
            Err(EngineError::ErrorList(errors))
        }
    }

    /// Execute a search against all partitions intersecting
    /// `[start, end]`, merging under the request's sort and paging.
    pub async fn query(
        &self,
        cancel: &CancellationToken,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        mut req: SearchRequest,
    ) -> Result<SearchResult, EngineError> {
        Stats::incr(&self.stats.queries_rx);
        let partitions = self.registry.select_range(start, end);
        if partitions.is_empty() {
            return Err(EngineError::EmptyRange);
        }
        search::inject_time_filter(&mut req, start, end);
        if let Some(q) = &req.query {
            q.validate()?;
        }
        search::multi_search(self, cancel, &req, partitions).await
    }

    /// All field names present across intersecting partitions.
    pub async fn fields(
        &self,
        cancel: &CancellationToken,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<String>, EngineError> {
        Stats::incr(&self.stats.queries_rx);
        let partitions = self.registry.select_range(start, end);
        if partitions.is_empty() {
            return Err(EngineError::EmptyRange);
        }

        let results = join_all(partitions.iter().map(|partition| async move {
            let outcome: Result<Vec<String>, EngineError> = async {
                let leased = self.pool.load(cancel, partition).await?;
                Ok(leased.fields())
            }
            .await;
            (partition.path.display().to_string(), outcome)
        }))
        .await;

        let mut all = Vec::new();
        let mut errors = Vec::new();
        for (path, outcome) in results {
            match outcome {
                Ok(fields) => {
                    for f in fields {
                        if !all.contains(&f) {
                            all.push(f);
                        }
                    }
                }
                Err(e) => errors.push(format!("{}: {}", path, e)),
            }
        }
        if !errors.is_empty() {
            return Err(EngineError::ErrorList(errors));
        }
        all.sort();
        Ok(all)
    }

    /// The merged dictionary for `field` across intersecting
    /// partitions; counts for the same term are summed.
    pub async fn field_dict(
        &self,
        cancel: &CancellationToken,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        field: &str,
    ) -> Result<Vec<DictEntry>, EngineError> {
        Stats::incr(&self.stats.queries_rx);
        let partitions = self.registry.select_range(start, end);
        if partitions.is_empty() {
            return Err(EngineError::EmptyRange);
        }

        let results = join_all(partitions.iter().map(|partition| async move {
            let outcome: Result<Vec<DictEntry>, EngineError> = async {
                let leased = self.pool.load(cancel, partition).await?;
                Ok(leased.field_dict(field))
            }
            .await;
            (partition.path.display().to_string(), outcome)
        }))
        .await;

        let mut merged: BTreeMap<String, u64> = BTreeMap::new();
        let mut errors = Vec::new();
        for (path, outcome) in results {
            match outcome {
                Ok(entries) => {
                    for e in entries {
                        *merged.entry(e.term).or_insert(0) += e.count;
                    }
                }
                Err(e) => errors.push(format!("{}: {}", path, e)),
            }
        }
        if !errors.is_empty() {
            return Err(EngineError::ErrorList(errors));
        }
        Ok(merged
            .into_iter()
            .map(|(term, count)| DictEntry { term, count })
            .collect())
    }

    /// One retention pass: retire partitions whose end plus the
    /// retention period is in the past, unless a pool slot holds a
    /// lease on them (those retry next tick).
    pub fn enforce_retention(&self) {
        let now = Utc::now();
        let retention = chrono::Duration::from_std(self.retention_period)
            .unwrap_or_else(|_| chrono::Duration::max_value());
        let removed = self
            .registry
            .retire(|p| p.expired(now, retention) && !self.pool.is_held(p.id));
        if !removed.is_empty() {
            Stats::add(&self.stats.retention_deletions, removed.len() as u64);
        }
    }

    /// Stop the retention sweeper and close the pool. In-flight leases
    /// close their backings on final release.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let handle = self.retention_task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.pool.close();
        tracing::info!("engine closed");
    }
}

#[async_trait]
impl Searcher for Engine {
    async fn query(
        &self,
        cancel: &CancellationToken,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        req: SearchRequest,
    ) -> Result<SearchResult, EngineError> {
        Engine::query(self, cancel, start, end, req).await
    }

    async fn fields(
        &self,
        cancel: &CancellationToken,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<String>, EngineError> {
        Engine::fields(self, cancel, start, end).await
    }

    async fn field_dict(
        &self,
        cancel: &CancellationToken,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        field: &str,
    ) -> Result<Vec<DictEntry>, EngineError> {
        Engine::field_dict(self, cancel, start, end, field).await
    }
}

async fn retention_loop(engine: Arc<Engine>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
    // The first tick of a tokio interval completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = engine.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                Stats::incr(&engine.stats.retention_runs);
                engine.enforce_retention();
            }
        }
    }
}
