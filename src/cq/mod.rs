//! Continuous-Query Scheduler
//!
//! Re-evaluates every saved query that carries continuous queries over
//! successive aligned time windows. `last_aligned` tracks the most
//! recent window boundary at or before now; each tick evaluates every
//! boundary the clock has passed since, so a stalled scheduler catches
//! up window by window instead of skipping data.
//!
//! Cancellation is cooperative: the loop stops between windows and
//! between child continuous queries, never inside one.

pub mod targets;

pub use targets::{CallbackChain, CqError, CqTarget, CqValue, TargetFactory, TargetRegistry};

use crate::engine::aggregate::group_by_term;
use crate::engine::{EngineError, Searcher};
use crate::meta::{ContinuousQuery, MetaStore, QueryDef};
use crate::observe::Stats;
use crate::store::{Query, SearchRequest, MAX_SEARCH_HIT_SIZE};
use crate::timeutil;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_RUN_INTERVAL: Duration = Duration::from_secs(60);

struct ChainCache {
    generation: u64,
    chains: HashMap<(String, String), Arc<CallbackChain>>,
}

/// The periodic evaluator.
pub struct CqService {
    searcher: Arc<dyn Searcher>,
    meta: Arc<MetaStore>,
    targets: TargetRegistry,
    run_interval: Duration,
    stats: Arc<Stats>,
    chains: Mutex<ChainCache>,
}

impl CqService {
    pub fn new(
        searcher: Arc<dyn Searcher>,
        meta: Arc<MetaStore>,
        run_interval: Duration,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            searcher,
            meta,
            targets: TargetRegistry::new(),
            run_interval: run_interval.max(Duration::from_millis(10)),
            stats,
            chains: Mutex::new(ChainCache {
                generation: 0,
                chains: HashMap::new(),
            }),
        }
    }

    /// The target registry, for registering custom target types before
    /// the service starts.
    pub fn targets(&self) -> &TargetRegistry {
        &self.targets
    }

    /// The scheduler loop; returns when `shutdown` fires. A window in
    /// progress completes before the loop exits.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let interval = match chrono::Duration::from_std(self.run_interval) {
            Ok(i) => i,
            Err(_) => {
                tracing::error!("continuous query interval is not representable; not running");
                return;
            }
        };
        let mut ticker = tokio::time::interval(self.run_interval);
        ticker.tick().await;

        let mut last = timeutil::align_time(Utc::now(), self.run_interval);
        tracing::info!(
            "continuous query service started, last boundary {}, interval {:?}",
            last,
            self.run_interval
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let now = Utc::now();
                    let mut end = last + interval;
                    while end <= now {
                        if shutdown.is_cancelled() {
                            break;
                        }
                        self.run_window(&shutdown, last, end).await;
                        last = end;
                        end = last + interval;
                    }
                }
            }
        }
        tracing::info!("continuous query service terminating");
    }

    /// Evaluate every continuous query over `[start, end)`.
    pub async fn run_window(
        &self,
        cancel: &CancellationToken,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) {
        Stats::incr(&self.stats.cq_runs);

        // Saved queries may have changed; resolved chains for old
        // definitions must not be reused.
        {
            let generation = self.meta.generation();
            let mut cache = self.chains.lock();
            if cache.generation != generation {
                cache.chains.clear();
                cache.generation = generation;
            }
        }

        for query in self.meta.queries_with_cq() {
            if cancel.is_cancelled() {
                return;
            }
            self.run_query(cancel, start, end, &query).await;
        }
    }

    async fn run_query(
        &self,
        cancel: &CancellationToken,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        query: &QueryDef,
    ) {
        let window = Query::DateRange {
            field: "reception".to_string(),
            start: Some(start),
            end: Some(end),
        };
        let base = match query.to_conjunction() {
            Ok(filters) => Query::conjoin(filters, window),
            Err(e) => {
                tracing::warn!("query '{}' ({}) does not compile: {}", query.name, query.id, e);
                Stats::incr(&self.stats.cq_errors);
                return;
            }
        };

        let mut cq_ids: Vec<&String> = query.continuous_queries.keys().collect();
        cq_ids.sort();
        for cq_id in cq_ids {
            if cancel.is_cancelled() {
                return;
            }
            let cq = &query.continuous_queries[cq_id];
            let chain = match self.chain_for(&query.id, cq_id, cq) {
                Ok(chain) => chain,
                Err(e) => {
                    tracing::warn!(
                        "cq (query={}, id={}) has unresolvable targets: {}",
                        query.id,
                        cq_id,
                        e
                    );
                    Stats::incr(&self.stats.cq_errors);
                    continue;
                }
            };

            let value = self.evaluate(cancel, start, end, &base, cq).await;
            if let Some(value) = value {
                if let Err(e) = chain.invoke(cq, &value).await {
                    Stats::incr(&self.stats.cq_errors);
                    tracing::warn!("cq (query={}, id={}) delivery: {}", query.id, cq_id, e);
                }
            }
        }
    }

    async fn evaluate(
        &self,
        cancel: &CancellationToken,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        base: &Query,
        cq: &ContinuousQuery,
    ) -> Option<CqValue> {
        if cq.group_by.is_empty() {
            let mut req = SearchRequest::new(base.clone());
            req.fields = cq.fields.clone();
            req.size = MAX_SEARCH_HIT_SIZE;
            match self
                .searcher
                .query(cancel, Some(start), Some(end), req)
                .await
            {
                Ok(result) => Some(CqValue::Search(result)),
                Err(EngineError::EmptyRange) => None,
                Err(e) => {
                    Stats::incr(&self.stats.cq_errors);
                    tracing::warn!("cq search over [{}, {}): {}", start, end, e);
                    None
                }
            }
        } else {
            match group_by_term(
                self.searcher.as_ref(),
                cancel,
                Some(start),
                Some(end),
                Some(base.clone()),
                &cq.group_by,
            )
            .await
            {
                Ok(groups) => Some(CqValue::Groups(groups)),
                Err(e) => {
                    Stats::incr(&self.stats.cq_errors);
                    tracing::warn!("cq group-by over [{}, {}): {}", start, end, e);
                    None
                }
            }
        }
    }

    fn chain_for(
        &self,
        query_id: &str,
        cq_id: &str,
        cq: &ContinuousQuery,
    ) -> Result<Arc<CallbackChain>, CqError> {
        let key = (query_id.to_string(), cq_id.to_string());
        if let Some(chain) = self.chains.lock().chains.get(&key) {
            return Ok(Arc::clone(chain));
        }
        let chain = Arc::new(self.targets.resolve(cq)?);
        self.chains
            .lock()
            .chains
            .insert(key, Arc::clone(&chain));
        Ok(chain)
    }
}
