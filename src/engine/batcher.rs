//! Batching Pipeline
//!
//! Accepts events on a bounded channel (producers block when it fills)
//! and hands them to the engine in batches, flushed on size or on a
//! single-shot timer that starts with the first event of a batch. The
//! background task owns an `IndexContinuation` so steady-state writes
//! into one partition reuse a pinned pool lease instead of reacquiring
//! it per batch.

use crate::engine::pool::LeasedPartition;
use crate::engine::{Engine, EngineError};
use crate::event::Event;
use crate::observe::Stats;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Single-writer state carried across batches: at most one pinned
/// lease, kept while consecutive batches land in the same partition.
#[derive(Default)]
pub struct IndexContinuation {
    pinned: Option<LeasedPartition>,
}

impl IndexContinuation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the pinned lease, if any.
    pub fn release(&mut self) {
        self.pinned = None;
    }

    /// Take the pinned lease if it is bound to partition `id`; a pin
    /// for a different partition stays put (it is replaced on the next
    /// `pin`).
    pub(crate) fn take_pinned_for(&mut self, id: u64) -> Option<LeasedPartition> {
        if self.pinned.as_ref().map(|lp| lp.store_id()) == Some(id) {
            self.pinned.take()
        } else {
            None
        }
    }

    pub(crate) fn pin(&mut self, lease: LeasedPartition) {
        self.pinned = Some(lease);
    }

    /// Whether a lease for partition `id` is currently pinned.
    pub fn is_pinned(&self, id: u64) -> bool {
        self.pinned.as_ref().map(|lp| lp.store_id()) == Some(id)
    }
}

/// The batching pipeline. `stop()` drains and flushes what is left.
pub struct Batcher {
    tx: mpsc::Sender<Event>,
    handle: JoinHandle<()>,
}

impl Batcher {
    /// Start the pipeline: `size`/`duration` are the flush triggers,
    /// `max_outstanding` the channel bound. Index errors go to
    /// `err_tx` when given; they never stop the pipeline.
    pub fn start(
        engine: Arc<Engine>,
        size: usize,
        duration: Duration,
        max_outstanding: usize,
        err_tx: Option<mpsc::UnboundedSender<EngineError>>,
    ) -> Self {
        let size = size.max(1);
        let (tx, rx) = mpsc::channel(max_outstanding.max(1));
        let handle = tokio::spawn(run(engine, rx, size, duration, err_tx));
        Self { tx, handle }
    }

    /// Channel on which producers submit events.
    pub fn sender(&self) -> mpsc::Sender<Event> {
        self.tx.clone()
    }

    /// Close the inbound channel, drain remaining events, flush them,
    /// and release the pinned lease.
    pub async fn stop(self) {
        drop(self.tx);
        if let Err(e) = self.handle.await {
            tracing::warn!("batcher task ended abnormally: {}", e);
        }
    }
}

async fn run(
    engine: Arc<Engine>,
    mut rx: mpsc::Receiver<Event>,
    size: usize,
    duration: Duration,
    err_tx: Option<mpsc::UnboundedSender<EngineError>>,
) {
    let stats = engine.stats();
    let mut continuation = IndexContinuation::new();
    let mut batch: Vec<Event> = Vec::with_capacity(size);
    let mut deadline: Option<tokio::time::Instant> = None;

    loop {
        let timer = async {
            match deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            received = rx.recv() => match received {
                Some(event) => {
                    if batch.is_empty() {
                        deadline = Some(tokio::time::Instant::now() + duration);
                    }
                    batch.push(event);
                    if batch.len() >= size {
                        flush(&engine, &mut continuation, &mut batch, &err_tx, &stats).await;
                        deadline = None;
                    }
                }
                None => break,
            },
            _ = timer => {
                Stats::incr(&stats.batch_timeouts);
                flush(&engine, &mut continuation, &mut batch, &err_tx, &stats).await;
                deadline = None;
            }
        }
    }

    // Graceful drain: whatever was buffered goes out before the task
    // ends and the pinned lease is released.
    flush(&engine, &mut continuation, &mut batch, &err_tx, &stats).await;
    continuation.release();
    tracing::info!("batcher stopped");
}

async fn flush(
    engine: &Engine,
    continuation: &mut IndexContinuation,
    batch: &mut Vec<Event>,
    err_tx: &Option<mpsc::UnboundedSender<EngineError>>,
    stats: &Stats,
) {
    if batch.is_empty() {
        return;
    }
    let events = std::mem::take(batch);
    let count = events.len();
    match engine.index(continuation, events).await {
        Ok(_) => {
            Stats::incr(&stats.batches_indexed);
            Stats::add(&stats.events_indexed, count as u64);
        }
        Err(e) => {
            Stats::incr(&stats.batch_errors);
            tracing::error!("batch index failed: {}", e);
            if let Some(tx) = err_tx {
                let _ = tx.send(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::store::{FieldValue, Query, SearchRequest};
    use crate::timeutil;
    use std::collections::HashMap;
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    fn test_event(message: &str, at: &str) -> Event {
        let mut fields = HashMap::new();
        fields.insert("message".to_string(), FieldValue::Text(message.to_string()));
        fields.insert(
            "timestamp".to_string(),
            FieldValue::Time(timeutil::parse_time(at).unwrap()),
        );
        let mut e = Event::new(message.to_string(), fields);
        e.stamp("127.0.0.1:9");
        e.fields.insert(
            "timestamp".to_string(),
            FieldValue::Time(timeutil::parse_time(at).unwrap()),
        );
        e
    }

    async fn search_total(engine: &Engine, q: &str) -> u64 {
        let cancel = CancellationToken::new();
        let mut req = SearchRequest::new(Query::QueryString { query: q.into() });
        req.size = 0;
        engine
            .query(&cancel, None, None, req)
            .await
            .map(|r| r.total_hits)
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_flush_on_size() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(EngineConfig::new(dir.path())).unwrap();
        let batcher = Batcher::start(
            Arc::clone(&engine),
            2,
            Duration::from_secs(3600),
            16,
            None,
        );

        let tx = batcher.sender();
        tx.send(test_event("sized one", "2023-01-02T03:04:05Z"))
            .await
            .unwrap();
        tx.send(test_event("sized two", "2023-01-02T03:04:06Z"))
            .await
            .unwrap();

        // Size trigger fires without waiting for the timer.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(search_total(&engine, "sized").await, 2);

        batcher.stop().await;
        engine.close().await;
    }

    #[tokio::test]
    async fn test_flush_on_timer() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(EngineConfig::new(dir.path())).unwrap();
        let batcher = Batcher::start(
            Arc::clone(&engine),
            100,
            Duration::from_millis(100),
            16,
            None,
        );

        batcher
            .sender()
            .send(test_event("timed entry", "2023-01-02T03:04:05Z"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(search_total(&engine, "timed").await, 1);

        batcher.stop().await;
        engine.close().await;
    }

    #[tokio::test]
    async fn test_stop_drains_remaining() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(EngineConfig::new(dir.path())).unwrap();
        let batcher = Batcher::start(
            Arc::clone(&engine),
            100,
            Duration::from_secs(3600),
            16,
            None,
        );

        batcher
            .sender()
            .send(test_event("drained entry", "2023-01-02T03:04:05Z"))
            .await
            .unwrap();
        batcher.stop().await;

        assert_eq!(search_total(&engine, "drained").await, 1);
        engine.close().await;
    }
}
