//! Shared API State

use crate::engine::Searcher;
use crate::event::Event;
use crate::meta::MetaStore;
use crate::observe::Stats;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Everything the handlers need: the search facade, the saved-query
/// store, the ingest channel into the batcher, and the stats counters.
pub struct AppState {
    pub searcher: Arc<dyn Searcher>,
    pub meta: Arc<MetaStore>,
    pub events: mpsc::Sender<Event>,
    pub stats: Arc<Stats>,
}

impl AppState {
    pub fn new(
        searcher: Arc<dyn Searcher>,
        meta: Arc<MetaStore>,
        events: mpsc::Sender<Event>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            searcher,
            meta,
            events,
            stats,
        }
    }
}
