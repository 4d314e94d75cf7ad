//! # Lantern
//!
//! A time-partitioned full-text search engine for syslog streams.
//! Events arrive over TCP/UDP syslog or HTTP, are batched and written
//! into hourly-to-daily partitions, and are served back through
//! searches, field dictionaries, group-by aggregations and continuous
//! queries. Partitions age out after a retention window.
//!
//! ## Modules
//!
//! - [`engine`]: partition lifecycle, open-partition pool, batching,
//!   fan-out search planner, aggregations, retention
//! - [`store`]: the per-partition writer/searcher and the query DSL
//! - [`syslog`] / [`input`]: wire parsing and network collectors
//! - [`meta`] / [`cq`]: saved queries and the continuous-query
//!   scheduler
//! - [`api`]: the HTTP query surface
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lantern::engine::{Engine, EngineConfig, IndexContinuation};
//! use lantern::event::Event;
//! use lantern::store::{FieldValue, Query, SearchRequest};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::open(EngineConfig::new("./lantern_data"))?;
//!
//!     // Index one event.
//!     let mut event = Event::new("raw line".to_string(), Default::default());
//!     event.stamp("127.0.0.1:514");
//!     event
//!         .fields
//!         .insert("message".to_string(), FieldValue::Text("hello".to_string()));
//!     let mut continuation = IndexContinuation::new();
//!     engine.index(&mut continuation, vec![event]).await?;
//!
//!     // Search it back.
//!     let cancel = CancellationToken::new();
//!     let req = SearchRequest::new(Query::QueryString { query: "hello".into() });
//!     let result = engine.query(&cancel, None, None, req).await?;
//!     println!("{} hit(s)", result.total_hits);
//!
//!     engine.close().await;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod cq;
pub mod engine;
pub mod event;
pub mod input;
pub mod meta;
pub mod observe;
pub mod store;
pub mod syslog;
pub mod timeutil;

// Re-export top-level types for convenience
pub use config::{Config, ConfigError};
pub use engine::{
    Batcher, Engine, EngineConfig, EngineError, IndexContinuation, Searcher,
};
pub use event::Event;
pub use meta::{ContinuousQuery, Filter, MetaStore, QueryDef};
pub use observe::{Stats, StatsSnapshot};
pub use store::{
    Document, FieldValue, Query, SearchHit, SearchRequest, SearchResult,
};
