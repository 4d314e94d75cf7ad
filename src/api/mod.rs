//! HTTP Query Surface
//!
//! Axum router for the search, dictionary, saved-query, ingest and
//! health endpoints. Responses are JSON and carry cache-disabling
//! headers so intermediaries never serve stale search results.
//!
//! # Endpoints
//!
//! - `GET /raw`, `POST /raw` - search (query string / full request)
//! - `GET|POST /raw/count` - totals only
//! - `GET /fields`, `GET /fields/{field}` - field list / dictionary
//! - `GET|POST /filters...` - saved-query CRUD
//! - `GET|POST /query/{name}`, `/query/{name}/count` - search by saved
//!   query, with optional `group_by`
//! - `POST /syslogs` - JSON event ingest
//! - `GET /health`, `GET /stats`

pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

use axum::http::{header, HeaderValue};
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

/// Build the router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);

    Router::new()
        .route("/raw", get(routes::raw::search).post(routes::raw::search_body))
        .route(
            "/raw/count",
            get(routes::raw::count).post(routes::raw::count_body),
        )
        .route("/fields", get(routes::fields::list_fields))
        .route("/fields/:field", get(routes::fields::field_dict))
        .route(
            "/filters",
            get(routes::filters::list).post(routes::filters::create),
        )
        .route(
            "/filters/:id",
            get(routes::filters::read)
                .put(routes::filters::update)
                .delete(routes::filters::remove),
        )
        .route(
            "/query/:name",
            get(routes::saved::search).post(routes::saved::search),
        )
        .route(
            "/query/:name/count",
            get(routes::saved::count).post(routes::saved::count),
        )
        .route("/syslogs", post(routes::syslogs::ingest))
        .route("/health", get(routes::health::health))
        .route("/stats", get(routes::health::stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("private, no-store, max-age=0, no-cache, must-revalidate"),
        ))
        .with_state(shared)
}

/// Bind and serve until `shutdown` fires.
pub async fn serve(
    state: AppState,
    bind: &str,
    shutdown: CancellationToken,
) -> Result<(), ApiError> {
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|e| ApiError::Internal(format!("bind {}: {}", bind, e)))?;
    tracing::info!("http server listening on {}", bind);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| ApiError::Internal(format!("server error: {}", e)))?;

    tracing::info!("http server shut down");
    Ok(())
}
