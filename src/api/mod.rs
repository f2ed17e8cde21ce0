use std::sync::Arc;

use axum::{http::StatusCode, routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::store::Ledger;

pub mod handlers;

/// Shared state for the retrieval endpoint. Read-only against the ledger.
pub struct AppState {
    pub ledger: Arc<dyn Ledger>,
}

/// Build the public router: subscription retrieval plus health/info.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handlers::service_info))
        .route("/health", get(handlers::health))
        .route("/sub/:token", get(handlers::get_subscription))
        .layer(TraceLayer::new_for_http())
        .fallback(fallback_404)
        .with_state(state)
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}
