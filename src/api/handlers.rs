use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue},
    response::IntoResponse,
    Json,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::json;

use super::AppState;
use crate::errors::AppError;

// ── Subscription retrieval ───────────────────────────────────

/// GET /sub/:token: base64 of every live descriptor, one per line, ordered by node name.
pub async fn get_subscription(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let subscription = state
        .ledger
        .subscription_by_token(&token)
        .await?
        .ok_or(AppError::SubscriptionNotFound)?;

    if !subscription.is_active {
        tracing::debug!(subscription_id = subscription.id, "retrieval for inactive subscription");
        return Err(AppError::SubscriptionInactive);
    }

    let grants = state.ledger.grants_for_subscription(subscription.id).await?;
    if grants.is_empty() {
        return Err(AppError::NoGrants);
    }

    let body = grants
        .iter()
        .map(|g| g.access_url.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_static("inline; filename=\"subscription.txt\""),
    );
    let userinfo = format!(
        "upload=0; download=0; total=0; expire={}",
        subscription.expires_at.timestamp()
    );
    headers.insert(
        "subscription-userinfo",
        HeaderValue::from_str(&userinfo).map_err(anyhow::Error::from)?,
    );

    Ok((headers, STANDARD.encode(body)))
}

// ── Service ──────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn service_info() -> impl IntoResponse {
    Json(json!({
        "service": "fleet",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/sub/{token}", "/health"],
    }))
}
