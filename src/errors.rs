use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by the retrieval endpoint.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("subscription not found")]
    SubscriptionNotFound,

    #[error("subscription inactive")]
    SubscriptionInactive,

    #[error("subscription has no grants")]
    NoGrants,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, code, msg) = match &self {
            AppError::SubscriptionNotFound => (
                StatusCode::NOT_FOUND,
                "not_found_error",
                "subscription_not_found",
                "subscription not found".to_string(),
            ),
            AppError::SubscriptionInactive => (
                StatusCode::FORBIDDEN,
                "permission_error",
                "subscription_inactive",
                "subscription expired or revoked".to_string(),
            ),
            AppError::NoGrants => (
                StatusCode::NOT_FOUND,
                "not_found_error",
                "no_grants",
                "no servers available for this subscription".to_string(),
            ),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "type": error_type,
                "code": code,
            }
        }));

        (status, body).into_response()
    }
}
