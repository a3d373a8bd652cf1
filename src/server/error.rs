use crate::errors::EngineError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

/// Error half of every handler's result.
#[derive(Debug)]
pub enum ApiError {
    /// No identity on the request.
    Unauthenticated,
    Engine(EngineError),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError::Engine(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::Engine(e) => match e {
                EngineError::Validation(_) => StatusCode::BAD_REQUEST,
                EngineError::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
                EngineError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
                EngineError::NotFound(_) => StatusCode::NOT_FOUND,
                EngineError::Permission(_) => StatusCode::FORBIDDEN,
                EngineError::NotYetDue { .. } => StatusCode::CONFLICT,
                EngineError::Store(_)
                | EngineError::Timeout(_)
                | EngineError::RetriesExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
                EngineError::MissingMaturity(_)
                | EngineError::Database(_)
                | EngineError::StateCorruption(_)
                | EngineError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::Unauthenticated => "unauthenticated",
            ApiError::Engine(e) => match e {
                EngineError::Validation(_) => "validation",
                EngineError::InsufficientBalance { .. } => "insufficient_balance",
                EngineError::QuotaExceeded { .. } => "quota_exceeded",
                EngineError::NotFound(_) => "not_found",
                EngineError::Permission(_) => "permission",
                EngineError::NotYetDue { .. } => "not_yet_due",
                EngineError::Store(_) | EngineError::Timeout(_) => "still_trying",
                EngineError::RetriesExhausted { .. } => "failed",
                _ => "internal",
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = serde_json::json!({
            "kind": self.kind(),
            "error": match &self {
                ApiError::Unauthenticated => "missing x-user-id header".to_string(),
                ApiError::Engine(e) => e.to_string(),
            },
        });

        match &self {
            ApiError::Engine(EngineError::QuotaExceeded { resets_at }) => {
                body["resets_at"] = serde_json::json!(resets_at.to_rfc3339());
            }
            ApiError::Engine(EngineError::NotYetDue { matures_at, .. }) => {
                body["matures_at"] = serde_json::json!(matures_at.to_rfc3339());
            }
            ApiError::Engine(e) if status.is_server_error() => {
                tracing::error!(error = %e, "request failed");
            }
            ApiError::Engine(e) if !e.is_user_facing() => {
                tracing::debug!(error = %e, "request rejected");
            }
            _ => {}
        }

        (status, Json(body)).into_response()
    }
}
