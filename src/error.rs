use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::models::UnknownVariant;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorObject,
}

#[derive(Debug, Serialize)]
pub struct ErrorObject {
    pub code: String,
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(&'static str, String),
    Forbidden(&'static str, String),
    BadRequest(&'static str, String),
    NotFound(&'static str, String),
    Conflict(&'static str, String),
    Unavailable(&'static str, String),
    Internal(String),
}

impl ApiError {
    pub fn session_expired() -> Self {
        ApiError::Unauthorized("SESSION_EXPIRED", "Session expired".into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::BadRequest("VALIDATION_ERROR", message.into())
    }

    fn to_error_response(code: &str, message: &str) -> Json<ErrorResponse> {
        Json(ErrorResponse {
            error: ErrorObject {
                code: code.to_string(),
                message: message.to_string(),
            },
        })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized(code, msg) => {
                (StatusCode::UNAUTHORIZED, ApiError::to_error_response(code, &msg)).into_response()
            }
            ApiError::Forbidden(code, msg) => {
                (StatusCode::FORBIDDEN, ApiError::to_error_response(code, &msg)).into_response()
            }
            ApiError::BadRequest(code, msg) => {
                (StatusCode::BAD_REQUEST, ApiError::to_error_response(code, &msg)).into_response()
            }
            ApiError::NotFound(code, msg) => {
                (StatusCode::NOT_FOUND, ApiError::to_error_response(code, &msg)).into_response()
            }
            ApiError::Conflict(code, msg) => {
                (StatusCode::CONFLICT, ApiError::to_error_response(code, &msg)).into_response()
            }
            ApiError::Unavailable(code, msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ApiError::to_error_response(code, &msg),
            )
                .into_response(),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiError::to_error_response("INTERNAL", &msg),
            )
                .into_response(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => ApiError::Unavailable("DATASTORE_UNAVAILABLE", msg),
            other => ApiError::Internal(format!("db error: {other}")),
        }
    }
}

/* -------------------------
   Domain errors
--------------------------*/

/// Failures talking to the datastore.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Pool exhausted, connection refused, or the server went away.
    #[error("datastore unavailable: {0}")]
    Unavailable(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("row decode failed: {0}")]
    Decode(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(e.to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Decode(e.to_string())
            }
            other => StoreError::Query(other.to_string()),
        }
    }
}

impl From<UnknownVariant> for StoreError {
    fn from(e: UnknownVariant) -> Self {
        StoreError::Decode(e.to_string())
    }
}

/// Outcome of a failed gateway call. Both variants end as `failed` rows; the
/// distinction only steers bulk requeue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// Network error, timeout, throttling or a 5xx. Worth retrying.
    #[error("transient gateway error: {0}")]
    Transient(String),

    /// Invalid phone, rejected content, bad credentials.
    #[error("permanent gateway error: {0}")]
    Permanent(String),
}

impl GatewayError {
    pub fn kind(&self) -> crate::models::FailureKind {
        match self {
            GatewayError::Transient(_) => crate::models::FailureKind::Transient,
            GatewayError::Permanent(_) => crate::models::FailureKind::Permanent,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(s) if s.is_client_error() && s.as_u16() != 429 => {
                GatewayError::Permanent(e.to_string())
            }
            _ => GatewayError::Transient(e.to_string()),
        }
    }
}

/// Errors of the messaging engine that callers may want to tell apart.
/// None of them abort a batch or an acknowledgment.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("no active template for trigger {0}")]
    TemplateNotFound(crate::models::TriggerType),

    #[error("no open feedback request for phone {0}")]
    UnmatchedReply(String),

    #[error("malformed webhook payload: {0}")]
    MalformedWebhookPayload(String),

    #[error("invalid phone number: {0}")]
    InvalidPhone(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<MessagingError> for ApiError {
    fn from(e: MessagingError) -> Self {
        match e {
            MessagingError::MalformedWebhookPayload(msg) => {
                ApiError::BadRequest("MALFORMED_PAYLOAD", msg)
            }
            MessagingError::InvalidPhone(msg) => ApiError::validation(msg),
            MessagingError::TemplateNotFound(t) => {
                ApiError::NotFound("TEMPLATE_NOT_FOUND", format!("no active template for {t}"))
            }
            MessagingError::UnmatchedReply(p) => {
                ApiError::NotFound("UNMATCHED_REPLY", format!("no open feedback for {p}"))
            }
            MessagingError::Store(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FailureKind;

    #[test]
    fn gateway_error_kinds() {
        assert_eq!(GatewayError::Transient("t".into()).kind(), FailureKind::Transient);
        assert_eq!(GatewayError::Permanent("p".into()).kind(), FailureKind::Permanent);
    }

    #[test]
    fn pool_timeout_is_unavailable() {
        let e: StoreError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(e, StoreError::Unavailable(_)));
        let api: ApiError = e.into();
        assert!(matches!(api, ApiError::Unavailable("DATASTORE_UNAVAILABLE", _)));
    }

    #[test]
    fn malformed_payload_maps_to_bad_request() {
        let api: ApiError = MessagingError::MalformedWebhookPayload("missing phone".into()).into();
        let res = api.into_response();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }
}
