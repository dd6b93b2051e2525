// src/routes/webhook_routes.rs

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;

use crate::{
    auth::secrets_match,
    error::ApiError,
    messaging::inbound::{parse_payload, InboundOutcome},
    models::AppState,
};

const WEBHOOK_TOKEN_HEADER: &str = "x-webhook-token";
const ENDPOINT: &str = "/api/v1/webhooks/whatsapp";

pub fn router() -> Router<AppState> {
    Router::new().route("/webhooks/whatsapp", get(webhook_health).post(receive_reply))
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub ok: bool,
    pub outcome: InboundOutcome,
}

#[derive(Debug, Serialize)]
pub struct WebhookHealth {
    pub status: &'static str,
    pub endpoint: &'static str,
    pub timestamp: String,
}

/// Gateway callback for patient replies.
///
/// Malformed bodies get a 400. Anything that parses is acknowledged with 200,
/// including unmatched replies and internal failures, so the gateway does not
/// retry-storm us.
pub async fn receive_reply(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    if let Some(expected) = state.webhook_token.as_deref() {
        let given = headers
            .get(WEBHOOK_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        if !secrets_match(given, expected) {
            tracing::warn!("Webhook call rejected: bad or missing token");
            return Err(ApiError::Unauthorized(
                "INVALID_WEBHOOK_TOKEN",
                "invalid webhook token".into(),
            ));
        }
    }

    let reply = parse_payload(&body).map_err(|e| {
        tracing::warn!(error = %e, "Rejected malformed webhook payload");
        ApiError::from(e)
    })?;

    let outcome = state.inbound.handle(reply).await;

    Ok(Json(WebhookAck { ok: true, outcome }))
}

pub async fn webhook_health() -> Json<WebhookHealth> {
    Json(WebhookHealth {
        status: "ok",
        endpoint: ENDPOINT,
        timestamp: Utc::now().to_rfc3339(),
    })
}
