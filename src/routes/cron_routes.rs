// src/routes/cron_routes.rs

//! Externally triggered runs. The internal scheduler does the same work on a
//! timer; these exist for an outside cron and for operators.

use axum::{
    extract::State,
    http::{header, HeaderMap},
    routing::get,
    Json, Router,
};
use serde::Serialize;

use crate::{
    auth::secrets_match,
    error::ApiError,
    messaging::{
        dispatch::DispatchSummary,
        follow_ups::{enqueue_due_follow_ups, FollowUpSummary, FOLLOW_UP_BATCH},
        inbound::{expire_past_confirmations, expire_stale_feedback},
        reminders::{enqueue_upcoming_reminders, ReminderSummary},
    },
    models::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/cron/process-campaigns", get(process_campaigns))
        .route("/cron/process-reminders", get(process_reminders))
        .route("/cron/process-followups", get(process_follow_ups))
        .route("/cron/expire-feedback", get(expire_feedback))
}

#[derive(Debug, Serialize)]
pub struct ExpireResult {
    pub expired: u64,
    pub confirmations_expired: u64,
}

fn ensure_cron_caller(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.cron_secret.as_deref() else {
        return Ok(());
    };

    let given = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    if secrets_match(given, expected) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized("INVALID_CRON_SECRET", "invalid cron secret".into()))
    }
}

/// One dispatch batch. 503 when the queue cannot be claimed.
pub async fn process_campaigns(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<DispatchSummary>, ApiError> {
    ensure_cron_caller(&state, &headers)?;

    let summary = state.dispatcher.run_batch().await.map_err(|e| {
        tracing::error!(error = %e, "Dispatch run failed");
        ApiError::from(e)
    })?;

    Ok(Json(summary))
}

/// Enqueue reminders for appointments inside the lead window.
pub async fn process_reminders(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ReminderSummary>, ApiError> {
    ensure_cron_caller(&state, &headers)?;

    let lead = chrono::Duration::hours(state.reminder_lead_hours);
    let summary = enqueue_upcoming_reminders(&state.engine, state.store.as_ref(), lead).await?;

    Ok(Json(summary))
}

pub async fn process_follow_ups(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<FollowUpSummary>, ApiError> {
    ensure_cron_caller(&state, &headers)?;

    let summary = enqueue_due_follow_ups(&state.engine, state.store.as_ref(), FOLLOW_UP_BATCH).await?;

    Ok(Json(summary))
}

/// Expire unanswered feedback and reminders whose appointment already began.
pub async fn expire_feedback(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ExpireResult>, ApiError> {
    ensure_cron_caller(&state, &headers)?;

    let expired = expire_stale_feedback(state.store.as_ref(), state.feedback_expiry_hours).await?;
    let confirmations_expired = expire_past_confirmations(state.store.as_ref()).await?;

    Ok(Json(ExpireResult {
        expired,
        confirmations_expired,
    }))
}
