// src/routes/attendance_routes.rs

use std::collections::HashMap;

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::ApiError,
    messaging::{templates::person_vars, trigger::BusinessEvent},
    middleware::auth_context::{ensure_admin_or_manager, ensure_staff, AuthContext},
    models::{
        ActiveAttendanceSession, ApiOk, AppState, AppointmentConfirmation, AttendanceFeedback,
        FollowUpStatus, ScheduledFollowUp,
    },
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/appointments/{appointment_id}/complete_attendance",
            post(complete_attendance),
        )
        .route(
            "/appointments/{appointment_id}/insole_delivery",
            post(insole_delivery),
        )
        .route("/appointments/{appointment_id}/feedback", get(get_feedback))
        .route(
            "/appointments/{appointment_id}/confirmation",
            get(get_confirmation),
        )
        .route("/appointments/{appointment_id}/follow_ups", get(list_follow_ups))
        .route("/follow_ups/{follow_up_id}/cancel", post(cancel_follow_up))
}

#[derive(Debug, Deserialize)]
pub struct InsoleDeliveryRequest {
    pub patient_name: String,
    pub patient_phone: String,
    /// Defaults to now.
    pub delivered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct CompleteAttendanceResult {
    pub ok: bool,
    pub messaging_queued: bool,
}

#[derive(Debug, Serialize)]
pub struct FeedbackDto {
    #[serde(flatten)]
    pub feedback: AttendanceFeedback,
    pub resolved: bool,
}

/// Placeholder values for the post-attendance template.
fn template_vars(appointment_id: Uuid, session: &ActiveAttendanceSession) -> HashMap<String, String> {
    let mut vars = person_vars(&session.patient_name, session.professional_name.as_deref());
    vars.insert("appointment_id".to_string(), appointment_id.to_string());
    vars
}

/// Close the attendance and hand the follow-up to the trigger worker.
/// The response never waits on, or fails because of, messaging.
pub async fn complete_attendance(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
    Json(session): Json<ActiveAttendanceSession>,
) -> Result<Json<ApiOk<CompleteAttendanceResult>>, ApiError> {
    ensure_staff(&auth)?;

    let duration_min = session
        .started_at
        .map(|s| (Utc::now() - s).num_minutes().max(0));

    tracing::info!(
        appointment_id = %appointment_id,
        user_id = %auth.user_id,
        duration_min = ?duration_min,
        "Attendance completed"
    );

    let queued = state.events.publish(BusinessEvent::AttendanceCompleted {
        appointment_id,
        patient_phone: session.patient_phone.clone(),
        vars: template_vars(appointment_id, &session),
    });

    Ok(Json(ApiOk {
        data: CompleteAttendanceResult {
            ok: true,
            messaging_queued: queued,
        },
    }))
}

/// Record an insole delivery; the check-in and renewal messages are parked
/// until they fall due.
pub async fn insole_delivery(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
    Json(req): Json<InsoleDeliveryRequest>,
) -> Result<Json<ApiOk<CompleteAttendanceResult>>, ApiError> {
    ensure_staff(&auth)?;

    if req.patient_phone.trim().is_empty() {
        return Err(ApiError::validation("patient_phone is required"));
    }

    let mut vars = person_vars(&req.patient_name, None);
    vars.insert("appointment_id".to_string(), appointment_id.to_string());

    let queued = state.events.publish(BusinessEvent::InsoleDelivered {
        appointment_id,
        patient_phone: req.patient_phone,
        delivered_at: req.delivered_at.unwrap_or_else(Utc::now),
        vars,
    });

    tracing::info!(appointment_id = %appointment_id, user_id = %auth.user_id, "Insole delivery recorded");

    Ok(Json(ApiOk {
        data: CompleteAttendanceResult {
            ok: true,
            messaging_queued: queued,
        },
    }))
}

pub async fn get_feedback(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<FeedbackDto>>, ApiError> {
    ensure_staff(&auth)?;

    let feedback = state
        .store
        .get_feedback(appointment_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("NOT_FOUND", "no feedback for this appointment".into()))?;

    let resolved = feedback.feedback_state.is_terminal();
    Ok(Json(ApiOk {
        data: FeedbackDto { feedback, resolved },
    }))
}

pub async fn get_confirmation(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<AppointmentConfirmation>>, ApiError> {
    ensure_staff(&auth)?;

    let data = state
        .store
        .get_confirmation(appointment_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("NOT_FOUND", "no reminder for this appointment".into()))?;

    Ok(Json(ApiOk { data }))
}

pub async fn list_follow_ups(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<Vec<ScheduledFollowUp>>>, ApiError> {
    ensure_staff(&auth)?;

    let data = state.store.list_follow_ups(appointment_id).await?;
    Ok(Json(ApiOk { data }))
}

pub async fn cancel_follow_up(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(follow_up_id): Path<Uuid>,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    ensure_admin_or_manager(&auth)?;

    let cancelled = state
        .store
        .close_follow_up(follow_up_id, FollowUpStatus::Cancelled, None)
        .await?;
    if !cancelled {
        return Err(ApiError::Conflict(
            "FOLLOW_UP_NOT_SCHEDULED",
            "follow-up does not exist or is no longer scheduled".into(),
        ));
    }

    tracing::info!(follow_up_id = %follow_up_id, user_id = %auth.user_id, "Follow-up cancelled");

    Ok(Json(ApiOk {
        data: serde_json::json!({ "follow_up_id": follow_up_id, "status": FollowUpStatus::Cancelled }),
    }))
}
