// src/routes/campaign_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::ApiError,
    messaging::{
        recovery,
        templates::{person_vars, render},
    },
    middleware::auth_context::{ensure_admin_or_manager, ensure_staff, AuthContext},
    models::{
        ApiOk, AppState, CampaignMessage, CampaignRecipient, CampaignWithStats, MessageSearch,
        NewCampaign, RequeueFilter, StatusCounts,
    },
    phone::normalize_phone,
};

/// Recipients accepted in one broadcast.
const MAX_RECIPIENTS: usize = 5000;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/campaigns", post(create_campaign))
        .route("/campaigns/{campaign_id}", get(get_campaign))
        .route("/campaign_messages", get(search_messages))
        .route("/campaign_messages/summary", get(summary))
        .route("/campaign_messages/requeue", post(requeue))
}

#[derive(Debug, Serialize)]
pub struct RequeueResult {
    pub requeued: u64,
}

#[derive(Debug, Deserialize)]
pub struct CreateCampaignRequest {
    pub title: String,
    /// Body with `{nome}`-style placeholders, rendered per recipient.
    pub content: String,
    pub recipients: Vec<RecipientInput>,
}

#[derive(Debug, Deserialize)]
pub struct RecipientInput {
    #[serde(default)]
    pub name: String,
    pub phone: String,
}

#[derive(Debug, Serialize)]
pub struct CreateCampaignResult {
    pub campaign_id: Uuid,
    pub queued: usize,
    pub skipped_invalid: usize,
}

/// Operator broadcast: one pending message per valid recipient. Recipients
/// with unusable phones are skipped and counted.
pub async fn create_campaign(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateCampaignRequest>,
) -> Result<Json<ApiOk<CreateCampaignResult>>, ApiError> {
    ensure_admin_or_manager(&auth)?;

    let title = req.title.trim();
    if title.is_empty() {
        return Err(ApiError::validation("title is required"));
    }
    if req.content.trim().is_empty() {
        return Err(ApiError::validation("content is required"));
    }
    if req.recipients.len() > MAX_RECIPIENTS {
        return Err(ApiError::validation(format!(
            "at most {MAX_RECIPIENTS} recipients per campaign"
        )));
    }

    let country_code = state.engine.country_code();
    let mut recipients: Vec<CampaignRecipient> = Vec::with_capacity(req.recipients.len());
    let mut skipped_invalid = 0;
    for r in &req.recipients {
        let Ok(phone) = normalize_phone(&r.phone, country_code) else {
            skipped_invalid += 1;
            continue;
        };
        if recipients.iter().any(|c| c.phone == phone) {
            continue;
        }
        recipients.push(CampaignRecipient {
            phone,
            content: render(&req.content, &person_vars(&r.name, None)),
        });
    }

    if recipients.is_empty() {
        return Err(ApiError::validation("no recipient has a usable phone number"));
    }

    let new = NewCampaign {
        title: title.to_string(),
        content: req.content.clone(),
        created_by: Some(auth.user_id),
    };
    let campaign = state.store.create_campaign(&new, &recipients).await?;

    tracing::info!(
        campaign_id = %campaign.campaign_id,
        user_id = %auth.user_id,
        queued = recipients.len(),
        skipped_invalid,
        "Campaign created"
    );

    Ok(Json(ApiOk {
        data: CreateCampaignResult {
            campaign_id: campaign.campaign_id,
            queued: recipients.len(),
            skipped_invalid,
        },
    }))
}

pub async fn get_campaign(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(campaign_id): Path<Uuid>,
) -> Result<Json<ApiOk<CampaignWithStats>>, ApiError> {
    ensure_staff(&auth)?;

    let data = state
        .store
        .get_campaign(campaign_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("NOT_FOUND", "campaign not found".into()))?;

    Ok(Json(ApiOk { data }))
}

pub async fn search_messages(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(mut q): Query<MessageSearch>,
) -> Result<Json<ApiOk<Vec<CampaignMessage>>>, ApiError> {
    ensure_staff(&auth)?;

    q.limit = Some(q.limit.unwrap_or(50).clamp(1, 200));
    q.offset = Some(q.offset.unwrap_or(0).max(0));
    q.phone = q
        .phone
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty());

    let data = state.store.search_messages(&q).await?;
    Ok(Json(ApiOk { data }))
}

pub async fn summary(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<StatusCounts>>, ApiError> {
    ensure_staff(&auth)?;

    let data = state.store.status_counts().await?;
    Ok(Json(ApiOk { data }))
}

/// Operator action: move failed messages back to pending.
pub async fn requeue(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(filter): Json<RequeueFilter>,
) -> Result<Json<ApiOk<RequeueResult>>, ApiError> {
    ensure_admin_or_manager(&auth)?;

    if let (Some(from), Some(to)) = (filter.created_from, filter.created_to) {
        if from > to {
            return Err(ApiError::validation("created_from must not be after created_to"));
        }
    }

    let requeued = recovery::requeue_failed(state.store.as_ref(), &filter).await?;

    tracing::info!(
        user_id = %auth.user_id,
        session_token_id = %auth.session_token_id,
        requeued,
        "Requeue requested by operator"
    );

    Ok(Json(ApiOk {
        data: RequeueResult { requeued },
    }))
}
