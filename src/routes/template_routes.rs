// src/routes/template_routes.rs

use axum::{
    extract::{Path, State},
    routing::{get, patch},
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::{ensure_admin_or_manager, ensure_staff, AuthContext},
    models::{ApiOk, AppState, MessageTemplate, NewTemplate, TemplatePatch, TriggerType},
};

const MAX_TITLE_LEN: usize = 120;
const MAX_CONTENT_LEN: usize = 4000;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/message_templates", get(list_templates).post(create_template))
        .route("/message_templates/{template_id}", patch(patch_template))
}

#[derive(Debug, Deserialize)]
pub struct CreateTemplateRequest {
    pub title: String,
    pub trigger_type: TriggerType,
    pub content: String,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct PatchTemplateRequest {
    pub title: Option<String>,
    pub content: Option<String>,
    pub is_active: Option<bool>,
}

fn validate_title(title: &str) -> Result<String, ApiError> {
    let t = title.trim();
    if t.is_empty() {
        return Err(ApiError::validation("title is required"));
    }
    if t.chars().count() > MAX_TITLE_LEN {
        return Err(ApiError::validation(format!(
            "title must be at most {MAX_TITLE_LEN} characters"
        )));
    }
    Ok(t.to_string())
}

fn validate_content(content: &str) -> Result<String, ApiError> {
    if content.trim().is_empty() {
        return Err(ApiError::validation("content is required"));
    }
    if content.chars().count() > MAX_CONTENT_LEN {
        return Err(ApiError::validation(format!(
            "content must be at most {MAX_CONTENT_LEN} characters"
        )));
    }
    Ok(content.to_string())
}

pub async fn list_templates(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<Vec<MessageTemplate>>>, ApiError> {
    ensure_staff(&auth)?;

    let data = state.store.list_templates().await?;
    Ok(Json(ApiOk { data }))
}

pub async fn create_template(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateTemplateRequest>,
) -> Result<Json<ApiOk<MessageTemplate>>, ApiError> {
    ensure_admin_or_manager(&auth)?;

    let new = NewTemplate {
        title: validate_title(&req.title)?,
        trigger_type: req.trigger_type,
        content: validate_content(&req.content)?,
        is_active: req.is_active.unwrap_or(true),
    };

    let tpl = state.store.create_template(&new).await?;

    tracing::info!(
        template_id = %tpl.template_id,
        trigger_type = %tpl.trigger_type,
        user_id = %auth.user_id,
        "Message template created"
    );

    Ok(Json(ApiOk { data: tpl }))
}

pub async fn patch_template(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(template_id): Path<Uuid>,
    Json(req): Json<PatchTemplateRequest>,
) -> Result<Json<ApiOk<MessageTemplate>>, ApiError> {
    ensure_admin_or_manager(&auth)?;

    if req.title.is_none() && req.content.is_none() && req.is_active.is_none() {
        return Err(ApiError::validation("nothing to update"));
    }

    let patch = TemplatePatch {
        title: req.title.as_deref().map(validate_title).transpose()?,
        content: req.content.as_deref().map(validate_content).transpose()?,
        is_active: req.is_active,
    };

    let tpl = state
        .store
        .update_template(template_id, &patch)
        .await?
        .ok_or_else(|| ApiError::NotFound("NOT_FOUND", "template not found".into()))?;

    tracing::info!(
        template_id = %tpl.template_id,
        is_active = tpl.is_active,
        user_id = %auth.user_id,
        "Message template updated"
    );

    Ok(Json(ApiOk { data: tpl }))
}
