use crate::models::AppState;
use axum::Router;

pub mod attendance_routes;
pub mod campaign_routes;
pub mod cron_routes;
pub mod template_routes;
pub mod webhook_routes;

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .merge(webhook_routes::router())
        .merge(cron_routes::router())
        .merge(template_routes::router())
        .merge(campaign_routes::router())
        .merge(attendance_routes::router());

    Router::new().nest("/api/v1", api).with_state(state)
}
