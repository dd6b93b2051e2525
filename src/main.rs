mod auth;
mod config;
mod gateway;
mod messaging;
mod middleware;
mod phone;
mod store;

mod db;
mod error;
mod models;
mod routes;

use std::sync::Arc;
use std::time::Duration;

use crate::{
    config::{clinic_offset, Config},
    messaging::{
        dispatch::Dispatcher,
        inbound::InboundHandler,
        scheduler::{spawn_scheduler, SchedulerDeps},
        trigger::{spawn_trigger_worker, EventPublisher, TriggerEngine},
    },
    models::AppState,
    phone::normalize_phone,
    store::{pg::PgStore, MessagingStore},
};

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use axum::http::header;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cfg = Config::from_env()?;
    let pool = db::connect_pg(
        &cfg.database_url,
        cfg.db_max_connections,
        cfg.db_acquire_timeout_secs,
    )
    .await?;
    db::run_migrations(&pool).await?;

    let store: Arc<dyn MessagingStore> = Arc::new(PgStore::new(pool));

    let safe_number = cfg
        .test_mode_safe_number
        .as_deref()
        .map(|n| normalize_phone(n, &cfg.default_country_code))
        .transpose()?;
    let gateway = gateway::build_gateway(
        &cfg.gateway,
        Duration::from_secs(cfg.dispatch.send_timeout_secs),
        safe_number,
    )?;
    tracing::info!(provider = gateway.name(), "Messaging gateway ready");

    let dispatcher = Arc::new(Dispatcher::new(store.clone(), gateway, cfg.dispatch.clone()));
    let engine = Arc::new(
        TriggerEngine::new(store.clone(), cfg.default_country_code.clone())
            .with_clinic_offset(clinic_offset(cfg.clinic_utc_offset_minutes)?),
    );
    let inbound = Arc::new(InboundHandler::new(
        store.clone(),
        engine.clone(),
        cfg.default_country_code.clone(),
    ));

    let (events, events_rx) = EventPublisher::channel(cfg.event_queue_capacity);
    let trigger_worker = spawn_trigger_worker(engine.clone(), events_rx);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = spawn_scheduler(
        SchedulerDeps {
            dispatcher: dispatcher.clone(),
            engine: engine.clone(),
            store: store.clone(),
            interval: Duration::from_secs(cfg.scheduler_interval_secs),
            feedback_expiry_hours: cfg.feedback_expiry_hours,
            reminder_lead_hours: cfg.reminder_lead_hours,
        },
        shutdown_rx,
    );

    let state = AppState {
        store,
        dispatcher,
        inbound,
        engine,
        events,
        feedback_expiry_hours: cfg.feedback_expiry_hours,
        reminder_lead_hours: cfg.reminder_lead_hours,
        webhook_token: cfg.webhook_token.clone(),
        cron_secret: cfg.cron_secret.clone(),
    };

    // Browser clients (the clinic frontend) call the operator endpoints directly.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
        ]);

    let app = routes::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    tracing::info!("Listening on http://{}", cfg.bind_addr);
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Router (and with it the last event publisher) is gone: the trigger
    // worker drains what is queued and exits.
    shutdown_tx.send(true).ok();
    scheduler.await.ok();
    if tokio::time::timeout(Duration::from_secs(10), trigger_worker)
        .await
        .is_err()
    {
        tracing::warn!("Trigger worker did not drain in time; remaining events dropped");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
