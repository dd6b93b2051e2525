// src/messaging/scheduler.rs

//! Periodic driver. Each tick enqueues due reminders and follow-ups, runs one
//! dispatch batch, then sweeps expired prompts.
//!
//! Runs hold no state between ticks. On shutdown an in-flight batch is
//! dropped; its claimed rows stay `pending` and are picked up again once
//! their lease expires.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::dispatch::Dispatcher;
use super::follow_ups::{enqueue_due_follow_ups, FOLLOW_UP_BATCH};
use super::inbound::{expire_past_confirmations, expire_stale_feedback};
use super::reminders::enqueue_upcoming_reminders;
use super::trigger::TriggerEngine;
use crate::store::MessagingStore;

pub struct SchedulerDeps {
    pub dispatcher: Arc<Dispatcher>,
    pub engine: Arc<TriggerEngine>,
    pub store: Arc<dyn MessagingStore>,
    pub interval: Duration,
    pub feedback_expiry_hours: i64,
    pub reminder_lead_hours: i64,
}

pub fn spawn_scheduler(deps: SchedulerDeps, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("Scheduler started (interval: {}s)", deps.interval.as_secs());

        let mut tick = tokio::time::interval(deps.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.changed() => break,
            }

            tokio::select! {
                _ = run_cycle(&deps) => {}
                _ = shutdown.changed() => {
                    tracing::warn!("Shutdown during scheduled run; unfinished messages stay pending");
                    break;
                }
            }
        }

        tracing::info!("Scheduler stopped");
    })
}

async fn run_cycle(deps: &SchedulerDeps) {
    let lead = chrono::Duration::hours(deps.reminder_lead_hours);
    if let Err(e) = enqueue_upcoming_reminders(&deps.engine, deps.store.as_ref(), lead).await {
        tracing::error!(error = %e, "Reminder scan failed; retrying next tick");
    }

    if let Err(e) = enqueue_due_follow_ups(&deps.engine, deps.store.as_ref(), FOLLOW_UP_BATCH).await {
        tracing::error!(error = %e, "Follow-up scan failed; retrying next tick");
    }

    if let Err(e) = deps.dispatcher.run_batch().await {
        tracing::error!(error = %e, "Dispatch run degraded; retrying next tick");
    }

    if let Err(e) = expire_stale_feedback(deps.store.as_ref(), deps.feedback_expiry_hours).await {
        tracing::error!(error = %e, "Feedback expiry sweep failed; retrying next tick");
    }

    if let Err(e) = expire_past_confirmations(deps.store.as_ref()).await {
        tracing::error!(error = %e, "Confirmation expiry sweep failed; retrying next tick");
    }
}
