// src/messaging/follow_ups.rs

//! Parked follow-ups (insole check-in and renewal) that reached their due
//! time are turned into pending messages.
//!
//! ```text
//! scheduled --due, enqueued--> enqueued
//!           --no template / bad phone--> skipped
//!           --operator--> cancelled
//! ```

use chrono::Utc;
use serde::Serialize;

use super::trigger::{BusinessEvent, TriggerEngine, TriggerOutcome};
use crate::error::StoreError;
use crate::models::FollowUpStatus;
use crate::store::MessagingStore;

/// Due follow-ups handled per run.
pub const FOLLOW_UP_BATCH: i64 = 20;

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct FollowUpSummary {
    pub processed: usize,
    pub enqueued: usize,
    pub skipped: usize,
}

pub async fn enqueue_due_follow_ups(
    engine: &TriggerEngine,
    store: &dyn MessagingStore,
    limit: i64,
) -> Result<FollowUpSummary, StoreError> {
    let due = store.due_follow_ups(Utc::now(), limit).await?;
    let mut summary = FollowUpSummary::default();

    for follow_up in due {
        let id = follow_up.follow_up_id;
        let trigger = follow_up.trigger_type;

        let (to, message_id) = match engine.handle(BusinessEvent::FollowUpDue { follow_up }).await {
            Ok(TriggerOutcome::Enqueued { message_id })
            | Ok(TriggerOutcome::AlreadyEnqueued { message_id }) => {
                (FollowUpStatus::Enqueued, Some(message_id))
            }
            Ok(_) => (FollowUpStatus::Skipped, None),
            Err(e) => {
                // Left scheduled; the next run tries again.
                tracing::error!(follow_up_id = %id, error = %e, "Failed to enqueue follow-up");
                continue;
            }
        };

        match store.close_follow_up(id, to, message_id).await {
            Ok(true) => {
                summary.processed += 1;
                match to {
                    FollowUpStatus::Enqueued => summary.enqueued += 1,
                    _ => summary.skipped += 1,
                }
                tracing::info!(follow_up_id = %id, trigger_type = %trigger, status = %to, "Follow-up closed");
            }
            Ok(false) => {
                tracing::debug!(follow_up_id = %id, "Follow-up already closed by another run");
            }
            Err(e) => {
                tracing::error!(follow_up_id = %id, error = %e, "Could not record follow-up outcome");
            }
        }
    }

    Ok(summary)
}
