// src/messaging/reminders.rs

//! Appointment reminders: every clinic appointment starting within the lead
//! window gets one reminder asking the patient to confirm.

use chrono::Utc;
use serde::Serialize;

use super::templates::person_vars;
use super::trigger::{BusinessEvent, TriggerEngine, TriggerOutcome};
use crate::error::StoreError;
use crate::store::MessagingStore;

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ReminderSummary {
    pub found: usize,
    pub enqueued: usize,
    pub skipped: usize,
}

/// Enqueue reminders for appointments starting in `(now, now + lead]`.
/// Appointments that already have one are not returned by the store, and
/// enqueue is idempotent, so overlapping runs are harmless.
pub async fn enqueue_upcoming_reminders(
    engine: &TriggerEngine,
    store: &dyn MessagingStore,
    lead: chrono::Duration,
) -> Result<ReminderSummary, StoreError> {
    let now = Utc::now();
    let upcoming = store.upcoming_appointments(now, now + lead).await?;

    let mut summary = ReminderSummary {
        found: upcoming.len(),
        ..Default::default()
    };

    for appt in upcoming {
        let vars = person_vars(&appt.patient_name, appt.professional_name.as_deref());
        let event = BusinessEvent::AppointmentUpcoming {
            appointment_id: appt.appointment_id,
            patient_phone: appt.patient_phone,
            starts_at: appt.starts_at,
            vars,
        };

        match engine.handle(event).await {
            Ok(TriggerOutcome::Enqueued { .. }) => summary.enqueued += 1,
            Ok(_) => summary.skipped += 1,
            Err(e) => {
                tracing::error!(
                    appointment_id = %appt.appointment_id,
                    error = %e,
                    "Failed to enqueue appointment reminder"
                );
                summary.skipped += 1;
            }
        }
    }

    if summary.found > 0 {
        tracing::info!(
            found = summary.found,
            enqueued = summary.enqueued,
            skipped = summary.skipped,
            "Appointment reminders processed"
        );
    }

    Ok(summary)
}
