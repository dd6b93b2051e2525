// src/messaging/trigger.rs

//! Business events in, pending messages out.
//!
//! Request handlers publish onto a bounded channel and return; a single
//! worker task turns events into `campaign_message` rows. A full or closed
//! channel is logged and dropped so the originating action never fails
//! because of messaging.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::templates::{render, resolve_template};
use crate::error::MessagingError;
use crate::models::{NewCampaignMessage, NewFollowUp, ScheduledFollowUp, TriggerType};
use crate::phone::normalize_phone;
use crate::store::{EnqueueOutcome, MessagingStore, OpenPrompt};

/// Insole check-in after delivery.
pub const INSOLE_CHECK_DAYS: i64 = 40;
/// Insole renewal reminder after delivery.
pub const INSOLE_RENEWAL_DAYS: i64 = 380;

#[derive(Debug, Clone)]
pub enum BusinessEvent {
    AttendanceCompleted {
        appointment_id: Uuid,
        patient_phone: String,
        /// Extra placeholder values (patient name, professional, ...).
        vars: HashMap<String, String>,
    },
    /// Appointment inside the reminder window.
    AppointmentUpcoming {
        appointment_id: Uuid,
        patient_phone: String,
        starts_at: DateTime<Utc>,
        vars: HashMap<String, String>,
    },
    /// Patient confirmed by replying to the reminder.
    AppointmentConfirmed {
        appointment_id: Uuid,
        patient_phone: String,
        starts_at: DateTime<Utc>,
    },
    InsoleDelivered {
        appointment_id: Uuid,
        patient_phone: String,
        delivered_at: DateTime<Utc>,
        vars: HashMap<String, String>,
    },
    /// A parked follow-up reached its due time.
    FollowUpDue { follow_up: ScheduledFollowUp },
}

impl BusinessEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BusinessEvent::AttendanceCompleted { .. } => "attendance_completed",
            BusinessEvent::AppointmentUpcoming { .. } => "appointment_upcoming",
            BusinessEvent::AppointmentConfirmed { .. } => "appointment_confirmed",
            BusinessEvent::InsoleDelivered { .. } => "insole_delivered",
            BusinessEvent::FollowUpDue { .. } => "follow_up_due",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Enqueued { message_id: Uuid },
    AlreadyEnqueued { message_id: Uuid },
    /// Follow-ups parked for later; `follow_ups` counts newly created ones.
    Scheduled { follow_ups: u64 },
    SkippedNoTemplate,
    SkippedInvalidPhone,
}

/// Cloneable, non-blocking handle for publishing business events.
#[derive(Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<BusinessEvent>,
}

impl EventPublisher {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<BusinessEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Returns whether the event was accepted onto the queue.
    pub fn publish(&self, event: BusinessEvent) -> bool {
        let name = event.name();
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::error!(event = name, "Trigger queue full; event dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::error!(event = name, "Trigger worker stopped; event dropped");
                false
            }
        }
    }
}

pub struct TriggerEngine {
    store: Arc<dyn MessagingStore>,
    country_code: String,
    clinic_offset: FixedOffset,
}

impl TriggerEngine {
    pub fn new(store: Arc<dyn MessagingStore>, country_code: String) -> Self {
        Self {
            store,
            country_code,
            clinic_offset: Utc.fix(),
        }
    }

    pub fn country_code(&self) -> &str {
        &self.country_code
    }

    /// Local time used for `{data}` and `{horario}`.
    pub fn with_clinic_offset(mut self, offset: FixedOffset) -> Self {
        self.clinic_offset = offset;
        self
    }

    /// Turn one event into at most one pending message per
    /// `(appointment_id, trigger_type)`. Re-firing the same event is a no-op.
    pub async fn handle(&self, event: BusinessEvent) -> Result<TriggerOutcome, MessagingError> {
        match event {
            BusinessEvent::AttendanceCompleted {
                appointment_id,
                patient_phone,
                vars,
            } => {
                self.enqueue(
                    TriggerType::PostAttendance,
                    appointment_id,
                    &patient_phone,
                    vars,
                    Some(OpenPrompt::Feedback),
                )
                .await
            }
            BusinessEvent::AppointmentUpcoming {
                appointment_id,
                patient_phone,
                starts_at,
                mut vars,
            } => {
                self.add_schedule_vars(&mut vars, starts_at);
                self.enqueue(
                    TriggerType::AppointmentReminder,
                    appointment_id,
                    &patient_phone,
                    vars,
                    Some(OpenPrompt::Confirmation { starts_at }),
                )
                .await
            }
            BusinessEvent::AppointmentConfirmed {
                appointment_id,
                patient_phone,
                starts_at,
            } => {
                let mut vars = HashMap::new();
                self.add_schedule_vars(&mut vars, starts_at);
                self.enqueue(
                    TriggerType::AppointmentConfirmation,
                    appointment_id,
                    &patient_phone,
                    vars,
                    None,
                )
                .await
            }
            BusinessEvent::InsoleDelivered {
                appointment_id,
                patient_phone,
                delivered_at,
                vars,
            } => {
                self.schedule_insole_follow_ups(appointment_id, &patient_phone, delivered_at, vars)
                    .await
            }
            BusinessEvent::FollowUpDue { follow_up } => {
                self.enqueue(
                    follow_up.trigger_type,
                    follow_up.appointment_id,
                    &follow_up.patient_phone,
                    follow_up.vars,
                    None,
                )
                .await
            }
        }
    }

    fn add_schedule_vars(&self, vars: &mut HashMap<String, String>, starts_at: DateTime<Utc>) {
        let local = starts_at.with_timezone(&self.clinic_offset);
        vars.entry("data".into())
            .or_insert_with(|| local.format("%d/%m/%Y").to_string());
        vars.entry("horario".into())
            .or_insert_with(|| local.format("%H:%M").to_string());
    }

    fn usable_phone(&self, raw: &str, appointment_id: Uuid, trigger: TriggerType) -> Option<String> {
        match normalize_phone(raw, &self.country_code) {
            Ok(p) => Some(p),
            Err(e) => {
                tracing::warn!(
                    appointment_id = %appointment_id,
                    trigger_type = %trigger,
                    error = %e,
                    "Skipping message: unusable phone"
                );
                None
            }
        }
    }

    async fn enqueue(
        &self,
        trigger: TriggerType,
        appointment_id: Uuid,
        raw_phone: &str,
        mut vars: HashMap<String, String>,
        prompt: Option<OpenPrompt>,
    ) -> Result<TriggerOutcome, MessagingError> {
        let Some(phone) = self.usable_phone(raw_phone, appointment_id, trigger) else {
            return Ok(TriggerOutcome::SkippedInvalidPhone);
        };

        let template = match resolve_template(self.store.as_ref(), trigger).await {
            Ok(t) => t,
            Err(MessagingError::TemplateNotFound(t)) => {
                tracing::info!(
                    appointment_id = %appointment_id,
                    trigger_type = %t,
                    "No active template; nothing enqueued"
                );
                return Ok(TriggerOutcome::SkippedNoTemplate);
            }
            Err(e) => return Err(e),
        };

        vars.entry("appointment_id".into())
            .or_insert_with(|| appointment_id.to_string());

        let msg = NewCampaignMessage {
            phone,
            template_id: Some(template.template_id),
            appointment_id: Some(appointment_id),
            campaign_id: None,
            trigger_type: trigger,
            content: render(&template.content, &vars),
        };

        let outcome = match self.store.enqueue_message(&msg, prompt).await? {
            EnqueueOutcome::Created { message_id } => {
                tracing::info!(
                    message_id = %message_id,
                    appointment_id = %appointment_id,
                    trigger_type = %trigger,
                    "Message enqueued"
                );
                TriggerOutcome::Enqueued { message_id }
            }
            EnqueueOutcome::Duplicate { message_id } => {
                tracing::debug!(
                    message_id = %message_id,
                    appointment_id = %appointment_id,
                    trigger_type = %trigger,
                    "Event already handled; skipping"
                );
                TriggerOutcome::AlreadyEnqueued { message_id }
            }
        };

        Ok(outcome)
    }

    async fn schedule_insole_follow_ups(
        &self,
        appointment_id: Uuid,
        raw_phone: &str,
        delivered_at: DateTime<Utc>,
        mut vars: HashMap<String, String>,
    ) -> Result<TriggerOutcome, MessagingError> {
        let Some(phone) = self.usable_phone(raw_phone, appointment_id, TriggerType::InsoleDelivery)
        else {
            return Ok(TriggerOutcome::SkippedInvalidPhone);
        };

        vars.entry("appointment_id".into())
            .or_insert_with(|| appointment_id.to_string());

        let items: Vec<NewFollowUp> = [
            (TriggerType::InsoleDelivery, INSOLE_CHECK_DAYS),
            (TriggerType::InsoleMaintenance, INSOLE_RENEWAL_DAYS),
        ]
        .into_iter()
        .map(|(trigger_type, days)| NewFollowUp {
            appointment_id,
            trigger_type,
            patient_phone: phone.clone(),
            vars: vars.clone(),
            due_at: delivered_at + chrono::Duration::days(days),
        })
        .collect();

        let created = self.store.schedule_follow_ups(&items).await?;
        tracing::info!(
            appointment_id = %appointment_id,
            created,
            "Insole follow-ups scheduled"
        );

        Ok(TriggerOutcome::Scheduled { follow_ups: created })
    }
}

/// Drain the event queue until every publisher is dropped.
pub fn spawn_trigger_worker(
    engine: Arc<TriggerEngine>,
    mut rx: mpsc::Receiver<BusinessEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("Trigger worker started");

        while let Some(event) = rx.recv().await {
            let name = event.name();
            if let Err(e) = engine.handle(event).await {
                tracing::error!(event = name, error = %e, "Failed to handle business event");
            }
        }

        tracing::info!("Trigger worker stopped");
    })
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::models::{ConfirmationState, FeedbackState, FollowUpStatus, MessageStatus};
    use crate::store::memory::MemoryStore;

    fn completed(appointment_id: Uuid, phone: &str, name: &str) -> BusinessEvent {
        let mut vars = HashMap::new();
        vars.insert("name".to_string(), name.to_string());
        BusinessEvent::AttendanceCompleted {
            appointment_id,
            patient_phone: phone.to_string(),
            vars,
        }
    }

    async fn store_with_template(content: &str) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_template_at(TriggerType::PostAttendance, content, Utc::now())
            .await;
        store
    }

    #[tokio::test]
    async fn attendance_completed_enqueues_rendered_message() {
        let store = store_with_template("Hi {name}, rate 1-5").await;
        let engine = TriggerEngine::new(store.clone(), "55".into());
        let appt = Uuid::new_v4();

        let outcome = engine
            .handle(completed(appt, "+5531999999999", "Dr. M"))
            .await
            .unwrap();
        assert!(matches!(outcome, TriggerOutcome::Enqueued { .. }));

        let messages = store.messages().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, MessageStatus::Pending);
        assert_eq!(messages[0].content, "Hi Dr. M, rate 1-5");
        assert_eq!(messages[0].phone, "5531999999999");
        assert_eq!(messages[0].appointment_id, Some(appt));

        let fb = store.get_feedback(appt).await.unwrap().unwrap();
        assert_eq!(fb.feedback_state, FeedbackState::AwaitingReply);
        assert_eq!(fb.patient_phone, "5531999999999");
    }

    #[tokio::test]
    async fn refiring_same_appointment_is_idempotent() {
        let store = store_with_template("Hi {name}").await;
        let engine = TriggerEngine::new(store.clone(), "55".into());
        let appt = Uuid::new_v4();

        let first = engine.handle(completed(appt, "31999999999", "Ana")).await.unwrap();
        let second = engine.handle(completed(appt, "31999999999", "Ana")).await.unwrap();

        let TriggerOutcome::Enqueued { message_id } = first else {
            panic!("first event should enqueue, got {first:?}");
        };
        assert_eq!(second, TriggerOutcome::AlreadyEnqueued { message_id });
        assert_eq!(store.messages().await.len(), 1);

        let open: Vec<_> = store
            .all_feedback()
            .await
            .into_iter()
            .filter(|f| f.feedback_state == FeedbackState::AwaitingReply)
            .collect();
        assert_eq!(open.len(), 1);
    }

    #[tokio::test]
    async fn missing_template_skips_without_error() {
        let store = Arc::new(MemoryStore::new());
        let engine = TriggerEngine::new(store.clone(), "55".into());

        let outcome = engine
            .handle(completed(Uuid::new_v4(), "31999999999", "Ana"))
            .await
            .unwrap();
        assert_eq!(outcome, TriggerOutcome::SkippedNoTemplate);
        assert!(store.messages().await.is_empty());
        assert!(store.all_feedback().await.is_empty());
    }

    #[tokio::test]
    async fn unusable_phone_skips_without_error() {
        let store = store_with_template("Hi").await;
        let engine = TriggerEngine::new(store.clone(), "55".into());

        let outcome = engine
            .handle(completed(Uuid::new_v4(), "n/a", "Ana"))
            .await
            .unwrap();
        assert_eq!(outcome, TriggerOutcome::SkippedInvalidPhone);
        assert!(store.messages().await.is_empty());
    }

    #[tokio::test]
    async fn worker_drains_published_events() {
        let store = store_with_template("Hi {name}").await;
        let engine = Arc::new(TriggerEngine::new(store.clone(), "55".into()));
        let (publisher, rx) = EventPublisher::channel(8);
        let handle = spawn_trigger_worker(engine, rx);

        assert!(publisher.publish(completed(Uuid::new_v4(), "31999999999", "Ana")));
        assert!(publisher.publish(completed(Uuid::new_v4(), "31988888888", "Bia")));
        drop(publisher);
        handle.await.unwrap();

        assert_eq!(store.messages().await.len(), 2);
    }

    #[tokio::test]
    async fn publish_never_blocks_when_queue_is_full() {
        let (publisher, _rx) = EventPublisher::channel(1);
        assert!(publisher.publish(completed(Uuid::new_v4(), "31999999999", "Ana")));
        assert!(!publisher.publish(completed(Uuid::new_v4(), "31999999999", "Ana")));
    }

    #[tokio::test]
    async fn upcoming_appointment_opens_confirmation_with_local_time() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_template_at(
                TriggerType::AppointmentReminder,
                "{paciente}, sua consulta é {data} às {horario}. Responda SIM.",
                Utc::now(),
            )
            .await;
        let brt = FixedOffset::west_opt(3 * 3600).unwrap();
        let engine = TriggerEngine::new(store.clone(), "55".into()).with_clinic_offset(brt);
        let appt = Uuid::new_v4();
        let starts_at = Utc.with_ymd_and_hms(2026, 3, 10, 13, 30, 0).unwrap();

        let mut vars = HashMap::new();
        vars.insert("paciente".to_string(), "Ana".to_string());
        let outcome = engine
            .handle(BusinessEvent::AppointmentUpcoming {
                appointment_id: appt,
                patient_phone: "31999999999".into(),
                starts_at,
                vars,
            })
            .await
            .unwrap();
        assert!(matches!(outcome, TriggerOutcome::Enqueued { .. }));

        let messages = store.messages().await;
        assert_eq!(messages[0].trigger_type, TriggerType::AppointmentReminder);
        assert_eq!(
            messages[0].content,
            "Ana, sua consulta é 10/03/2026 às 10:30. Responda SIM."
        );

        let c = store.get_confirmation(appt).await.unwrap().unwrap();
        assert_eq!(c.confirmation_state, ConfirmationState::AwaitingConfirmation);
        assert_eq!(c.starts_at, starts_at);
        assert!(store.get_feedback(appt).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn confirmation_acknowledgement_opens_no_prompt() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_template_at(TriggerType::AppointmentConfirmation, "Confirmado: {data}", Utc::now())
            .await;
        let engine = TriggerEngine::new(store.clone(), "55".into());
        let appt = Uuid::new_v4();
        let starts_at = Utc.with_ymd_and_hms(2026, 3, 10, 13, 30, 0).unwrap();

        let event = BusinessEvent::AppointmentConfirmed {
            appointment_id: appt,
            patient_phone: "5531999999999".into(),
            starts_at,
        };
        engine.handle(event.clone()).await.unwrap();
        assert!(matches!(
            engine.handle(event).await.unwrap(),
            TriggerOutcome::AlreadyEnqueued { .. }
        ));

        let messages = store.messages().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "Confirmado: 10/03/2026");
        assert!(store.get_confirmation(appt).await.unwrap().is_none());
        assert!(store.get_feedback(appt).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn insole_delivery_parks_check_in_and_renewal() {
        let store = Arc::new(MemoryStore::new());
        let engine = TriggerEngine::new(store.clone(), "55".into());
        let appt = Uuid::new_v4();
        let delivered_at = Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap();
        let event = BusinessEvent::InsoleDelivered {
            appointment_id: appt,
            patient_phone: "31999999999".into(),
            delivered_at,
            vars: HashMap::new(),
        };

        assert_eq!(
            engine.handle(event.clone()).await.unwrap(),
            TriggerOutcome::Scheduled { follow_ups: 2 }
        );
        assert_eq!(
            engine.handle(event).await.unwrap(),
            TriggerOutcome::Scheduled { follow_ups: 0 }
        );
        assert!(store.messages().await.is_empty());

        let follow_ups = store.list_follow_ups(appt).await.unwrap();
        assert_eq!(follow_ups.len(), 2);
        assert_eq!(follow_ups[0].trigger_type, TriggerType::InsoleDelivery);
        assert_eq!(follow_ups[0].due_at, delivered_at + chrono::Duration::days(40));
        assert_eq!(follow_ups[1].trigger_type, TriggerType::InsoleMaintenance);
        assert_eq!(follow_ups[1].due_at, delivered_at + chrono::Duration::days(380));
        assert!(follow_ups.iter().all(|f| f.status == FollowUpStatus::Scheduled));
        assert_eq!(follow_ups[0].patient_phone, "5531999999999");
    }

    #[tokio::test]
    async fn due_follow_up_becomes_a_message() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_template_at(TriggerType::InsoleDelivery, "Oi {paciente}, como estão as palmilhas?", Utc::now())
            .await;
        let engine = TriggerEngine::new(store.clone(), "55".into());
        let appt = Uuid::new_v4();
        let mut vars = HashMap::new();
        vars.insert("paciente".to_string(), "Bia".to_string());
        engine
            .handle(BusinessEvent::InsoleDelivered {
                appointment_id: appt,
                patient_phone: "31999999999".into(),
                delivered_at: Utc::now() - chrono::Duration::days(41),
                vars,
            })
            .await
            .unwrap();

        let due = store.due_follow_ups(Utc::now(), 20).await.unwrap();
        assert_eq!(due.len(), 1);
        let outcome = engine
            .handle(BusinessEvent::FollowUpDue {
                follow_up: due[0].clone(),
            })
            .await
            .unwrap();
        assert!(matches!(outcome, TriggerOutcome::Enqueued { .. }));

        let messages = store.messages().await;
        assert_eq!(messages[0].content, "Oi Bia, como estão as palmilhas?");
        assert_eq!(messages[0].trigger_type, TriggerType::InsoleDelivery);
    }
}
