// src/messaging/inbound.rs

//! Gateway callbacks: patient replies to feedback and confirmation prompts.
//!
//! A reply goes to the newest open prompt for the phone.
//!
//! ```text
//! feedback:      awaiting_reply --"1"--> replied_positive
//!                               --"2"--> replied_negative
//!                               --else-> unrecognized
//!                               --horizon after send--> expired
//!
//! confirmation:  awaiting_confirmation --keyword--> confirmed
//!                                      --appointment start passed--> expired
//! ```
//!
//! Every non-initial state is terminal. A confirmation prompt stays open on
//! replies that are not a confirmation. A reply with no open record is kept
//! in `inbound_event` for audit and changes nothing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::trigger::{BusinessEvent, TriggerEngine};
use crate::error::{MessagingError, StoreError};
use crate::models::{
    AppointmentConfirmation, AttendanceFeedback, FeedbackState, InboundDisposition, InboundEvent,
};
use crate::phone::normalize_phone;
use crate::store::MessagingStore;

const CONFIRMATION_KEYWORDS: &[&str] = &["1", "sim", "confirmar", "confirmo", "confirmado", "ok", "yes"];
const NEGATIONS: &[&str] = &["não", "nao", "no"];
/// Longer replies only count when they are exactly a keyword.
const SHORT_REPLY_CHARS: usize = 30;

/// Webhook body as delivered by the gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundPayload {
    pub phone: Option<String>,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub from_me: bool,
    pub message: Option<InboundMessage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub text: Option<String>,
    #[serde(default)]
    pub from_me: bool,
}

/// A payload that passed validation.
#[derive(Debug, Clone)]
pub struct InboundReply {
    pub phone: String,
    pub is_group: bool,
    pub from_me: bool,
    pub text: String,
    pub raw: Value,
}

/// Validate a raw webhook body. Only this step can reject a delivery.
pub fn parse_payload(body: &[u8]) -> Result<InboundReply, MessagingError> {
    let raw: Value = serde_json::from_slice(body)
        .map_err(|e| MessagingError::MalformedWebhookPayload(format!("invalid JSON: {e}")))?;

    let payload: InboundPayload = serde_json::from_value(raw.clone())
        .map_err(|e| MessagingError::MalformedWebhookPayload(e.to_string()))?;

    let phone = payload
        .phone
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .ok_or_else(|| MessagingError::MalformedWebhookPayload("missing phone".into()))?;

    let message = payload
        .message
        .ok_or_else(|| MessagingError::MalformedWebhookPayload("missing message".into()))?;

    let text = message
        .text
        .ok_or_else(|| MessagingError::MalformedWebhookPayload("missing message.text".into()))?;

    Ok(InboundReply {
        phone,
        is_group: payload.is_group,
        from_me: payload.from_me || message.from_me,
        text,
        raw,
    })
}

/// Map reply text to the feedback state it produces.
pub fn classify_reply(text: &str) -> FeedbackState {
    match text.trim() {
        "1" => FeedbackState::RepliedPositive,
        "2" => FeedbackState::RepliedNegative,
        _ => FeedbackState::Unrecognized,
    }
}

/// Whether a reply to a reminder confirms the appointment.
pub fn is_confirmation(text: &str) -> bool {
    let text = text.trim().to_lowercase();
    if CONFIRMATION_KEYWORDS.contains(&text.as_str()) {
        return true;
    }
    if text.chars().count() > SHORT_REPLY_CHARS {
        return false;
    }

    let words: Vec<&str> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    if words.iter().any(|w| NEGATIONS.contains(w)) {
        return false;
    }

    words.iter().any(|w| CONFIRMATION_KEYWORDS.contains(w)) || text.contains('👍')
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum InboundOutcome {
    Applied {
        appointment_id: Uuid,
        feedback_state: FeedbackState,
    },
    Confirmed { appointment_id: Uuid },
    /// Open reminder, but the reply did not confirm it.
    NotAConfirmation { appointment_id: Uuid },
    Unmatched,
    IgnoredGroup,
    IgnoredSelf,
    /// Another delivery resolved the record first.
    Duplicate { appointment_id: Uuid },
    /// Processing failed internally; the gateway is still acknowledged.
    Error,
}

enum OpenPromptRecord {
    Feedback(AttendanceFeedback),
    Confirmation(AppointmentConfirmation),
}

/// Outcome plus the audit detail recorded with it.
type ApplyResult = (InboundOutcome, Option<String>);

pub struct InboundHandler {
    store: Arc<dyn MessagingStore>,
    engine: Arc<TriggerEngine>,
    country_code: String,
}

impl InboundHandler {
    pub fn new(
        store: Arc<dyn MessagingStore>,
        engine: Arc<TriggerEngine>,
        country_code: String,
    ) -> Self {
        Self {
            store,
            engine,
            country_code,
        }
    }

    /// Process a validated reply. Never fails: internal errors are logged and
    /// reported as `InboundOutcome::Error`.
    pub async fn handle(&self, reply: InboundReply) -> InboundOutcome {
        let received_at = Utc::now();

        match self.apply(&reply, received_at).await {
            Ok((outcome, detail)) => {
                self.audit(&reply, &outcome, detail, received_at).await;
                outcome
            }
            Err(e) => {
                tracing::error!(phone = %reply.phone, error = %e, "Inbound reply processing failed");
                self.audit(&reply, &InboundOutcome::Error, Some(e.to_string()), received_at)
                    .await;
                InboundOutcome::Error
            }
        }
    }

    async fn apply(
        &self,
        reply: &InboundReply,
        at: DateTime<Utc>,
    ) -> Result<ApplyResult, MessagingError> {
        if reply.is_group {
            return Ok((InboundOutcome::IgnoredGroup, None));
        }
        if reply.from_me {
            return Ok((InboundOutcome::IgnoredSelf, None));
        }

        let phone = normalize_phone(&reply.phone, &self.country_code)?;

        let feedback = self.store.open_feedback_for_phone(&phone).await?;
        let confirmation = self.store.open_confirmation_for_phone(&phone).await?;

        let open = match (feedback, confirmation) {
            (Some(f), Some(c)) if c.created_at > f.created_at => OpenPromptRecord::Confirmation(c),
            (Some(f), _) => OpenPromptRecord::Feedback(f),
            (None, Some(c)) => OpenPromptRecord::Confirmation(c),
            (None, None) => {
                let unmatched = MessagingError::UnmatchedReply(phone);
                tracing::info!(reason = %unmatched, "Reply archived without state change");
                return Ok((InboundOutcome::Unmatched, Some(unmatched.to_string())));
            }
        };

        match open {
            OpenPromptRecord::Feedback(f) => self.apply_feedback(f, reply, at).await,
            OpenPromptRecord::Confirmation(c) => self.apply_confirmation(c, reply, at).await,
        }
    }

    async fn apply_feedback(
        &self,
        open: AttendanceFeedback,
        reply: &InboundReply,
        at: DateTime<Utc>,
    ) -> Result<ApplyResult, MessagingError> {
        let to = classify_reply(&reply.text);
        let won = self
            .store
            .resolve_feedback(open.appointment_id, to, reply.text.trim(), at)
            .await?;

        if !won {
            return Ok((
                InboundOutcome::Duplicate {
                    appointment_id: open.appointment_id,
                },
                Some("feedback already resolved".into()),
            ));
        }

        tracing::info!(
            appointment_id = %open.appointment_id,
            feedback_state = %to,
            "Feedback reply applied"
        );

        Ok((
            InboundOutcome::Applied {
                appointment_id: open.appointment_id,
                feedback_state: to,
            },
            None,
        ))
    }

    async fn apply_confirmation(
        &self,
        open: AppointmentConfirmation,
        reply: &InboundReply,
        at: DateTime<Utc>,
    ) -> Result<ApplyResult, MessagingError> {
        let appointment_id = open.appointment_id;

        if !is_confirmation(&reply.text) {
            tracing::info!(appointment_id = %appointment_id, "Reply to reminder is not a confirmation");
            return Ok((InboundOutcome::NotAConfirmation { appointment_id }, None));
        }

        let won = self
            .store
            .confirm_appointment(appointment_id, reply.text.trim(), at)
            .await?;
        if !won {
            return Ok((
                InboundOutcome::Duplicate { appointment_id },
                Some("confirmation already resolved".into()),
            ));
        }

        tracing::info!(appointment_id = %appointment_id, "Appointment confirmed by patient");

        let ack = BusinessEvent::AppointmentConfirmed {
            appointment_id,
            patient_phone: open.patient_phone,
            starts_at: open.starts_at,
        };
        if let Err(e) = self.engine.handle(ack).await {
            tracing::error!(
                appointment_id = %appointment_id,
                error = %e,
                "Failed to enqueue confirmation acknowledgement"
            );
        }

        Ok((InboundOutcome::Confirmed { appointment_id }, None))
    }

    async fn audit(
        &self,
        reply: &InboundReply,
        outcome: &InboundOutcome,
        detail: Option<String>,
        received_at: DateTime<Utc>,
    ) {
        let (disposition, appointment_id) = match outcome {
            InboundOutcome::Applied { appointment_id, .. } => {
                (InboundDisposition::Applied, Some(*appointment_id))
            }
            InboundOutcome::Confirmed { appointment_id } => {
                (InboundDisposition::Confirmed, Some(*appointment_id))
            }
            InboundOutcome::NotAConfirmation { appointment_id } => {
                (InboundDisposition::NotAConfirmation, Some(*appointment_id))
            }
            InboundOutcome::Duplicate { appointment_id } => {
                (InboundDisposition::Duplicate, Some(*appointment_id))
            }
            InboundOutcome::Unmatched => (InboundDisposition::Unmatched, None),
            InboundOutcome::IgnoredGroup => (InboundDisposition::IgnoredGroup, None),
            InboundOutcome::IgnoredSelf => (InboundDisposition::IgnoredSelf, None),
            InboundOutcome::Error => (InboundDisposition::Error, None),
        };

        let event = InboundEvent {
            inbound_event_id: Uuid::new_v4(),
            phone: reply.phone.clone(),
            is_group: reply.is_group,
            text: Some(reply.text.clone()),
            disposition,
            appointment_id,
            detail,
            payload: reply.raw.clone(),
            received_at,
        };

        if let Err(e) = self.store.record_inbound(&event).await {
            tracing::error!(phone = %reply.phone, error = %e, "Failed to archive inbound event");
        }
    }
}

/// Close every `awaiting_reply` record whose prompt was sent more than
/// `horizon_hours` ago. Records whose prompt never went out stay open.
pub async fn expire_stale_feedback(
    store: &dyn MessagingStore,
    horizon_hours: i64,
) -> Result<u64, StoreError> {
    let cutoff = Utc::now() - chrono::Duration::hours(horizon_hours);
    let n = store.expire_feedback(cutoff).await?;
    if n > 0 {
        tracing::info!(expired = n, "Expired unanswered feedback requests");
    }
    Ok(n)
}

/// Close reminders nobody confirmed before the appointment started.
pub async fn expire_past_confirmations(store: &dyn MessagingStore) -> Result<u64, StoreError> {
    let n = store.expire_confirmations(Utc::now()).await?;
    if n > 0 {
        tracing::info!(expired = n, "Expired unconfirmed appointment reminders");
    }
    Ok(n)
}
