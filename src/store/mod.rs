//! Persistence seam for the messaging engine.
//!
//! Every status change on `campaign_message`, `attendance_feedback`,
//! `appointment_confirmation` and `scheduled_follow_up` is a single
//! conditional update; the boolean returned by the transition methods says
//! whether this caller won the row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    AppointmentConfirmation, AttendanceFeedback, Campaign, CampaignMessage, CampaignRecipient,
    CampaignWithStats, ClaimedMessage, FailureKind, FeedbackState, FollowUpStatus, InboundEvent,
    MessageSearch, MessageTemplate, NewCampaign, NewCampaignMessage, NewFollowUp, NewTemplate,
    RequeueFilter, ScheduledFollowUp, SessionUser, StatusCounts, TemplatePatch, TriggerType,
    UpcomingAppointment,
};

#[cfg(test)]
pub mod memory;
pub mod pg;

/// Result of enqueuing a triggered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Created { message_id: Uuid },
    /// A message for the same `(appointment_id, trigger_type)` already exists.
    Duplicate { message_id: Uuid },
}

/// Conversation opened alongside a triggered message. Replies from the
/// message's phone are matched against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenPrompt {
    /// `attendance_feedback`, answered with "1"/"2".
    Feedback,
    /// `appointment_confirmation`, answered with a confirmation keyword
    /// before `starts_at`.
    Confirmation { starts_at: DateTime<Utc> },
}

#[async_trait]
pub trait MessagingStore: Send + Sync {
    // ── Templates ───────────────────────────────────────────────────

    /// Active templates for a trigger, most recently updated first.
    async fn active_templates(&self, trigger: TriggerType)
        -> Result<Vec<MessageTemplate>, StoreError>;

    async fn list_templates(&self) -> Result<Vec<MessageTemplate>, StoreError>;

    async fn create_template(&self, new: &NewTemplate) -> Result<MessageTemplate, StoreError>;

    async fn update_template(
        &self,
        template_id: Uuid,
        patch: &TemplatePatch,
    ) -> Result<Option<MessageTemplate>, StoreError>;

    // ── Campaign messages ───────────────────────────────────────────

    /// Insert a pending message and open (or reopen) `prompt` for the
    /// message's appointment in one transaction. Idempotent on
    /// `(appointment_id, trigger_type)`; a duplicate opens nothing.
    async fn enqueue_message(
        &self,
        msg: &NewCampaignMessage,
        prompt: Option<OpenPrompt>,
    ) -> Result<EnqueueOutcome, StoreError>;

    /// Claim up to `limit` pending rows, oldest first, skipping rows whose
    /// lease is still held by another run.
    async fn claim_pending(
        &self,
        limit: i64,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<ClaimedMessage>, StoreError>;

    /// Push the lease of a still-held claim out to `lease_until`. Returns
    /// false once another run has taken the row or it left `pending`.
    async fn renew_claim(
        &self,
        message_id: Uuid,
        claim_token: Uuid,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// pending -> sent, only for the claim holder.
    async fn mark_sent(
        &self,
        message_id: Uuid,
        claim_token: Uuid,
        sent_at: DateTime<Utc>,
        provider_message_id: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// pending -> failed, only for the claim holder.
    async fn mark_failed(
        &self,
        message_id: Uuid,
        claim_token: Uuid,
        error_message: &str,
        kind: FailureKind,
    ) -> Result<bool, StoreError>;

    /// failed -> pending for every row matching `filter`.
    async fn requeue_failed(&self, filter: &RequeueFilter) -> Result<u64, StoreError>;

    async fn search_messages(&self, q: &MessageSearch) -> Result<Vec<CampaignMessage>, StoreError>;

    async fn status_counts(&self) -> Result<StatusCounts, StoreError>;

    // ── Campaigns ───────────────────────────────────────────────────

    /// Create the campaign and one pending `manual` message per recipient.
    async fn create_campaign(
        &self,
        new: &NewCampaign,
        recipients: &[CampaignRecipient],
    ) -> Result<Campaign, StoreError>;

    async fn get_campaign(&self, campaign_id: Uuid)
        -> Result<Option<CampaignWithStats>, StoreError>;

    /// processing -> completed/failed for campaigns with nothing pending.
    /// `failed` only when no message was sent.
    async fn roll_up_campaigns(&self) -> Result<u64, StoreError>;

    // ── Feedback ────────────────────────────────────────────────────

    /// Most recent `awaiting_reply` record for a phone.
    async fn open_feedback_for_phone(
        &self,
        phone: &str,
    ) -> Result<Option<AttendanceFeedback>, StoreError>;

    async fn get_feedback(&self, appointment_id: Uuid)
        -> Result<Option<AttendanceFeedback>, StoreError>;

    /// awaiting_reply -> `to`. Returns false if the record already left
    /// `awaiting_reply`.
    async fn resolve_feedback(
        &self,
        appointment_id: Uuid,
        to: FeedbackState,
        reply_text: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// awaiting_reply -> expired for records whose prompt was sent before
    /// `cutoff`. A prompt that has not gone out yet keeps its record open.
    async fn expire_feedback(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    // ── Appointment confirmation ────────────────────────────────────

    /// Clinic appointments (scheduled or confirmed) starting in `(from, to]`
    /// that have no reminder yet.
    async fn upcoming_appointments(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<UpcomingAppointment>, StoreError>;

    /// Most recent `awaiting_confirmation` record for a phone.
    async fn open_confirmation_for_phone(
        &self,
        phone: &str,
    ) -> Result<Option<AppointmentConfirmation>, StoreError>;

    async fn get_confirmation(
        &self,
        appointment_id: Uuid,
    ) -> Result<Option<AppointmentConfirmation>, StoreError>;

    /// awaiting_confirmation -> confirmed, and the clinic appointment from
    /// scheduled to confirmed. Returns false if the record was already closed.
    async fn confirm_appointment(
        &self,
        appointment_id: Uuid,
        reply_text: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// awaiting_confirmation -> expired once the appointment has started.
    async fn expire_confirmations(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    // ── Scheduled follow-ups ────────────────────────────────────────

    /// Park future messages. Existing `(appointment_id, trigger_type)` rows
    /// are left untouched. Returns how many were created.
    async fn schedule_follow_ups(&self, items: &[NewFollowUp]) -> Result<u64, StoreError>;

    /// `scheduled` rows with `due_at <= now`, earliest first.
    async fn due_follow_ups(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ScheduledFollowUp>, StoreError>;

    async fn list_follow_ups(&self, appointment_id: Uuid)
        -> Result<Vec<ScheduledFollowUp>, StoreError>;

    /// scheduled -> `to`. Returns false if the row already left `scheduled`.
    async fn close_follow_up(
        &self,
        follow_up_id: Uuid,
        to: FollowUpStatus,
        message_id: Option<Uuid>,
    ) -> Result<bool, StoreError>;

    // ── Audit / auth ────────────────────────────────────────────────

    async fn record_inbound(&self, event: &InboundEvent) -> Result<(), StoreError>;

    /// Resolve an operator session by the sha256 of its bearer token.
    async fn session_user(&self, token_hash: &str) -> Result<Option<SessionUser>, StoreError>;
}
