//! In-memory store with the same conditional-update semantics as Postgres.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{EnqueueOutcome, MessagingStore, OpenPrompt};
use crate::error::StoreError;
use crate::models::{
    AppointmentConfirmation, AttendanceFeedback, Campaign, CampaignMessage, CampaignRecipient,
    CampaignStatus, CampaignWithStats, ClaimedMessage, ConfirmationState, FailureKind,
    FeedbackState, FollowUpStatus, InboundEvent, MessageSearch, MessageStatus, MessageTemplate,
    NewCampaign, NewCampaignMessage, NewFollowUp, NewTemplate, RequeueFilter, ScheduledFollowUp,
    SessionUser, StatusCounts, TemplatePatch, TriggerType, UpcomingAppointment,
};

#[derive(Debug, Clone)]
struct Claim {
    token: Uuid,
    until: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    templates: Vec<MessageTemplate>,
    messages: Vec<CampaignMessage>,
    claims: HashMap<Uuid, Claim>,
    feedback: HashMap<Uuid, AttendanceFeedback>,
    confirmations: HashMap<Uuid, AppointmentConfirmation>,
    follow_ups: Vec<ScheduledFollowUp>,
    campaigns: Vec<Campaign>,
    upcoming: Vec<UpcomingAppointment>,
    /// Clinic appointments moved to "confirmed" by a patient reply.
    confirmed_appointments: Vec<Uuid>,
    inbound: Vec<InboundEvent>,
    sessions: HashMap<String, SessionUser>,
    offline: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing the datastore: every call fails with `Unavailable`.
    pub async fn set_offline(&self, offline: bool) {
        self.inner.lock().await.offline = offline;
    }

    pub async fn insert_session(&self, token_hash: &str, user: SessionUser) {
        self.inner
            .lock()
            .await
            .sessions
            .insert(token_hash.to_string(), user);
    }

    pub async fn insert_template_at(
        &self,
        trigger_type: TriggerType,
        content: &str,
        updated_at: DateTime<Utc>,
    ) -> MessageTemplate {
        let tpl = MessageTemplate {
            template_id: Uuid::new_v4(),
            title: format!("{trigger_type} template"),
            trigger_type,
            content: content.to_string(),
            is_active: true,
            created_at: updated_at,
            updated_at,
        };
        self.inner.lock().await.templates.push(tpl.clone());
        tpl
    }

    pub async fn insert_pending(&self, phone: &str, content: &str, created_at: DateTime<Utc>) -> Uuid {
        let message_id = Uuid::new_v4();
        self.inner.lock().await.messages.push(CampaignMessage {
            message_id,
            phone: phone.to_string(),
            template_id: None,
            appointment_id: None,
            campaign_id: None,
            trigger_type: TriggerType::Manual,
            content: content.to_string(),
            status: MessageStatus::Pending,
            error_message: None,
            failure_kind: None,
            provider_message_id: None,
            sent_at: None,
            created_at,
        });
        message_id
    }

    pub async fn messages(&self) -> Vec<CampaignMessage> {
        self.inner.lock().await.messages.clone()
    }

    pub async fn message(&self, message_id: Uuid) -> Option<CampaignMessage> {
        self.inner
            .lock()
            .await
            .messages
            .iter()
            .find(|m| m.message_id == message_id)
            .cloned()
    }

    pub async fn inbound_events(&self) -> Vec<InboundEvent> {
        self.inner.lock().await.inbound.clone()
    }

    pub async fn all_feedback(&self) -> Vec<AttendanceFeedback> {
        self.inner.lock().await.feedback.values().cloned().collect()
    }

    /// Backdate a feedback record's creation time.
    pub async fn backdate_feedback(&self, appointment_id: Uuid, created_at: DateTime<Utc>) {
        if let Some(f) = self.inner.lock().await.feedback.get_mut(&appointment_id) {
            f.created_at = created_at;
        }
    }

    /// Mark the appointment's `trigger` message as delivered at `sent_at`.
    pub async fn deliver_at(&self, appointment_id: Uuid, trigger: TriggerType, sent_at: DateTime<Utc>) {
        let mut inner = self.inner.lock().await;
        let mut delivered = None;
        for m in inner.messages.iter_mut() {
            if m.appointment_id == Some(appointment_id) && m.trigger_type == trigger {
                m.status = MessageStatus::Sent;
                m.sent_at = Some(sent_at);
                delivered = Some(m.message_id);
            }
        }
        if let Some(id) = delivered {
            inner.claims.remove(&id);
        }
    }

    /// Make an appointment visible to `upcoming_appointments`.
    pub async fn insert_upcoming(&self, appt: UpcomingAppointment) {
        self.inner.lock().await.upcoming.push(appt);
    }

    pub async fn confirmed_appointments(&self) -> Vec<Uuid> {
        self.inner.lock().await.confirmed_appointments.clone()
    }

    pub async fn all_follow_ups(&self) -> Vec<ScheduledFollowUp> {
        self.inner.lock().await.follow_ups.clone()
    }
}

fn counts_for<'a>(messages: impl Iterator<Item = &'a CampaignMessage>) -> StatusCounts {
    let mut counts = StatusCounts::default();
    for m in messages {
        match m.status {
            MessageStatus::Pending => counts.pending += 1,
            MessageStatus::Sent => counts.sent += 1,
            MessageStatus::Failed => counts.failed += 1,
        }
    }
    counts
}

fn check(inner: &Inner) -> Result<(), StoreError> {
    if inner.offline {
        Err(StoreError::Unavailable("memory store offline".into()))
    } else {
        Ok(())
    }
}

fn holds_claim(inner: &Inner, message_id: Uuid, claim_token: Uuid) -> bool {
    inner
        .claims
        .get(&message_id)
        .is_some_and(|c| c.token == claim_token)
}

#[async_trait]
impl MessagingStore for MemoryStore {
    async fn active_templates(
        &self,
        trigger: TriggerType,
    ) -> Result<Vec<MessageTemplate>, StoreError> {
        let inner = self.inner.lock().await;
        check(&inner)?;
        let mut out: Vec<MessageTemplate> = inner
            .templates
            .iter()
            .filter(|t| t.trigger_type == trigger && t.is_active)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then(b.template_id.cmp(&a.template_id))
        });
        Ok(out)
    }

    async fn list_templates(&self) -> Result<Vec<MessageTemplate>, StoreError> {
        let inner = self.inner.lock().await;
        check(&inner)?;
        Ok(inner.templates.clone())
    }

    async fn create_template(&self, new: &NewTemplate) -> Result<MessageTemplate, StoreError> {
        let mut inner = self.inner.lock().await;
        check(&inner)?;
        let now = Utc::now();
        let tpl = MessageTemplate {
            template_id: Uuid::new_v4(),
            title: new.title.clone(),
            trigger_type: new.trigger_type,
            content: new.content.clone(),
            is_active: new.is_active,
            created_at: now,
            updated_at: now,
        };
        inner.templates.push(tpl.clone());
        Ok(tpl)
    }

    async fn update_template(
        &self,
        template_id: Uuid,
        patch: &TemplatePatch,
    ) -> Result<Option<MessageTemplate>, StoreError> {
        let mut inner = self.inner.lock().await;
        check(&inner)?;
        let Some(tpl) = inner
            .templates
            .iter_mut()
            .find(|t| t.template_id == template_id)
        else {
            return Ok(None);
        };
        if let Some(title) = &patch.title {
            tpl.title = title.clone();
        }
        if let Some(content) = &patch.content {
            tpl.content = content.clone();
        }
        if let Some(active) = patch.is_active {
            tpl.is_active = active;
        }
        tpl.updated_at = Utc::now();
        Ok(Some(tpl.clone()))
    }

    async fn enqueue_message(
        &self,
        msg: &NewCampaignMessage,
        prompt: Option<OpenPrompt>,
    ) -> Result<EnqueueOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        check(&inner)?;

        if msg.appointment_id.is_some() {
            if let Some(existing) = inner.messages.iter().find(|m| {
                m.appointment_id == msg.appointment_id && m.trigger_type == msg.trigger_type
            }) {
                return Ok(EnqueueOutcome::Duplicate {
                    message_id: existing.message_id,
                });
            }
        }

        let now = Utc::now();
        let message_id = Uuid::new_v4();
        inner.messages.push(CampaignMessage {
            message_id,
            phone: msg.phone.clone(),
            template_id: msg.template_id,
            appointment_id: msg.appointment_id,
            campaign_id: msg.campaign_id,
            trigger_type: msg.trigger_type,
            content: msg.content.clone(),
            status: MessageStatus::Pending,
            error_message: None,
            failure_kind: None,
            provider_message_id: None,
            sent_at: None,
            created_at: now,
        });

        match (msg.appointment_id, prompt) {
            (Some(appointment_id), Some(OpenPrompt::Feedback)) => {
                inner.feedback.insert(
                    appointment_id,
                    AttendanceFeedback {
                        appointment_id,
                        patient_phone: msg.phone.clone(),
                        feedback_state: FeedbackState::AwaitingReply,
                        reply_text: None,
                        responded_at: None,
                        created_at: now,
                        updated_at: now,
                    },
                );
            }
            (Some(appointment_id), Some(OpenPrompt::Confirmation { starts_at })) => {
                inner.confirmations.insert(
                    appointment_id,
                    AppointmentConfirmation {
                        appointment_id,
                        patient_phone: msg.phone.clone(),
                        confirmation_state: ConfirmationState::AwaitingConfirmation,
                        starts_at,
                        reply_text: None,
                        confirmed_at: None,
                        created_at: now,
                        updated_at: now,
                    },
                );
            }
            _ => {}
        }

        Ok(EnqueueOutcome::Created { message_id })
    }

    async fn claim_pending(
        &self,
        limit: i64,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<ClaimedMessage>, StoreError> {
        let mut inner = self.inner.lock().await;
        check(&inner)?;
        let now = Utc::now();
        let token = Uuid::new_v4();

        let mut candidates: Vec<CampaignMessage> = inner
            .messages
            .iter()
            .filter(|m| m.status == MessageStatus::Pending)
            .filter(|m| inner.claims.get(&m.message_id).is_none_or(|c| c.until < now))
            .cloned()
            .collect();
        candidates.sort_by_key(|m| m.created_at);
        candidates.truncate(limit.max(0) as usize);

        for m in &candidates {
            inner.claims.insert(
                m.message_id,
                Claim {
                    token,
                    until: lease_until,
                },
            );
        }

        Ok(candidates
            .into_iter()
            .map(|message| ClaimedMessage {
                message,
                claim_token: token,
            })
            .collect())
    }

    async fn renew_claim(
        &self,
        message_id: Uuid,
        claim_token: Uuid,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        check(&inner)?;
        let pending = inner
            .messages
            .iter()
            .any(|m| m.message_id == message_id && m.status == MessageStatus::Pending);
        if !pending || !holds_claim(&inner, message_id, claim_token) {
            return Ok(false);
        }
        if let Some(c) = inner.claims.get_mut(&message_id) {
            c.until = lease_until;
        }
        Ok(true)
    }

    async fn mark_sent(
        &self,
        message_id: Uuid,
        claim_token: Uuid,
        sent_at: DateTime<Utc>,
        provider_message_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        check(&inner)?;
        if !holds_claim(&inner, message_id, claim_token) {
            return Ok(false);
        }
        let Some(m) = inner
            .messages
            .iter_mut()
            .find(|m| m.message_id == message_id && m.status == MessageStatus::Pending)
        else {
            return Ok(false);
        };
        m.status = MessageStatus::Sent;
        m.sent_at = Some(sent_at);
        m.provider_message_id = provider_message_id.map(str::to_string);
        m.error_message = None;
        m.failure_kind = None;
        inner.claims.remove(&message_id);
        Ok(true)
    }

    async fn mark_failed(
        &self,
        message_id: Uuid,
        claim_token: Uuid,
        error_message: &str,
        kind: FailureKind,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        check(&inner)?;
        if !holds_claim(&inner, message_id, claim_token) {
            return Ok(false);
        }
        let Some(m) = inner
            .messages
            .iter_mut()
            .find(|m| m.message_id == message_id && m.status == MessageStatus::Pending)
        else {
            return Ok(false);
        };
        m.status = MessageStatus::Failed;
        m.error_message = Some(error_message.to_string());
        m.failure_kind = Some(kind);
        inner.claims.remove(&message_id);
        Ok(true)
    }

    async fn requeue_failed(&self, filter: &RequeueFilter) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        check(&inner)?;
        let mut n = 0;
        for m in inner.messages.iter_mut() {
            if m.status != MessageStatus::Failed {
                continue;
            }
            if filter.trigger_type.is_some_and(|t| t != m.trigger_type) {
                continue;
            }
            if filter.created_from.is_some_and(|from| m.created_at < from) {
                continue;
            }
            if filter.created_to.is_some_and(|to| m.created_at > to) {
                continue;
            }
            if !filter.include_permanent && m.failure_kind == Some(FailureKind::Permanent) {
                continue;
            }
            m.status = MessageStatus::Pending;
            m.error_message = None;
            m.failure_kind = None;
            n += 1;
        }
        Ok(n)
    }

    async fn search_messages(&self, q: &MessageSearch) -> Result<Vec<CampaignMessage>, StoreError> {
        let inner = self.inner.lock().await;
        check(&inner)?;
        let limit = q.limit.unwrap_or(50).clamp(1, 200) as usize;
        let offset = q.offset.unwrap_or(0).max(0) as usize;
        let mut out: Vec<CampaignMessage> = inner
            .messages
            .iter()
            .filter(|m| q.status.is_none_or(|s| s == m.status))
            .filter(|m| q.trigger_type.is_none_or(|t| t == m.trigger_type))
            .filter(|m| q.campaign_id.is_none_or(|c| Some(c) == m.campaign_id))
            .filter(|m| q.phone.as_deref().is_none_or(|p| p == m.phone))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out.into_iter().skip(offset).take(limit).collect())
    }

    async fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        let inner = self.inner.lock().await;
        check(&inner)?;
        Ok(counts_for(inner.messages.iter()))
    }

    async fn create_campaign(
        &self,
        new: &NewCampaign,
        recipients: &[CampaignRecipient],
    ) -> Result<Campaign, StoreError> {
        let mut inner = self.inner.lock().await;
        check(&inner)?;
        let now = Utc::now();
        let campaign = Campaign {
            campaign_id: Uuid::new_v4(),
            title: new.title.clone(),
            content: new.content.clone(),
            status: CampaignStatus::Processing,
            created_by: new.created_by,
            created_at: now,
            completed_at: None,
        };
        for r in recipients {
            inner.messages.push(CampaignMessage {
                message_id: Uuid::new_v4(),
                phone: r.phone.clone(),
                template_id: None,
                appointment_id: None,
                campaign_id: Some(campaign.campaign_id),
                trigger_type: TriggerType::Manual,
                content: r.content.clone(),
                status: MessageStatus::Pending,
                error_message: None,
                failure_kind: None,
                provider_message_id: None,
                sent_at: None,
                created_at: now,
            });
        }
        inner.campaigns.push(campaign.clone());
        Ok(campaign)
    }

    async fn get_campaign(
        &self,
        campaign_id: Uuid,
    ) -> Result<Option<CampaignWithStats>, StoreError> {
        let inner = self.inner.lock().await;
        check(&inner)?;
        let Some(campaign) = inner.campaigns.iter().find(|c| c.campaign_id == campaign_id) else {
            return Ok(None);
        };
        let stats = counts_for(
            inner
                .messages
                .iter()
                .filter(|m| m.campaign_id == Some(campaign_id)),
        );
        Ok(Some(CampaignWithStats {
            campaign: campaign.clone(),
            stats,
        }))
    }

    async fn roll_up_campaigns(&self) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        check(&inner)?;
        let Inner {
            campaigns,
            messages,
            ..
        } = &mut *inner;
        let mut n = 0;
        for c in campaigns
            .iter_mut()
            .filter(|c| c.status == CampaignStatus::Processing)
        {
            let counts = counts_for(
                messages
                    .iter()
                    .filter(|m| m.campaign_id == Some(c.campaign_id)),
            );
            if counts.pending > 0 {
                continue;
            }
            c.status = if counts.sent > 0 {
                CampaignStatus::Completed
            } else {
                CampaignStatus::Failed
            };
            c.completed_at = Some(Utc::now());
            n += 1;
        }
        Ok(n)
    }

    async fn open_feedback_for_phone(
        &self,
        phone: &str,
    ) -> Result<Option<AttendanceFeedback>, StoreError> {
        let inner = self.inner.lock().await;
        check(&inner)?;
        Ok(inner
            .feedback
            .values()
            .filter(|f| f.patient_phone == phone && f.feedback_state == FeedbackState::AwaitingReply)
            .max_by_key(|f| f.created_at)
            .cloned())
    }

    async fn get_feedback(
        &self,
        appointment_id: Uuid,
    ) -> Result<Option<AttendanceFeedback>, StoreError> {
        let inner = self.inner.lock().await;
        check(&inner)?;
        Ok(inner.feedback.get(&appointment_id).cloned())
    }

    async fn resolve_feedback(
        &self,
        appointment_id: Uuid,
        to: FeedbackState,
        reply_text: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        check(&inner)?;
        match inner.feedback.get_mut(&appointment_id) {
            Some(f) if f.feedback_state == FeedbackState::AwaitingReply => {
                f.feedback_state = to;
                f.reply_text = Some(reply_text.to_string());
                f.responded_at = Some(at);
                f.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire_feedback(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        check(&inner)?;
        let Inner {
            feedback,
            messages,
            ..
        } = &mut *inner;
        let mut n = 0;
        for f in feedback.values_mut() {
            if f.feedback_state != FeedbackState::AwaitingReply {
                continue;
            }
            let prompt_sent_before_cutoff = messages.iter().any(|m| {
                m.appointment_id == Some(f.appointment_id)
                    && m.trigger_type == TriggerType::PostAttendance
                    && m.status == MessageStatus::Sent
                    && m.sent_at.is_some_and(|at| at < cutoff)
            });
            if prompt_sent_before_cutoff {
                f.feedback_state = FeedbackState::Expired;
                f.updated_at = Utc::now();
                n += 1;
            }
        }
        Ok(n)
    }

    async fn upcoming_appointments(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<UpcomingAppointment>, StoreError> {
        let inner = self.inner.lock().await;
        check(&inner)?;
        let mut out: Vec<UpcomingAppointment> = inner
            .upcoming
            .iter()
            .filter(|a| a.starts_at > from && a.starts_at <= to)
            .filter(|a| {
                !inner.messages.iter().any(|m| {
                    m.appointment_id == Some(a.appointment_id)
                        && m.trigger_type == TriggerType::AppointmentReminder
                })
            })
            .cloned()
            .collect();
        out.sort_by_key(|a| a.starts_at);
        Ok(out)
    }

    async fn open_confirmation_for_phone(
        &self,
        phone: &str,
    ) -> Result<Option<AppointmentConfirmation>, StoreError> {
        let inner = self.inner.lock().await;
        check(&inner)?;
        Ok(inner
            .confirmations
            .values()
            .filter(|c| {
                c.patient_phone == phone
                    && c.confirmation_state == ConfirmationState::AwaitingConfirmation
            })
            .max_by_key(|c| c.created_at)
            .cloned())
    }

    async fn get_confirmation(
        &self,
        appointment_id: Uuid,
    ) -> Result<Option<AppointmentConfirmation>, StoreError> {
        let inner = self.inner.lock().await;
        check(&inner)?;
        Ok(inner.confirmations.get(&appointment_id).cloned())
    }

    async fn confirm_appointment(
        &self,
        appointment_id: Uuid,
        reply_text: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        check(&inner)?;
        match inner.confirmations.get_mut(&appointment_id) {
            Some(c) if c.confirmation_state == ConfirmationState::AwaitingConfirmation => {
                c.confirmation_state = ConfirmationState::Confirmed;
                c.reply_text = Some(reply_text.to_string());
                c.confirmed_at = Some(at);
                c.updated_at = Utc::now();
            }
            _ => return Ok(false),
        }
        inner.confirmed_appointments.push(appointment_id);
        Ok(true)
    }

    async fn expire_confirmations(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        check(&inner)?;
        let mut n = 0;
        for c in inner.confirmations.values_mut() {
            if c.confirmation_state == ConfirmationState::AwaitingConfirmation && c.starts_at < now {
                c.confirmation_state = ConfirmationState::Expired;
                c.updated_at = Utc::now();
                n += 1;
            }
        }
        Ok(n)
    }

    async fn schedule_follow_ups(&self, items: &[NewFollowUp]) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        check(&inner)?;
        let now = Utc::now();
        let mut n = 0;
        for item in items {
            let exists = inner.follow_ups.iter().any(|f| {
                f.appointment_id == item.appointment_id && f.trigger_type == item.trigger_type
            });
            if exists {
                continue;
            }
            inner.follow_ups.push(ScheduledFollowUp {
                follow_up_id: Uuid::new_v4(),
                appointment_id: item.appointment_id,
                trigger_type: item.trigger_type,
                patient_phone: item.patient_phone.clone(),
                vars: item.vars.clone(),
                due_at: item.due_at,
                status: FollowUpStatus::Scheduled,
                message_id: None,
                created_at: now,
                updated_at: now,
            });
            n += 1;
        }
        Ok(n)
    }

    async fn due_follow_ups(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ScheduledFollowUp>, StoreError> {
        let inner = self.inner.lock().await;
        check(&inner)?;
        let mut out: Vec<ScheduledFollowUp> = inner
            .follow_ups
            .iter()
            .filter(|f| f.status == FollowUpStatus::Scheduled && f.due_at <= now)
            .cloned()
            .collect();
        out.sort_by_key(|f| f.due_at);
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }

    async fn list_follow_ups(
        &self,
        appointment_id: Uuid,
    ) -> Result<Vec<ScheduledFollowUp>, StoreError> {
        let inner = self.inner.lock().await;
        check(&inner)?;
        let mut out: Vec<ScheduledFollowUp> = inner
            .follow_ups
            .iter()
            .filter(|f| f.appointment_id == appointment_id)
            .cloned()
            .collect();
        out.sort_by_key(|f| f.due_at);
        Ok(out)
    }

    async fn close_follow_up(
        &self,
        follow_up_id: Uuid,
        to: FollowUpStatus,
        message_id: Option<Uuid>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        check(&inner)?;
        match inner
            .follow_ups
            .iter_mut()
            .find(|f| f.follow_up_id == follow_up_id)
        {
            Some(f) if f.status == FollowUpStatus::Scheduled => {
                f.status = to;
                f.message_id = message_id;
                f.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_inbound(&self, event: &InboundEvent) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        check(&inner)?;
        inner.inbound.push(event.clone());
        Ok(())
    }

    async fn session_user(&self, token_hash: &str) -> Result<Option<SessionUser>, StoreError> {
        let inner = self.inner.lock().await;
        check(&inner)?;
        Ok(inner.sessions.get(token_hash).cloned())
    }
}
