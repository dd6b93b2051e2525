// src/store/pg.rs

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use uuid::Uuid;

use super::{EnqueueOutcome, MessagingStore, OpenPrompt};
use crate::error::StoreError;
use crate::models::{
    AppointmentConfirmation, AttendanceFeedback, Campaign, CampaignMessage, CampaignRecipient,
    CampaignWithStats, ClaimedMessage, FailureKind, FeedbackState, FollowUpStatus, InboundEvent,
    MessageSearch, MessageStatus, MessageTemplate, NewCampaign, NewCampaignMessage, NewFollowUp,
    NewTemplate, RequeueFilter, ScheduledFollowUp, SessionUser, StatusCounts, TemplatePatch,
    TriggerType, UpcomingAppointment,
};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/* -------------------------
   DB Row Models
--------------------------*/

#[derive(Debug, sqlx::FromRow)]
struct TemplateRow {
    template_id: Uuid,
    title: String,
    trigger_type: String,
    content: String,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TemplateRow> for MessageTemplate {
    type Error = StoreError;

    fn try_from(r: TemplateRow) -> Result<Self, Self::Error> {
        Ok(MessageTemplate {
            template_id: r.template_id,
            title: r.title,
            trigger_type: r.trigger_type.parse()?,
            content: r.content,
            is_active: r.is_active,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    message_id: Uuid,
    phone: String,
    template_id: Option<Uuid>,
    appointment_id: Option<Uuid>,
    campaign_id: Option<Uuid>,
    trigger_type: String,
    content: String,
    status: String,
    error_message: Option<String>,
    failure_kind: Option<String>,
    provider_message_id: Option<String>,
    sent_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for CampaignMessage {
    type Error = StoreError;

    fn try_from(r: MessageRow) -> Result<Self, Self::Error> {
        Ok(CampaignMessage {
            message_id: r.message_id,
            phone: r.phone,
            template_id: r.template_id,
            appointment_id: r.appointment_id,
            campaign_id: r.campaign_id,
            trigger_type: r.trigger_type.parse()?,
            content: r.content,
            status: r.status.parse()?,
            error_message: r.error_message,
            failure_kind: r
                .failure_kind
                .as_deref()
                .map(str::parse::<FailureKind>)
                .transpose()?,
            provider_message_id: r.provider_message_id,
            sent_at: r.sent_at,
            created_at: r.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct FeedbackRow {
    appointment_id: Uuid,
    patient_phone: String,
    feedback_state: String,
    reply_text: Option<String>,
    responded_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<FeedbackRow> for AttendanceFeedback {
    type Error = StoreError;

    fn try_from(r: FeedbackRow) -> Result<Self, Self::Error> {
        Ok(AttendanceFeedback {
            appointment_id: r.appointment_id,
            patient_phone: r.patient_phone,
            feedback_state: r.feedback_state.parse()?,
            reply_text: r.reply_text,
            responded_at: r.responded_at,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ConfirmationRow {
    appointment_id: Uuid,
    patient_phone: String,
    confirmation_state: String,
    starts_at: DateTime<Utc>,
    reply_text: Option<String>,
    confirmed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ConfirmationRow> for AppointmentConfirmation {
    type Error = StoreError;

    fn try_from(r: ConfirmationRow) -> Result<Self, Self::Error> {
        Ok(AppointmentConfirmation {
            appointment_id: r.appointment_id,
            patient_phone: r.patient_phone,
            confirmation_state: r.confirmation_state.parse()?,
            starts_at: r.starts_at,
            reply_text: r.reply_text,
            confirmed_at: r.confirmed_at,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct FollowUpRow {
    follow_up_id: Uuid,
    appointment_id: Uuid,
    trigger_type: String,
    patient_phone: String,
    vars: Json<HashMap<String, String>>,
    due_at: DateTime<Utc>,
    status: String,
    message_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<FollowUpRow> for ScheduledFollowUp {
    type Error = StoreError;

    fn try_from(r: FollowUpRow) -> Result<Self, Self::Error> {
        Ok(ScheduledFollowUp {
            follow_up_id: r.follow_up_id,
            appointment_id: r.appointment_id,
            trigger_type: r.trigger_type.parse()?,
            patient_phone: r.patient_phone,
            vars: r.vars.0,
            due_at: r.due_at,
            status: r.status.parse()?,
            message_id: r.message_id,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CampaignRow {
    campaign_id: Uuid,
    title: String,
    content: String,
    status: String,
    created_by: Option<Uuid>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<CampaignRow> for Campaign {
    type Error = StoreError;

    fn try_from(r: CampaignRow) -> Result<Self, Self::Error> {
        Ok(Campaign {
            campaign_id: r.campaign_id,
            title: r.title,
            content: r.content,
            status: r.status.parse()?,
            created_by: r.created_by,
            created_at: r.created_at,
            completed_at: r.completed_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct UpcomingRow {
    appointment_id: Uuid,
    start_at: DateTime<Utc>,
    patient_name: String,
    patient_phone: String,
    professional_name: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct SessionLookupRow {
    session_token_id: Uuid,
    user_id: Uuid,
    roles: i16,
}

const TEMPLATE_COLUMNS: &str =
    "template_id, title, trigger_type, content, is_active, created_at, updated_at";

const MESSAGE_COLUMNS: &str = r#"
          message_id,
          phone,
          template_id,
          appointment_id,
          campaign_id,
          trigger_type,
          content,
          status,
          error_message,
          failure_kind,
          provider_message_id,
          sent_at,
          created_at
"#;

const FEEDBACK_COLUMNS: &str = "appointment_id, patient_phone, feedback_state, reply_text, \
     responded_at, created_at, updated_at";

const CONFIRMATION_COLUMNS: &str = "appointment_id, patient_phone, confirmation_state, starts_at, \
     reply_text, confirmed_at, created_at, updated_at";

const FOLLOW_UP_COLUMNS: &str = "follow_up_id, appointment_id, trigger_type, patient_phone, vars, \
     due_at, status, message_id, created_at, updated_at";

const CAMPAIGN_COLUMNS: &str =
    "campaign_id, title, content, status, created_by, created_at, completed_at";

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>, StoreError>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

async fn open_prompt(
    tx: &mut Transaction<'_, Postgres>,
    appointment_id: Uuid,
    phone: &str,
    prompt: OpenPrompt,
) -> Result<(), StoreError> {
    match prompt {
        OpenPrompt::Feedback => {
            sqlx::query(
                r#"
                INSERT INTO attendance_feedback (appointment_id, patient_phone, feedback_state)
                VALUES ($1, $2, 'awaiting_reply')
                ON CONFLICT (appointment_id) DO UPDATE
                SET patient_phone = EXCLUDED.patient_phone,
                    feedback_state = 'awaiting_reply',
                    reply_text = NULL,
                    responded_at = NULL,
                    created_at = now(),
                    updated_at = now()
                "#,
            )
            .bind(appointment_id)
            .bind(phone)
            .execute(&mut **tx)
            .await?;
        }
        OpenPrompt::Confirmation { starts_at } => {
            sqlx::query(
                r#"
                INSERT INTO appointment_confirmation
                  (appointment_id, patient_phone, confirmation_state, starts_at)
                VALUES ($1, $2, 'awaiting_confirmation', $3)
                ON CONFLICT (appointment_id) DO UPDATE
                SET patient_phone = EXCLUDED.patient_phone,
                    confirmation_state = 'awaiting_confirmation',
                    starts_at = EXCLUDED.starts_at,
                    reply_text = NULL,
                    confirmed_at = NULL,
                    created_at = now(),
                    updated_at = now()
                "#,
            )
            .bind(appointment_id)
            .bind(phone)
            .bind(starts_at)
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}

#[async_trait]
impl MessagingStore for PgStore {
    async fn active_templates(
        &self,
        trigger: TriggerType,
    ) -> Result<Vec<MessageTemplate>, StoreError> {
        let rows: Vec<TemplateRow> = sqlx::query_as::<_, TemplateRow>(&format!(
            r#"
            SELECT {TEMPLATE_COLUMNS}
            FROM message_template
            WHERE trigger_type = $1
              AND is_active = true
            ORDER BY updated_at DESC, template_id DESC
            "#
        ))
        .bind(trigger.as_str())
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }

    async fn list_templates(&self) -> Result<Vec<MessageTemplate>, StoreError> {
        let rows: Vec<TemplateRow> = sqlx::query_as::<_, TemplateRow>(&format!(
            r#"
            SELECT {TEMPLATE_COLUMNS}
            FROM message_template
            ORDER BY trigger_type ASC, updated_at DESC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }

    async fn create_template(&self, new: &NewTemplate) -> Result<MessageTemplate, StoreError> {
        let row: TemplateRow = sqlx::query_as::<_, TemplateRow>(&format!(
            r#"
            INSERT INTO message_template (title, trigger_type, content, is_active)
            VALUES ($1, $2, $3, $4)
            RETURNING {TEMPLATE_COLUMNS}
            "#
        ))
        .bind(&new.title)
        .bind(new.trigger_type.as_str())
        .bind(&new.content)
        .bind(new.is_active)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn update_template(
        &self,
        template_id: Uuid,
        patch: &TemplatePatch,
    ) -> Result<Option<MessageTemplate>, StoreError> {
        let row: Option<TemplateRow> = sqlx::query_as::<_, TemplateRow>(&format!(
            r#"
            UPDATE message_template
            SET title = COALESCE($2, title),
                content = COALESCE($3, content),
                is_active = COALESCE($4, is_active),
                updated_at = now()
            WHERE template_id = $1
            RETURNING {TEMPLATE_COLUMNS}
            "#
        ))
        .bind(template_id)
        .bind(patch.title.as_deref())
        .bind(patch.content.as_deref())
        .bind(patch.is_active)
        .fetch_optional(&self.pool)
        .await?;

        row.map(MessageTemplate::try_from).transpose()
    }

    async fn enqueue_message(
        &self,
        msg: &NewCampaignMessage,
        prompt: Option<OpenPrompt>,
    ) -> Result<EnqueueOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO campaign_message
              (phone, template_id, appointment_id, campaign_id, trigger_type, content, status)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending')
            ON CONFLICT (appointment_id, trigger_type) WHERE appointment_id IS NOT NULL
            DO NOTHING
            RETURNING message_id
            "#,
        )
        .bind(&msg.phone)
        .bind(msg.template_id)
        .bind(msg.appointment_id)
        .bind(msg.campaign_id)
        .bind(msg.trigger_type.as_str())
        .bind(&msg.content)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(message_id) = inserted else {
            let existing: Uuid = sqlx::query_scalar(
                r#"
                SELECT message_id
                FROM campaign_message
                WHERE appointment_id = $1 AND trigger_type = $2
                "#,
            )
            .bind(msg.appointment_id)
            .bind(msg.trigger_type.as_str())
            .fetch_one(&mut *tx)
            .await?;

            tx.commit().await?;
            return Ok(EnqueueOutcome::Duplicate {
                message_id: existing,
            });
        };

        if let (Some(appointment_id), Some(prompt)) = (msg.appointment_id, prompt) {
            open_prompt(&mut tx, appointment_id, &msg.phone, prompt).await?;
        }

        tx.commit().await?;
        Ok(EnqueueOutcome::Created { message_id })
    }

    async fn claim_pending(
        &self,
        limit: i64,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<ClaimedMessage>, StoreError> {
        let claim_token = Uuid::new_v4();

        // SKIP LOCKED keeps overlapping runs off each other's rows; the lease
        // keeps them off after this statement commits.
        let rows: Vec<MessageRow> = sqlx::query_as::<_, MessageRow>(&format!(
            r#"
            UPDATE campaign_message
            SET claim_token = $1,
                claimed_until = $2
            WHERE message_id IN (
                SELECT message_id
                FROM campaign_message
                WHERE status = 'pending'
                  AND (claimed_until IS NULL OR claimed_until < now())
                ORDER BY created_at ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(claim_token)
        .bind(lease_until)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut messages: Vec<CampaignMessage> = convert_all(rows)?;
        messages.sort_by_key(|m| m.created_at);

        Ok(messages
            .into_iter()
            .map(|message| ClaimedMessage {
                message,
                claim_token,
            })
            .collect())
    }

    async fn renew_claim(
        &self,
        message_id: Uuid,
        claim_token: Uuid,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        // A competing claim rewrites claim_token, so matching it is enough
        // even when our lease already lapsed.
        let res = sqlx::query(
            r#"
            UPDATE campaign_message
            SET claimed_until = $3
            WHERE message_id = $1
              AND status = 'pending'
              AND claim_token = $2
            "#,
        )
        .bind(message_id)
        .bind(claim_token)
        .bind(lease_until)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn mark_sent(
        &self,
        message_id: Uuid,
        claim_token: Uuid,
        sent_at: DateTime<Utc>,
        provider_message_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE campaign_message
            SET status = 'sent',
                sent_at = $3,
                provider_message_id = $4,
                error_message = NULL,
                failure_kind = NULL,
                claim_token = NULL,
                claimed_until = NULL
            WHERE message_id = $1
              AND status = 'pending'
              AND claim_token = $2
            "#,
        )
        .bind(message_id)
        .bind(claim_token)
        .bind(sent_at)
        .bind(provider_message_id)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn mark_failed(
        &self,
        message_id: Uuid,
        claim_token: Uuid,
        error_message: &str,
        kind: FailureKind,
    ) -> Result<bool, StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE campaign_message
            SET status = 'failed',
                error_message = $3,
                failure_kind = $4,
                claim_token = NULL,
                claimed_until = NULL
            WHERE message_id = $1
              AND status = 'pending'
              AND claim_token = $2
            "#,
        )
        .bind(message_id)
        .bind(claim_token)
        .bind(error_message)
        .bind(kind.as_str())
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn requeue_failed(&self, filter: &RequeueFilter) -> Result<u64, StoreError> {
        let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
            r#"
            UPDATE campaign_message
            SET status = 'pending',
                error_message = NULL,
                failure_kind = NULL,
                claim_token = NULL,
                claimed_until = NULL
            WHERE status = 'failed'
            "#,
        );

        if let Some(t) = filter.trigger_type {
            qb.push(" AND trigger_type = ");
            qb.push_bind(t.as_str());
        }
        if let Some(from) = filter.created_from {
            qb.push(" AND created_at >= ");
            qb.push_bind(from);
        }
        if let Some(to) = filter.created_to {
            qb.push(" AND created_at <= ");
            qb.push_bind(to);
        }
        if !filter.include_permanent {
            qb.push(" AND failure_kind IS DISTINCT FROM 'permanent' ");
        }

        let res = qb.build().execute(&self.pool).await?;
        Ok(res.rows_affected())
    }

    async fn search_messages(&self, q: &MessageSearch) -> Result<Vec<CampaignMessage>, StoreError> {
        let limit = q.limit.unwrap_or(50).clamp(1, 200);
        let offset = q.offset.unwrap_or(0).max(0);

        let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(format!(
            "SELECT {MESSAGE_COLUMNS} FROM campaign_message WHERE 1=1 "
        ));

        if let Some(status) = q.status {
            qb.push(" AND status = ");
            qb.push_bind(status.as_str());
        }
        if let Some(t) = q.trigger_type {
            qb.push(" AND trigger_type = ");
            qb.push_bind(t.as_str());
        }
        if let Some(campaign_id) = q.campaign_id {
            qb.push(" AND campaign_id = ");
            qb.push_bind(campaign_id);
        }
        if let Some(phone) = q.phone.as_ref().map(|s| s.trim()).filter(|s| !s.is_empty()) {
            qb.push(" AND phone = ");
            qb.push_bind(phone.to_string());
        }

        qb.push(" ORDER BY created_at DESC ");
        qb.push(" LIMIT ");
        qb.push_bind(limit);
        qb.push(" OFFSET ");
        qb.push_bind(offset);

        let rows: Vec<MessageRow> = qb.build_query_as::<MessageRow>().fetch_all(&self.pool).await?;
        convert_all(rows)
    }

    async fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*)::bigint
            FROM campaign_message
            GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            match status.parse::<MessageStatus>()? {
                MessageStatus::Pending => counts.pending = n,
                MessageStatus::Sent => counts.sent = n,
                MessageStatus::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }

    async fn create_campaign(
        &self,
        new: &NewCampaign,
        recipients: &[CampaignRecipient],
    ) -> Result<Campaign, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row: CampaignRow = sqlx::query_as::<_, CampaignRow>(&format!(
            r#"
            INSERT INTO campaign (title, content, status, created_by)
            VALUES ($1, $2, 'processing', $3)
            RETURNING {CAMPAIGN_COLUMNS}
            "#
        ))
        .bind(&new.title)
        .bind(&new.content)
        .bind(new.created_by)
        .fetch_one(&mut *tx)
        .await?;

        if !recipients.is_empty() {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO campaign_message (phone, campaign_id, trigger_type, content, status) ",
            );
            qb.push_values(recipients, |mut b, r| {
                b.push_bind(&r.phone)
                    .push_bind(row.campaign_id)
                    .push_bind(TriggerType::Manual.as_str())
                    .push_bind(&r.content)
                    .push_bind(MessageStatus::Pending.as_str());
            });
            qb.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        row.try_into()
    }

    async fn get_campaign(
        &self,
        campaign_id: Uuid,
    ) -> Result<Option<CampaignWithStats>, StoreError> {
        let row: Option<CampaignRow> = sqlx::query_as::<_, CampaignRow>(&format!(
            r#"
            SELECT {CAMPAIGN_COLUMNS}
            FROM campaign
            WHERE campaign_id = $1
            "#
        ))
        .bind(campaign_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let (pending, sent, failed): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
              COUNT(*) FILTER (WHERE status = 'pending')::bigint,
              COUNT(*) FILTER (WHERE status = 'sent')::bigint,
              COUNT(*) FILTER (WHERE status = 'failed')::bigint
            FROM campaign_message
            WHERE campaign_id = $1
            "#,
        )
        .bind(campaign_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(Some(CampaignWithStats {
            campaign: row.try_into()?,
            stats: StatusCounts {
                pending,
                sent,
                failed,
            },
        }))
    }

    async fn roll_up_campaigns(&self) -> Result<u64, StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE campaign c
            SET status = CASE
                    WHEN EXISTS (
                        SELECT 1 FROM campaign_message m
                        WHERE m.campaign_id = c.campaign_id AND m.status = 'sent'
                    ) THEN 'completed'
                    ELSE 'failed'
                END,
                completed_at = now()
            WHERE c.status = 'processing'
              AND NOT EXISTS (
                  SELECT 1 FROM campaign_message m
                  WHERE m.campaign_id = c.campaign_id AND m.status = 'pending'
              )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    async fn open_feedback_for_phone(
        &self,
        phone: &str,
    ) -> Result<Option<AttendanceFeedback>, StoreError> {
        let row: Option<FeedbackRow> = sqlx::query_as::<_, FeedbackRow>(&format!(
            r#"
            SELECT {FEEDBACK_COLUMNS}
            FROM attendance_feedback
            WHERE patient_phone = $1
              AND feedback_state = 'awaiting_reply'
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(phone)
        .fetch_optional(&self.pool)
        .await?;

        row.map(AttendanceFeedback::try_from).transpose()
    }

    async fn get_feedback(
        &self,
        appointment_id: Uuid,
    ) -> Result<Option<AttendanceFeedback>, StoreError> {
        let row: Option<FeedbackRow> = sqlx::query_as::<_, FeedbackRow>(&format!(
            r#"
            SELECT {FEEDBACK_COLUMNS}
            FROM attendance_feedback
            WHERE appointment_id = $1
            "#
        ))
        .bind(appointment_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(AttendanceFeedback::try_from).transpose()
    }

    async fn resolve_feedback(
        &self,
        appointment_id: Uuid,
        to: FeedbackState,
        reply_text: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE attendance_feedback
            SET feedback_state = $2,
                reply_text = $3,
                responded_at = $4,
                updated_at = now()
            WHERE appointment_id = $1
              AND feedback_state = 'awaiting_reply'
            "#,
        )
        .bind(appointment_id)
        .bind(to.as_str())
        .bind(reply_text)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn expire_feedback(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        // The horizon runs from when the prompt actually went out.
        let res = sqlx::query(
            r#"
            UPDATE attendance_feedback f
            SET feedback_state = 'expired',
                updated_at = now()
            FROM campaign_message m
            WHERE f.feedback_state = 'awaiting_reply'
              AND m.appointment_id = f.appointment_id
              AND m.trigger_type = 'post_attendance'
              AND m.status = 'sent'
              AND m.sent_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    async fn upcoming_appointments(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<UpcomingAppointment>, StoreError> {
        // Clinic tables: status 0 scheduled, 1 confirmed.
        let rows: Vec<UpcomingRow> = sqlx::query_as::<_, UpcomingRow>(
            r#"
            SELECT
              a.appointment_id,
              a.start_at,
              concat_ws(' ', p.first_name, p.last_name) AS patient_name,
              ph.phone_number AS patient_phone,
              NULLIF(concat_ws(' ', d.first_name, d.last_name), '') AS professional_name
            FROM appointment a
            JOIN patient p ON p.patient_id = a.patient_id
            JOIN LATERAL (
                SELECT phone_number
                FROM phone_number
                WHERE patient_id = p.patient_id
                ORDER BY is_primary DESC, created_at ASC
                LIMIT 1
            ) ph ON true
            LEFT JOIN employee d ON d.employee_id = a.doctor_employee_id
            WHERE a.start_at > $1
              AND a.start_at <= $2
              AND a.status IN (0, 1)
              AND NOT EXISTS (
                  SELECT 1 FROM campaign_message m
                  WHERE m.appointment_id = a.appointment_id
                    AND m.trigger_type = 'appointment_reminder'
              )
            ORDER BY a.start_at ASC
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| UpcomingAppointment {
                appointment_id: r.appointment_id,
                patient_name: r.patient_name,
                patient_phone: r.patient_phone,
                professional_name: r.professional_name,
                starts_at: r.start_at,
            })
            .collect())
    }

    async fn open_confirmation_for_phone(
        &self,
        phone: &str,
    ) -> Result<Option<AppointmentConfirmation>, StoreError> {
        let row: Option<ConfirmationRow> = sqlx::query_as::<_, ConfirmationRow>(&format!(
            r#"
            SELECT {CONFIRMATION_COLUMNS}
            FROM appointment_confirmation
            WHERE patient_phone = $1
              AND confirmation_state = 'awaiting_confirmation'
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(phone)
        .fetch_optional(&self.pool)
        .await?;

        row.map(AppointmentConfirmation::try_from).transpose()
    }

    async fn get_confirmation(
        &self,
        appointment_id: Uuid,
    ) -> Result<Option<AppointmentConfirmation>, StoreError> {
        let row: Option<ConfirmationRow> = sqlx::query_as::<_, ConfirmationRow>(&format!(
            r#"
            SELECT {CONFIRMATION_COLUMNS}
            FROM appointment_confirmation
            WHERE appointment_id = $1
            "#
        ))
        .bind(appointment_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(AppointmentConfirmation::try_from).transpose()
    }

    async fn confirm_appointment(
        &self,
        appointment_id: Uuid,
        reply_text: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let res = sqlx::query(
            r#"
            UPDATE appointment_confirmation
            SET confirmation_state = 'confirmed',
                reply_text = $2,
                confirmed_at = $3,
                updated_at = now()
            WHERE appointment_id = $1
              AND confirmation_state = 'awaiting_confirmation'
            "#,
        )
        .bind(appointment_id)
        .bind(reply_text)
        .bind(at)
        .execute(&mut *tx)
        .await?;

        if res.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE appointment
            SET status = 1
            WHERE appointment_id = $1
              AND status = 0
            "#,
        )
        .bind(appointment_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn expire_confirmations(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE appointment_confirmation
            SET confirmation_state = 'expired',
                updated_at = now()
            WHERE confirmation_state = 'awaiting_confirmation'
              AND starts_at < $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    async fn schedule_follow_ups(&self, items: &[NewFollowUp]) -> Result<u64, StoreError> {
        if items.is_empty() {
            return Ok(0);
        }

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO scheduled_follow_up (appointment_id, trigger_type, patient_phone, vars, due_at) ",
        );
        qb.push_values(items, |mut b, f| {
            b.push_bind(f.appointment_id)
                .push_bind(f.trigger_type.as_str())
                .push_bind(&f.patient_phone)
                .push_bind(Json(&f.vars))
                .push_bind(f.due_at);
        });
        qb.push(" ON CONFLICT (appointment_id, trigger_type) DO NOTHING");

        let res = qb.build().execute(&self.pool).await?;
        Ok(res.rows_affected())
    }

    async fn due_follow_ups(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ScheduledFollowUp>, StoreError> {
        let rows: Vec<FollowUpRow> = sqlx::query_as::<_, FollowUpRow>(&format!(
            r#"
            SELECT {FOLLOW_UP_COLUMNS}
            FROM scheduled_follow_up
            WHERE status = 'scheduled'
              AND due_at <= $1
            ORDER BY due_at ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }

    async fn list_follow_ups(
        &self,
        appointment_id: Uuid,
    ) -> Result<Vec<ScheduledFollowUp>, StoreError> {
        let rows: Vec<FollowUpRow> = sqlx::query_as::<_, FollowUpRow>(&format!(
            r#"
            SELECT {FOLLOW_UP_COLUMNS}
            FROM scheduled_follow_up
            WHERE appointment_id = $1
            ORDER BY due_at ASC
            "#
        ))
        .bind(appointment_id)
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }

    async fn close_follow_up(
        &self,
        follow_up_id: Uuid,
        to: FollowUpStatus,
        message_id: Option<Uuid>,
    ) -> Result<bool, StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE scheduled_follow_up
            SET status = $2,
                message_id = $3,
                updated_at = now()
            WHERE follow_up_id = $1
              AND status = 'scheduled'
            "#,
        )
        .bind(follow_up_id)
        .bind(to.as_str())
        .bind(message_id)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn record_inbound(&self, event: &InboundEvent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO inbound_event
              (inbound_event_id, phone, is_group, text, disposition,
               appointment_id, detail, payload, received_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(event.inbound_event_id)
        .bind(&event.phone)
        .bind(event.is_group)
        .bind(event.text.as_deref())
        .bind(event.disposition.as_str())
        .bind(event.appointment_id)
        .bind(event.detail.as_deref())
        .bind(&event.payload)
        .bind(event.received_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn session_user(&self, token_hash: &str) -> Result<Option<SessionUser>, StoreError> {
        // Sessions are issued by the clinic app; ensure the user is still active.
        let row: Option<SessionLookupRow> = sqlx::query_as::<_, SessionLookupRow>(
            r#"
            SELECT st.session_token_id, st.user_id, u.roles
            FROM session_token st
            JOIN "dcms_user" u ON u.user_id = st.user_id
            WHERE st.session_token_hash = $1
              AND st.revoked_at IS NULL
              AND st.expires_at > now()
              AND u.is_active = true
            "#,
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        // Touch last_seen_at (best-effort)
        let _ = sqlx::query(
            r#"
            UPDATE session_token
            SET last_seen_at = now()
            WHERE session_token_id = $1
            "#,
        )
        .bind(row.session_token_id)
        .execute(&self.pool)
        .await;

        Ok(Some(SessionUser {
            session_token_id: row.session_token_id,
            user_id: row.user_id,
            role: row.roles,
        }))
    }
}
