use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::messaging::dispatch::Dispatcher;
use crate::messaging::inbound::InboundHandler;
use crate::messaging::trigger::{EventPublisher, TriggerEngine};
use crate::store::MessagingStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn MessagingStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub inbound: Arc<InboundHandler>,
    pub events: EventPublisher,
    pub engine: Arc<TriggerEngine>,
    pub feedback_expiry_hours: i64,
    pub reminder_lead_hours: i64,
    pub webhook_token: Option<String>,
    pub cron_secret: Option<String>,
}

/* -------------------------
   API DTOs
--------------------------*/

#[derive(Debug, Serialize)]
pub struct ApiOk<T> {
    pub data: T,
}

/* -------------------------
   Enums stored as text
--------------------------*/

/// Raised when a text column holds a value the enum does not know.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

text_enum!(TriggerType, "trigger_type", {
    Manual => "manual",
    AppointmentConfirmation => "appointment_confirmation",
    AppointmentReminder => "appointment_reminder",
    PostAttendance => "post_attendance",
    InsoleDelivery => "insole_delivery",
    InsoleMaintenance => "insole_maintenance",
});

text_enum!(MessageStatus, "message_status", {
    Pending => "pending",
    Sent => "sent",
    Failed => "failed",
});

text_enum!(FailureKind, "failure_kind", {
    Transient => "transient",
    Permanent => "permanent",
});

text_enum!(FeedbackState, "feedback_state", {
    AwaitingReply => "awaiting_reply",
    RepliedPositive => "replied_positive",
    RepliedNegative => "replied_negative",
    Unrecognized => "unrecognized",
    Expired => "expired",
});

impl FeedbackState {
    /// Every state except `awaiting_reply` is terminal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FeedbackState::AwaitingReply)
    }
}

text_enum!(ConfirmationState, "confirmation_state", {
    AwaitingConfirmation => "awaiting_confirmation",
    Confirmed => "confirmed",
    Expired => "expired",
});

text_enum!(FollowUpStatus, "follow_up_status", {
    Scheduled => "scheduled",
    Enqueued => "enqueued",
    Skipped => "skipped",
    Cancelled => "cancelled",
});

text_enum!(CampaignStatus, "campaign_status", {
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

text_enum!(InboundDisposition, "inbound_disposition", {
    Applied => "applied",
    Confirmed => "confirmed",
    NotAConfirmation => "not_a_confirmation",
    Unmatched => "unmatched",
    IgnoredGroup => "ignored_group",
    IgnoredSelf => "ignored_self",
    Duplicate => "duplicate",
    Error => "error",
});

/* -------------------------
   Domain rows
--------------------------*/

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub template_id: Uuid,
    pub title: String,
    pub trigger_type: TriggerType,
    pub content: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignMessage {
    pub message_id: Uuid,
    pub phone: String,
    pub template_id: Option<Uuid>,
    pub appointment_id: Option<Uuid>,
    pub campaign_id: Option<Uuid>,
    pub trigger_type: TriggerType,
    pub content: String,
    pub status: MessageStatus,
    pub error_message: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub provider_message_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A pending row held by one dispatch run. Only the holder of `claim_token`
/// may finalize it.
#[derive(Debug, Clone)]
pub struct ClaimedMessage {
    pub message: CampaignMessage,
    pub claim_token: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttendanceFeedback {
    pub appointment_id: Uuid,
    pub patient_phone: String,
    pub feedback_state: FeedbackState,
    pub reply_text: Option<String>,
    pub responded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Reminder prompt waiting for the patient to confirm the appointment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppointmentConfirmation {
    pub appointment_id: Uuid,
    pub patient_phone: String,
    pub confirmation_state: ConfirmationState,
    pub starts_at: DateTime<Utc>,
    pub reply_text: Option<String>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A future message parked until `due_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledFollowUp {
    pub follow_up_id: Uuid,
    pub appointment_id: Uuid,
    pub trigger_type: TriggerType,
    pub patient_phone: String,
    pub vars: HashMap<String, String>,
    pub due_at: DateTime<Utc>,
    pub status: FollowUpStatus,
    pub message_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub campaign_id: Uuid,
    pub title: String,
    pub content: String,
    pub status: CampaignStatus,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CampaignWithStats {
    #[serde(flatten)]
    pub campaign: Campaign,
    pub stats: StatusCounts,
}

/// Clinic appointment due for a reminder, read from the clinic tables.
#[derive(Debug, Clone)]
pub struct UpcomingAppointment {
    pub appointment_id: Uuid,
    pub patient_name: String,
    pub patient_phone: String,
    pub professional_name: Option<String>,
    pub starts_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub inbound_event_id: Uuid,
    pub phone: String,
    pub is_group: bool,
    pub text: Option<String>,
    pub disposition: InboundDisposition,
    pub appointment_id: Option<Uuid>,
    pub detail: Option<String>,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

/// Client-held snapshot of the attendance being conducted. Never persisted
/// here; it arrives with the "complete attendance" action.
#[derive(Debug, Clone, Deserialize)]
pub struct ActiveAttendanceSession {
    pub patient_name: String,
    pub patient_phone: String,
    pub started_at: Option<DateTime<Utc>>,
    pub professional_name: Option<String>,
}

/* -------------------------
   Store inputs
--------------------------*/

#[derive(Debug, Clone)]
pub struct NewCampaignMessage {
    pub phone: String,
    pub template_id: Option<Uuid>,
    pub appointment_id: Option<Uuid>,
    pub campaign_id: Option<Uuid>,
    pub trigger_type: TriggerType,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct NewFollowUp {
    pub appointment_id: Uuid,
    pub trigger_type: TriggerType,
    pub patient_phone: String,
    pub vars: HashMap<String, String>,
    pub due_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewCampaign {
    pub title: String,
    pub content: String,
    pub created_by: Option<Uuid>,
}

/// One campaign recipient; `content` is already personalised.
#[derive(Debug, Clone)]
pub struct CampaignRecipient {
    pub phone: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct NewTemplate {
    pub title: String,
    pub trigger_type: TriggerType,
    pub content: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TemplatePatch {
    pub title: Option<String>,
    pub content: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequeueFilter {
    pub trigger_type: Option<TriggerType>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    /// Permanent gateway rejections are skipped unless this is set.
    #[serde(default)]
    pub include_permanent: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageSearch {
    pub status: Option<MessageStatus>,
    pub trigger_type: Option<TriggerType>,
    pub campaign_id: Option<Uuid>,
    pub phone: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: i64,
    pub sent: i64,
    pub failed: i64,
}

/// Operator identity resolved from a bearer session token.
#[derive(Debug, Clone)]
pub struct SessionUser {
    pub session_token_id: Uuid,
    pub user_id: Uuid,
    pub role: i16,
}

/* -------------------------
   Helpers
--------------------------*/

/// Role mapping of the clinic user table:
/// 0 Patient, 1 Admin, 2 Manager, 3 Doctor, 4 Receptionist
pub fn role_to_string(role: i16) -> String {
    match role {
        0 => "patient",
        1 => "admin",
        2 => "manager",
        3 => "doctor",
        4 => "receptionist",
        _ => "unknown",
    }
    .to_string()
}
