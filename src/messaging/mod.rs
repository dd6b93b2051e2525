//! Automated patient messaging: trigger -> queue -> dispatch -> reply.

pub mod dispatch;
pub mod follow_ups;
pub mod inbound;
pub mod recovery;
pub mod reminders;
pub mod scheduler;
pub mod templates;
pub mod trigger;
