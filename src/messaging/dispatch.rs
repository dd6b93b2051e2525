// src/messaging/dispatch.rs

//! One dispatch run: claim a batch of pending messages, send each through
//! the gateway, record the outcome.
//!
//! Every message is its own unit of work. A gateway failure, timeout or a
//! lost compare-and-set on one row never touches the others. Only failing to
//! claim the batch (datastore unreachable) fails the run.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;

use crate::config::DispatchConfig;
use crate::error::{GatewayError, StoreError};
use crate::gateway::MessageGateway;
use crate::models::ClaimedMessage;
use crate::store::MessagingStore;

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct DispatchSummary {
    pub processed: usize,
    pub sent: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendOutcome {
    Sent,
    Failed,
    /// Our claim was lost (lease expired and another run took the row).
    Lost,
}

pub struct Dispatcher {
    store: Arc<dyn MessagingStore>,
    gateway: Arc<dyn MessageGateway>,
    cfg: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn MessagingStore>,
        gateway: Arc<dyn MessageGateway>,
        cfg: DispatchConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            cfg,
        }
    }

    pub async fn run_batch(&self) -> Result<DispatchSummary, StoreError> {
        let lease_until = Utc::now() + chrono::Duration::seconds(self.cfg.lease_secs);
        let batch = self.store.claim_pending(self.cfg.batch_size, lease_until).await?;

        if batch.is_empty() {
            return Ok(DispatchSummary::default());
        }

        tracing::info!(
            batch = batch.len(),
            gateway = self.gateway.name(),
            "Dispatching pending messages"
        );

        // buffered() keeps results in claim order, which is oldest-first.
        let outcomes: Vec<SendOutcome> = stream::iter(batch)
            .map(|claimed| self.process_one(claimed))
            .buffered(self.cfg.fan_out.max(1))
            .collect()
            .await;

        let mut summary = DispatchSummary::default();
        for outcome in outcomes {
            match outcome {
                SendOutcome::Sent => {
                    summary.processed += 1;
                    summary.sent += 1;
                }
                SendOutcome::Failed => {
                    summary.processed += 1;
                    summary.failed += 1;
                }
                SendOutcome::Lost => {}
            }
        }

        tracing::info!(
            processed = summary.processed,
            sent = summary.sent,
            failed = summary.failed,
            "Dispatch run finished"
        );

        match self.store.roll_up_campaigns().await {
            Ok(0) => {}
            Ok(n) => tracing::info!(campaigns = n, "Campaigns finished"),
            Err(e) => tracing::error!(error = %e, "Campaign roll-up failed; retrying next run"),
        }

        Ok(summary)
    }

    async fn process_one(&self, claimed: ClaimedMessage) -> SendOutcome {
        let ClaimedMessage {
            message,
            claim_token,
        } = claimed;
        let id = message.message_id;
        let timeout = Duration::from_secs(self.cfg.send_timeout_secs);

        // Rows wait their turn behind the fan-out limit; the claim-time lease
        // may have lapsed by now. Renew so it covers this send.
        let lease_until = Utc::now() + chrono::Duration::seconds(self.cfg.lease_secs);
        match self.store.renew_claim(id, claim_token, lease_until).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(message_id = %id, "Claim lost before send; skipping");
                return SendOutcome::Lost;
            }
            Err(e) => {
                tracing::error!(message_id = %id, error = %e, "Could not renew claim; skipping send");
                return SendOutcome::Lost;
            }
        }

        let result = match tokio::time::timeout(
            timeout,
            self.gateway.send(&message.phone, &message.content),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => Err(GatewayError::Transient(format!(
                "gateway timed out after {}s",
                timeout.as_secs()
            ))),
        };

        let transition = match &result {
            Ok(receipt) => {
                self.store
                    .mark_sent(id, claim_token, Utc::now(), receipt.provider_message_id.as_deref())
                    .await
            }
            Err(e) => {
                tracing::warn!(message_id = %id, phone = %message.phone, error = %e, "Send failed");
                self.store
                    .mark_failed(id, claim_token, &e.to_string(), e.kind())
                    .await
            }
        };

        match transition {
            Ok(true) if result.is_ok() => SendOutcome::Sent,
            Ok(true) => SendOutcome::Failed,
            Ok(false) => {
                tracing::warn!(message_id = %id, "Claim lost before status update; row left to its new owner");
                SendOutcome::Lost
            }
            Err(e) => {
                // Row stays pending under our lease and is retried after it
                // expires. A successful send may therefore repeat.
                tracing::error!(message_id = %id, error = %e, "Could not record send outcome");
                SendOutcome::Lost
            }
        }
    }
}
