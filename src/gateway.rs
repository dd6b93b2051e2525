// src/gateway.rs

//! Outbound messaging providers.
//!
//! Every provider takes an already-normalized phone (digits, country code
//! first). Sends carry no state between calls; the shared `reqwest::Client`
//! only pools connections.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::error::GatewayError;

/// What the provider handed back for an accepted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub provider_message_id: Option<String>,
}

#[async_trait]
pub trait MessageGateway: Send + Sync {
    async fn send(&self, phone: &str, content: &str) -> Result<SendReceipt, GatewayError>;

    fn name(&self) -> &'static str;
}

pub fn build_gateway(
    cfg: &GatewayConfig,
    timeout: Duration,
    test_mode_safe_number: Option<String>,
) -> anyhow::Result<Arc<dyn MessageGateway>> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;

    let inner: Arc<dyn MessageGateway> = match cfg {
        GatewayConfig::ZApi {
            instance_id,
            token,
            client_token,
        } => Arc::new(ZApiGateway {
            client,
            base_url: "https://api.z-api.io".into(),
            instance_id: instance_id.clone(),
            token: token.clone(),
            client_token: client_token.clone(),
        }),
        GatewayConfig::Evolution {
            url,
            api_key,
            instance,
        } => Arc::new(EvolutionGateway {
            client,
            base_url: url.trim_end_matches('/').to_string(),
            api_key: api_key.clone(),
            instance: instance.clone(),
        }),
        GatewayConfig::Simulation => {
            tracing::warn!("No messaging provider configured; sends are simulated");
            Arc::new(SimulatedGateway)
        }
    };

    Ok(match test_mode_safe_number {
        Some(safe_number) => {
            tracing::warn!(safe_number = %safe_number, "Test mode active; all sends are redirected");
            Arc::new(TestModeGateway::new(inner, safe_number))
        }
        None => inner,
    })
}

// --------------------------
// Z-API
// --------------------------

pub struct ZApiGateway {
    client: reqwest::Client,
    base_url: String,
    instance_id: String,
    token: String,
    client_token: Option<String>,
}

#[async_trait]
impl MessageGateway for ZApiGateway {
    async fn send(&self, phone: &str, content: &str) -> Result<SendReceipt, GatewayError> {
        let url = format!(
            "{}/instances/{}/token/{}/send-text",
            self.base_url, self.instance_id, self.token
        );

        let mut req = self
            .client
            .post(&url)
            .json(&json!({ "phone": phone, "message": content }));
        if let Some(ct) = &self.client_token {
            req = req.header("Client-Token", ct);
        }

        let body = send_json(req).await?;
        let id = body
            .get("id")
            .or_else(|| body.get("messageId"))
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(SendReceipt {
            provider_message_id: id,
        })
    }

    fn name(&self) -> &'static str {
        "zapi"
    }
}

// --------------------------
// Evolution API
// --------------------------

pub struct EvolutionGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    instance: String,
}

#[async_trait]
impl MessageGateway for EvolutionGateway {
    async fn send(&self, phone: &str, content: &str) -> Result<SendReceipt, GatewayError> {
        let url = format!("{}/message/sendText/{}", self.base_url, self.instance);

        let req = self
            .client
            .post(&url)
            .header("apikey", &self.api_key)
            .json(&json!({ "number": phone, "text": content }));

        let body = send_json(req).await?;
        let id = body
            .pointer("/key/id")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(SendReceipt {
            provider_message_id: id,
        })
    }

    fn name(&self) -> &'static str {
        "evolution"
    }
}

/// Execute a provider request and classify the outcome.
async fn send_json(req: reqwest::RequestBuilder) -> Result<Value, GatewayError> {
    let res = req.send().await?;
    let status = res.status();
    let text = res.text().await.unwrap_or_default();

    if status.is_success() {
        return Ok(serde_json::from_str(&text).unwrap_or(Value::Null));
    }

    let detail = format!("HTTP {}: {}", status.as_u16(), truncate(&text, 500));
    Err(classify_status(status.as_u16(), detail))
}

fn classify_status(status: u16, detail: String) -> GatewayError {
    match status {
        429 | 500..=599 => GatewayError::Transient(detail),
        _ => GatewayError::Permanent(detail),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// --------------------------
// Simulation / test mode
// --------------------------

/// Used when no provider is configured. Accepts everything.
pub struct SimulatedGateway;

#[async_trait]
impl MessageGateway for SimulatedGateway {
    async fn send(&self, phone: &str, content: &str) -> Result<SendReceipt, GatewayError> {
        tracing::info!(phone = %phone, chars = content.chars().count(), "[SIMULATION] message sent");
        Ok(SendReceipt {
            provider_message_id: Some(format!("simulated_{}", Uuid::new_v4().simple())),
        })
    }

    fn name(&self) -> &'static str {
        "simulation"
    }
}

/// Redirects every send to a safe number, tagging the original recipient.
///
/// A provider failure in test mode is logged and reported as a simulated
/// success so a broken sandbox never marks real rows as failed.
pub struct TestModeGateway {
    inner: Arc<dyn MessageGateway>,
    safe_number: String,
}

impl TestModeGateway {
    pub fn new(inner: Arc<dyn MessageGateway>, safe_number: String) -> Self {
        Self { inner, safe_number }
    }
}

#[async_trait]
impl MessageGateway for TestModeGateway {
    async fn send(&self, phone: &str, content: &str) -> Result<SendReceipt, GatewayError> {
        let redirected = format!("[TEST MODE] To: {phone}\n\n{content}");
        match self.inner.send(&self.safe_number, &redirected).await {
            Ok(receipt) => Ok(receipt),
            Err(e) => {
                tracing::warn!(
                    phone = %phone,
                    provider = self.inner.name(),
                    error = %e,
                    "Test mode send failed; recording simulated success"
                );
                Ok(SendReceipt {
                    provider_message_id: Some(format!(
                        "simulated_fallback_{}",
                        Uuid::new_v4().simple()
                    )),
                })
            }
        }
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}
