use std::env;
use std::str::FromStr;

use anyhow::{anyhow, bail};
use chrono::FixedOffset;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub db_max_connections: u32,
    pub db_acquire_timeout_secs: u64,
    pub dispatch: DispatchConfig,
    pub scheduler_interval_secs: u64,
    pub feedback_expiry_hours: i64,
    pub reminder_lead_hours: i64,
    /// Clinic wall clock used in rendered dates, minutes east of UTC.
    pub clinic_utc_offset_minutes: i32,
    pub event_queue_capacity: usize,
    pub default_country_code: String,
    pub gateway: GatewayConfig,
    pub test_mode_safe_number: Option<String>,
    pub webhook_token: Option<String>,
    pub cron_secret: Option<String>,
}

#[derive(Clone, Debug)]
pub struct DispatchConfig {
    pub batch_size: i64,
    pub fan_out: usize,
    pub lease_secs: i64,
    pub send_timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 6,
            fan_out: 3,
            lease_secs: 300,
            send_timeout_secs: 15,
        }
    }
}

impl DispatchConfig {
    /// Each send renews its lease right before calling the gateway, so the
    /// lease only has to outlive a single send.
    pub fn validate(&self) -> anyhow::Result<()> {
        let send_secs = i64::try_from(self.send_timeout_secs).unwrap_or(i64::MAX);
        if self.lease_secs <= send_secs {
            bail!(
                "DISPATCH_LEASE_SECS ({}) must exceed GATEWAY_TIMEOUT_SECS ({})",
                self.lease_secs,
                self.send_timeout_secs
            );
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub enum GatewayConfig {
    ZApi {
        instance_id: String,
        token: String,
        client_token: Option<String>,
    },
    Evolution {
        url: String,
        api_key: String,
        instance: String,
    },
    Simulation,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL")?;
        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

        let defaults = DispatchConfig::default();
        let dispatch = DispatchConfig {
            batch_size: parse_or("DISPATCH_BATCH_SIZE", defaults.batch_size).max(1),
            fan_out: parse_or("DISPATCH_FAN_OUT", defaults.fan_out).max(1),
            lease_secs: parse_or("DISPATCH_LEASE_SECS", defaults.lease_secs).max(1),
            send_timeout_secs: parse_or("GATEWAY_TIMEOUT_SECS", defaults.send_timeout_secs).max(1),
        };
        dispatch.validate()?;

        Ok(Self {
            database_url,
            bind_addr,
            db_max_connections: parse_or("DB_MAX_CONNECTIONS", 10),
            db_acquire_timeout_secs: parse_or("DB_ACQUIRE_TIMEOUT_SECS", 5),
            dispatch,
            scheduler_interval_secs: parse_or("SCHEDULER_INTERVAL_SECS", 60).max(1),
            feedback_expiry_hours: parse_or("FEEDBACK_EXPIRY_HOURS", 48).max(1),
            reminder_lead_hours: parse_or("REMINDER_LEAD_HOURS", 24).max(1),
            clinic_utc_offset_minutes: clinic_offset_minutes()?,
            event_queue_capacity: parse_or("EVENT_QUEUE_CAPACITY", 256).max(1),
            default_country_code: env::var("DEFAULT_COUNTRY_CODE").unwrap_or_else(|_| "55".into()),
            gateway: gateway_from_env()?,
            test_mode_safe_number: non_empty("TEST_MODE_SAFE_NUMBER"),
            webhook_token: non_empty("WEBHOOK_TOKEN"),
            cron_secret: non_empty("CRON_SECRET"),
        })
    }
}

fn clinic_offset_minutes() -> anyhow::Result<i32> {
    let minutes = parse_or("CLINIC_UTC_OFFSET_MINUTES", -180);
    clinic_offset(minutes)?;
    Ok(minutes)
}

/// Offset for a signed minute count; rejects anything beyond ±24h.
pub fn clinic_offset(minutes: i32) -> anyhow::Result<FixedOffset> {
    minutes
        .checked_mul(60)
        .and_then(FixedOffset::east_opt)
        .ok_or_else(|| anyhow!("CLINIC_UTC_OFFSET_MINUTES out of range: {minutes}"))
}

fn gateway_from_env() -> anyhow::Result<GatewayConfig> {
    let provider = env::var("GATEWAY_PROVIDER").unwrap_or_else(|_| "simulation".into());

    match provider.trim().to_ascii_lowercase().as_str() {
        "zapi" => Ok(GatewayConfig::ZApi {
            instance_id: required("ZAPI_INSTANCE_ID")?,
            token: required("ZAPI_TOKEN")?,
            client_token: non_empty("ZAPI_CLIENT_TOKEN"),
        }),
        "evolution" => Ok(GatewayConfig::Evolution {
            url: required("EVOLUTION_URL")?,
            api_key: required("EVOLUTION_API_KEY")?,
            instance: required("EVOLUTION_INSTANCE")?,
        }),
        "simulation" | "" => Ok(GatewayConfig::Simulation),
        other => bail!("unknown GATEWAY_PROVIDER: {other}"),
    }
}

fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn required(key: &str) -> anyhow::Result<String> {
    non_empty(key).ok_or_else(|| anyhow!("{key} is required for the selected gateway provider"))
}
