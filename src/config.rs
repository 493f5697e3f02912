use std::{str::FromStr, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{FixedOffset, Local, Offset, Utc};

use crate::reminder::checked_lookahead;

const DEFAULT_VAPID_SUBJECT: &str = "mailto:admin@example.com";
const MAX_SEND_TIMEOUT_SECS: u64 = 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Firestore,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "memory" => Ok(StoreBackend::Memory),
            "firestore" => Ok(StoreBackend::Firestore),
            other => Err(anyhow!("Unknown store backend {:?}.", other)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub vapid_pubkey: Option<String>,
    pub vapid_privkey: Option<String>,
    pub vapid_subject: String,
    pub cron_secret: Option<String>,
    pub admin_api_key: Option<String>,

    pub store: StoreBackend,
    pub gcp_project_id: Option<String>,
    pub due_collection: String,

    pub throttle_interval: chrono::Duration,
    pub lookahead_days: u32,
    pub send_concurrency: usize,
    pub send_timeout: Duration,
    pub push_ttl_secs: u32,
    pub utc_offset: FixedOffset,
    pub subscribe_per_minute: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            vapid_pubkey: None,
            vapid_privkey: None,
            vapid_subject: DEFAULT_VAPID_SUBJECT.to_string(),
            cron_secret: None,
            admin_api_key: None,
            store: StoreBackend::Memory,
            gcp_project_id: None,
            due_collection: "loans".to_string(),
            throttle_interval: chrono::Duration::hours(6),
            lookahead_days: 2,
            send_concurrency: crate::dispatch::DEFAULT_CONCURRENCY,
            send_timeout: Duration::from_secs(30),
            push_ttl_secs: 24 * 60 * 60,
            utc_offset: Utc.fix(),
            subscribe_per_minute: 30,
        }
    }
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow!("{}", e))
            .with_context(|| format!("Invalid value for {} env var.", name)),
        None => Ok(None),
    }
}

/// Parses offsets such as `+05:30`, `-08:00` or `Z`.
pub fn parse_utc_offset(raw: &str) -> Result<FixedOffset> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).context("UTC offset out of range.");
    }

    let (sign, rest) = match raw.as_bytes().first() {
        Some(b'+') => (1, &raw[1..]),
        Some(b'-') => (-1, &raw[1..]),
        _ => bail!("UTC offset {:?} must start with + or -.", raw),
    };

    let (hours, minutes) = rest.split_once(':').unwrap_or((rest, "0"));
    let hours: i32 = hours.parse().context("Bad hours in UTC offset.")?;
    let minutes: i32 = minutes.parse().context("Bad minutes in UTC offset.")?;

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .with_context(|| format!("UTC offset {:?} out of range.", raw))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();

        let store = parsed::<StoreBackend>("PUSH_STORE")?.unwrap_or(defaults.store);
        let gcp_project_id = var("GCP_PROJECT_ID");
        if store == StoreBackend::Firestore && gcp_project_id.is_none() {
            bail!("Expected GCP_PROJECT_ID env var for the firestore store.");
        }

        let send_timeout_secs = parsed::<u64>("PUSH_SEND_TIMEOUT_SECS")?
            .unwrap_or(defaults.send_timeout.as_secs());
        if send_timeout_secs == 0 || send_timeout_secs > MAX_SEND_TIMEOUT_SECS {
            bail!(
                "PUSH_SEND_TIMEOUT_SECS must be between 1 and {}.",
                MAX_SEND_TIMEOUT_SECS
            );
        }

        let utc_offset = match var("REMINDER_UTC_OFFSET") {
            Some(raw) => parse_utc_offset(&raw)?,
            None => Local::now().offset().fix(),
        };

        let config = Config {
            vapid_pubkey: var("PUSH_VAPID_PUBKEY"),
            vapid_privkey: var("PUSH_VAPID_PRIVKEY"),
            vapid_subject: var("PUSH_VAPID_SUBJECT").unwrap_or(defaults.vapid_subject),
            cron_secret: var("PUSH_CRON_SECRET"),
            admin_api_key: var("PUSH_ADMIN_API_KEY"),
            store,
            gcp_project_id,
            due_collection: var("PUSH_DUE_COLLECTION").unwrap_or(defaults.due_collection),
            throttle_interval: parsed::<i64>("PUSH_THROTTLE_HOURS")?
                .map(chrono::Duration::hours)
                .unwrap_or(defaults.throttle_interval),
            lookahead_days: checked_lookahead(
                parsed("PUSH_LOOKAHEAD_DAYS")?.unwrap_or(defaults.lookahead_days),
            )
            .context("Invalid value for PUSH_LOOKAHEAD_DAYS env var.")?,
            send_concurrency: parsed::<usize>("PUSH_SEND_CONCURRENCY")?
                .unwrap_or(defaults.send_concurrency)
                .max(1),
            send_timeout: Duration::from_secs(send_timeout_secs),
            push_ttl_secs: parsed("PUSH_TTL_SECS")?.unwrap_or(defaults.push_ttl_secs),
            utc_offset,
            subscribe_per_minute: parsed::<u32>("PUSH_SUBSCRIBE_PER_MINUTE")?
                .unwrap_or(defaults.subscribe_per_minute)
                .max(1),
        };

        if config.vapid_privkey.is_none() {
            tracing::warn!("PUSH_VAPID_PRIVKEY is not set; sending is disabled.");
        }
        if config.cron_secret.is_none() {
            tracing::warn!("PUSH_CRON_SECRET is not set; the reminder trigger will refuse to run.");
        }

        Ok(config)
    }
}
