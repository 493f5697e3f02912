use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SUBSCRIPTIONS_COLLECTION: &str = "subscriptions";
pub const THROTTLE_COLLECTION: &str = "notification_log";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionKeys {
    pub p256dh: String,
    pub auth: String,
}

/// One device's push registration, keyed by `endpoint`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub endpoint: String,
    pub keys: SubscriptionKeys,

    /// The registration exactly as the browser produced it.
    pub subscription: Value,

    pub user_id: Option<String>,
    pub device_id: Option<String>,
    pub last_seen_at: DateTime<Utc>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn is_owned_by_other(&self, user_id: &str) -> bool {
        matches!(&self.user_id, Some(owner) if owner != user_id)
    }
}

/// Browser `PushSubscription.toJSON()` shape. Only the fields the transport
/// needs are typed; the full object is kept alongside as raw JSON.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct BrowserSubscription {
    endpoint: String,
    keys: SubscriptionKeys,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PushRegistration {
    pub endpoint: String,
    pub keys: SubscriptionKeys,
    pub raw: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("No subscription provided")]
    Missing,
    #[error("Malformed subscription: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl PushRegistration {
    pub fn from_raw(raw: Value) -> Result<Self, RegistrationError> {
        if raw.get("endpoint").and_then(Value::as_str).map_or(true, str::is_empty) {
            return Err(RegistrationError::Missing);
        }

        let parsed: BrowserSubscription = serde_json::from_value(raw.clone())?;

        Ok(PushRegistration {
            endpoint: parsed.endpoint,
            keys: parsed.keys,
            raw,
        })
    }
}

/// Insert-or-update request for a subscription. `None` ownership fields
/// leave whatever is already stored untouched.
#[derive(Debug, Clone)]
pub struct SubscriptionUpsert {
    pub registration: PushRegistration,
    pub user_id: Option<String>,
    pub device_id: Option<String>,
}

impl SubscriptionUpsert {
    pub fn anonymous(registration: PushRegistration, device_id: Option<String>) -> Self {
        SubscriptionUpsert {
            registration,
            user_id: None,
            device_id,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ThrottleEntry {
    pub user_id: String,
    pub subject_id: String,
    pub last_notified_at: DateTime<Utc>,
}

/// Anything with an owner and a deadline, read from the external record store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DueItem {
    pub id: String,
    pub owner_id: Option<String>,
    pub deadline: DateTime<Utc>,
    pub label: String,
}

/// JSON body the service worker turns into a system notification.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl PushPayload {
    pub fn new(title: &str, body: &str, url: Option<&str>) -> Self {
        PushPayload {
            title: title.to_string(),
            body: body.to_string(),
            url: url.unwrap_or("/").to_string(),
            meta: None,
            tag: None,
        }
    }
}
