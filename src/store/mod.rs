//! Persistence seams for subscriptions, the throttle ledger and the external
//! record store that due items are read from.
//!
//! Every mutation is an idempotent upsert or an exact-match delete, so two
//! overlapping reminder passes never need to coordinate.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{DueItem, Subscription, SubscriptionUpsert, ThrottleEntry};

pub mod firestore;
pub mod memory;

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Insert-or-update keyed by endpoint. `createdAt` is only set on insert,
    /// and an existing owner or device is only replaced by a `Some` value.
    /// An owned row never changes owner; a different `user_id` leaves both
    /// owner and device as they were.
    async fn upsert(&self, upsert: SubscriptionUpsert) -> Result<Subscription>;

    async fn find_by_endpoint(&self, endpoint: &str) -> Result<Option<Subscription>>;

    async fn find_by_user(&self, user_id: &str) -> Result<Vec<Subscription>>;

    async fn find_by_user_and_device(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Vec<Subscription>>;

    async fn find_all(&self) -> Result<Vec<Subscription>>;

    /// Returns whether a row was deleted.
    async fn remove(&self, endpoint: &str) -> Result<bool>;

    /// Claims every subscription registered from `device_id` that is unowned or
    /// already owned by `user_id`. Rows owned by someone else are left alone.
    /// Returns the number of rows linked.
    async fn link_device_to_user(&self, device_id: &str, user_id: &str) -> Result<usize>;

    /// Refreshes `lastSeenAt` after the transport accepted a message.
    async fn mark_seen(&self, endpoint: &str, at: DateTime<Utc>) -> Result<()>;
}

#[async_trait]
pub trait ThrottleLedger: Send + Sync {
    async fn get(&self, user_id: &str, subject_id: &str) -> Result<Option<ThrottleEntry>>;

    /// Upserts `lastNotifiedAt` for the pair.
    async fn record(&self, user_id: &str, subject_id: &str, at: DateTime<Utc>) -> Result<()>;
}

#[async_trait]
pub trait DueItemSource: Send + Sync {
    /// Owned items whose deadline lies in `[start, end]`.
    async fn find_due(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<DueItem>>;
}

pub(crate) fn apply_link(subscription: &mut Subscription, user_id: &str, at: DateTime<Utc>) -> bool {
    if subscription.is_owned_by_other(user_id) {
        return false;
    }

    subscription.user_id = Some(user_id.to_string());
    subscription.last_seen_at = at;
    subscription.is_active = true;
    subscription.updated_at = at;
    true
}

pub(crate) fn merge_upsert(
    existing: Option<Subscription>,
    upsert: SubscriptionUpsert,
    now: DateTime<Utc>,
) -> Subscription {
    let SubscriptionUpsert {
        registration,
        user_id,
        device_id,
    } = upsert;

    match existing {
        Some(mut current) => {
            current.keys = registration.keys;
            current.subscription = registration.raw;
            let claimed_by_other = user_id
                .as_deref()
                .map_or(false, |user_id| current.is_owned_by_other(user_id));
            if !claimed_by_other {
                if user_id.is_some() {
                    current.user_id = user_id;
                }
                if device_id.is_some() {
                    current.device_id = device_id;
                }
            }
            current.last_seen_at = now;
            current.is_active = true;
            current.updated_at = now;
            current
        }
        None => Subscription {
            endpoint: registration.endpoint,
            keys: registration.keys,
            subscription: registration.raw,
            user_id,
            device_id,
            last_seen_at: now,
            is_active: true,
            created_at: now,
            updated_at: now,
        },
    }
}
