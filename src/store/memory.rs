use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{apply_link, merge_upsert, DueItemSource, SubscriptionStore, ThrottleLedger};
use crate::model::{DueItem, Subscription, SubscriptionUpsert, ThrottleEntry};

/// Process-local backend. Nothing survives a restart; used for development
/// and as the test double for every store trait.
#[derive(Default)]
pub struct MemoryStore {
    subscriptions: RwLock<HashMap<String, Subscription>>,
    throttle: RwLock<HashMap<(String, String), ThrottleEntry>>,
    items: RwLock<HashMap<String, DueItem>>,
}

#[cfg(test)]
impl MemoryStore {
    pub async fn put_item(&self, item: DueItem) {
        self.items.write().await.insert(item.id.clone(), item);
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    pub async fn throttle_count(&self) -> usize {
        self.throttle.read().await.len()
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn upsert(&self, upsert: SubscriptionUpsert) -> Result<Subscription> {
        let mut subscriptions = self.subscriptions.write().await;
        let endpoint = upsert.registration.endpoint.clone();
        let merged = merge_upsert(subscriptions.remove(&endpoint), upsert, Utc::now());
        subscriptions.insert(endpoint, merged.clone());

        Ok(merged)
    }

    async fn find_by_endpoint(&self, endpoint: &str) -> Result<Option<Subscription>> {
        Ok(self.subscriptions.read().await.get(endpoint).cloned())
    }

    async fn find_by_user(&self, user_id: &str) -> Result<Vec<Subscription>> {
        Ok(self
            .subscriptions
            .read()
            .await
            .values()
            .filter(|s| s.user_id.as_deref() == Some(user_id))
            .cloned()
            .collect())
    }

    async fn find_by_user_and_device(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Vec<Subscription>> {
        Ok(self
            .subscriptions
            .read()
            .await
            .values()
            .filter(|s| {
                s.user_id.as_deref() == Some(user_id) && s.device_id.as_deref() == Some(device_id)
            })
            .cloned()
            .collect())
    }

    async fn find_all(&self) -> Result<Vec<Subscription>> {
        Ok(self.subscriptions.read().await.values().cloned().collect())
    }

    async fn remove(&self, endpoint: &str) -> Result<bool> {
        Ok(self.subscriptions.write().await.remove(endpoint).is_some())
    }

    async fn link_device_to_user(&self, device_id: &str, user_id: &str) -> Result<usize> {
        let now = Utc::now();
        let mut linked = 0;

        for subscription in self.subscriptions.write().await.values_mut() {
            if subscription.device_id.as_deref() != Some(device_id) {
                continue;
            }
            if apply_link(subscription, user_id, now) {
                linked += 1;
            }
        }

        Ok(linked)
    }

    async fn mark_seen(&self, endpoint: &str, at: DateTime<Utc>) -> Result<()> {
        if let Some(subscription) = self.subscriptions.write().await.get_mut(endpoint) {
            subscription.last_seen_at = at;
        }
        Ok(())
    }
}

#[async_trait]
impl ThrottleLedger for MemoryStore {
    async fn get(&self, user_id: &str, subject_id: &str) -> Result<Option<ThrottleEntry>> {
        Ok(self
            .throttle
            .read()
            .await
            .get(&(user_id.to_string(), subject_id.to_string()))
            .cloned())
    }

    async fn record(&self, user_id: &str, subject_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.throttle
            .write()
            .await
            .entry((user_id.to_string(), subject_id.to_string()))
            .and_modify(|entry| entry.last_notified_at = at)
            .or_insert_with(|| ThrottleEntry {
                user_id: user_id.to_string(),
                subject_id: subject_id.to_string(),
                last_notified_at: at,
            });
        Ok(())
    }
}

#[async_trait]
impl DueItemSource for MemoryStore {
    async fn find_due(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<DueItem>> {
        let mut due: Vec<DueItem> = self
            .items
            .read()
            .await
            .values()
            .filter(|item| item.owner_id.is_some())
            .filter(|item| item.deadline >= start && item.deadline <= end)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.deadline.cmp(&b.deadline).then_with(|| a.id.cmp(&b.id)));

        Ok(due)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{PushRegistration, SubscriptionKeys};
    use chrono::Duration;
    use serde_json::json;

    pub fn registration(endpoint: &str) -> PushRegistration {
        PushRegistration {
            endpoint: endpoint.to_string(),
            keys: SubscriptionKeys {
                p256dh: format!("p256dh-{}", endpoint),
                auth: "auth".to_string(),
            },
            raw: json!({ "endpoint": endpoint }),
        }
    }

    pub fn owned(endpoint: &str, user_id: &str, device_id: Option<&str>) -> SubscriptionUpsert {
        SubscriptionUpsert {
            registration: registration(endpoint),
            user_id: Some(user_id.to_string()),
            device_id: device_id.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn registering_twice_keeps_one_row_with_latest_metadata() {
        let store = MemoryStore::default();

        let first = store
            .upsert(SubscriptionUpsert::anonymous(registration("https://push/e1"), Some("dev-a".into())))
            .await
            .unwrap();

        let mut again = registration("https://push/e1");
        again.keys.auth = "rotated".to_string();
        let second = store
            .upsert(SubscriptionUpsert::anonymous(again, Some("dev-b".into())))
            .await
            .unwrap();

        assert_eq!(store.subscription_count().await, 1);
        assert_eq!(second.keys.auth, "rotated");
        assert_eq!(second.device_id.as_deref(), Some("dev-b"));
        assert_eq!(second.created_at, first.created_at);
    }

    #[tokio::test]
    async fn anonymous_upsert_does_not_clear_owner() {
        let store = MemoryStore::default();
        store.upsert(owned("https://push/e1", "alice", None)).await.unwrap();

        let refreshed = store
            .upsert(SubscriptionUpsert::anonymous(registration("https://push/e1"), None))
            .await
            .unwrap();

        assert_eq!(refreshed.user_id.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn owned_upsert_never_changes_owner() {
        let store = MemoryStore::default();
        store.upsert(owned("https://push/e1", "alice", Some("laptop"))).await.unwrap();

        let mut rotated = owned("https://push/e1", "bob", Some("phone"));
        rotated.registration.keys.auth = "rotated".to_string();
        let stored = store.upsert(rotated).await.unwrap();

        assert_eq!(stored.user_id.as_deref(), Some("alice"));
        assert_eq!(stored.device_id.as_deref(), Some("laptop"));
        assert_eq!(stored.keys.auth, "rotated");

        let same_owner = store
            .upsert(owned("https://push/e1", "alice", Some("phone")))
            .await
            .unwrap();
        assert_eq!(same_owner.device_id.as_deref(), Some("phone"));
    }

    #[tokio::test]
    async fn linking_skips_rows_owned_by_someone_else() {
        let store = MemoryStore::default();
        store
            .upsert(SubscriptionUpsert::anonymous(registration("https://push/free"), Some("dev".into())))
            .await
            .unwrap();
        store.upsert(owned("https://push/mine", "bob", Some("dev"))).await.unwrap();
        store.upsert(owned("https://push/theirs", "alice", Some("dev"))).await.unwrap();
        store
            .upsert(SubscriptionUpsert::anonymous(registration("https://push/other-device"), Some("x".into())))
            .await
            .unwrap();

        let linked = store.link_device_to_user("dev", "bob").await.unwrap();
        assert_eq!(linked, 2);

        let theirs = store.find_by_endpoint("https://push/theirs").await.unwrap().unwrap();
        assert_eq!(theirs.user_id.as_deref(), Some("alice"));

        let mut bobs: Vec<String> = store
            .find_by_user_and_device("bob", "dev")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.endpoint)
            .collect();
        bobs.sort();
        assert_eq!(bobs, vec!["https://push/free", "https://push/mine"]);
    }

    #[tokio::test]
    async fn ledger_updates_in_place() {
        let store = MemoryStore::default();
        let t0 = Utc::now();

        store.record("u", "item", t0).await.unwrap();
        store.record("u", "item", t0 + Duration::hours(7)).await.unwrap();

        assert_eq!(store.throttle_count().await, 1);
        let entry = ThrottleLedger::get(&store, "u", "item").await.unwrap().unwrap();
        assert_eq!(entry.last_notified_at, t0 + Duration::hours(7));
    }

    #[tokio::test]
    async fn due_window_is_inclusive_and_requires_owner() {
        let store = MemoryStore::default();
        let start = Utc::now();
        let end = start + Duration::days(1);

        for (id, owner, deadline) in [
            ("at-start", Some("u"), start),
            ("at-end", Some("u"), end),
            ("after", Some("u"), end + Duration::milliseconds(1)),
            ("orphan", None, start + Duration::hours(1)),
        ] {
            store
                .put_item(DueItem {
                    id: id.to_string(),
                    owner_id: owner.map(str::to_string),
                    deadline,
                    label: id.to_string(),
                })
                .await;
        }

        let ids: Vec<String> = store
            .find_due(start, end)
            .await
            .unwrap()
            .into_iter()
            .map(|item| item.id)
            .collect();
        assert_eq!(ids, vec!["at-start", "at-end"]);
    }
}
