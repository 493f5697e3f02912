use std::{convert::Infallible, pin::pin};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use deadpool::managed::{self, Object, Pool};
use google_authz::Credentials;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tiny_firestore_odm::{Collection, Database};
use tokio_stream::StreamExt;
use tonic::{Code, Status};

use super::{apply_link, merge_upsert, DueItemSource, SubscriptionStore, ThrottleLedger};
use crate::model::{
    DueItem, Subscription, SubscriptionKeys, SubscriptionUpsert, ThrottleEntry,
    SUBSCRIPTIONS_COLLECTION, THROTTLE_COLLECTION,
};

#[derive(Serialize, Deserialize, Debug)]
struct SubscriptionDoc {
    endpoint: String,
    p256dh: String,
    auth: String,
    subscription_json: String,
    user_id: Option<String>,
    device_id: Option<String>,

    #[serde(with = "firestore_serde_timestamp::timestamp")]
    last_seen_at: DateTime<Utc>,

    is_active: bool,

    #[serde(with = "firestore_serde_timestamp::timestamp")]
    created_at: DateTime<Utc>,

    #[serde(with = "firestore_serde_timestamp::timestamp")]
    updated_at: DateTime<Utc>,
}

impl SubscriptionDoc {
    fn from_model(subscription: &Subscription) -> Result<Self> {
        Ok(SubscriptionDoc {
            endpoint: subscription.endpoint.clone(),
            p256dh: subscription.keys.p256dh.clone(),
            auth: subscription.keys.auth.clone(),
            subscription_json: serde_json::to_string(&subscription.subscription)?,
            user_id: subscription.user_id.clone(),
            device_id: subscription.device_id.clone(),
            last_seen_at: subscription.last_seen_at,
            is_active: subscription.is_active,
            created_at: subscription.created_at,
            updated_at: subscription.updated_at,
        })
    }

    fn into_model(self) -> Result<Subscription> {
        Ok(Subscription {
            subscription: serde_json::from_str(&self.subscription_json)
                .with_context(|| format!("Corrupt subscription blob for {}", self.endpoint))?,
            endpoint: self.endpoint,
            keys: SubscriptionKeys {
                p256dh: self.p256dh,
                auth: self.auth,
            },
            user_id: self.user_id,
            device_id: self.device_id,
            last_seen_at: self.last_seen_at,
            is_active: self.is_active,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct ThrottleDoc {
    user_id: String,
    subject_id: String,

    #[serde(with = "firestore_serde_timestamp::timestamp")]
    last_notified_at: DateTime<Utc>,
}

/// Shape of a record in the borrowing store. Written by another service.
#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct DueItemDoc {
    owner_id: Option<String>,

    #[serde(with = "firestore_serde_timestamp::timestamp")]
    deadline: DateTime<Utc>,

    label: String,
}

fn subscription_doc_id(endpoint: &str) -> String {
    URL_SAFE_NO_PAD.encode(endpoint)
}

fn throttle_doc_id(user_id: &str, subject_id: &str) -> String {
    URL_SAFE_NO_PAD.encode(format!("{}\n{}", user_id, subject_id))
}

pub struct PushDatabase {
    db: Database,
}

impl PushDatabase {
    fn subscriptions(&self) -> Collection<SubscriptionDoc> {
        self.db.collection(SUBSCRIPTIONS_COLLECTION)
    }

    fn throttle(&self) -> Collection<ThrottleDoc> {
        self.db.collection(THROTTLE_COLLECTION)
    }

    fn due_items(&self, collection: &str) -> Collection<DueItemDoc> {
        self.db.collection(collection)
    }
}

pub struct PushDatabaseManager {
    project_id: String,
}

#[async_trait]
impl managed::Manager for PushDatabaseManager {
    type Type = PushDatabase;
    type Error = Infallible;

    async fn create(&self) -> Result<PushDatabase, Infallible> {
        let creds = Credentials::default().await;
        let db = Database::new(creds.into(), &self.project_id).await;

        Ok(PushDatabase { db })
    }

    async fn recycle(&self, _: &mut PushDatabase) -> managed::RecycleResult<Infallible> {
        Ok(())
    }
}

/// Firestore-backed implementation of every store trait. Field lookups list
/// the collection and filter here; the document store is only used as a
/// keyed get/put service.
pub struct FirestoreStore {
    pool: Pool<PushDatabaseManager>,
    due_collection: String,
}

impl FirestoreStore {
    pub fn new(project_id: &str, due_collection: &str) -> Result<Self> {
        let manager = PushDatabaseManager {
            project_id: project_id.to_string(),
        };
        let pool = Pool::<PushDatabaseManager>::builder(manager)
            .build()
            .map_err(|e| anyhow!("Could not build Firestore pool: {:?}", e))?;

        Ok(FirestoreStore {
            pool,
            due_collection: due_collection.to_string(),
        })
    }

    async fn db(&self) -> Result<Object<PushDatabaseManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| anyhow!("Could not get Firestore handle: {:?}", e))
    }

    pub fn close(&self) {
        self.pool.close();
    }

    async fn all_subscriptions(&self) -> Result<Vec<Subscription>> {
        let db = self.db().await?;
        list_values(db.subscriptions())
            .await
            .into_iter()
            .map(|(_, doc)| doc.into_model())
            .collect()
    }

    async fn put_subscription(&self, subscription: &Subscription) -> Result<()> {
        let id = subscription_doc_id(&subscription.endpoint);
        let db = self.db().await?;
        db.subscriptions()
            .upsert(&SubscriptionDoc::from_model(subscription)?, id.as_str())
            .await?;
        Ok(())
    }
}

fn is_not_found(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<Status>()
        .map_or(false, |status| status.code() == Code::NotFound)
}

/// Keyed read; a missing document is `None`.
async fn get_value<T>(collection: Collection<T>, id: &str) -> Result<Option<T>>
where
    T: Serialize + DeserializeOwned + Send + Unpin + 'static,
{
    match collection.get(id).await {
        Ok(value) => Ok(Some(value)),
        Err(error) if is_not_found(&error) => Ok(None),
        Err(error) => Err(error),
    }
}

/// Full scan, for lookups on fields other than the document id.
async fn list_values<T>(collection: Collection<T>) -> Vec<(String, T)>
where
    T: Serialize + DeserializeOwned + Send + Unpin + 'static,
{
    let mut docs = pin!(collection.list());
    let mut values = Vec::new();

    while let Some(doc) = docs.next().await {
        values.push((doc.name.leaf_name().to_string(), doc.value));
    }

    values
}

#[async_trait]
impl SubscriptionStore for FirestoreStore {
    async fn upsert(&self, upsert: SubscriptionUpsert) -> Result<Subscription> {
        let existing = self.find_by_endpoint(&upsert.registration.endpoint).await?;
        let merged = merge_upsert(existing, upsert, Utc::now());
        self.put_subscription(&merged).await?;

        Ok(merged)
    }

    async fn find_by_endpoint(&self, endpoint: &str) -> Result<Option<Subscription>> {
        let id = subscription_doc_id(endpoint);
        let db = self.db().await?;

        get_value(db.subscriptions(), &id)
            .await?
            .map(SubscriptionDoc::into_model)
            .transpose()
    }

    async fn find_by_user(&self, user_id: &str) -> Result<Vec<Subscription>> {
        Ok(self
            .all_subscriptions()
            .await?
            .into_iter()
            .filter(|s| s.user_id.as_deref() == Some(user_id))
            .collect())
    }

    async fn find_by_user_and_device(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Vec<Subscription>> {
        Ok(self
            .find_by_user(user_id)
            .await?
            .into_iter()
            .filter(|s| s.device_id.as_deref() == Some(device_id))
            .collect())
    }

    async fn find_all(&self) -> Result<Vec<Subscription>> {
        self.all_subscriptions().await
    }

    async fn remove(&self, endpoint: &str) -> Result<bool> {
        let id = subscription_doc_id(endpoint);
        let db = self.db().await?;

        // Deletes carry an exists precondition, so a missing row is NotFound.
        match db.subscriptions().delete(id.as_str()).await {
            Ok(()) => Ok(true),
            Err(error) if is_not_found(&error) => Ok(false),
            Err(error) => Err(error),
        }
    }

    async fn link_device_to_user(&self, device_id: &str, user_id: &str) -> Result<usize> {
        let now = Utc::now();
        let mut linked = 0;

        for mut subscription in self.all_subscriptions().await? {
            if subscription.device_id.as_deref() != Some(device_id) {
                continue;
            }
            if apply_link(&mut subscription, user_id, now) {
                self.put_subscription(&subscription).await?;
                linked += 1;
            }
        }

        Ok(linked)
    }

    async fn mark_seen(&self, endpoint: &str, at: DateTime<Utc>) -> Result<()> {
        if let Some(mut subscription) = self.find_by_endpoint(endpoint).await? {
            subscription.last_seen_at = at;
            self.put_subscription(&subscription).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ThrottleLedger for FirestoreStore {
    async fn get(&self, user_id: &str, subject_id: &str) -> Result<Option<ThrottleEntry>> {
        let id = throttle_doc_id(user_id, subject_id);
        let db = self.db().await?;

        Ok(get_value(db.throttle(), &id)
            .await?
            .map(|doc| ThrottleEntry {
                user_id: doc.user_id,
                subject_id: doc.subject_id,
                last_notified_at: doc.last_notified_at,
            }))
    }

    async fn record(&self, user_id: &str, subject_id: &str, at: DateTime<Utc>) -> Result<()> {
        let db = self.db().await?;
        let doc = ThrottleDoc {
            user_id: user_id.to_string(),
            subject_id: subject_id.to_string(),
            last_notified_at: at,
        };
        let id = throttle_doc_id(user_id, subject_id);
        db.throttle().upsert(&doc, id.as_str()).await?;
        Ok(())
    }
}

#[async_trait]
impl DueItemSource for FirestoreStore {
    async fn find_due(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<DueItem>> {
        let db = self.db().await?;

        Ok(list_values(db.due_items(&self.due_collection))
            .await
            .into_iter()
            .filter(|(_, doc)| doc.owner_id.is_some())
            .filter(|(_, doc)| doc.deadline >= start && doc.deadline <= end)
            .map(|(id, doc)| DueItem {
                id,
                owner_id: doc.owner_id,
                deadline: doc.deadline,
                label: doc.label,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_ids_are_path_safe() {
        let id = subscription_doc_id("https://fcm.googleapis.com/fcm/send/abc+def/=");
        assert!(!id.contains('/'));
        assert!(!id.contains('='));

        assert_ne!(throttle_doc_id("a", "bc"), throttle_doc_id("ab", "c"));
    }

    #[test]
    fn only_not_found_status_means_missing() {
        assert!(is_not_found(&Status::not_found("no document").into()));
        assert!(!is_not_found(&Status::permission_denied("denied").into()));
        assert!(!is_not_found(&anyhow!("Error deserializing.")));
    }
}
