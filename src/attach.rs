//! Links anonymous device subscriptions to an identity once it is known.
//!
//! Runs detached from the login that triggered it: nothing here may fail or
//! delay authentication.

use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::{
    dispatch::DispatchEngine,
    model::{PushPayload, PushRegistration, SubscriptionUpsert},
    push::{DeliveryOptions, Urgency},
    store::SubscriptionStore,
};

const WELCOME_TTL_SECS: u32 = 60;

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct AttachRequest {
    pub device_id: Option<String>,
    pub subscription: Option<Value>,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachOutcome {
    Upserted,
    /// The endpoint already belongs to another user and was left alone.
    ForeignOwner,
    Linked(usize),
    Noop,
}

pub struct AttachService {
    subscriptions: Arc<dyn SubscriptionStore>,
    engine: Option<Arc<DispatchEngine>>,
}

impl AttachService {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        engine: Option<Arc<DispatchEngine>>,
    ) -> Self {
        AttachService {
            subscriptions,
            engine,
        }
    }

    pub async fn attach(&self, user_id: &str, request: AttachRequest) -> Result<AttachOutcome> {
        let AttachRequest {
            device_id,
            subscription,
            display_name,
        } = request;

        let outcome = match subscription {
            Some(raw) => {
                let registration = PushRegistration::from_raw(raw)?;

                let existing = self
                    .subscriptions
                    .find_by_endpoint(&registration.endpoint)
                    .await?;
                if existing.map_or(false, |s| s.is_owned_by_other(user_id)) {
                    tracing::warn!(
                        endpoint = %registration.endpoint,
                        "Endpoint is owned by another user; not attaching."
                    );
                    return Ok(AttachOutcome::ForeignOwner);
                }

                self.subscriptions
                    .upsert(SubscriptionUpsert {
                        registration,
                        user_id: Some(user_id.to_string()),
                        device_id: device_id.clone(),
                    })
                    .await?;
                AttachOutcome::Upserted
            }
            None => match &device_id {
                Some(device_id) => {
                    let linked = self
                        .subscriptions
                        .link_device_to_user(device_id, user_id)
                        .await?;
                    tracing::info!(linked, "Linked device subscriptions.");
                    AttachOutcome::Linked(linked)
                }
                None => return Ok(AttachOutcome::Noop),
            },
        };

        if let Some(device_id) = device_id {
            self.welcome(user_id, &device_id, display_name.as_deref())
                .await;
        }

        Ok(outcome)
    }

    /// Runs [`attach`](Self::attach) on its own task. Errors are logged and
    /// go no further.
    pub fn spawn_attach(self: Arc<Self>, user_id: String, request: AttachRequest) -> JoinHandle<()> {
        let span = tracing::info_span!("attach", %user_id);

        tokio::spawn(
            async move {
                match self.attach(&user_id, request).await {
                    Ok(outcome) => tracing::info!(?outcome, "Attach finished."),
                    Err(error) => tracing::error!(?error, "Attach failed."),
                }
            }
            .instrument(span),
        )
    }

    async fn welcome(&self, user_id: &str, device_id: &str, display_name: Option<&str>) {
        let engine = match &self.engine {
            Some(engine) => engine,
            None => return,
        };

        let targets = match self
            .subscriptions
            .find_by_user_and_device(user_id, device_id)
            .await
        {
            Ok(targets) => targets,
            Err(error) => {
                tracing::warn!(?error, "Could not look up device for welcome push.");
                return;
            }
        };
        if targets.is_empty() {
            return;
        }

        let body = match display_name {
            Some(name) => format!("Good to see you, {}", name),
            None => "Good to see you".to_string(),
        };
        let payload = PushPayload::new("Welcome back!", &body, Some("/dashboard"));
        let options = DeliveryOptions {
            ttl: WELCOME_TTL_SECS,
            urgency: Urgency::High,
        };

        let report = engine.dispatch_with(targets, &payload, &options).await;
        tracing::debug!(sent = report.sent_count, "Welcome push sent.");
    }
}
