//! Concurrent fan-out of one payload to many subscriptions.
//!
//! Partial failure is the normal case: every call returns a full
//! per-endpoint report, and only the caller decides what counts as success.
//! The engine never touches the throttle ledger because only the caller
//! knows which subject a message is about.

use std::{collections::HashSet, sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use futures::{stream, StreamExt};
use serde::Serialize;

use crate::{
    model::{PushPayload, Subscription},
    push::{DeliveryOptions, PushTransport, SendError},
    store::SubscriptionStore,
};

pub const DEFAULT_CONCURRENCY: usize = 10;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Removed,
    Error,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct EndpointResult {
    pub endpoint: String,
    pub status: DeliveryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Serialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    pub sent_count: usize,
    pub per_endpoint_results: Vec<EndpointResult>,
}

impl DispatchReport {
    fn from_results(per_endpoint_results: Vec<EndpointResult>) -> Self {
        DispatchReport {
            sent_count: per_endpoint_results
                .iter()
                .filter(|r| r.status == DeliveryStatus::Sent)
                .count(),
            per_endpoint_results,
        }
    }

    pub fn count(&self, status: DeliveryStatus) -> usize {
        self.per_endpoint_results
            .iter()
            .filter(|r| r.status == status)
            .count()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("push transport credentials are not configured")]
    Misconfigured,
}

pub struct DispatchEngine {
    transport: Arc<dyn PushTransport>,
    subscriptions: Arc<dyn SubscriptionStore>,
    concurrency: usize,
    send_timeout: Duration,
}

impl DispatchEngine {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        subscriptions: Arc<dyn SubscriptionStore>,
        concurrency: usize,
        send_timeout: Duration,
    ) -> Self {
        DispatchEngine {
            transport,
            subscriptions,
            concurrency: concurrency.max(1),
            send_timeout,
        }
    }

    pub async fn dispatch(
        &self,
        subscriptions: Vec<Subscription>,
        payload: &PushPayload,
    ) -> DispatchReport {
        self.dispatch_with(subscriptions, payload, &DeliveryOptions::default())
            .await
    }

    pub async fn dispatch_with(
        &self,
        subscriptions: Vec<Subscription>,
        payload: &PushPayload,
        options: &DeliveryOptions,
    ) -> DispatchReport {
        let mut seen = HashSet::new();
        let unique: Vec<Subscription> = subscriptions
            .into_iter()
            .filter(|s| seen.insert(s.endpoint.clone()))
            .collect();

        if unique.is_empty() {
            return DispatchReport::default();
        }

        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(error) => {
                tracing::error!(?error, "Could not encode push payload.");
                let results = unique
                    .into_iter()
                    .map(|s| EndpointResult {
                        endpoint: s.endpoint,
                        status: DeliveryStatus::Error,
                        detail: Some(format!("malformed payload: {}", error)),
                    })
                    .collect();
                return DispatchReport::from_results(results);
            }
        };

        let results = stream::iter(unique)
            .map(|subscription| self.send_one(subscription, &body, options))
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .await;

        let report = DispatchReport::from_results(results);
        tracing::info!(
            sent = report.sent_count,
            removed = report.count(DeliveryStatus::Removed),
            errors = report.count(DeliveryStatus::Error),
            "Dispatch finished."
        );
        report
    }

    /// Sends to the user's active subscriptions.
    pub async fn send_to_user(&self, user_id: &str, payload: &PushPayload) -> Result<DispatchReport> {
        self.send_to_user_with(user_id, payload, &DeliveryOptions::default())
            .await
    }

    pub async fn send_to_user_with(
        &self,
        user_id: &str,
        payload: &PushPayload,
        options: &DeliveryOptions,
    ) -> Result<DispatchReport> {
        let subscriptions = self
            .subscriptions
            .find_by_user(user_id)
            .await?
            .into_iter()
            .filter(|s| s.is_active)
            .collect();

        Ok(self.dispatch_with(subscriptions, payload, options).await)
    }

    pub async fn send_to_all(&self, payload: &PushPayload) -> Result<DispatchReport> {
        let subscriptions = self
            .subscriptions
            .find_all()
            .await?
            .into_iter()
            .filter(|s| s.is_active)
            .collect();

        Ok(self.dispatch(subscriptions, payload).await)
    }

    async fn send_one(
        &self,
        subscription: Subscription,
        body: &[u8],
        options: &DeliveryOptions,
    ) -> EndpointResult {
        let endpoint = subscription.endpoint.clone();
        let attempt = tokio::time::timeout(
            self.send_timeout,
            self.transport.send(&subscription, body, options),
        )
        .await
        .unwrap_or(Err(SendError::Timeout));

        match attempt {
            Ok(()) => {
                if let Err(error) = self.subscriptions.mark_seen(&endpoint, Utc::now()).await {
                    tracing::warn!(?error, %endpoint, "Could not refresh lastSeenAt.");
                }
                EndpointResult {
                    endpoint,
                    status: DeliveryStatus::Sent,
                    detail: None,
                }
            }
            Err(error) if error.is_permanent() => {
                tracing::info!(%endpoint, %error, "Removing dead subscription.");
                match self.subscriptions.remove(&endpoint).await {
                    Ok(_) => EndpointResult {
                        endpoint,
                        status: DeliveryStatus::Removed,
                        detail: Some(error.to_string()),
                    },
                    Err(cleanup) => {
                        tracing::error!(error = ?cleanup, %endpoint, "Could not remove dead subscription.");
                        EndpointResult {
                            endpoint,
                            status: DeliveryStatus::Error,
                            detail: Some(format!("{}; cleanup failed: {}", error, cleanup)),
                        }
                    }
                }
            }
            Err(error) => {
                tracing::warn!(%endpoint, %error, "Push delivery failed.");
                EndpointResult {
                    endpoint,
                    status: DeliveryStatus::Error,
                    detail: Some(error.to_string()),
                }
            }
        }
    }
}
