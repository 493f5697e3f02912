//! Web Push delivery (RFC 8030) with VAPID authentication (RFC 8292).

use std::time::Duration;

use async_trait::async_trait;
use web_push::{
    ContentEncoding, SubscriptionInfo, VapidSignatureBuilder, WebPushError, WebPushMessageBuilder,
};

use crate::model::Subscription;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Urgency {
    Normal,
    High,
}

impl Urgency {
    fn as_str(self) -> &'static str {
        match self {
            Urgency::Normal => "normal",
            Urgency::High => "high",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeliveryOptions {
    pub ttl: u32,
    pub urgency: Urgency,
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        DeliveryOptions {
            ttl: 24 * 60 * 60,
            urgency: Urgency::Normal,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The push service says the endpoint will never work again.
    #[error("endpoint gone (HTTP {status})")]
    Gone { status: u16 },

    #[error("push service rejected message (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("delivery attempt timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("could not build message: {0}")]
    Encode(#[from] WebPushError),
}

impl SendError {
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            404 | 410 => SendError::Gone { status },
            _ => SendError::Rejected { status, body },
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, SendError::Gone { .. })
    }
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(
        &self,
        subscription: &Subscription,
        payload: &[u8],
        options: &DeliveryOptions,
    ) -> Result<(), SendError>;
}

/// Encrypts with `web-push` and posts through a shared `reqwest::Client` so
/// connections to each push service are pooled.
pub struct WebPushTransport {
    client: reqwest::Client,
    vapid_privkey: String,
    vapid_subject: String,
}

impl WebPushTransport {
    pub fn new(vapid_privkey: &str, vapid_subject: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .build()?;

        Ok(WebPushTransport {
            client,
            vapid_privkey: vapid_privkey.to_string(),
            vapid_subject: vapid_subject.to_string(),
        })
    }
}

#[async_trait]
impl PushTransport for WebPushTransport {
    async fn send(
        &self,
        subscription: &Subscription,
        payload: &[u8],
        options: &DeliveryOptions,
    ) -> Result<(), SendError> {
        let subscription_info = SubscriptionInfo::new(
            &subscription.endpoint,
            &subscription.keys.p256dh,
            &subscription.keys.auth,
        );

        let mut sig_builder =
            VapidSignatureBuilder::from_base64(&self.vapid_privkey, &subscription_info)?;
        sig_builder.add_claim("sub", self.vapid_subject.as_str());
        let signature = sig_builder.build()?;

        let mut builder = WebPushMessageBuilder::new(&subscription_info);
        builder.set_payload(ContentEncoding::Aes128Gcm, payload);
        builder.set_vapid_signature(signature);
        builder.set_ttl(options.ttl);
        let message = builder.build()?;

        let mut request = self
            .client
            .post(message.endpoint.to_string())
            .header("TTL", message.ttl.to_string())
            .header("Urgency", options.urgency.as_str());

        if let Some(push_payload) = message.payload {
            request = request
                .header("Content-Encoding", push_payload.content_encoding.to_str())
                .header("Content-Type", "application/octet-stream");

            for (key, value) in &push_payload.crypto_headers {
                request = request.header(*key, value.as_str());
            }

            request = request.body(push_payload.content);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SendError::Timeout
            } else {
                SendError::Transport(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(SendError::from_status(status, body))
    }
}
