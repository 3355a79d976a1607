//! Signed webhook delivery for subscribed stream events, with exponential
//! backoff retries (§4.8).

use crate::config::Config;
use crate::persistence::WebhookRepository;
use crate::state::host_aggregator::AggregatorEventSubscriber;
use chrono::Utc;
use cnc_models::events::{AggregatorEvent, StreamEvent};
use cnc_models::webhook::{DeliveryStatus, WebhookDelivery};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::{instrument, warn};

type HmacSha256 = Hmac<Sha256>;

/// Fans mutating events out to every webhook subscribed to that event type,
/// retrying failed deliveries with exponential backoff (§4.8: "the
/// dispatcher owns retry state; the registry only owns subscriptions").
pub struct WebhookDispatcher {
    config: Arc<Config>,
    webhooks: Arc<WebhookRepository>,
    client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(config: Arc<Config>, webhooks: Arc<WebhookRepository>) -> Self {
        Self { config, webhooks, client: reqwest::Client::new() }
    }

    #[instrument(skip(self))]
    pub fn notify_wake_verified(self: &Arc<Self>, event: &StreamEvent) {
        self.dispatch_event(event.clone());
    }

    fn dispatch_event(self: &Arc<Self>, event: StreamEvent) {
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.deliver_to_subscribers(event).await });
    }

    #[instrument(skip(self, event))]
    async fn deliver_to_subscribers(&self, event: StreamEvent) {
        let subscribers = match self.webhooks.list_subscribed_to(&event.event_type).await {
            Ok(subscribers) => subscribers,
            Err(err) => {
                warn!(%err, "failed to load webhook subscriptions");
                return;
            }
        };

        let body = serde_json::to_vec(&event).unwrap_or_default();
        for webhook in subscribers {
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                let outcome = self.send_once(&webhook.id, &webhook.url, webhook.secret.as_deref(), &event.event_type, &body, attempt).await;
                let (status, response_status) = match &outcome {
                    Ok(code) => (DeliveryStatus::Success, Some(*code)),
                    Err(code) => (DeliveryStatus::Failed, *code),
                };
                let _ = self
                    .webhooks
                    .record_delivery(&WebhookDelivery {
                        webhook_id: webhook.id.clone(),
                        event_type: event.event_type.clone(),
                        attempt,
                        status,
                        response_status,
                        requested_at: Utc::now(),
                    })
                    .await;

                if outcome.is_ok() || attempt >= self.config.webhook_max_attempts {
                    break;
                }
                tokio::time::sleep(self.config.webhook_backoff_base * 2u32.pow(attempt - 1)).await;
            }
        }
    }

    /// Sends one delivery attempt; `Ok` carries the response status, `Err`
    /// the response status if one was received (`None` for a transport
    /// failure).
    async fn send_once(&self, webhook_id: &str, url: &str, secret: Option<&str>, event_type: &str, body: &[u8], attempt: u32) -> Result<u16, Option<u16>> {
        let mut request = self.client.post(url).header("X-Woly-Event", event_type).header("X-Woly-Delivery-Attempt", attempt.to_string()).body(body.to_vec());

        if let Some(secret) = secret {
            if let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) {
                mac.update(body);
                let signature = hex_encode(&mac.finalize().into_bytes());
                request = request.header("X-Woly-Signature", format!("sha256={signature}"));
            }
        }

        match request.timeout(Duration::from_secs(10)).send().await {
            Ok(response) if response.status().is_success() => Ok(response.status().as_u16()),
            Ok(response) => {
                warn!(webhook_id, status = %response.status(), "webhook delivery rejected");
                Err(Some(response.status().as_u16()))
            }
            Err(err) => {
                warn!(webhook_id, %err, "webhook delivery failed to send");
                Err(None)
            }
        }
    }
}

impl AggregatorEventSubscriber for WebhookDispatcher {
    fn on_event(&self, event: &AggregatorEvent) {
        // `on_event` must not block (§4.3); hand the actual HTTP work to a
        // spawned task. `deliver_to_subscribers` takes `&self`, so this
        // needs only a reference-counted clone of the fields it touches.
        let config = self.config.clone();
        let webhooks = self.webhooks.clone();
        let client = self.client.clone();
        let event = StreamEvent::from_aggregator_event(event);
        tokio::spawn(async move { WebhookDispatcher { config, webhooks, client }.deliver_to_subscribers(event).await });
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
