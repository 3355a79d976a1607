use crate::persistence::client::DbClient;
use crate::persistence::errors::DbError;
use cnc_models::webhook::{DeliveryStatus, Webhook, WebhookDelivery};
use libsql::{params, Row};
use std::collections::BTreeSet;
use tracing::instrument;
use uuid::Uuid;

pub struct WebhookRepository {
    db: DbClient,
}

impl WebhookRepository {
    pub fn new(db: DbClient) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub async fn list_subscribed_to(&self, event_type: &str) -> Result<Vec<Webhook>, DbError> {
        let conn = self.db.connection()?;
        let mut rows = conn.query("SELECT * FROM webhooks", ()).await?;
        let mut matching = Vec::new();
        while let Some(row) = rows.next().await? {
            let webhook = row_to_webhook(&row)?;
            if webhook.events.contains(event_type) {
                matching.push(webhook);
            }
        }
        Ok(matching)
    }

    #[instrument(skip(self, webhook))]
    pub async fn create(&self, webhook: &Webhook) -> Result<(), DbError> {
        let conn = self.db.connection()?;
        conn.execute(
            "INSERT INTO webhooks (id, url, events, secret) VALUES (?1, ?2, ?3, ?4)",
            params![
                webhook.id.clone(),
                webhook.url.clone(),
                serde_json::to_string(&webhook.events).map_err(|e| DbError::Mapping(e.to_string()))?,
                webhook.secret.clone(),
            ],
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn record_delivery(&self, delivery: &WebhookDelivery) -> Result<(), DbError> {
        let conn = self.db.connection()?;
        conn.execute(
            "INSERT INTO webhook_deliveries (id, webhook_id, event_type, attempt, status, response_status, requested_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                Uuid::new_v4().to_string(),
                delivery.webhook_id.clone(),
                delivery.event_type.clone(),
                delivery.attempt as i64,
                delivery_status_str(delivery.status).to_string(),
                delivery.response_status.map(|v| v as i64),
                delivery.requested_at.to_rfc3339(),
            ],
        )
        .await?;
        Ok(())
    }
}

fn delivery_status_str(status: DeliveryStatus) -> &'static str {
    match status {
        DeliveryStatus::Success => "success",
        DeliveryStatus::Failed => "failed",
    }
}

fn row_to_webhook(row: &Row) -> Result<Webhook, DbError> {
    let events_raw: String = row.get(2)?;
    let events: BTreeSet<String> = serde_json::from_str(&events_raw).map_err(|e| DbError::Mapping(e.to_string()))?;
    Ok(Webhook { id: row.get(0)?, url: row.get(1)?, events, secret: row.get(3)? })
}
