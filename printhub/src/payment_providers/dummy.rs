//! Dummy payment provider
//!
//! Accepts every payment without contacting anyone. With `complete_immediately` the payment is
//! reported as completed as soon as it is created; otherwise it stays pending until a signed
//! notification is posted to `/api/payments/notify`:
//!
//! ```text
//! X-Dummy-Signature: hex(sha256(webhook_secret + body))
//! {"provider_order_id": "dummy_...", "status": "completed"}
//! ```

use async_trait::async_trait;
use axum::http::HeaderMap;
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::{
    config::DummyConfig,
    payment_providers::{PaymentError, PaymentProvider, PaymentRequest, ProviderOrder, ProviderStatus, Result, WebhookEvent},
};

pub const SIGNATURE_HEADER: &str = "X-Dummy-Signature";
const ORDER_PREFIX: &str = "dummy_";

pub struct DummyProvider {
    webhook_secret: String,
    complete_immediately: bool,
}

impl From<DummyConfig> for DummyProvider {
    fn from(config: DummyConfig) -> Self {
        Self {
            webhook_secret: config.webhook_secret,
            complete_immediately: config.complete_immediately,
        }
    }
}

impl DummyProvider {
    /// Signature a notification body must carry.
    pub fn sign(&self, body: &str) -> String {
        format!("{:x}", Sha256::digest(format!("{}{}", self.webhook_secret, body).as_bytes()))
    }

    fn current_status(&self) -> ProviderStatus {
        if self.complete_immediately {
            ProviderStatus::Completed
        } else {
            ProviderStatus::Pending
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum DummyStatus {
    Pending,
    Completed,
    Canceled,
}

#[derive(Debug, Deserialize)]
struct DummyNotification {
    provider_order_id: String,
    status: DummyStatus,
}

#[async_trait]
impl PaymentProvider for DummyProvider {
    fn name(&self) -> &'static str {
        "dummy"
    }

    async fn create_payment(&self, request: &PaymentRequest) -> Result<ProviderOrder> {
        let provider_order_id = format!("{ORDER_PREFIX}{}", request.payment_id);
        tracing::info!(
            "Dummy provider opened payment {} for {} {}",
            provider_order_id,
            request.amount,
            request.currency
        );

        Ok(ProviderOrder {
            provider_order_id,
            redirect_url: Some(request.continue_url.clone()),
            status: self.current_status(),
        })
    }

    async fn get_payment_status(&self, provider_order_id: &str) -> Result<ProviderStatus> {
        if !provider_order_id.starts_with(ORDER_PREFIX) {
            return Err(PaymentError::InvalidData("Invalid dummy order ID format".to_string()));
        }
        Ok(self.current_status())
    }

    fn validate_webhook(&self, headers: &HeaderMap, body: &str) -> Result<Option<WebhookEvent>> {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(PaymentError::InvalidSignature)?;

        if signature != self.sign(body) {
            return Err(PaymentError::InvalidSignature);
        }

        let notification: DummyNotification =
            serde_json::from_str(body).map_err(|e| PaymentError::InvalidData(format!("Malformed notification: {e}")))?;

        let status = match notification.status {
            DummyStatus::Pending => ProviderStatus::Pending,
            DummyStatus::Completed => ProviderStatus::Completed,
            DummyStatus::Canceled => ProviderStatus::Canceled,
        };

        Ok(Some(WebhookEvent {
            provider_order_id: notification.provider_order_id,
            ext_order_id: None,
            status,
        }))
    }

    async fn capture(&self, provider_order_id: &str) -> Result<()> {
        tracing::info!("Dummy provider captured {}", provider_order_id);
        Ok(())
    }

    async fn cancel(&self, provider_order_id: &str) -> Result<()> {
        tracing::info!("Dummy provider canceled {}", provider_order_id);
        Ok(())
    }

    async fn refund(&self, provider_order_id: &str, amount: Decimal, _description: &str) -> Result<()> {
        tracing::info!("Dummy provider refunded {} of {}", amount, provider_order_id);
        Ok(())
    }
}
