//! Payment provider abstraction layer
//!
//! The `PaymentProvider` trait hides the differences between PayU (BLIK and card payments over
//! its REST API) and the dummy provider used in development. Providers only talk to the outside
//! world; applying a payment outcome to orders and credits lives in [`settlement`].

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::{config::PaymentConfig, db::errors::DbError, db::models::payments::PaymentMethod, types::PaymentId};

pub mod dummy;
pub mod payu;
pub mod settlement;

/// Create a payment provider from configuration
pub fn create_provider(config: PaymentConfig) -> Result<Arc<dyn PaymentProvider>> {
    match config {
        PaymentConfig::Payu(payu_config) => Ok(Arc::new(payu::PayUProvider::new(payu_config)?)),
        PaymentConfig::Dummy(dummy_config) => Ok(Arc::new(dummy::DummyProvider::from(dummy_config))),
    }
}

/// Result type for payment provider operations
pub type Result<T> = std::result::Result<T, PaymentError>;

/// Errors that can occur during payment processing
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("Payment provider API error: {0}")]
    ProviderApi(String),

    #[error("Payment provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid notification signature")]
    InvalidSignature,

    #[error("Invalid payment data: {0}")]
    InvalidData(String),

    #[error("Payment already processed")]
    AlreadyProcessed,

    #[error("Database error: {0}")]
    Database(#[from] DbError),
}

impl From<sqlx::Error> for PaymentError {
    fn from(err: sqlx::Error) -> Self {
        PaymentError::Database(DbError::from(err))
    }
}

impl PaymentError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            PaymentError::InvalidSignature | PaymentError::InvalidData(_) => StatusCode::BAD_REQUEST,
            PaymentError::ProviderApi(_) | PaymentError::Http(_) => StatusCode::BAD_GATEWAY,
            PaymentError::AlreadyProcessed => StatusCode::OK,
            PaymentError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            PaymentError::InvalidSignature => "Invalid notification signature".to_string(),
            PaymentError::InvalidData(message) => message.clone(),
            PaymentError::ProviderApi(_) | PaymentError::Http(_) => {
                "The payment provider is unavailable, please try again later".to_string()
            }
            PaymentError::AlreadyProcessed => "Payment already processed".to_string(),
            PaymentError::Database(_) => "Internal server error".to_string(),
        }
    }
}

/// Buyer details passed to the provider
#[derive(Debug, Clone)]
pub struct Buyer {
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
}

/// One line on the provider's payment page
#[derive(Debug, Clone)]
pub struct LineItem {
    pub name: String,
    pub unit_price: Decimal,
    pub quantity: i32,
}

/// Everything a provider needs to open a payment
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    /// Local payment id, sent as the provider's external order id
    pub payment_id: PaymentId,
    pub amount: Decimal,
    pub currency: String,
    pub description: String,
    pub method: PaymentMethod,
    /// Six digit BLIK code entered in the shop, if any
    pub blik_code: Option<String>,
    pub customer_ip: String,
    pub buyer: Buyer,
    pub items: Vec<LineItem>,
    /// Where the customer returns after paying
    pub continue_url: String,
    /// Where the provider sends status notifications
    pub notify_url: String,
}

/// Payment status as reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    New,
    Pending,
    /// Authorised, waiting for the merchant to capture
    WaitingForConfirmation,
    Completed,
    Canceled,
}

/// A payment opened at the provider
#[derive(Debug, Clone)]
pub struct ProviderOrder {
    pub provider_order_id: String,
    /// Page the customer must visit to finish paying; absent when no redirect is needed
    pub redirect_url: Option<String>,
    pub status: ProviderStatus,
}

/// A verified status notification from the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
    pub provider_order_id: String,
    /// Our payment id echoed back by the provider
    pub ext_order_id: Option<String>,
    pub status: ProviderStatus,
}

/// Abstract payment provider interface
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Stored in `payments.provider`
    fn name(&self) -> &'static str;

    /// Open a payment at the provider.
    async fn create_payment(&self, request: &PaymentRequest) -> Result<ProviderOrder>;

    /// Fetch the current status of a payment.
    async fn get_payment_status(&self, provider_order_id: &str) -> Result<ProviderStatus>;

    /// Verify a notification and parse it.
    ///
    /// Returns `Ok(None)` for well-signed notifications that carry nothing to act on.
    /// Returns `Err(PaymentError::InvalidSignature)` when the signature does not match.
    fn validate_webhook(&self, headers: &HeaderMap, body: &str) -> Result<Option<WebhookEvent>>;

    /// Capture an authorised payment.
    async fn capture(&self, provider_order_id: &str) -> Result<()>;

    /// Withdraw a payment the customer has not finished.
    async fn cancel(&self, provider_order_id: &str) -> Result<()>;

    /// Refund `amount` of a completed payment.
    async fn refund(&self, provider_order_id: &str, amount: Decimal, description: &str) -> Result<()>;

    /// Whether `WaitingForConfirmation` should be captured automatically
    fn auto_capture(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_errors_are_internal() {
        let err = PaymentError::from(DbError::NotFound);
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.user_message(), "Internal server error");
    }

    #[test]
    fn test_provider_errors_are_bad_gateway() {
        let err = PaymentError::ProviderApi("ERROR_VALUE_INVALID".to_string());
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert!(!err.user_message().contains("ERROR_VALUE_INVALID"));
    }
}
