use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    db::models::payments::{PaymentDBResponse, PaymentMethod, PaymentPurpose, PaymentStatus},
    types::{OrderId, PaymentId},
};

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct PayOrderRequest {
    pub method: PaymentMethod,
    /// Six digits from the customer's banking app, for BLIK paid without a redirect
    pub blik_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct TopUpRequest {
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub blik_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaymentResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: PaymentId,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub order_id: Option<OrderId>,
    pub purpose: PaymentPurpose,
    pub method: PaymentMethod,
    pub provider: String,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    /// Provider page to send the customer to, when one is needed
    pub redirect_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<PaymentDBResponse> for PaymentResponse {
    fn from(db: PaymentDBResponse) -> Self {
        Self {
            id: db.id,
            order_id: db.order_id,
            purpose: db.purpose,
            method: db.method,
            provider: db.provider,
            amount: db.amount,
            currency: db.currency,
            status: db.status,
            redirect_url: db.redirect_url,
            created_at: db.created_at,
            updated_at: db.updated_at,
            completed_at: db.completed_at,
        }
    }
}

/// Acknowledgement returned to the provider
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NotificationAck {
    pub status: String,
}

impl NotificationAck {
    pub fn ok() -> Self {
        Self { status: "OK".to_string() }
    }
}
