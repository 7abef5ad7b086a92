//! Database models for payments.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

use crate::types::{OrderId, PaymentId, UserId};

/// What the money is for
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentPurpose {
    Order,
    /// Credits top-up
    Credits,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Blik,
    Card,
    /// Paid from the customer's credit balance
    Credits,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Blik => "blik",
            PaymentMethod::Card => "card",
            PaymentMethod::Credits => "credits",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    WaitingForConfirmation,
    Completed,
    Canceled,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::WaitingForConfirmation => "waiting_for_confirmation",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Canceled => "canceled",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn is_open(self) -> bool {
        matches!(self, PaymentStatus::Pending | PaymentStatus::WaitingForConfirmation)
    }

    /// Completed payments only move on to refunded; failed and cancelled ones stay put.
    pub fn can_transition_to(self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        if self == next {
            return false;
        }
        match self {
            Pending => true,
            WaitingForConfirmation => next != Pending,
            Completed => next == Refunded,
            Canceled | Failed | Refunded => false,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct PaymentDBResponse {
    pub id: PaymentId,
    pub user_id: Option<UserId>,
    pub order_id: Option<OrderId>,
    pub purpose: PaymentPurpose,
    pub method: PaymentMethod,
    pub provider: String,
    pub provider_order_id: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub redirect_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct PaymentCreateDBRequest {
    pub id: PaymentId,
    pub user_id: Option<UserId>,
    pub order_id: Option<OrderId>,
    pub purpose: PaymentPurpose,
    pub method: PaymentMethod,
    pub provider: String,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
}
