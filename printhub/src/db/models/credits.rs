//! Database models for credit balances and the transaction ledger.

use crate::types::{OrderId, PaymentId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// Credit transaction type enum stored as TEXT in database
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CreditTransactionType {
    Purchase,
    AdminGrant,
    AdminRemoval,
    OrderPayment,
    Refund,
}

impl CreditTransactionType {
    /// Debits take money out of the balance
    pub fn is_debit(self) -> bool {
        matches!(self, CreditTransactionType::AdminRemoval | CreditTransactionType::OrderPayment)
    }
}

/// Database request for creating a new credit transaction
#[derive(Debug, Clone)]
pub struct CreditTransactionCreateDBRequest {
    pub user_id: UserId,
    pub transaction_type: CreditTransactionType,
    /// Always positive; the direction comes from the transaction type
    pub amount: Decimal,
    /// Unique per ledger entry. Replaying the same source is rejected by the database.
    pub source_id: String,
    pub description: Option<String>,
}

impl CreditTransactionCreateDBRequest {
    /// Manual adjustment by staff, with a random source id
    pub fn admin_adjustment(
        user_id: UserId,
        grantor_id: UserId,
        transaction_type: CreditTransactionType,
        amount: Decimal,
        description: Option<String>,
    ) -> Self {
        Self {
            user_id,
            transaction_type,
            amount,
            source_id: format!("{}_{}", grantor_id, Uuid::new_v4()),
            description,
        }
    }

    /// Credits bought through a settled top-up payment
    pub fn top_up(user_id: UserId, payment_id: PaymentId, amount: Decimal) -> Self {
        Self {
            user_id,
            transaction_type: CreditTransactionType::Purchase,
            amount,
            source_id: payment_id.to_string(),
            description: Some("Credits top-up".to_string()),
        }
    }

    /// Paying an order from the balance. At most one per order.
    pub fn order_payment(user_id: UserId, order_id: OrderId, order_number: i64, amount: Decimal) -> Self {
        Self {
            user_id,
            transaction_type: CreditTransactionType::OrderPayment,
            amount,
            source_id: format!("order_{order_id}"),
            description: Some(format!("Payment for order #{order_number}")),
        }
    }

    /// Returning an order payment to the balance. At most one per order.
    pub fn order_refund(user_id: UserId, order_id: OrderId, order_number: i64, amount: Decimal) -> Self {
        Self {
            user_id,
            transaction_type: CreditTransactionType::Refund,
            amount,
            source_id: format!("refund_{order_id}"),
            description: Some(format!("Refund for order #{order_number}")),
        }
    }
}

/// Database response for a credit transaction
#[derive(Debug, Clone, FromRow)]
pub struct CreditTransactionDBResponse {
    pub id: Uuid,
    pub user_id: UserId,
    pub transaction_type: CreditTransactionType,
    pub amount: Decimal,
    pub balance_after: Decimal,
    pub source_id: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_ids_are_deterministic_for_orders() {
        let user = Uuid::new_v4();
        let order = Uuid::new_v4();
        let a = CreditTransactionCreateDBRequest::order_payment(user, order, 7, Decimal::ONE);
        let b = CreditTransactionCreateDBRequest::order_payment(user, order, 7, Decimal::ONE);
        assert_eq!(a.source_id, b.source_id);
        assert_ne!(
            a.source_id,
            CreditTransactionCreateDBRequest::order_refund(user, order, 7, Decimal::ONE).source_id
        );

        let grant1 = CreditTransactionCreateDBRequest::admin_adjustment(user, user, CreditTransactionType::AdminGrant, Decimal::ONE, None);
        let grant2 = CreditTransactionCreateDBRequest::admin_adjustment(user, user, CreditTransactionType::AdminGrant, Decimal::ONE, None);
        assert_ne!(grant1.source_id, grant2.source_id);
    }

    #[test]
    fn test_debit_types() {
        assert!(CreditTransactionType::OrderPayment.is_debit());
        assert!(CreditTransactionType::AdminRemoval.is_debit());
        assert!(!CreditTransactionType::Refund.is_debit());
        assert!(!CreditTransactionType::Purchase.is_debit());
    }
}
