use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::{
    api::models::pagination::Pagination,
    db::models::credits::{CreditTransactionDBResponse, CreditTransactionType},
    types::UserId,
};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BalanceResponse {
    #[schema(value_type = String, format = "uuid")]
    pub user_id: UserId,
    pub balance: Decimal,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreditTransactionResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: Uuid,
    #[schema(value_type = String, format = "uuid")]
    pub user_id: UserId,
    pub transaction_type: CreditTransactionType,
    pub amount: Decimal,
    pub balance_after: Decimal,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<CreditTransactionDBResponse> for CreditTransactionResponse {
    fn from(db: CreditTransactionDBResponse) -> Self {
        Self {
            id: db.id,
            user_id: db.user_id,
            transaction_type: db.transaction_type,
            amount: db.amount,
            balance_after: db.balance_after,
            description: db.description,
            created_at: db.created_at,
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ListTransactionsQuery {
    #[serde(flatten)]
    #[param(inline)]
    pub pagination: Pagination,

    /// Billing staff only: restrict to one user. Staff see every user's transactions otherwise.
    #[param(value_type = Option<String>, format = "uuid")]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentKind {
    Grant,
    Removal,
}

impl From<AdjustmentKind> for CreditTransactionType {
    fn from(kind: AdjustmentKind) -> Self {
        match kind {
            AdjustmentKind::Grant => CreditTransactionType::AdminGrant,
            AdjustmentKind::Removal => CreditTransactionType::AdminRemoval,
        }
    }
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreditAdjustmentRequest {
    #[schema(value_type = String, format = "uuid")]
    pub user_id: UserId,
    pub kind: AdjustmentKind,
    /// Positive; the direction comes from `kind`
    pub amount: Decimal,
    pub description: Option<String>,
}
