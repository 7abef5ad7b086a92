//! Database models for custom design requests.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

use crate::types::{DesignRequestId, FileId, UserId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DesignRequestStatus {
    New,
    InReview,
    Quoted,
    Accepted,
    Rejected,
    Completed,
}

impl DesignRequestStatus {
    pub fn can_transition_to(self, next: DesignRequestStatus) -> bool {
        use DesignRequestStatus::*;
        matches!(
            (self, next),
            (New, InReview)
                | (New, Quoted)
                | (New, Rejected)
                | (InReview, Quoted)
                | (InReview, Rejected)
                | (Quoted, Quoted)
                | (Quoted, Accepted)
                | (Quoted, Rejected)
                | (Accepted, Completed)
        )
    }

    /// Still waiting on the shop
    pub fn is_pending(self) -> bool {
        matches!(self, DesignRequestStatus::New | DesignRequestStatus::InReview)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DesignRequestDBResponse {
    pub id: DesignRequestId,
    pub user_id: Option<UserId>,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub title: String,
    pub description: String,
    pub budget: Option<Decimal>,
    pub deadline: Option<NaiveDate>,
    pub attachment_ids: Vec<FileId>,
    pub status: DesignRequestStatus,
    pub quoted_price: Option<Decimal>,
    pub admin_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DesignRequestCreateDBRequest {
    pub user_id: Option<UserId>,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub title: String,
    pub description: String,
    pub budget: Option<Decimal>,
    pub deadline: Option<NaiveDate>,
    pub attachment_ids: Vec<FileId>,
}

#[derive(Debug, Clone, Default)]
pub struct DesignRequestUpdateDBRequest {
    pub status: Option<DesignRequestStatus>,
    pub quoted_price: Option<Decimal>,
    pub admin_notes: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DesignRequestFilter {
    pub user_id: Option<UserId>,
    pub status: Option<DesignRequestStatus>,
    pub skip: i64,
    pub limit: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_design_request_workflow() {
        use DesignRequestStatus::*;
        assert!(New.can_transition_to(InReview));
        assert!(InReview.can_transition_to(Quoted));
        assert!(Quoted.can_transition_to(Quoted));
        assert!(Quoted.can_transition_to(Accepted));
        assert!(Accepted.can_transition_to(Completed));
        assert!(!New.can_transition_to(Accepted));
        assert!(!Rejected.can_transition_to(InReview));
        assert!(!Completed.can_transition_to(New));
        assert!(New.is_pending() && !Quoted.is_pending());
    }
}
