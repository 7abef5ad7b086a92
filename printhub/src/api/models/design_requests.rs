use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::{
    api::models::pagination::Pagination,
    db::models::design_requests::{DesignRequestDBResponse, DesignRequestStatus},
    types::{DesignRequestId, FileId, UserId},
};

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct DesignRequestCreate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub budget: Option<Decimal>,
    #[schema(value_type = Option<String>, format = "date")]
    pub deadline: Option<NaiveDate>,
    /// Previously uploaded reference files
    #[schema(value_type = Vec<String>)]
    pub attachment_ids: Vec<FileId>,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct DesignRequestUpdate {
    pub status: Option<DesignRequestStatus>,
    pub quoted_price: Option<Decimal>,
    pub admin_notes: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams, ToSchema)]
pub struct ListDesignRequestsQuery {
    #[serde(flatten)]
    #[param(inline)]
    pub pagination: Pagination,

    pub status: Option<DesignRequestStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DesignRequestResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: DesignRequestId,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub user_id: Option<UserId>,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub title: String,
    pub description: String,
    pub budget: Option<Decimal>,
    #[schema(value_type = Option<String>, format = "date")]
    pub deadline: Option<NaiveDate>,
    #[schema(value_type = Vec<String>)]
    pub attachment_ids: Vec<FileId>,
    pub status: DesignRequestStatus,
    pub quoted_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<DesignRequestDBResponse> for DesignRequestResponse {
    fn from(db: DesignRequestDBResponse) -> Self {
        Self {
            id: db.id,
            user_id: db.user_id,
            name: db.name,
            email: db.email,
            phone: db.phone,
            title: db.title,
            description: db.description,
            budget: db.budget,
            deadline: db.deadline,
            attachment_ids: db.attachment_ids,
            status: db.status,
            quoted_price: db.quoted_price,
            admin_notes: db.admin_notes,
            created_at: db.created_at,
            updated_at: db.updated_at,
        }
    }
}

impl DesignRequestResponse {
    pub fn for_customer(mut self) -> Self {
        self.admin_notes = None;
        self
    }
}
