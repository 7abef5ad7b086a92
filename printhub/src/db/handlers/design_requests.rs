//! Database repository for design requests.

use sqlx::PgConnection;
use tracing::instrument;
use uuid::Uuid;

use crate::{
    db::{
        errors::{DbError, Result},
        models::design_requests::{
            DesignRequestCreateDBRequest, DesignRequestDBResponse, DesignRequestFilter, DesignRequestUpdateDBRequest,
        },
    },
    types::{DesignRequestId, abbrev_uuid},
};

const DESIGN_REQUEST_COLUMNS: &str = "id, user_id, name, email, phone, title, description, budget, deadline, \
                                      attachment_ids, status, quoted_price, admin_notes, created_at, updated_at";

pub struct DesignRequests<'c> {
    db: &'c mut PgConnection,
}

impl<'c> DesignRequests<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(title = %request.title), err)]
    pub async fn create(&mut self, request: &DesignRequestCreateDBRequest) -> Result<DesignRequestDBResponse> {
        let design_request = sqlx::query_as::<_, DesignRequestDBResponse>(&format!(
            r#"
            INSERT INTO design_requests (id, user_id, name, email, phone, title, description, budget, deadline, attachment_ids)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {DESIGN_REQUEST_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(request.user_id)
        .bind(request.name.trim())
        .bind(request.email.trim().to_lowercase())
        .bind(&request.phone)
        .bind(request.title.trim())
        .bind(&request.description)
        .bind(request.budget)
        .bind(request.deadline)
        .bind(&request.attachment_ids)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(design_request)
    }

    #[instrument(skip(self), fields(design_request_id = %abbrev_uuid(&id)), err)]
    pub async fn get_by_id(&mut self, id: DesignRequestId) -> Result<Option<DesignRequestDBResponse>> {
        let design_request = sqlx::query_as::<_, DesignRequestDBResponse>(&format!(
            "SELECT {DESIGN_REQUEST_COLUMNS} FROM design_requests WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&mut *self.db)
        .await?;
        Ok(design_request)
    }

    #[instrument(skip(self, filter), fields(limit = filter.limit, skip = filter.skip), err)]
    pub async fn list(&mut self, filter: &DesignRequestFilter) -> Result<Vec<DesignRequestDBResponse>> {
        let requests = sqlx::query_as::<_, DesignRequestDBResponse>(&format!(
            r#"
            SELECT {DESIGN_REQUEST_COLUMNS} FROM design_requests
            WHERE ($1::uuid IS NULL OR user_id = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(filter.user_id)
        .bind(filter.status)
        .bind(filter.limit)
        .bind(filter.skip)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(requests)
    }

    #[instrument(skip(self, filter), err)]
    pub async fn count(&mut self, filter: &DesignRequestFilter) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM design_requests
            WHERE ($1::uuid IS NULL OR user_id = $1)
              AND ($2::text IS NULL OR status = $2)
            "#,
        )
        .bind(filter.user_id)
        .bind(filter.status)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(count)
    }

    /// Requests the shop has not answered yet
    #[instrument(skip(self), err)]
    pub async fn count_pending(&mut self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM design_requests WHERE status IN ('new', 'in_review')")
            .fetch_one(&mut *self.db)
            .await?;
        Ok(count)
    }

    #[instrument(skip(self, request), fields(design_request_id = %abbrev_uuid(&id)), err)]
    pub async fn update(&mut self, id: DesignRequestId, request: &DesignRequestUpdateDBRequest) -> Result<DesignRequestDBResponse> {
        sqlx::query_as::<_, DesignRequestDBResponse>(&format!(
            r#"
            UPDATE design_requests SET
                status = COALESCE($2, status),
                quoted_price = COALESCE($3, quoted_price),
                admin_notes = COALESCE($4, admin_notes),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {DESIGN_REQUEST_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(request.status)
        .bind(request.quoted_price)
        .bind(&request.admin_notes)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)
    }
}
