//! Database repository for uploaded model files.

use std::collections::HashMap;

use sqlx::PgConnection;
use tracing::instrument;

use crate::{
    db::{
        errors::Result,
        models::files::{UploadedFileCreateDBRequest, UploadedFileDBResponse},
    },
    types::{FileId, UserId, abbrev_uuid},
};

const FILE_COLUMNS: &str = "id, user_id, original_name, storage_path, content_type, size_bytes, volume_cm3, \
                            bbox_x_mm, bbox_y_mm, bbox_z_mm, triangle_count, created_at";

pub struct Files<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Files<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(file_id = %abbrev_uuid(&request.id)), err)]
    pub async fn create(&mut self, request: &UploadedFileCreateDBRequest) -> Result<UploadedFileDBResponse> {
        let [x, y, z] = match request.bbox_mm {
            Some([x, y, z]) => [Some(x), Some(y), Some(z)],
            None => [None, None, None],
        };

        let file = sqlx::query_as::<_, UploadedFileDBResponse>(&format!(
            r#"
            INSERT INTO uploaded_files (id, user_id, original_name, storage_path, content_type, size_bytes,
                                        volume_cm3, bbox_x_mm, bbox_y_mm, bbox_z_mm, triangle_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {FILE_COLUMNS}
            "#
        ))
        .bind(request.id)
        .bind(request.user_id)
        .bind(&request.original_name)
        .bind(&request.storage_path)
        .bind(&request.content_type)
        .bind(request.size_bytes)
        .bind(request.volume_cm3)
        .bind(x)
        .bind(y)
        .bind(z)
        .bind(request.triangle_count)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(file)
    }

    #[instrument(skip(self), fields(file_id = %abbrev_uuid(&id)), err)]
    pub async fn get_by_id(&mut self, id: FileId) -> Result<Option<UploadedFileDBResponse>> {
        let file = sqlx::query_as::<_, UploadedFileDBResponse>(&format!("SELECT {FILE_COLUMNS} FROM uploaded_files WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(file)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    pub async fn get_bulk(&mut self, ids: &[FileId]) -> Result<HashMap<FileId, UploadedFileDBResponse>> {
        let files =
            sqlx::query_as::<_, UploadedFileDBResponse>(&format!("SELECT {FILE_COLUMNS} FROM uploaded_files WHERE id = ANY($1)"))
                .bind(ids)
                .fetch_all(&mut *self.db)
                .await?;
        Ok(files.into_iter().map(|f| (f.id, f)).collect())
    }

    #[instrument(skip(self), err)]
    pub async fn list_for_user(&mut self, user_id: UserId, skip: i64, limit: i64) -> Result<Vec<UploadedFileDBResponse>> {
        let files = sqlx::query_as::<_, UploadedFileDBResponse>(&format!(
            "SELECT {FILE_COLUMNS} FROM uploaded_files WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2 OFFSET $3"
        ))
        .bind(user_id)
        .bind(limit)
        .bind(skip)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(files)
    }

    #[instrument(skip(self), fields(file_id = %abbrev_uuid(&id)), err)]
    pub async fn delete(&mut self, id: FileId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM uploaded_files WHERE id = $1")
            .bind(id)
            .execute(&mut *self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// True if any order references the file
    #[instrument(skip(self), fields(file_id = %abbrev_uuid(&id)), err)]
    pub async fn is_referenced(&mut self, id: FileId) -> Result<bool> {
        let used = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM orders WHERE $1 = ANY(file_ids)) OR EXISTS(SELECT 1 FROM design_requests WHERE $1 = ANY(attachment_ids))",
        )
        .bind(id)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(used)
    }
}
