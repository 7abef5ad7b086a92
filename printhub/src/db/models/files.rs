//! Database models for uploaded model files.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::FromRow;

use crate::types::{FileId, UserId};

#[derive(Debug, Clone, FromRow)]
pub struct UploadedFileDBResponse {
    pub id: FileId,
    pub user_id: Option<UserId>,
    pub original_name: String,
    pub storage_path: String,
    pub content_type: Option<String>,
    pub size_bytes: i64,
    /// Only known for formats we can measure (STL)
    pub volume_cm3: Option<Decimal>,
    pub bbox_x_mm: Option<Decimal>,
    pub bbox_y_mm: Option<Decimal>,
    pub bbox_z_mm: Option<Decimal>,
    pub triangle_count: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl UploadedFileDBResponse {
    pub fn bbox_mm(&self) -> Option<[Decimal; 3]> {
        Some([self.bbox_x_mm?, self.bbox_y_mm?, self.bbox_z_mm?])
    }
}

#[derive(Debug, Clone)]
pub struct UploadedFileCreateDBRequest {
    pub id: FileId,
    pub user_id: Option<UserId>,
    pub original_name: String,
    pub storage_path: String,
    pub content_type: Option<String>,
    pub size_bytes: i64,
    pub volume_cm3: Option<Decimal>,
    pub bbox_mm: Option<[Decimal; 3]>,
    pub triangle_count: Option<i64>,
}
