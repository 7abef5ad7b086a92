use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{db::models::files::UploadedFileDBResponse, types::FileId};

/// Metadata of an uploaded model. Geometry is only known for STL files.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UploadResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: FileId,
    pub original_name: String,
    pub content_type: Option<String>,
    pub size_bytes: i64,
    pub volume_cm3: Option<Decimal>,
    /// Bounding box edges in millimetres
    #[schema(value_type = Option<Vec<String>>)]
    pub bbox_mm: Option<[Decimal; 3]>,
    pub triangle_count: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl From<UploadedFileDBResponse> for UploadResponse {
    fn from(db: UploadedFileDBResponse) -> Self {
        let bbox_mm = db.bbox_mm();
        Self {
            id: db.id,
            original_name: db.original_name,
            content_type: db.content_type,
            size_bytes: db.size_bytes,
            volume_cm3: db.volume_cm3,
            bbox_mm,
            triangle_count: db.triangle_count,
            created_at: db.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UploadDeleteResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: FileId,
    pub deleted: bool,
}
