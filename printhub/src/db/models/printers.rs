//! Database models for printers.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::db::models::materials::MaterialKind;
use crate::types::PrinterId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PrinterStatus {
    Idle,
    Printing,
    Maintenance,
    Offline,
}

impl PrinterStatus {
    /// Printers under maintenance or offline are not offered for new jobs.
    pub fn accepts_jobs(&self) -> bool {
        matches!(self, PrinterStatus::Idle | PrinterStatus::Printing)
    }
}

#[derive(Debug, Clone)]
pub struct PrinterDBResponse {
    pub id: PrinterId,
    pub name: String,
    pub model: String,
    pub status: PrinterStatus,
    pub hourly_rate: Decimal,
    pub throughput_g_per_hour: Decimal,
    pub build_x_mm: i32,
    pub build_y_mm: i32,
    pub build_z_mm: i32,
    pub supported_kinds: Vec<MaterialKind>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PrinterDBResponse {
    pub fn supports(&self, kind: MaterialKind) -> bool {
        self.supported_kinds.contains(&kind)
    }

    /// Whether a part with this bounding box fits in the build volume, in any axis order.
    pub fn fits(&self, bbox_mm: [Decimal; 3]) -> bool {
        let mut part = bbox_mm;
        part.sort();
        let mut volume = [
            Decimal::from(self.build_x_mm),
            Decimal::from(self.build_y_mm),
            Decimal::from(self.build_z_mm),
        ];
        volume.sort();
        part.iter().zip(volume.iter()).all(|(p, v)| p <= v)
    }
}

#[derive(Debug, Clone)]
pub struct PrinterCreateDBRequest {
    pub name: String,
    pub model: String,
    pub status: PrinterStatus,
    pub hourly_rate: Decimal,
    pub throughput_g_per_hour: Decimal,
    pub build_x_mm: i32,
    pub build_y_mm: i32,
    pub build_z_mm: i32,
    pub supported_kinds: Vec<MaterialKind>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PrinterUpdateDBRequest {
    pub name: Option<String>,
    pub model: Option<String>,
    pub status: Option<PrinterStatus>,
    pub hourly_rate: Option<Decimal>,
    pub throughput_g_per_hour: Option<Decimal>,
    pub supported_kinds: Option<Vec<MaterialKind>>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PrinterFilter {
    pub status: Option<PrinterStatus>,
    pub skip: i64,
    pub limit: i64,
}
