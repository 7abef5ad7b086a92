use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::{
    api::models::pagination::Pagination,
    db::models::{
        materials::MaterialKind,
        printers::{PrinterCreateDBRequest, PrinterDBResponse, PrinterStatus, PrinterUpdateDBRequest},
    },
    types::PrinterId,
};

fn default_status() -> PrinterStatus {
    PrinterStatus::Idle
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct PrinterCreate {
    pub name: String,
    pub model: String,
    #[serde(default = "default_status")]
    pub status: PrinterStatus,
    pub hourly_rate: Decimal,
    pub throughput_g_per_hour: Decimal,
    pub build_x_mm: i32,
    pub build_y_mm: i32,
    pub build_z_mm: i32,
    pub supported_kinds: Vec<MaterialKind>,
    pub notes: Option<String>,
}

impl PrinterCreate {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must not be empty".to_string());
        }
        if self.hourly_rate < Decimal::ZERO {
            return Err("hourly_rate must not be negative".to_string());
        }
        if self.throughput_g_per_hour <= Decimal::ZERO {
            return Err("throughput_g_per_hour must be positive".to_string());
        }
        if [self.build_x_mm, self.build_y_mm, self.build_z_mm].iter().any(|d| *d <= 0) {
            return Err("build volume dimensions must be positive".to_string());
        }
        if self.supported_kinds.is_empty() {
            return Err("supported_kinds must list at least one material kind".to_string());
        }
        Ok(())
    }
}

impl From<PrinterCreate> for PrinterCreateDBRequest {
    fn from(create: PrinterCreate) -> Self {
        Self {
            name: create.name.trim().to_string(),
            model: create.model,
            status: create.status,
            hourly_rate: create.hourly_rate,
            throughput_g_per_hour: create.throughput_g_per_hour,
            build_x_mm: create.build_x_mm,
            build_y_mm: create.build_y_mm,
            build_z_mm: create.build_z_mm,
            supported_kinds: create.supported_kinds,
            notes: create.notes,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct PrinterUpdate {
    pub name: Option<String>,
    pub model: Option<String>,
    pub status: Option<PrinterStatus>,
    pub hourly_rate: Option<Decimal>,
    pub throughput_g_per_hour: Option<Decimal>,
    pub supported_kinds: Option<Vec<MaterialKind>>,
    pub notes: Option<String>,
}

impl PrinterUpdate {
    pub fn validate(&self) -> Result<(), String> {
        if self.hourly_rate.is_some_and(|r| r < Decimal::ZERO) {
            return Err("hourly_rate must not be negative".to_string());
        }
        if self.throughput_g_per_hour.is_some_and(|t| t <= Decimal::ZERO) {
            return Err("throughput_g_per_hour must be positive".to_string());
        }
        if self.supported_kinds.as_ref().is_some_and(|k| k.is_empty()) {
            return Err("supported_kinds must list at least one material kind".to_string());
        }
        Ok(())
    }
}

impl From<PrinterUpdate> for PrinterUpdateDBRequest {
    fn from(update: PrinterUpdate) -> Self {
        Self {
            name: update.name.map(|n| n.trim().to_string()),
            model: update.model,
            status: update.status,
            hourly_rate: update.hourly_rate,
            throughput_g_per_hour: update.throughput_g_per_hour,
            supported_kinds: update.supported_kinds,
            notes: update.notes,
        }
    }
}

#[derive(Debug, Deserialize, IntoParams, ToSchema)]
pub struct ListPrintersQuery {
    #[serde(flatten)]
    #[param(inline)]
    pub pagination: Pagination,

    pub status: Option<PrinterStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PrinterResponse {
    #[schema(value_type = String, format = "uuid")]
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

impl From<PrinterDBResponse> for PrinterResponse {
    fn from(db: PrinterDBResponse) -> Self {
        Self {
            id: db.id,
            name: db.name,
            model: db.model,
            status: db.status,
            hourly_rate: db.hourly_rate,
            throughput_g_per_hour: db.throughput_g_per_hour,
            build_x_mm: db.build_x_mm,
            build_y_mm: db.build_y_mm,
            build_z_mm: db.build_z_mm,
            supported_kinds: db.supported_kinds,
            notes: db.notes,
            created_at: db.created_at,
            updated_at: db.updated_at,
        }
    }
}
