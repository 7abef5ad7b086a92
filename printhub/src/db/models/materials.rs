//! Database models for print materials.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, str::FromStr};
use utoipa::ToSchema;

use crate::types::MaterialId;

/// Filament or resin family. Printers declare which kinds they can run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MaterialKind {
    Pla,
    Petg,
    Abs,
    Asa,
    Tpu,
    Nylon,
    Resin,
}

impl MaterialKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaterialKind::Pla => "pla",
            MaterialKind::Petg => "petg",
            MaterialKind::Abs => "abs",
            MaterialKind::Asa => "asa",
            MaterialKind::Tpu => "tpu",
            MaterialKind::Nylon => "nylon",
            MaterialKind::Resin => "resin",
        }
    }
}

impl fmt::Display for MaterialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MaterialKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pla" => Ok(MaterialKind::Pla),
            "petg" => Ok(MaterialKind::Petg),
            "abs" => Ok(MaterialKind::Abs),
            "asa" => Ok(MaterialKind::Asa),
            "tpu" => Ok(MaterialKind::Tpu),
            "nylon" => Ok(MaterialKind::Nylon),
            "resin" => Ok(MaterialKind::Resin),
            other => Err(format!("unknown material kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct MaterialDBResponse {
    pub id: MaterialId,
    pub name: String,
    pub kind: MaterialKind,
    pub description: Option<String>,
    pub density_g_cm3: Decimal,
    pub price_per_gram: Decimal,
    pub colors: Vec<String>,
    pub available: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MaterialCreateDBRequest {
    pub name: String,
    pub kind: MaterialKind,
    pub description: Option<String>,
    pub density_g_cm3: Decimal,
    pub price_per_gram: Decimal,
    pub colors: Vec<String>,
    pub available: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MaterialUpdateDBRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub density_g_cm3: Option<Decimal>,
    pub price_per_gram: Option<Decimal>,
    pub colors: Option<Vec<String>>,
    pub available: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct MaterialFilter {
    pub available_only: bool,
    pub skip: i64,
    pub limit: i64,
}
