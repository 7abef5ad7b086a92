use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::{
    api::models::pagination::Pagination,
    db::models::materials::{MaterialCreateDBRequest, MaterialDBResponse, MaterialKind, MaterialUpdateDBRequest},
    types::MaterialId,
};

fn default_available() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct MaterialCreate {
    pub name: String,
    pub kind: MaterialKind,
    pub description: Option<String>,
    pub density_g_cm3: Decimal,
    pub price_per_gram: Decimal,
    #[serde(default)]
    pub colors: Vec<String>,
    #[serde(default = "default_available")]
    pub available: bool,
}

impl From<MaterialCreate> for MaterialCreateDBRequest {
    fn from(create: MaterialCreate) -> Self {
        Self {
            name: create.name.trim().to_string(),
            kind: create.kind,
            description: create.description,
            density_g_cm3: create.density_g_cm3,
            price_per_gram: create.price_per_gram,
            colors: create.colors,
            available: create.available,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct MaterialUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub density_g_cm3: Option<Decimal>,
    pub price_per_gram: Option<Decimal>,
    pub colors: Option<Vec<String>>,
    pub available: Option<bool>,
}

impl From<MaterialUpdate> for MaterialUpdateDBRequest {
    fn from(update: MaterialUpdate) -> Self {
        Self {
            name: update.name.map(|n| n.trim().to_string()),
            description: update.description,
            density_g_cm3: update.density_g_cm3,
            price_per_gram: update.price_per_gram,
            colors: update.colors,
            available: update.available,
        }
    }
}

#[derive(Debug, Deserialize, IntoParams, ToSchema)]
pub struct ListMaterialsQuery {
    #[serde(flatten)]
    #[param(inline)]
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MaterialResponse {
    #[schema(value_type = String, format = "uuid")]
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

impl From<MaterialDBResponse> for MaterialResponse {
    fn from(db: MaterialDBResponse) -> Self {
        Self {
            id: db.id,
            name: db.name,
            kind: db.kind,
            description: db.description,
            density_g_cm3: db.density_g_cm3,
            price_per_gram: db.price_per_gram,
            colors: db.colors,
            available: db.available,
            created_at: db.created_at,
            updated_at: db.updated_at,
        }
    }
}

/// Density must be positive and price non-negative
pub fn validate_rates(density_g_cm3: Option<Decimal>, price_per_gram: Option<Decimal>) -> Result<(), String> {
    if density_g_cm3.is_some_and(|d| d <= Decimal::ZERO) {
        return Err("density_g_cm3 must be positive".to_string());
    }
    if price_per_gram.is_some_and(|p| p < Decimal::ZERO) {
        return Err("price_per_gram must not be negative".to_string());
    }
    Ok(())
}
