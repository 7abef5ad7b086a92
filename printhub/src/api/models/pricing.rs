use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    pricing::PriceEstimate,
    types::{FileId, MaterialId, PrinterId},
};

pub(crate) fn default_infill() -> i16 {
    20
}

pub(crate) fn default_quantity() -> i32 {
    1
}

/// Quote request. The volume comes from the uploaded files, or from `volume_cm3` when given.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct EstimateRequest {
    #[schema(value_type = Option<String>, format = "uuid")]
    pub file_id: Option<FileId>,
    /// Several files priced as one set
    #[serde(default)]
    #[schema(value_type = Vec<String>)]
    pub file_ids: Vec<FileId>,
    pub volume_cm3: Option<Decimal>,
    #[schema(value_type = String, format = "uuid")]
    pub material_id: MaterialId,
    #[serde(default = "default_infill")]
    pub infill_percent: i16,
    #[serde(default = "default_quantity")]
    pub quantity: i32,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub printer_id: Option<PrinterId>,
}

impl EstimateRequest {
    pub fn all_file_ids(&self) -> Vec<FileId> {
        let mut ids = Vec::new();
        for id in self.file_id.into_iter().chain(self.file_ids.iter().copied()) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct EstimateResponse {
    #[schema(value_type = String, format = "uuid")]
    pub material_id: MaterialId,
    pub material_name: String,
    pub currency: String,
    #[serde(flatten)]
    pub estimate: PriceEstimate,
}
