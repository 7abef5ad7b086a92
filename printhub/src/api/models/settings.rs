use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::db::models::settings::{ScheduleSettings, ShippingOption, ShopSettings};

/// The part of the shop settings the storefront needs
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PublicSettingsResponse {
    pub currency: String,
    /// Enabled shipping methods only
    pub shipping_options: Vec<ShippingOption>,
    pub free_shipping_threshold: Option<Decimal>,
    pub minimum_order_price: Decimal,
    pub max_quantity: i32,
    pub schedule: ScheduleSettings,
}

impl From<ShopSettings> for PublicSettingsResponse {
    fn from(settings: ShopSettings) -> Self {
        Self {
            currency: settings.currency,
            shipping_options: settings.shipping.options.into_iter().filter(|o| o.enabled).collect(),
            free_shipping_threshold: settings.shipping.free_shipping_threshold,
            minimum_order_price: settings.pricing.minimum_order_price,
            max_quantity: settings.pricing.max_quantity,
            schedule: settings.schedule,
        }
    }
}
