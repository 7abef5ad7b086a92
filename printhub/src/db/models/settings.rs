//! Shop-wide settings stored under the `shop` key of the settings table.
//!
//! Every section has defaults, so a partially stored document (or none at all) still yields a
//! complete [`ShopSettings`].

use chrono::{NaiveTime, Weekday};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::orders::ShippingMethod;

/// Settings key holding [`ShopSettings`]
pub const SHOP_SETTINGS_KEY: &str = "shop";
/// Set once the catalog from the config file has been inserted
pub const CATALOG_SEEDED_KEY: &str = "catalog_seeded";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(default, deny_unknown_fields)]
pub struct ShopSettings {
    /// ISO currency code used for prices and orders
    pub currency: String,
    pub pricing: PricingSettings,
    pub shipping: ShippingSettings,
    pub schedule: ScheduleSettings,
}

/// Parameters of the print price formula.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(default, deny_unknown_fields)]
pub struct PricingSettings {
    /// Share of the model volume printed solid (walls, top and bottom layers), 0..=1
    pub shell_fraction: Decimal,
    /// Extra material for supports, as a fraction of the effective volume
    pub support_overhead: Decimal,
    /// Machine preparation time added to every job, in hours
    pub setup_hours: Decimal,
    /// Flat fee added once per order
    pub base_fee: Decimal,
    /// Orders never cost less than this (before shipping)
    pub minimum_order_price: Decimal,
    pub max_quantity: i32,
    /// Used when no printer can take the material
    pub fallback_hourly_rate: Decimal,
    pub fallback_throughput_g_per_hour: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(default, deny_unknown_fields)]
pub struct ShippingSettings {
    pub options: Vec<ShippingOption>,
    /// Subtotal at or above which shipping is free
    pub free_shipping_threshold: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct ShippingOption {
    pub method: ShippingMethod,
    pub label: String,
    pub price: Decimal,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Opening hours used to generate appointment slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(default, deny_unknown_fields)]
pub struct ScheduleSettings {
    #[schema(value_type = Vec<String>, example = json!(["Mon", "Tue"]))]
    pub working_days: Vec<Weekday>,
    /// Local opening time, e.g. "09:00:00"
    #[schema(value_type = String)]
    pub open_time: NaiveTime,
    #[schema(value_type = String)]
    pub close_time: NaiveTime,
    pub slot_minutes: u32,
    /// Fixed offset of shop-local time from UTC
    pub utc_offset_minutes: i32,
    /// Bookings must be made at least this far ahead
    pub min_notice_hours: i64,
    /// Bookings can be made at most this many days ahead
    pub max_days_ahead: i64,
}

/// Upper bound for [`ScheduleSettings::min_notice_hours`], thirty days
pub const MAX_NOTICE_HOURS: i64 = 24 * 30;
/// Upper bound for [`ScheduleSettings::max_days_ahead`]
pub const MAX_DAYS_AHEAD: i64 = 365;

impl Default for ShopSettings {
    fn default() -> Self {
        Self {
            currency: "PLN".to_string(),
            pricing: PricingSettings::default(),
            shipping: ShippingSettings::default(),
            schedule: ScheduleSettings::default(),
        }
    }
}

impl Default for PricingSettings {
    fn default() -> Self {
        Self {
            shell_fraction: Decimal::new(25, 2),
            support_overhead: Decimal::new(10, 2),
            setup_hours: Decimal::new(25, 2),
            base_fee: Decimal::new(500, 2),
            minimum_order_price: Decimal::new(2000, 2),
            max_quantity: 100,
            fallback_hourly_rate: Decimal::new(800, 2),
            fallback_throughput_g_per_hour: Decimal::new(12, 0),
        }
    }
}

impl Default for ShippingSettings {
    fn default() -> Self {
        Self {
            options: vec![
                ShippingOption {
                    method: ShippingMethod::Pickup,
                    label: "Pickup at the shop".to_string(),
                    price: Decimal::ZERO,
                    enabled: true,
                },
                ShippingOption {
                    method: ShippingMethod::InpostLocker,
                    label: "InPost parcel locker".to_string(),
                    price: Decimal::new(1399, 2),
                    enabled: true,
                },
                ShippingOption {
                    method: ShippingMethod::DpdCourier,
                    label: "DPD courier".to_string(),
                    price: Decimal::new(1899, 2),
                    enabled: true,
                },
            ],
            free_shipping_threshold: Some(Decimal::new(300, 0)),
        }
    }
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            working_days: vec![Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri],
            open_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default(),
            close_time: NaiveTime::from_hms_opt(17, 0, 0).unwrap_or_default(),
            slot_minutes: 30,
            utc_offset_minutes: 60,
            min_notice_hours: 24,
            max_days_ahead: 30,
        }
    }
}

impl ShippingSettings {
    pub fn option(&self, method: ShippingMethod) -> Option<&ShippingOption> {
        self.options.iter().find(|o| o.method == method && o.enabled)
    }

    /// Shipping price for an order with this subtotal. None if the method is not offered.
    pub fn cost_for(&self, method: ShippingMethod, subtotal: Decimal) -> Option<Decimal> {
        let option = self.option(method)?;
        match self.free_shipping_threshold {
            Some(threshold) if subtotal >= threshold => Some(Decimal::ZERO),
            _ => Some(option.price),
        }
    }
}

impl ShopSettings {
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(format!("currency must be a three-letter ISO code, got '{}'", self.currency));
        }

        let p = &self.pricing;
        if p.shell_fraction < Decimal::ZERO || p.shell_fraction > Decimal::ONE {
            return Err("pricing.shell_fraction must be between 0 and 1".to_string());
        }
        for (name, value) in [
            ("support_overhead", p.support_overhead),
            ("setup_hours", p.setup_hours),
            ("base_fee", p.base_fee),
            ("minimum_order_price", p.minimum_order_price),
            ("fallback_hourly_rate", p.fallback_hourly_rate),
        ] {
            if value < Decimal::ZERO {
                return Err(format!("pricing.{name} must not be negative"));
            }
        }
        if p.fallback_throughput_g_per_hour <= Decimal::ZERO {
            return Err("pricing.fallback_throughput_g_per_hour must be positive".to_string());
        }
        if p.max_quantity < 1 {
            return Err("pricing.max_quantity must be at least 1".to_string());
        }

        let mut seen = Vec::new();
        for option in &self.shipping.options {
            if option.price < Decimal::ZERO {
                return Err(format!("shipping price for {:?} must not be negative", option.method));
            }
            if seen.contains(&option.method) {
                return Err(format!("shipping method {:?} is listed twice", option.method));
            }
            seen.push(option.method);
        }
        if !self.shipping.options.iter().any(|o| o.enabled) {
            return Err("at least one shipping method must be enabled".to_string());
        }

        let s = &self.schedule;
        if s.working_days.is_empty() {
            return Err("schedule.working_days must not be empty".to_string());
        }
        if s.open_time >= s.close_time {
            return Err("schedule.open_time must be before close_time".to_string());
        }
        if s.slot_minutes == 0 || s.slot_minutes > 8 * 60 {
            return Err("schedule.slot_minutes must be between 1 and 480".to_string());
        }
        if s.utc_offset_minutes.abs() > 14 * 60 {
            return Err("schedule.utc_offset_minutes must be within ±14 hours".to_string());
        }
        if !(0..=MAX_NOTICE_HOURS).contains(&s.min_notice_hours) {
            return Err(format!("schedule.min_notice_hours must be between 0 and {MAX_NOTICE_HOURS}"));
        }
        if !(1..=MAX_DAYS_AHEAD).contains(&s.max_days_ahead) {
            return Err(format!("schedule.max_days_ahead must be between 1 and {MAX_DAYS_AHEAD}"));
        }
        Ok(())
    }
}
