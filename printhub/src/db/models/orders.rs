//! Database models for print orders.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, types::Json};
use utoipa::ToSchema;

use crate::types::{FileId, MaterialId, OrderId, PrinterId, UserId};

/// Order lifecycle.
///
/// ```text
/// pending_payment ─▶ paid ─▶ in_production ─▶ printed ─┬▶ shipped ──────────┬▶ completed
///        │            │            │                    └▶ ready_for_pickup ─┘
///        └────────────┴────────────┴─▶ cancelled
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    PendingPayment,
    Paid,
    InProduction,
    Printed,
    Shipped,
    ReadyForPickup,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (PendingPayment, Paid)
                | (PendingPayment, Cancelled)
                | (Paid, InProduction)
                | (Paid, Cancelled)
                | (InProduction, Printed)
                | (InProduction, Cancelled)
                | (Printed, Shipped)
                | (Printed, ReadyForPickup)
                | (Shipped, Completed)
                | (ReadyForPickup, Completed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::PendingPayment => "pending_payment",
            OrderStatus::Paid => "paid",
            OrderStatus::InProduction => "in_production",
            OrderStatus::Printed => "printed",
            OrderStatus::Shipped => "shipped",
            OrderStatus::ReadyForPickup => "ready_for_pickup",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

/// Payment state tracked on the order itself
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrderPaymentStatus {
    Unpaid,
    Pending,
    Paid,
    Failed,
    Refunded,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ShippingMethod {
    /// Collected at the shop; pairs with a pickup appointment
    Pickup,
    /// InPost parcel locker
    InpostLocker,
    /// DPD courier to a street address
    DpdCourier,
}

impl ShippingMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            ShippingMethod::Pickup => "pickup",
            ShippingMethod::InpostLocker => "inpost_locker",
            ShippingMethod::DpdCourier => "dpd_courier",
        }
    }

    /// Pickup orders need no delivery details
    pub fn requires_address(self) -> bool {
        !matches!(self, ShippingMethod::Pickup)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ShippingAddress {
    pub recipient: String,
    pub phone: String,
    pub street: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    #[serde(default = "default_country")]
    pub country: String,
    /// InPost locker code, e.g. `KRA01M`
    pub locker_id: Option<String>,
}

fn default_country() -> String {
    "PL".to_string()
}

impl ShippingAddress {
    /// Check that the fields the carrier needs are present. Returns the missing field names.
    pub fn missing_fields(&self, method: ShippingMethod) -> Vec<&'static str> {
        fn blank(v: &Option<String>) -> bool {
            v.as_deref().is_none_or(|s| s.trim().is_empty())
        }

        let mut missing = Vec::new();
        if self.recipient.trim().is_empty() {
            missing.push("recipient");
        }
        if self.phone.trim().is_empty() {
            missing.push("phone");
        }
        match method {
            ShippingMethod::InpostLocker if blank(&self.locker_id) => missing.push("locker_id"),
            ShippingMethod::DpdCourier => {
                if blank(&self.street) {
                    missing.push("street");
                }
                if blank(&self.city) {
                    missing.push("city");
                }
                if blank(&self.postal_code) {
                    missing.push("postal_code");
                }
            }
            _ => {}
        }
        missing
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct OrderDBResponse {
    pub id: OrderId,
    pub number: i64,
    pub user_id: Option<UserId>,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: Option<String>,
    pub material_id: MaterialId,
    pub printer_id: Option<PrinterId>,
    pub color: Option<String>,
    pub infill_percent: i16,
    pub quantity: i32,
    pub file_ids: Vec<FileId>,
    pub volume_cm3: Decimal,
    pub weight_g: Decimal,
    pub print_hours: Decimal,
    pub subtotal: Decimal,
    pub shipping_cost: Decimal,
    pub total: Decimal,
    pub currency: String,
    pub shipping_method: ShippingMethod,
    pub shipping_address: Option<Json<ShippingAddress>>,
    pub tracking_number: Option<String>,
    pub status: OrderStatus,
    pub payment_status: OrderPaymentStatus,
    pub notes: Option<String>,
    pub admin_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OrderCreateDBRequest {
    pub user_id: Option<UserId>,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: Option<String>,
    pub material_id: MaterialId,
    pub printer_id: Option<PrinterId>,
    pub color: Option<String>,
    pub infill_percent: i16,
    pub quantity: i32,
    pub file_ids: Vec<FileId>,
    pub volume_cm3: Decimal,
    pub weight_g: Decimal,
    pub print_hours: Decimal,
    pub subtotal: Decimal,
    pub shipping_cost: Decimal,
    pub total: Decimal,
    pub currency: String,
    pub shipping_method: ShippingMethod,
    pub shipping_address: Option<ShippingAddress>,
    pub notes: Option<String>,
}

/// Staff-side changes. Status changes are validated before they reach the database.
#[derive(Debug, Clone, Default)]
pub struct OrderUpdateDBRequest {
    pub status: Option<OrderStatus>,
    pub payment_status: Option<OrderPaymentStatus>,
    pub printer_id: Option<PrinterId>,
    pub tracking_number: Option<String>,
    pub admin_notes: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub user_id: Option<UserId>,
    pub status: Option<OrderStatus>,
    pub skip: i64,
    pub limit: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_transitions() {
        use OrderStatus::*;
        assert!(PendingPayment.can_transition_to(Paid));
        assert!(Paid.can_transition_to(InProduction));
        assert!(Printed.can_transition_to(ReadyForPickup));
        assert!(Shipped.can_transition_to(Completed));
        assert!(InProduction.can_transition_to(Cancelled));

        assert!(!PendingPayment.can_transition_to(InProduction));
        assert!(!Printed.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Paid));
        assert!(!Shipped.can_transition_to(ReadyForPickup));
    }

    #[test]
    fn test_address_requirements_per_method() {
        let mut address = ShippingAddress {
            recipient: "Jan Kowalski".to_string(),
            phone: "+48500100200".to_string(),
            street: None,
            city: None,
            postal_code: None,
            country: "PL".to_string(),
            locker_id: None,
        };
        assert!(address.missing_fields(ShippingMethod::Pickup).is_empty());
        assert_eq!(address.missing_fields(ShippingMethod::InpostLocker), vec!["locker_id"]);
        assert_eq!(
            address.missing_fields(ShippingMethod::DpdCourier),
            vec!["street", "city", "postal_code"]
        );

        address.locker_id = Some("KRA01M".to_string());
        assert!(address.missing_fields(ShippingMethod::InpostLocker).is_empty());
    }

    #[test]
    fn test_country_defaults_to_pl() {
        let address: ShippingAddress =
            serde_json::from_str(r#"{"recipient":"A","phone":"1","street":null,"city":null,"postal_code":null,"locker_id":"X"}"#)
                .unwrap();
        assert_eq!(address.country, "PL");
    }
}
