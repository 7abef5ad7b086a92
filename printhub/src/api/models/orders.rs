use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::{
    api::models::{
        pagination::Pagination,
        pricing::{default_infill, default_quantity},
    },
    db::models::orders::{OrderDBResponse, OrderPaymentStatus, OrderStatus, ShippingAddress, ShippingMethod},
    types::{FileId, MaterialId, OrderId, PrinterId, UserId},
};

/// New order. Required fields are checked by the handler so that missing values produce a 400
/// listing what is missing.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct OrderCreate {
    /// Defaults to the signed-in user's display name
    pub customer_name: Option<String>,
    /// Defaults to the signed-in user's email
    pub customer_email: Option<String>,
    pub customer_phone: Option<String>,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub material_id: Option<MaterialId>,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub printer_id: Option<PrinterId>,
    pub color: Option<String>,
    pub infill_percent: Option<i16>,
    pub quantity: Option<i32>,
    #[schema(value_type = Vec<String>)]
    pub file_ids: Vec<FileId>,
    /// Overrides the volume computed from the files
    pub volume_cm3: Option<Decimal>,
    pub shipping_method: Option<ShippingMethod>,
    pub shipping_address: Option<ShippingAddress>,
    pub notes: Option<String>,
}

impl OrderCreate {
    pub fn infill(&self) -> i16 {
        self.infill_percent.unwrap_or_else(default_infill)
    }

    pub fn quantity(&self) -> i32 {
        self.quantity.unwrap_or_else(default_quantity)
    }
}

/// Staff update of an order
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct OrderUpdate {
    pub status: Option<OrderStatus>,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub printer_id: Option<PrinterId>,
    pub tracking_number: Option<String>,
    pub admin_notes: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams, ToSchema)]
pub struct ListOrdersQuery {
    #[serde(flatten)]
    #[param(inline)]
    pub pagination: Pagination,

    pub status: Option<OrderStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: OrderId,
    /// Human-friendly sequential order number
    pub number: i64,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub user_id: Option<UserId>,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: Option<String>,
    #[schema(value_type = String, format = "uuid")]
    pub material_id: MaterialId,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub printer_id: Option<PrinterId>,
    pub color: Option<String>,
    pub infill_percent: i16,
    pub quantity: i32,
    #[schema(value_type = Vec<String>)]
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
    pub tracking_number: Option<String>,
    pub status: OrderStatus,
    pub payment_status: OrderPaymentStatus,
    pub notes: Option<String>,
    /// Only shown to staff
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<OrderDBResponse> for OrderResponse {
    fn from(db: OrderDBResponse) -> Self {
        Self {
            id: db.id,
            number: db.number,
            user_id: db.user_id,
            customer_name: db.customer_name,
            customer_email: db.customer_email,
            customer_phone: db.customer_phone,
            material_id: db.material_id,
            printer_id: db.printer_id,
            color: db.color,
            infill_percent: db.infill_percent,
            quantity: db.quantity,
            file_ids: db.file_ids,
            volume_cm3: db.volume_cm3,
            weight_g: db.weight_g,
            print_hours: db.print_hours,
            subtotal: db.subtotal,
            shipping_cost: db.shipping_cost,
            total: db.total,
            currency: db.currency,
            shipping_method: db.shipping_method,
            shipping_address: db.shipping_address.map(|json| json.0),
            tracking_number: db.tracking_number,
            status: db.status,
            payment_status: db.payment_status,
            notes: db.notes,
            admin_notes: db.admin_notes,
            created_at: db.created_at,
            updated_at: db.updated_at,
        }
    }
}

impl OrderResponse {
    /// Strip staff-only fields
    pub fn for_customer(mut self) -> Self {
        self.admin_notes = None;
        self
    }
}

/// A shipping method the customer can pick, with its current price
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ShippingOptionResponse {
    pub method: ShippingMethod,
    pub label: String,
    pub price: Decimal,
    pub requires_address: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ShippingOptionsResponse {
    pub currency: String,
    pub options: Vec<ShippingOptionResponse>,
    /// Orders at or above this subtotal ship for free
    pub free_shipping_threshold: Option<Decimal>,
}
