use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::db::models::{orders::OrderStatus, printers::PrinterStatus};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderStatusCount {
    pub status: OrderStatus,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PrinterStatusCount {
    pub status: PrinterStatus,
    pub count: i64,
}

/// Shop overview for the admin landing page
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DashboardResponse {
    pub currency: String,
    pub orders_by_status: Vec<OrderStatusCount>,
    /// Paid order totals, all time
    pub revenue_total: Decimal,
    pub revenue_last_30_days: Decimal,
    pub pending_design_requests: i64,
    /// Active appointments in the next seven days
    pub upcoming_appointments: i64,
    pub printers_by_status: Vec<PrinterStatusCount>,
    pub user_count: i64,
}
