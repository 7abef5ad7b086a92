use axum::{Json, extract::State};

use crate::{
    AppState,
    api::models::{
        dashboard::{DashboardResponse, OrderStatusCount, PrinterStatusCount},
        users::CurrentUser,
    },
    auth::permissions,
    db::handlers::{Appointments, DesignRequests, Orders, Printers, Settings, Users, users::UserFilter},
    errors::Error,
    types::{Operation, Resource},
};

const REVENUE_WINDOW_DAYS: i32 = 30;
const UPCOMING_APPOINTMENT_DAYS: i32 = 7;

/// Shop overview
#[utoipa::path(
    get,
    path = "/admin/dashboard",
    tag = "admin",
    responses(
        (status = 200, description = "Order, revenue, booking and fleet summary", body = DashboardResponse),
        (status = 403, description = "Staff only"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn get_dashboard(State(state): State<AppState>, user: CurrentUser) -> Result<Json<DashboardResponse>, Error> {
    permissions::require(&user, Resource::Dashboard, Operation::ReadAll)?;

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;

    let currency = Settings::new(&mut conn).get_shop().await?.currency;

    let mut orders = Orders::new(&mut conn);
    let orders_by_status = orders
        .status_counts()
        .await?
        .into_iter()
        .map(|(status, count)| OrderStatusCount { status, count })
        .collect();
    let revenue_total = orders.revenue(None).await?;
    let revenue_last_30_days = orders.revenue(Some(REVENUE_WINDOW_DAYS)).await?;

    let pending_design_requests = DesignRequests::new(&mut conn).count_pending().await?;
    let upcoming_appointments = Appointments::new(&mut conn).count_upcoming(UPCOMING_APPOINTMENT_DAYS).await?;
    let printers_by_status = Printers::new(&mut conn)
        .status_counts()
        .await?
        .into_iter()
        .map(|(status, count)| PrinterStatusCount { status, count })
        .collect();
    let user_count = Users::new(&mut conn).count(&UserFilter::new(0, 1)).await?;

    Ok(Json(DashboardResponse {
        currency,
        orders_by_status,
        revenue_total,
        revenue_last_30_days,
        pending_design_requests,
        upcoming_appointments,
        printers_by_status,
        user_count,
    }))
}
