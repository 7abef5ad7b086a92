use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use sqlx::PgConnection;
use tracing::{info, warn};

use crate::{
    AppState,
    api::{
        handlers::{is_valid_email, missing_fields, non_blank, not_found, pricing::resolve_geometry},
        models::{
            orders::{ListOrdersQuery, OrderCreate, OrderResponse, OrderUpdate, ShippingOptionResponse, ShippingOptionsResponse},
            pagination::PaginatedResponse,
            users::CurrentUser,
        },
    },
    auth::{current_user::MaybeUser, permissions},
    db::{
        handlers::{Credits, Materials, Orders, Payments, Printers, Repository, Settings},
        models::{
            credits::CreditTransactionCreateDBRequest,
            orders::{OrderCreateDBRequest, OrderDBResponse, OrderFilter, OrderPaymentStatus, OrderStatus, OrderUpdateDBRequest},
            payments::{PaymentMethod, PaymentStatus},
        },
    },
    errors::Error,
    pricing::{self, EstimateInput},
    types::{OrderId, Operation, Resource, abbrev_uuid},
};

/// Staff see everything; customers lose the internal notes
fn present(order: OrderDBResponse, user: Option<&CurrentUser>) -> OrderResponse {
    let response = OrderResponse::from(order);
    if user.is_some_and(|u| permissions::can_access_all(u, Resource::Orders, Operation::ReadAll)) {
        response
    } else {
        response.for_customer()
    }
}

/// Guest orders are reachable by anyone holding the id; account orders by the owner and staff.
fn ensure_can_read(order: &OrderDBResponse, user: Option<&CurrentUser>) -> Result<(), Error> {
    match (order.user_id, user) {
        (None, _) => Ok(()),
        (Some(owner), Some(user)) => permissions::require_access(user, Resource::Orders, Operation::ReadOwn, Some(owner)),
        (Some(_), None) => Err(Error::Unauthenticated { message: None }),
    }
}

/// Return the money of a paid order. Runs inside the caller's transaction, which holds the
/// order row lock.
async fn refund_order(conn: &mut PgConnection, state: &AppState, order: &OrderDBResponse) -> Result<bool, Error> {
    let Some(payment) = Payments::new(&mut *conn).completed_for_order(order.id).await? else {
        warn!(order_id = %abbrev_uuid(&order.id), "Paid order has no completed payment, nothing to refund");
        return Ok(false);
    };

    if payment.method == PaymentMethod::Credits {
        let user_id = payment.user_id.ok_or_else(|| Error::Internal {
            operation: format!("refund credits payment {} without a user", payment.id),
        })?;
        Credits::new(&mut *conn)
            .create_transaction(&CreditTransactionCreateDBRequest::order_refund(
                user_id,
                order.id,
                order.number,
                payment.amount,
            ))
            .await?;
    } else {
        let provider = state
            .payment_provider
            .as_ref()
            .filter(|p| p.name() == payment.provider)
            .ok_or_else(|| Error::ServiceUnavailable {
                message: format!("Payment provider '{}' is not configured, cannot refund", payment.provider),
            })?;
        let provider_order_id = payment.provider_order_id.as_deref().ok_or_else(|| Error::Internal {
            operation: format!("refund payment {} without a provider order id", payment.id),
        })?;
        provider
            .refund(provider_order_id, payment.amount, &format!("Refund for order #{}", order.number))
            .await?;
    }

    Payments::new(&mut *conn).set_status(payment.id, PaymentStatus::Refunded).await?;
    metrics::counter!("printhub_order_refunds_total", "method" => payment.method.as_str()).increment(1);
    info!(order_id = %abbrev_uuid(&order.id), amount = %payment.amount, "Refunded cancelled order");
    Ok(true)
}

/// Withdraw the provider payments still open for a cancelled order, best effort. A payment the
/// customer completes anyway is refunded when its notification arrives.
async fn cancel_open_payments(state: &AppState, order_id: OrderId) {
    let Some(provider) = &state.payment_provider else {
        return;
    };
    let payments = match state.db.acquire().await {
        Ok(mut conn) => Payments::new(&mut conn).list_for_order(order_id).await,
        Err(e) => Err(e.into()),
    };
    let payments = match payments {
        Ok(payments) => payments,
        Err(e) => {
            warn!(order_id = %abbrev_uuid(&order_id), "Could not load payments to cancel: {}", e);
            return;
        }
    };

    let open = payments.iter().filter(|p| {
        matches!(p.status, PaymentStatus::Pending | PaymentStatus::WaitingForConfirmation) && p.provider == provider.name()
    });
    for payment in open {
        let Some(provider_order_id) = payment.provider_order_id.as_deref() else {
            continue;
        };
        match provider.cancel(provider_order_id).await {
            Ok(()) => info!(provider_order_id, "Cancelled open payment of a cancelled order"),
            Err(e) => warn!(provider_order_id, "Failed to cancel open payment: {}", e),
        }
    }
}

/// Place an order
///
/// Prices the uploaded files in the chosen material, adds shipping and stores the order awaiting
/// payment. Guests may order; signed-in users' name and email default to their account.
#[utoipa::path(
    post,
    path = "/orders",
    tag = "orders",
    request_body = OrderCreate,
    responses(
        (status = 201, description = "Order created", body = OrderResponse),
        (status = 400, description = "Missing or invalid fields"),
        (status = 404, description = "Material, printer or upload not found"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn create_order(
    State(state): State<AppState>,
    user: MaybeUser,
    Json(request): Json<OrderCreate>,
) -> Result<(StatusCode, Json<OrderResponse>), Error> {
    let customer_name =
        non_blank(request.customer_name.as_deref()).or_else(|| user.as_ref().and_then(|u| non_blank(u.display_name.as_deref())));
    let customer_email = non_blank(request.customer_email.as_deref()).or_else(|| user.as_ref().map(|u| u.email.clone()));

    let mut missing = Vec::new();
    if customer_name.is_none() {
        missing.push("customer_name");
    }
    if customer_email.is_none() {
        missing.push("customer_email");
    }
    if request.material_id.is_none() {
        missing.push("material_id");
    }
    if request.file_ids.is_empty() {
        missing.push("file_ids");
    }
    if request.shipping_method.is_none() {
        missing.push("shipping_method");
    }
    if let Some(method) = request.shipping_method {
        match &request.shipping_address {
            None if method.requires_address() => missing.push("shipping_address"),
            Some(address) if method.requires_address() => missing.extend(address.missing_fields(method)),
            _ => {}
        }
    }

    let (Some(customer_name), Some(customer_email), Some(material_id), Some(shipping_method)) =
        (customer_name, customer_email, request.material_id, request.shipping_method)
    else {
        return Err(missing_fields(&missing));
    };
    if !missing.is_empty() {
        return Err(missing_fields(&missing));
    }
    if !is_valid_email(&customer_email) {
        return Err(Error::BadRequest {
            message: "Invalid email address".to_string(),
        });
    }

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let shop = Settings::new(&mut conn).get_shop().await?;
    if shop.shipping.option(shipping_method).is_none() {
        return Err(Error::BadRequest {
            message: "Selected shipping method is not available".to_string(),
        });
    }

    let material = Materials::new(&mut conn)
        .get_by_id(material_id)
        .await?
        .ok_or_else(|| not_found("Material", material_id))?;
    let color = non_blank(request.color.as_deref());
    if color
        .as_ref()
        .is_some_and(|c| !material.colors.is_empty() && !material.colors.iter().any(|m| m.eq_ignore_ascii_case(c)))
    {
        return Err(Error::BadRequest {
            message: format!("Color is not offered for {}", material.name),
        });
    }

    let mut file_ids = Vec::new();
    for id in &request.file_ids {
        if !file_ids.contains(id) {
            file_ids.push(*id);
        }
    }

    let infill_percent = request.infill();
    let geometry = resolve_geometry(&mut conn, &file_ids, request.volume_cm3, user.as_ref()).await?;
    let machine = pricing::machine_for(&mut conn, &material, request.printer_id, geometry.bbox_mm, &shop.pricing).await?;
    let estimate = pricing::estimate(
        &EstimateInput {
            volume_cm3: geometry.volume_cm3,
            infill_percent,
            quantity: request.quantity(),
        },
        &material,
        &machine,
        &shop.pricing,
    )?;

    let shipping_cost = shop
        .shipping
        .cost_for(shipping_method, estimate.subtotal)
        .ok_or_else(|| Error::BadRequest {
            message: "Selected shipping method is not available".to_string(),
        })?;

    let order = Orders::new(&mut conn)
        .create(&OrderCreateDBRequest {
            user_id: user.as_ref().map(|u| u.id),
            customer_name,
            customer_email: customer_email.trim().to_lowercase(),
            customer_phone: non_blank(request.customer_phone.as_deref()),
            material_id: material.id,
            printer_id: estimate.printer_id,
            color,
            infill_percent,
            quantity: estimate.quantity,
            file_ids,
            volume_cm3: estimate.volume_cm3,
            weight_g: estimate.weight_g,
            print_hours: estimate.print_hours,
            subtotal: estimate.subtotal,
            shipping_cost,
            total: estimate.subtotal + shipping_cost,
            currency: shop.currency.clone(),
            shipping_method,
            shipping_address: if shipping_method.requires_address() {
                request.shipping_address
            } else {
                None
            },
            notes: non_blank(request.notes.as_deref()),
        })
        .await?;

    metrics::counter!("printhub_orders_created_total", "shipping" => shipping_method.as_str()).increment(1);
    info!(order_id = %abbrev_uuid(&order.id), number = order.number, total = %order.total, "Order placed");

    if let Err(e) = state.email.send_order_confirmation(&order, &material.name).await {
        tracing::error!(order_id = %order.id, "Failed to send order confirmation: {}", e);
    }

    Ok((StatusCode::CREATED, Json(present(order, user.as_ref()))))
}

/// List orders
///
/// Customers see their own orders; order staff see every order.
#[utoipa::path(
    get,
    path = "/orders",
    tag = "orders",
    params(ListOrdersQuery),
    responses(
        (status = 200, description = "Orders, newest first", body = PaginatedResponse<OrderResponse>),
        (status = 401, description = "Not logged in"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_orders(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<ListOrdersQuery>,
) -> Result<Json<PaginatedResponse<OrderResponse>>, Error> {
    permissions::require(&user, Resource::Orders, Operation::ReadOwn)?;
    let (skip, limit) = query.pagination.params();

    let filter = OrderFilter {
        user_id: (!permissions::can_access_all(&user, Resource::Orders, Operation::ReadAll)).then_some(user.id),
        status: query.status,
        skip,
        limit,
    };

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut repo = Orders::new(&mut conn);
    let orders = repo.list(&filter).await?;
    let total = repo.count(&filter).await?;

    let data = orders.into_iter().map(|o| present(o, Some(&user))).collect();
    Ok(Json(PaginatedResponse::new(data, total, skip, limit)))
}

/// Get an order
#[utoipa::path(
    get,
    path = "/orders/{id}",
    tag = "orders",
    params(("id" = String, Path, description = "Order ID")),
    responses(
        (status = 200, description = "The order", body = OrderResponse),
        (status = 401, description = "The order belongs to an account"),
        (status = 403, description = "Not your order"),
        (status = 404, description = "Order not found"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn get_order(State(state): State<AppState>, user: MaybeUser, Path(id): Path<OrderId>) -> Result<Json<OrderResponse>, Error> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let order = Orders::new(&mut conn).get_by_id(id).await?.ok_or_else(|| not_found("Order", id))?;

    ensure_can_read(&order, user.as_ref())?;

    Ok(Json(present(order, user.as_ref())))
}

/// Update an order (staff)
///
/// Moves the order through its lifecycle and records the printer, tracking number and internal
/// notes. Cancelling a paid order refunds the payment.
#[utoipa::path(
    patch,
    path = "/orders/{id}",
    tag = "orders",
    request_body = OrderUpdate,
    params(("id" = String, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order updated", body = OrderResponse),
        (status = 400, description = "Transition not allowed"),
        (status = 403, description = "Staff only"),
        (status = 404, description = "Order not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn update_order(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<OrderId>,
    Json(request): Json<OrderUpdate>,
) -> Result<Json<OrderResponse>, Error> {
    permissions::require(&user, Resource::Orders, Operation::UpdateAll)?;

    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;
    let order = Orders::new(&mut tx).get_for_update(id).await?.ok_or_else(|| not_found("Order", id))?;

    if let Some(printer_id) = request.printer_id {
        Printers::new(&mut tx)
            .get_by_id(printer_id)
            .await?
            .ok_or_else(|| not_found("Printer", printer_id))?;
    }

    let mut payment_status = None;
    if let Some(next) = request.status {
        if !order.status.can_transition_to(next) {
            return Err(Error::BadRequest {
                message: format!("Cannot move order from {} to {}", order.status.as_str(), next.as_str()),
            });
        }
        match next {
            OrderStatus::Paid if order.payment_status != OrderPaymentStatus::Paid => {
                payment_status = Some(OrderPaymentStatus::Paid);
            }
            OrderStatus::Cancelled if order.payment_status == OrderPaymentStatus::Paid => {
                if refund_order(&mut tx, &state, &order).await? {
                    payment_status = Some(OrderPaymentStatus::Refunded);
                }
            }
            _ => {}
        }
    }

    let updated = Orders::new(&mut tx)
        .update(
            id,
            &OrderUpdateDBRequest {
                status: request.status,
                payment_status,
                printer_id: request.printer_id,
                tracking_number: non_blank(request.tracking_number.as_deref()),
                admin_notes: request.admin_notes,
            },
        )
        .await?;
    tx.commit().await.map_err(|e| Error::Database(e.into()))?;

    if let Some(next) = request.status {
        info!(order_id = %abbrev_uuid(&id), from = order.status.as_str(), to = next.as_str(), "Order status changed");
        if next == OrderStatus::Cancelled && order.status == OrderStatus::PendingPayment {
            cancel_open_payments(&state, id).await;
        }
    }

    Ok(Json(present(updated, Some(&user))))
}

/// Cancel your own order before it is paid
#[utoipa::path(
    post,
    path = "/orders/{id}/cancel",
    tag = "orders",
    params(("id" = String, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order cancelled", body = OrderResponse),
        (status = 403, description = "Not your order"),
        (status = 404, description = "Order not found"),
        (status = 409, description = "The order is no longer awaiting payment"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn cancel_order(State(state): State<AppState>, user: CurrentUser, Path(id): Path<OrderId>) -> Result<Json<OrderResponse>, Error> {
    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;
    let order = Orders::new(&mut tx).get_for_update(id).await?.ok_or_else(|| not_found("Order", id))?;

    permissions::require_access(&user, Resource::Orders, Operation::UpdateOwn, order.user_id)?;

    if order.status != OrderStatus::PendingPayment {
        return Err(Error::Conflict {
            message: "Only orders awaiting payment can be cancelled".to_string(),
        });
    }

    let updated = Orders::new(&mut tx)
        .update(
            id,
            &OrderUpdateDBRequest {
                status: Some(OrderStatus::Cancelled),
                ..Default::default()
            },
        )
        .await?;
    tx.commit().await.map_err(|e| Error::Database(e.into()))?;

    info!(order_id = %abbrev_uuid(&id), "Order cancelled by customer");
    cancel_open_payments(&state, id).await;
    Ok(Json(present(updated, Some(&user))))
}

/// Shipping methods currently offered
#[utoipa::path(
    get,
    path = "/shipping/options",
    tag = "orders",
    responses(
        (status = 200, description = "Enabled shipping methods", body = ShippingOptionsResponse),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn list_shipping_options(State(state): State<AppState>) -> Result<Json<ShippingOptionsResponse>, Error> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let shop = Settings::new(&mut conn).get_shop().await?;

    let options = shop
        .shipping
        .options
        .iter()
        .filter(|o| o.enabled)
        .map(|o| ShippingOptionResponse {
            method: o.method,
            label: o.label.clone(),
            price: o.price,
            requires_address: o.method.requires_address(),
        })
        .collect();

    Ok(Json(ShippingOptionsResponse {
        currency: shop.currency,
        options,
        free_shipping_threshold: shop.shipping.free_shipping_threshold,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::models::users::Role,
        db::models::credits::CreditTransactionType,
        db::models::payments::{PaymentCreateDBRequest, PaymentPurpose},
        test_utils::{
            bearer_for, create_payu_test_config, create_test_admin_user, create_test_app, create_test_material, create_test_order,
            create_test_server, create_test_state, create_test_upload, create_test_user,
        },
    };
    use uuid::Uuid;
    use rust_decimal::Decimal;
    use serde_json::{Value, json};
    use sqlx::PgPool;

    #[sqlx::test]
    #[test_log::test]
    async fn test_create_order_reports_missing_fields(pool: PgPool) {
        let (server, _) = create_test_app(pool.clone()).await;

        let response = server.post("/api/orders").json(&json!({})).await;
        response.assert_status(StatusCode::BAD_REQUEST);
        let body: Value = response.json();
        let message = body["message"].as_str().unwrap();
        for field in ["customer_name", "customer_email", "material_id", "file_ids", "shipping_method"] {
            assert!(message.contains(field), "{message} should mention {field}");
        }

        let material = create_test_material(&pool).await;
        let file = create_test_upload(&pool, None).await;
        let base = json!({
            "customer_name": "Jan Kowalski",
            "customer_email": "jan@example.com",
            "material_id": material.id,
            "file_ids": [file.id],
        });

        let mut locker_without_address = base.clone();
        locker_without_address["shipping_method"] = json!("inpost_locker");
        let response = server.post("/api/orders").json(&locker_without_address).await;
        response.assert_status(StatusCode::BAD_REQUEST);
        assert!(response.json::<Value>()["message"].as_str().unwrap().contains("shipping_address"));

        let mut courier_partial = base.clone();
        courier_partial["shipping_method"] = json!("dpd_courier");
        courier_partial["shipping_address"] = json!({ "recipient": "Jan Kowalski", "phone": "+48500100200", "city": "Kraków" });
        let response = server.post("/api/orders").json(&courier_partial).await;
        response.assert_status(StatusCode::BAD_REQUEST);
        let message = response.json::<Value>()["message"].as_str().unwrap().to_string();
        assert!(message.contains("street") && message.contains("postal_code"));

        let mut bad_email = base.clone();
        bad_email["shipping_method"] = json!("pickup");
        bad_email["customer_email"] = json!("jan.example.com");
        server
            .post("/api/orders")
            .json(&bad_email)
            .await
            .assert_status(StatusCode::BAD_REQUEST);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_guest_order_with_locker_shipping(pool: PgPool) {
        let (server, _) = create_test_app(pool.clone()).await;
        let material = create_test_material(&pool).await;
        let file = create_test_upload(&pool, None).await;

        let response = server
            .post("/api/orders")
            .json(&json!({
                "customer_name": "Anna Nowak",
                "customer_email": "Anna@Example.com",
                "material_id": material.id,
                "file_ids": [file.id, file.id],
                "color": "white",
                "shipping_method": "inpost_locker",
                "shipping_address": { "recipient": "Anna Nowak", "phone": "+48500100200", "locker_id": "KRA01M" }
            }))
            .await;

        response.assert_status(StatusCode::CREATED);
        let order: OrderResponse = response.json();
        assert_eq!(order.user_id, None);
        assert_eq!(order.customer_email, "anna@example.com");
        assert_eq!(order.file_ids, vec![file.id]);
        assert_eq!(order.status, OrderStatus::PendingPayment);
        assert_eq!(order.payment_status, OrderPaymentStatus::Unpaid);
        // Minimum order price plus the locker fee
        assert_eq!(order.subtotal, Decimal::new(2000, 2));
        assert_eq!(order.shipping_cost, Decimal::new(1399, 2));
        assert_eq!(order.total, Decimal::new(3399, 2));
        assert_eq!(order.shipping_address.unwrap().locker_id.as_deref(), Some("KRA01M"));

        server.get(&format!("/api/orders/{}", order.id)).await.assert_status_ok();
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_account_order_defaults_and_visibility(pool: PgPool) {
        let (server, state) = create_test_app(pool.clone()).await;
        let customer = create_test_user(&pool, Role::Customer).await;
        let other = create_test_user(&pool, Role::Customer).await;
        let staff = create_test_user(&pool, Role::OrderManager).await;
        let material = create_test_material(&pool).await;
        let file = create_test_upload(&pool, Some(customer.id)).await;

        let order: OrderResponse = server
            .post("/api/orders")
            .add_header("authorization", bearer_for(&state, &customer))
            .json(&json!({ "material_id": material.id, "file_ids": [file.id], "shipping_method": "pickup" }))
            .await
            .json();
        assert_eq!(order.user_id, Some(customer.id));
        assert_eq!(order.customer_name, "Test User");
        assert_eq!(order.customer_email, customer.email);
        assert_eq!(order.shipping_cost, Decimal::ZERO);

        let url = format!("/api/orders/{}", order.id);
        server.get(&url).await.assert_status(StatusCode::UNAUTHORIZED);
        server
            .get(&url)
            .add_header("authorization", bearer_for(&state, &other))
            .await
            .assert_status(StatusCode::FORBIDDEN);

        create_test_order(&pool, Some(other.id)).await;

        let own: Value = server
            .get("/api/orders")
            .add_header("authorization", bearer_for(&state, &customer))
            .await
            .json();
        assert_eq!(own["total_count"], 1);

        let all: Value = server
            .get("/api/orders?status=pending_payment")
            .add_header("authorization", bearer_for(&state, &staff))
            .await
            .json();
        assert_eq!(all["total_count"], 2);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_staff_transitions(pool: PgPool) {
        let (server, state) = create_test_app(pool.clone()).await;
        let customer = create_test_user(&pool, Role::Customer).await;
        let operator = create_test_user(&pool, Role::PrintOperator).await;
        let order = create_test_order(&pool, Some(customer.id)).await;
        let url = format!("/api/orders/{}", order.id);

        server
            .patch(&url)
            .add_header("authorization", bearer_for(&state, &customer))
            .json(&json!({ "status": "cancelled" }))
            .await
            .assert_status(StatusCode::FORBIDDEN);

        server
            .patch(&url)
            .add_header("authorization", bearer_for(&state, &operator))
            .json(&json!({ "status": "in_production" }))
            .await
            .assert_status(StatusCode::BAD_REQUEST);

        let paid: OrderResponse = server
            .patch(&url)
            .add_header("authorization", bearer_for(&state, &operator))
            .json(&json!({ "status": "paid", "admin_notes": "Paid in cash" }))
            .await
            .json();
        assert_eq!(paid.status, OrderStatus::Paid);
        assert_eq!(paid.payment_status, OrderPaymentStatus::Paid);
        assert_eq!(paid.admin_notes.as_deref(), Some("Paid in cash"));

        for next in ["in_production", "printed", "ready_for_pickup", "completed"] {
            server
                .patch(&url)
                .add_header("authorization", bearer_for(&state, &operator))
                .json(&json!({ "status": next }))
                .await
                .assert_status_ok();
        }

        // Customers never see internal notes
        let seen: Value = server
            .get(&url)
            .add_header("authorization", bearer_for(&state, &customer))
            .await
            .json();
        assert_eq!(seen["status"], "completed");
        assert!(seen.get("admin_notes").is_none());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_cancelling_credit_paid_order_refunds_balance(pool: PgPool) {
        let (server, state) = create_test_app(pool.clone()).await;
        let customer = create_test_user(&pool, Role::Customer).await;
        let admin = create_test_admin_user(&pool).await;
        let order = create_test_order(&pool, Some(customer.id)).await;

        let mut conn = pool.acquire().await.unwrap();
        Credits::new(&mut conn)
            .create_transaction(&CreditTransactionCreateDBRequest::admin_adjustment(
                customer.id,
                admin.id,
                CreditTransactionType::AdminGrant,
                Decimal::new(10000, 2),
                None,
            ))
            .await
            .unwrap();

        server
            .post(&format!("/api/orders/{}/payments", order.id))
            .add_header("authorization", bearer_for(&state, &customer))
            .json(&json!({ "method": "credits" }))
            .await
            .assert_status(StatusCode::CREATED);
        assert_eq!(Credits::new(&mut conn).get_balance(customer.id).await.unwrap(), Decimal::new(5701, 2));

        let cancelled: OrderResponse = server
            .patch(&format!("/api/orders/{}", order.id))
            .add_header("authorization", bearer_for(&state, &admin))
            .json(&json!({ "status": "cancelled" }))
            .await
            .json();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(cancelled.payment_status, OrderPaymentStatus::Refunded);
        assert_eq!(Credits::new(&mut conn).get_balance(customer.id).await.unwrap(), Decimal::new(10000, 2));

        let payments = Payments::new(&mut conn).list_for_order(order.id).await.unwrap();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].status, PaymentStatus::Refunded);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_owner_cancel_only_while_awaiting_payment(pool: PgPool) {
        let (server, state) = create_test_app(pool.clone()).await;
        let customer = create_test_user(&pool, Role::Customer).await;
        let other = create_test_user(&pool, Role::Customer).await;
        let order = create_test_order(&pool, Some(customer.id)).await;
        let url = format!("/api/orders/{}/cancel", order.id);

        server
            .post(&url)
            .add_header("authorization", bearer_for(&state, &other))
            .await
            .assert_status(StatusCode::FORBIDDEN);

        let cancelled: OrderResponse = server
            .post(&url)
            .add_header("authorization", bearer_for(&state, &customer))
            .await
            .json();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);

        server
            .post(&url)
            .add_header("authorization", bearer_for(&state, &customer))
            .await
            .assert_status(StatusCode::CONFLICT);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_cancel_withdraws_open_provider_payment(pool: PgPool) {
        use crate::payment_providers::payu::{OAUTH_PATH, ORDERS_PATH};
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let payu = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(OAUTH_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "token-123",
                "token_type": "bearer",
                "expires_in": 43199,
                "grant_type": "client_credentials"
            })))
            .mount(&payu)
            .await;
        Mock::given(method("DELETE"))
            .and(path(format!("{ORDERS_PATH}/PAYU-OPEN")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "orderId": "PAYU-OPEN",
                "status": {"statusCode": "SUCCESS"}
            })))
            .expect(1)
            .mount(&payu)
            .await;

        let state = create_test_state(pool.clone(), create_payu_test_config(&payu.uri()));
        let server = create_test_server(state.clone());
        let customer = create_test_user(&pool, Role::Customer).await;
        let order = create_test_order(&pool, Some(customer.id)).await;

        let mut conn = pool.acquire().await.unwrap();
        let payment = Payments::new(&mut conn)
            .create(&PaymentCreateDBRequest {
                id: Uuid::new_v4(),
                user_id: Some(customer.id),
                order_id: Some(order.id),
                purpose: PaymentPurpose::Order,
                method: PaymentMethod::Card,
                provider: "payu".to_string(),
                amount: order.total,
                currency: "PLN".to_string(),
                status: PaymentStatus::Pending,
            })
            .await
            .unwrap();
        Payments::new(&mut conn)
            .attach_provider_order(payment.id, "PAYU-OPEN", None)
            .await
            .unwrap();
        drop(conn);

        let cancelled: OrderResponse = server
            .post(&format!("/api/orders/{}/cancel", order.id))
            .add_header("authorization", bearer_for(&state, &customer))
            .await
            .json();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);

        // The provider settles the cancellation with its own notification
        let mut conn = pool.acquire().await.unwrap();
        let payment = Payments::new(&mut conn).get_by_id(payment.id).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_shipping_options(pool: PgPool) {
        let (server, _) = create_test_app(pool).await;

        let body: ShippingOptionsResponse = server.get("/api/shipping/options").await.json();
        assert_eq!(body.currency, "PLN");
        assert_eq!(body.options.len(), 3);
        let pickup = body.options.iter().find(|o| !o.requires_address).unwrap();
        assert_eq!(pickup.price, Decimal::ZERO);
        assert_eq!(body.free_shipping_threshold, Some(Decimal::new(300, 0)));
    }
}
