use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    AppState,
    api::{
        handlers::not_found,
        models::payments::{NotificationAck, PayOrderRequest, PaymentResponse},
    },
    auth::{current_user::MaybeUser, permissions},
    db::{
        handlers::{Credits, Orders, Payments},
        models::{
            credits::CreditTransactionCreateDBRequest,
            orders::{OrderDBResponse, OrderPaymentStatus, OrderStatus},
            payments::{PaymentCreateDBRequest, PaymentDBResponse, PaymentMethod, PaymentPurpose, PaymentStatus},
        },
    },
    errors::Error,
    payment_providers::{Buyer, LineItem, PaymentProvider, PaymentRequest, settlement},
    types::{OrderId, Operation, PaymentId, Permission, Resource, abbrev_uuid},
};

/// Provider name recorded for payments taken from the credit balance
pub(crate) const CREDITS_PROVIDER: &str = "credits";

/// Reject malformed BLIK codes before anything is stored. Codes only make sense for BLIK.
pub(crate) fn validate_blik_code(method: PaymentMethod, code: Option<&str>) -> Result<Option<String>, Error> {
    let Some(code) = code.map(str::trim).filter(|c| !c.is_empty()) else {
        return Ok(None);
    };
    if method != PaymentMethod::Blik {
        return Err(Error::BadRequest {
            message: "blik_code is only accepted for BLIK payments".to_string(),
        });
    }
    if code.len() != 6 || !code.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::BadRequest {
            message: "BLIK code must be exactly 6 digits".to_string(),
        });
    }
    Ok(Some(code.to_string()))
}

pub(crate) fn configured_provider(state: &AppState) -> Result<&dyn PaymentProvider, Error> {
    state.payment_provider.as_deref().ok_or_else(|| Error::ServiceUnavailable {
        message: "Online payments are not available".to_string(),
    })
}

/// First hop of `X-Forwarded-For`, then `X-Real-IP`
pub(crate) fn customer_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

/// Split "Jan Kowalski" into first and last name for the provider's buyer block
pub(crate) fn split_name(full_name: Option<&str>) -> (Option<String>, Option<String>) {
    let Some(name) = full_name.map(str::trim).filter(|n| !n.is_empty()) else {
        return (None, None);
    };
    match name.split_once(char::is_whitespace) {
        Some((first, last)) => (Some(first.to_string()), Some(last.trim().to_string())),
        None => (Some(name.to_string()), None),
    }
}

/// What the provider shows on its payment page
pub(crate) struct Checkout {
    pub description: String,
    pub buyer: Buyer,
    pub items: Vec<LineItem>,
    pub continue_url: String,
}

/// Open a payment at the provider for a row that is about to be created.
///
/// The row is stored first so that its id can travel as the provider's external order id.
/// A provider that reports the payment settled straight away is settled here.
pub(crate) async fn open_provider_payment(
    state: &AppState,
    headers: &HeaderMap,
    create: PaymentCreateDBRequest,
    blik_code: Option<String>,
    checkout: Checkout,
) -> Result<PaymentDBResponse, Error> {
    let provider = configured_provider(state)?;

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let payment = Payments::new(&mut conn).create(&create).await?;
    drop(conn);

    let request = PaymentRequest {
        payment_id: payment.id,
        amount: payment.amount,
        currency: payment.currency.clone(),
        description: checkout.description,
        method: payment.method,
        blik_code,
        customer_ip: customer_ip(headers),
        buyer: checkout.buyer,
        items: checkout.items,
        continue_url: checkout.continue_url,
        notify_url: state.config.payment_notify_url(),
    };

    let opened = match provider.create_payment(&request).await {
        Ok(opened) => opened,
        Err(e) => {
            if let Err(settle_err) = settlement::apply_status(&state.db, payment.id, PaymentStatus::Failed).await {
                warn!(payment_id = %abbrev_uuid(&payment.id), "Failed to mark payment as failed: {}", settle_err);
            }
            return Err(e.into());
        }
    };

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let payment = Payments::new(&mut conn)
        .attach_provider_order(payment.id, &opened.provider_order_id, opened.redirect_url.as_deref())
        .await?;
    drop(conn);

    metrics::counter!("printhub_payments_opened_total", "provider" => provider.name(), "method" => payment.method.as_str())
        .increment(1);
    info!(
        payment_id = %abbrev_uuid(&payment.id),
        provider_order_id = %opened.provider_order_id,
        "Opened payment at provider"
    );

    let status = PaymentStatus::from(opened.status);
    if status == payment.status {
        return Ok(payment);
    }
    Ok(settlement::settle(state, payment.id, status).await?.payment)
}

/// Order payments are accepted only while the order waits for money
fn ensure_awaiting_payment(order: &OrderDBResponse) -> Result<(), Error> {
    if order.status != OrderStatus::PendingPayment || order.payment_status == OrderPaymentStatus::Paid {
        return Err(Error::Conflict {
            message: "Order is not awaiting payment".to_string(),
        });
    }
    Ok(())
}

/// Pay the full order total from the credit balance, in one transaction.
async fn pay_with_credits(state: &AppState, user: MaybeUser, order_id: OrderId) -> Result<PaymentDBResponse, Error> {
    let user = user.ok_or_else(|| Error::Unauthenticated {
        message: Some("Log in to pay with credits".to_string()),
    })?;

    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;
    let order = Orders::new(&mut tx)
        .get_for_update(order_id)
        .await?
        .ok_or_else(|| not_found("Order", order_id))?;

    // Only the account that placed the order can spend its balance on it
    if order.user_id != Some(user.id) {
        return Err(Error::InsufficientPermissions {
            required: Permission::Allow(Resource::Payments, Operation::CreateOwn),
            action: Operation::CreateOwn,
            resource: "payments for this order".to_string(),
        });
    }
    ensure_awaiting_payment(&order)?;

    Credits::new(&mut tx)
        .create_transaction(&CreditTransactionCreateDBRequest::order_payment(
            user.id,
            order.id,
            order.number,
            order.total,
        ))
        .await?;

    let payment = Payments::new(&mut tx)
        .create(&PaymentCreateDBRequest {
            id: Uuid::new_v4(),
            user_id: Some(user.id),
            order_id: Some(order.id),
            purpose: PaymentPurpose::Order,
            method: PaymentMethod::Credits,
            provider: CREDITS_PROVIDER.to_string(),
            amount: order.total,
            currency: order.currency.clone(),
            status: PaymentStatus::Completed,
        })
        .await?;

    if !Orders::new(&mut tx).mark_paid(order.id).await? {
        return Err(Error::Conflict {
            message: "Order is not awaiting payment".to_string(),
        });
    }
    tx.commit().await.map_err(|e| Error::Database(e.into()))?;

    metrics::counter!("printhub_payments_settled_total", "status" => "completed", "purpose" => "order").increment(1);
    info!(order_id = %abbrev_uuid(&order.id), amount = %order.total, "Order paid with credits");

    if let Err(e) = state
        .email
        .send_payment_received(
            &order.customer_email,
            Some(&order.customer_name),
            payment.amount,
            &payment.currency,
            &format!("order #{}", order.number),
            Some(&format!("/orders/{}", order.id)),
        )
        .await
    {
        warn!("Failed to send payment confirmation email: {}", e);
    }

    Ok(payment)
}

/// Pay for an order
///
/// BLIK and card payments are opened at the payment provider; follow `redirect_url` when it is
/// present. Credits payments settle immediately from the account balance.
#[utoipa::path(
    post,
    path = "/orders/{id}/payments",
    tag = "payments",
    request_body = PayOrderRequest,
    params(("id" = String, Path, description = "Order ID")),
    responses(
        (status = 201, description = "Payment opened or completed", body = PaymentResponse),
        (status = 400, description = "Invalid BLIK code"),
        (status = 402, description = "Not enough credits"),
        (status = 404, description = "Order not found"),
        (status = 409, description = "Order is not awaiting payment"),
        (status = 503, description = "No payment provider configured"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn pay_order(
    State(state): State<AppState>,
    user: MaybeUser,
    Path(order_id): Path<OrderId>,
    headers: HeaderMap,
    Json(request): Json<PayOrderRequest>,
) -> Result<(StatusCode, Json<PaymentResponse>), Error> {
    let blik_code = validate_blik_code(request.method, request.blik_code.as_deref())?;

    if request.method == PaymentMethod::Credits {
        let payment = pay_with_credits(&state, user, order_id).await?;
        return Ok((StatusCode::CREATED, Json(PaymentResponse::from(payment))));
    }

    let provider = configured_provider(&state)?;

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let order = Orders::new(&mut conn)
        .get_by_id(order_id)
        .await?
        .ok_or_else(|| not_found("Order", order_id))?;
    if let (Some(owner), Some(user)) = (order.user_id, user.as_ref()) {
        permissions::require_access(user, Resource::Payments, Operation::CreateOwn, Some(owner))?;
    } else if order.user_id.is_some() {
        return Err(Error::Unauthenticated { message: None });
    }
    ensure_awaiting_payment(&order)?;
    Orders::new(&mut conn).set_payment_status(order.id, OrderPaymentStatus::Pending).await?;
    drop(conn);

    let (first_name, last_name) = split_name(Some(&order.customer_name));
    let mut items = vec![LineItem {
        name: format!("3D print, {} pcs", order.quantity),
        unit_price: order.subtotal,
        quantity: 1,
    }];
    if order.shipping_cost > Decimal::ZERO {
        items.push(LineItem {
            name: "Shipping".to_string(),
            unit_price: order.shipping_cost,
            quantity: 1,
        });
    }

    let payment = open_provider_payment(
        &state,
        &headers,
        PaymentCreateDBRequest {
            id: Uuid::new_v4(),
            user_id: order.user_id,
            order_id: Some(order.id),
            purpose: PaymentPurpose::Order,
            method: request.method,
            provider: provider.name().to_string(),
            amount: order.total,
            currency: order.currency.clone(),
            status: PaymentStatus::Pending,
        },
        blik_code,
        Checkout {
            description: format!("PrintHub order #{}", order.number),
            buyer: Buyer {
                email: order.customer_email.clone(),
                first_name,
                last_name,
                phone: order.customer_phone.clone(),
            },
            items,
            continue_url: format!("{}/orders/{}", state.config.public_url.trim_end_matches('/'), order.id),
        },
    )
    .await?;

    Ok((StatusCode::CREATED, Json(PaymentResponse::from(payment))))
}

/// Get a payment
///
/// Open payments are refreshed from the provider before answering, so polling this endpoint
/// after the redirect back from the payment page shows the outcome.
#[utoipa::path(
    get,
    path = "/payments/{id}",
    tag = "payments",
    params(("id" = String, Path, description = "Payment ID")),
    responses(
        (status = 200, description = "The payment", body = PaymentResponse),
        (status = 404, description = "Payment not found"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn get_payment(State(state): State<AppState>, user: MaybeUser, Path(id): Path<PaymentId>) -> Result<Json<PaymentResponse>, Error> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let payment = Payments::new(&mut conn).get_by_id(id).await?.ok_or_else(|| not_found("Payment", id))?;
    drop(conn);

    match (payment.user_id, user.as_ref()) {
        (None, _) => {}
        (Some(owner), Some(user)) => permissions::require_access(user, Resource::Payments, Operation::ReadOwn, Some(owner))?,
        (Some(_), None) => return Err(Error::Unauthenticated { message: None }),
    }

    if !payment.status.is_open() {
        return Ok(Json(PaymentResponse::from(payment)));
    }
    let (Some(provider), Some(provider_order_id)) = (
        state.payment_provider.as_ref().filter(|p| p.name() == payment.provider),
        payment.provider_order_id.as_deref(),
    ) else {
        return Ok(Json(PaymentResponse::from(payment)));
    };

    let status = match provider.get_payment_status(provider_order_id).await {
        Ok(status) => PaymentStatus::from(status),
        Err(e) => {
            warn!(payment_id = %abbrev_uuid(&payment.id), "Could not refresh payment from provider: {}", e);
            return Ok(Json(PaymentResponse::from(payment)));
        }
    };
    if status == payment.status {
        return Ok(Json(PaymentResponse::from(payment)));
    }

    let outcome = settlement::settle(&state, payment.id, status).await?;
    Ok(Json(PaymentResponse::from(outcome.payment)))
}

/// Payment provider notification
///
/// Called by the payment provider whenever a payment changes state. The signature is checked
/// before anything else; notifications for unknown payments are acknowledged and ignored.
#[utoipa::path(
    post,
    path = "/payments/notify",
    tag = "payments",
    request_body(content = String, description = "Provider notification as sent"),
    responses(
        (status = 200, description = "Notification processed", body = NotificationAck),
        (status = 400, description = "Invalid signature or payload"),
        (status = 503, description = "No payment provider configured"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn payment_notification(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<NotificationAck>, Error> {
    let provider = configured_provider(&state)?;

    let Some(event) = provider.validate_webhook(&headers, &body)? else {
        debug!("Notification carried nothing to act on");
        return Ok(Json(NotificationAck::ok()));
    };

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut repo = Payments::new(&mut conn);
    let mut payment = repo.find_by_provider_order(provider.name(), &event.provider_order_id).await?;
    if payment.is_none() {
        if let Some(ext_id) = event.ext_order_id.as_deref().and_then(|id| Uuid::parse_str(id).ok()) {
            payment = repo.get_by_id(ext_id).await?;
        }
    }
    drop(conn);

    let Some(payment) = payment else {
        warn!(provider_order_id = %event.provider_order_id, "Notification for unknown payment");
        return Ok(Json(NotificationAck::ok()));
    };

    let outcome = settlement::settle(&state, payment.id, PaymentStatus::from(event.status)).await?;
    debug!(
        payment_id = %abbrev_uuid(&payment.id),
        transitioned = outcome.transitioned,
        "Processed payment notification"
    );

    Ok(Json(NotificationAck::ok()))
}
