use axum::{
    Json,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
};
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

use crate::{
    AppState,
    api::{
        handlers::{
            non_blank, not_found,
            payments::{Checkout, configured_provider, open_provider_payment, split_name, validate_blik_code},
        },
        models::{
            credits::{BalanceResponse, CreditAdjustmentRequest, CreditTransactionResponse, ListTransactionsQuery},
            pagination::PaginatedResponse,
            payments::{PaymentResponse, TopUpRequest},
            users::CurrentUser,
        },
    },
    auth::permissions,
    db::{
        handlers::{Credits, Repository, Settings, Users, credits::CreditTransactionFilter},
        models::{
            credits::{CreditTransactionCreateDBRequest, CreditTransactionType},
            payments::{PaymentCreateDBRequest, PaymentMethod, PaymentPurpose, PaymentStatus},
        },
    },
    errors::Error,
    payment_providers::{Buyer, LineItem},
    types::{Operation, Resource, abbrev_uuid},
};

/// Amounts are whole grosze and positive
fn validate_amount(amount: Decimal) -> Result<(), Error> {
    if amount <= Decimal::ZERO {
        return Err(Error::BadRequest {
            message: "Amount must be positive".to_string(),
        });
    }
    if amount.normalize().scale() > 2 {
        return Err(Error::BadRequest {
            message: "Amount can have at most two decimal places".to_string(),
        });
    }
    Ok(())
}

/// Get your credit balance
#[utoipa::path(
    get,
    path = "/credits/balance",
    tag = "credits",
    responses(
        (status = 200, description = "Current balance", body = BalanceResponse),
        (status = 401, description = "Not logged in"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn get_balance(State(state): State<AppState>, user: CurrentUser) -> Result<Json<BalanceResponse>, Error> {
    permissions::require(&user, Resource::Credits, Operation::ReadOwn)?;

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let balance = Credits::new(&mut conn).get_balance(user.id).await?;
    let shop = Settings::new(&mut conn).get_shop().await?;

    Ok(Json(BalanceResponse {
        user_id: user.id,
        balance,
        currency: shop.currency,
    }))
}

/// List credit transactions
///
/// Customers see their own ledger. Billing staff see every user's, optionally filtered by
/// `user_id`.
#[utoipa::path(
    get,
    path = "/credits/transactions",
    tag = "credits",
    params(ListTransactionsQuery),
    responses(
        (status = 200, description = "Transactions, newest first", body = PaginatedResponse<CreditTransactionResponse>),
        (status = 403, description = "Asked for another user's ledger"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_transactions(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<ListTransactionsQuery>,
) -> Result<Json<PaginatedResponse<CreditTransactionResponse>>, Error> {
    let user_id = if permissions::can_access_all(&user, Resource::Credits, Operation::ReadAll) {
        query.user_id
    } else {
        permissions::require_access(&user, Resource::Credits, Operation::ReadOwn, Some(query.user_id.unwrap_or(user.id)))?;
        Some(user.id)
    };
    let (skip, limit) = query.pagination.params();
    let filter = CreditTransactionFilter::new(user_id, skip, limit);

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut repo = Credits::new(&mut conn);
    let transactions = repo.list_transactions(&filter).await?;
    let total = repo.count_transactions(&filter).await?;

    Ok(Json(PaginatedResponse::new(
        transactions.into_iter().map(CreditTransactionResponse::from).collect(),
        total,
        skip,
        limit,
    )))
}

/// Buy credits
///
/// Opens a payment at the provider. The balance grows once the payment completes.
#[utoipa::path(
    post,
    path = "/credits/top-ups",
    tag = "credits",
    request_body = TopUpRequest,
    responses(
        (status = 201, description = "Top-up payment opened", body = PaymentResponse),
        (status = 400, description = "Amount outside the allowed range or invalid method"),
        (status = 503, description = "No payment provider configured"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn create_top_up(
    State(state): State<AppState>,
    user: CurrentUser,
    headers: HeaderMap,
    Json(request): Json<TopUpRequest>,
) -> Result<(StatusCode, Json<PaymentResponse>), Error> {
    permissions::require(&user, Resource::Credits, Operation::CreateOwn)?;

    if request.method == PaymentMethod::Credits {
        return Err(Error::BadRequest {
            message: "Credits cannot be bought with credits".to_string(),
        });
    }
    validate_amount(request.amount)?;
    let limits = &state.config.credits;
    if request.amount < limits.min_top_up || request.amount > limits.max_top_up {
        return Err(Error::BadRequest {
            message: format!("Top-up amount must be between {} and {}", limits.min_top_up, limits.max_top_up),
        });
    }
    let blik_code = validate_blik_code(request.method, request.blik_code.as_deref())?;
    let provider = configured_provider(&state)?;

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let currency = Settings::new(&mut conn).get_shop().await?.currency;
    drop(conn);

    let (first_name, last_name) = split_name(user.display_name.as_deref());
    let payment = open_provider_payment(
        &state,
        &headers,
        PaymentCreateDBRequest {
            id: Uuid::new_v4(),
            user_id: Some(user.id),
            order_id: None,
            purpose: PaymentPurpose::Credits,
            method: request.method,
            provider: provider.name().to_string(),
            amount: request.amount,
            currency,
            status: PaymentStatus::Pending,
        },
        blik_code,
        Checkout {
            description: "PrintHub credits top-up".to_string(),
            buyer: Buyer {
                email: user.email.clone(),
                first_name,
                last_name,
                phone: None,
            },
            items: vec![LineItem {
                name: "Credits".to_string(),
                unit_price: request.amount,
                quantity: 1,
            }],
            continue_url: format!("{}/credits", state.config.public_url.trim_end_matches('/')),
        },
    )
    .await?;

    Ok((StatusCode::CREATED, Json(PaymentResponse::from(payment))))
}

/// Grant or remove credits (billing staff)
#[utoipa::path(
    post,
    path = "/admin/credits/adjustments",
    tag = "credits",
    request_body = CreditAdjustmentRequest,
    responses(
        (status = 201, description = "Adjustment recorded", body = CreditTransactionResponse),
        (status = 402, description = "Removal larger than the balance"),
        (status = 403, description = "Billing staff only"),
        (status = 404, description = "User not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn create_adjustment(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<CreditAdjustmentRequest>,
) -> Result<(StatusCode, Json<CreditTransactionResponse>), Error> {
    permissions::require(&user, Resource::Credits, Operation::CreateAll)?;
    validate_amount(request.amount)?;

    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;
    Users::new(&mut tx)
        .get_by_id(request.user_id)
        .await?
        .ok_or_else(|| not_found("User", request.user_id))?;

    let transaction_type = CreditTransactionType::from(request.kind);
    let transaction = Credits::new(&mut tx)
        .create_transaction(&CreditTransactionCreateDBRequest::admin_adjustment(
            request.user_id,
            user.id,
            transaction_type,
            request.amount,
            non_blank(request.description.as_deref()),
        ))
        .await?;
    tx.commit().await.map_err(|e| Error::Database(e.into()))?;

    info!(
        user_id = %abbrev_uuid(&request.user_id),
        grantor = %abbrev_uuid(&user.id),
        kind = ?transaction_type,
        amount = %request.amount,
        "Credit adjustment recorded"
    );

    Ok((StatusCode::CREATED, Json(CreditTransactionResponse::from(transaction))))
}
