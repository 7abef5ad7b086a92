use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use rust_decimal::Decimal;
use tracing::info;

use crate::{
    AppState,
    api::{
        handlers::{is_valid_email, missing_fields, non_blank, not_found, uploads::ensure_can_read},
        models::{
            design_requests::{DesignRequestCreate, DesignRequestResponse, DesignRequestUpdate, ListDesignRequestsQuery},
            pagination::PaginatedResponse,
            users::CurrentUser,
        },
    },
    auth::{current_user::MaybeUser, permissions},
    db::{
        handlers::{DesignRequests, Files, Settings},
        models::design_requests::{
            DesignRequestCreateDBRequest, DesignRequestFilter, DesignRequestStatus, DesignRequestUpdateDBRequest,
        },
    },
    errors::Error,
    types::{DesignRequestId, Operation, Resource, abbrev_uuid},
};

/// Staff see internal notes, customers don't
fn present(user: &CurrentUser, request: DesignRequestResponse) -> DesignRequestResponse {
    if permissions::can_access_all(user, Resource::DesignRequests, Operation::ReadAll) {
        request
    } else {
        request.for_customer()
    }
}

/// Submit a custom design request
#[utoipa::path(
    post,
    path = "/design-requests",
    tag = "design-requests",
    request_body = DesignRequestCreate,
    responses(
        (status = 201, description = "Request received", body = DesignRequestResponse),
        (status = 400, description = "Missing or invalid fields"),
        (status = 404, description = "Attachment not found"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn create_design_request(
    State(state): State<AppState>,
    user: MaybeUser,
    Json(request): Json<DesignRequestCreate>,
) -> Result<(StatusCode, Json<DesignRequestResponse>), Error> {
    let name = non_blank(request.name.as_deref()).or_else(|| user.as_ref().and_then(|u| non_blank(u.display_name.as_deref())));
    let email = non_blank(request.email.as_deref()).or_else(|| user.as_ref().map(|u| u.email.clone()));
    let title = non_blank(request.title.as_deref());
    let description = non_blank(request.description.as_deref());

    let (Some(name), Some(email), Some(title), Some(description)) = (name.clone(), email.clone(), title.clone(), description.clone())
    else {
        let missing: Vec<&str> = [
            ("name", name.is_none()),
            ("email", email.is_none()),
            ("title", title.is_none()),
            ("description", description.is_none()),
        ]
        .into_iter()
        .filter_map(|(field, absent)| absent.then_some(field))
        .collect();
        return Err(missing_fields(&missing));
    };
    if !is_valid_email(&email) {
        return Err(Error::BadRequest {
            message: "Invalid email address".to_string(),
        });
    }
    if request.budget.is_some_and(|b| b < Decimal::ZERO) {
        return Err(Error::BadRequest {
            message: "Budget cannot be negative".to_string(),
        });
    }

    let mut attachment_ids = request.attachment_ids;
    attachment_ids.dedup();

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let files = Files::new(&mut conn).get_bulk(&attachment_ids).await?;
    for id in &attachment_ids {
        let file = files.get(id).ok_or_else(|| not_found("Upload", id))?;
        ensure_can_read(file, user.as_ref())?;
    }

    let created = DesignRequests::new(&mut conn)
        .create(&DesignRequestCreateDBRequest {
            user_id: user.as_ref().map(|u| u.id),
            name,
            email: email.trim().to_lowercase(),
            phone: non_blank(request.phone.as_deref()),
            title,
            description,
            budget: request.budget,
            deadline: request.deadline,
            attachment_ids,
        })
        .await?;
    let currency = Settings::new(&mut conn).get_shop().await?.currency;

    metrics::counter!("printhub_design_requests_total").increment(1);
    info!(design_request_id = %abbrev_uuid(&created.id), "Design request received");

    if let Err(e) = state.email.send_design_request_notification(&created, &currency).await {
        tracing::error!(design_request_id = %created.id, "Failed to send design request notification: {}", e);
    }

    Ok((StatusCode::CREATED, Json(DesignRequestResponse::from(created).for_customer())))
}

/// List design requests
#[utoipa::path(
    get,
    path = "/design-requests",
    tag = "design-requests",
    params(ListDesignRequestsQuery),
    responses(
        (status = 200, description = "Design requests, newest first", body = PaginatedResponse<DesignRequestResponse>),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_design_requests(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<ListDesignRequestsQuery>,
) -> Result<Json<PaginatedResponse<DesignRequestResponse>>, Error> {
    permissions::require(&user, Resource::DesignRequests, Operation::ReadOwn)?;
    let (skip, limit) = query.pagination.params();

    let filter = DesignRequestFilter {
        user_id: (!permissions::can_access_all(&user, Resource::DesignRequests, Operation::ReadAll)).then_some(user.id),
        status: query.status,
        skip,
        limit,
    };

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut repo = DesignRequests::new(&mut conn);
    let requests = repo.list(&filter).await?;
    let total = repo.count(&filter).await?;

    Ok(Json(PaginatedResponse::new(
        requests
            .into_iter()
            .map(|r| present(&user, DesignRequestResponse::from(r)))
            .collect(),
        total,
        skip,
        limit,
    )))
}

/// Get a design request
#[utoipa::path(
    get,
    path = "/design-requests/{id}",
    tag = "design-requests",
    params(("id" = String, Path, description = "Design request ID")),
    responses(
        (status = 200, description = "Design request", body = DesignRequestResponse),
        (status = 403, description = "Not your request"),
        (status = 404, description = "Design request not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn get_design_request(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<DesignRequestId>,
) -> Result<Json<DesignRequestResponse>, Error> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let request = DesignRequests::new(&mut conn)
        .get_by_id(id)
        .await?
        .ok_or_else(|| not_found("Design request", id))?;

    permissions::require_access(&user, Resource::DesignRequests, Operation::ReadOwn, request.user_id)?;

    Ok(Json(present(&user, DesignRequestResponse::from(request))))
}

/// Update a design request (staff)
///
/// Moving to `quoted` needs a quoted price, either in this request or already on record.
#[utoipa::path(
    patch,
    path = "/design-requests/{id}",
    tag = "design-requests",
    request_body = DesignRequestUpdate,
    params(("id" = String, Path, description = "Design request ID")),
    responses(
        (status = 200, description = "Design request updated", body = DesignRequestResponse),
        (status = 400, description = "Invalid transition or price"),
        (status = 403, description = "Staff only"),
        (status = 404, description = "Design request not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn update_design_request(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<DesignRequestId>,
    Json(request): Json<DesignRequestUpdate>,
) -> Result<Json<DesignRequestResponse>, Error> {
    permissions::require(&user, Resource::DesignRequests, Operation::UpdateAll)?;

    if request.quoted_price.is_some_and(|p| p < Decimal::ZERO) {
        return Err(Error::BadRequest {
            message: "Quoted price cannot be negative".to_string(),
        });
    }

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut repo = DesignRequests::new(&mut conn);
    let current = repo.get_by_id(id).await?.ok_or_else(|| not_found("Design request", id))?;

    if let Some(next) = request.status {
        if !current.status.can_transition_to(next) {
            return Err(Error::BadRequest {
                message: "Design request cannot move to the requested status".to_string(),
            });
        }
        if next == DesignRequestStatus::Quoted && request.quoted_price.or(current.quoted_price).is_none() {
            return Err(missing_fields(&["quoted_price"]));
        }
    }

    let updated = repo
        .update(
            id,
            &DesignRequestUpdateDBRequest {
                status: request.status,
                quoted_price: request.quoted_price,
                admin_notes: request.admin_notes,
            },
        )
        .await?;
    info!(design_request_id = %abbrev_uuid(&id), status = ?updated.status, "Design request updated");

    Ok(Json(DesignRequestResponse::from(updated)))
}
