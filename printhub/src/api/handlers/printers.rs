use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use tracing::info;

use crate::{
    AppState,
    api::{
        handlers::not_found,
        models::{
            pagination::PaginatedResponse,
            printers::{ListPrintersQuery, PrinterCreate, PrinterResponse, PrinterUpdate},
            users::CurrentUser,
        },
    },
    auth::permissions,
    db::{
        errors::DbError,
        handlers::{Printers, Repository},
        models::printers::PrinterFilter,
    },
    errors::Error,
    types::{Operation, PrinterId, Resource, abbrev_uuid},
};

#[utoipa::path(
    get,
    path = "/admin/printers",
    tag = "admin",
    params(ListPrintersQuery),
    responses(
        (status = 200, description = "Printers", body = PaginatedResponse<PrinterResponse>),
        (status = 403, description = "Staff only"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_printers(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<ListPrintersQuery>,
) -> Result<Json<PaginatedResponse<PrinterResponse>>, Error> {
    permissions::require(&user, Resource::Printers, Operation::ReadAll)?;
    let (skip, limit) = query.pagination.params();
    let filter = PrinterFilter {
        status: query.status,
        skip,
        limit,
    };

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut repo = Printers::new(&mut conn);
    let printers = repo.list(&filter).await?;
    let total = repo.count(&filter).await?;

    Ok(Json(PaginatedResponse::new(
        printers.into_iter().map(PrinterResponse::from).collect(),
        total,
        skip,
        limit,
    )))
}

#[utoipa::path(
    get,
    path = "/admin/printers/{id}",
    tag = "admin",
    params(("id" = String, Path, description = "Printer ID")),
    responses(
        (status = 200, description = "Printer", body = PrinterResponse),
        (status = 404, description = "Printer not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn get_printer(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<PrinterId>,
) -> Result<Json<PrinterResponse>, Error> {
    permissions::require(&user, Resource::Printers, Operation::ReadAll)?;

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let printer = Printers::new(&mut conn).get_by_id(id).await?.ok_or_else(|| not_found("Printer", id))?;
    Ok(Json(PrinterResponse::from(printer)))
}

#[utoipa::path(
    post,
    path = "/admin/printers",
    tag = "admin",
    request_body = PrinterCreate,
    responses(
        (status = 201, description = "Printer added", body = PrinterResponse),
        (status = 400, description = "Invalid printer parameters"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn create_printer(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<PrinterCreate>,
) -> Result<(StatusCode, Json<PrinterResponse>), Error> {
    permissions::require(&user, Resource::Printers, Operation::CreateAll)?;
    request.validate().map_err(|message| Error::BadRequest { message })?;

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let printer = Printers::new(&mut conn).create(&request.into()).await?;
    info!(printer_id = %abbrev_uuid(&printer.id), name = %printer.name, "Printer added");

    Ok((StatusCode::CREATED, Json(PrinterResponse::from(printer))))
}

/// Update a printer
///
/// Operators use this to move printers between idle, printing and maintenance.
#[utoipa::path(
    patch,
    path = "/admin/printers/{id}",
    tag = "admin",
    request_body = PrinterUpdate,
    params(("id" = String, Path, description = "Printer ID")),
    responses(
        (status = 200, description = "Printer updated", body = PrinterResponse),
        (status = 400, description = "Invalid printer parameters"),
        (status = 404, description = "Printer not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn update_printer(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<PrinterId>,
    Json(request): Json<PrinterUpdate>,
) -> Result<Json<PrinterResponse>, Error> {
    permissions::require(&user, Resource::Printers, Operation::UpdateAll)?;
    request.validate().map_err(|message| Error::BadRequest { message })?;

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let printer = match Printers::new(&mut conn).update(id, &request.into()).await {
        Ok(printer) => printer,
        Err(DbError::NotFound) => return Err(not_found("Printer", id)),
        Err(e) => return Err(e.into()),
    };
    info!(printer_id = %abbrev_uuid(&id), status = ?printer.status, "Printer updated");

    Ok(Json(PrinterResponse::from(printer)))
}

#[utoipa::path(
    delete,
    path = "/admin/printers/{id}",
    tag = "admin",
    params(("id" = String, Path, description = "Printer ID")),
    responses(
        (status = 204, description = "Printer removed"),
        (status = 404, description = "Printer not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn delete_printer(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<PrinterId>,
) -> Result<StatusCode, Error> {
    permissions::require(&user, Resource::Printers, Operation::DeleteAll)?;

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    if !Printers::new(&mut conn).delete(id).await? {
        return Err(not_found("Printer", id));
    }
    info!(printer_id = %abbrev_uuid(&id), "Printer removed");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::models::users::Role,
        db::models::printers::PrinterStatus,
        test_utils::{bearer_for, create_test_app, create_test_user},
    };
    use serde_json::{Value, json};
    use sqlx::PgPool;

    fn printer_body() -> Value {
        json!({
            "name": "Prusa #3",
            "model": "Prusa MK4",
            "hourly_rate": "9.50",
            "throughput_g_per_hour": "14",
            "build_x_mm": 250,
            "build_y_mm": 210,
            "build_z_mm": 220,
            "supported_kinds": ["pla", "petg"]
        })
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_printers_are_not_public(pool: PgPool) {
        let (server, state) = create_test_app(pool.clone()).await;
        let customer = create_test_user(&pool, Role::Customer).await;

        server.get("/api/admin/printers").await.assert_status(StatusCode::UNAUTHORIZED);
        server
            .get("/api/admin/printers")
            .add_header("authorization", bearer_for(&state, &customer))
            .await
            .assert_status(StatusCode::FORBIDDEN);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_operator_updates_status_admin_manages_fleet(pool: PgPool) {
        let (server, state) = create_test_app(pool.clone()).await;
        let admin = create_test_user(&pool, Role::ShopAdmin).await;
        let operator = create_test_user(&pool, Role::PrintOperator).await;

        server
            .post("/api/admin/printers")
            .add_header("authorization", bearer_for(&state, &operator))
            .json(&printer_body())
            .await
            .assert_status(StatusCode::FORBIDDEN);

        let mut invalid = printer_body();
        invalid["supported_kinds"] = json!([]);
        server
            .post("/api/admin/printers")
            .add_header("authorization", bearer_for(&state, &admin))
            .json(&invalid)
            .await
            .assert_status(StatusCode::BAD_REQUEST);

        let response = server
            .post("/api/admin/printers")
            .add_header("authorization", bearer_for(&state, &admin))
            .json(&printer_body())
            .await;
        response.assert_status(StatusCode::CREATED);
        let printer: PrinterResponse = response.json();
        assert_eq!(printer.status, PrinterStatus::Idle);
        let url = format!("/api/admin/printers/{}", printer.id);

        let updated: PrinterResponse = server
            .patch(&url)
            .add_header("authorization", bearer_for(&state, &operator))
            .json(&json!({ "status": "maintenance" }))
            .await
            .json();
        assert_eq!(updated.status, PrinterStatus::Maintenance);

        let listed: Value = server
            .get("/api/admin/printers?status=maintenance")
            .add_header("authorization", bearer_for(&state, &operator))
            .await
            .json();
        assert_eq!(listed["total_count"], 1);

        server
            .delete(&url)
            .add_header("authorization", bearer_for(&state, &admin))
            .await
            .assert_status(StatusCode::NO_CONTENT);
        server
            .get(&url)
            .add_header("authorization", bearer_for(&state, &admin))
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }
}
