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
            materials::{ListMaterialsQuery, MaterialCreate, MaterialResponse, MaterialUpdate, validate_rates},
            pagination::PaginatedResponse,
            users::CurrentUser,
        },
    },
    auth::permissions,
    db::{
        errors::DbError,
        handlers::{Materials, Repository},
        models::materials::MaterialFilter,
    },
    errors::Error,
    types::{MaterialId, Operation, Resource, abbrev_uuid},
};

async fn list_with(state: &AppState, query: ListMaterialsQuery, available_only: bool) -> Result<PaginatedResponse<MaterialResponse>, Error> {
    let (skip, limit) = query.pagination.params();
    let filter = MaterialFilter {
        available_only,
        skip,
        limit,
    };

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut repo = Materials::new(&mut conn);
    let materials = repo.list(&filter).await?;
    let total = repo.count(&filter).await?;

    Ok(PaginatedResponse::new(
        materials.into_iter().map(MaterialResponse::from).collect(),
        total,
        skip,
        limit,
    ))
}

/// List materials available for ordering
#[utoipa::path(
    get,
    path = "/materials",
    tag = "materials",
    params(ListMaterialsQuery),
    responses(
        (status = 200, description = "Available materials", body = PaginatedResponse<MaterialResponse>),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn list_materials(
    State(state): State<AppState>,
    Query(query): Query<ListMaterialsQuery>,
) -> Result<Json<PaginatedResponse<MaterialResponse>>, Error> {
    Ok(Json(list_with(&state, query, true).await?))
}

/// Get a material
///
/// Unavailable materials are hidden from the public catalog.
#[utoipa::path(
    get,
    path = "/materials/{id}",
    tag = "materials",
    params(("id" = String, Path, description = "Material ID")),
    responses(
        (status = 200, description = "Material", body = MaterialResponse),
        (status = 404, description = "Material not found"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn get_material(State(state): State<AppState>, Path(id): Path<MaterialId>) -> Result<Json<MaterialResponse>, Error> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let material = Materials::new(&mut conn)
        .get_by_id(id)
        .await?
        .filter(|m| m.available)
        .ok_or_else(|| not_found("Material", id))?;

    Ok(Json(MaterialResponse::from(material)))
}

/// List all materials, including unavailable ones
#[utoipa::path(
    get,
    path = "/admin/materials",
    tag = "admin",
    params(ListMaterialsQuery),
    responses(
        (status = 200, description = "All materials", body = PaginatedResponse<MaterialResponse>),
        (status = 403, description = "Admin only"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn admin_list_materials(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<ListMaterialsQuery>,
) -> Result<Json<PaginatedResponse<MaterialResponse>>, Error> {
    permissions::require(&user, Resource::Materials, Operation::UpdateAll)?;
    Ok(Json(list_with(&state, query, false).await?))
}

/// Add a material
#[utoipa::path(
    post,
    path = "/admin/materials",
    tag = "admin",
    request_body = MaterialCreate,
    responses(
        (status = 201, description = "Material created", body = MaterialResponse),
        (status = 400, description = "Invalid rates"),
        (status = 409, description = "A material with this name exists"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn create_material(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<MaterialCreate>,
) -> Result<(StatusCode, Json<MaterialResponse>), Error> {
    permissions::require(&user, Resource::Materials, Operation::CreateAll)?;

    if request.name.trim().is_empty() {
        return Err(Error::BadRequest {
            message: "name must not be empty".to_string(),
        });
    }
    validate_rates(Some(request.density_g_cm3), Some(request.price_per_gram)).map_err(|message| Error::BadRequest { message })?;

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let material = Materials::new(&mut conn).create(&request.into()).await?;
    info!(material_id = %abbrev_uuid(&material.id), name = %material.name, "Material created");

    Ok((StatusCode::CREATED, Json(MaterialResponse::from(material))))
}

/// Update a material
#[utoipa::path(
    patch,
    path = "/admin/materials/{id}",
    tag = "admin",
    request_body = MaterialUpdate,
    params(("id" = String, Path, description = "Material ID")),
    responses(
        (status = 200, description = "Material updated", body = MaterialResponse),
        (status = 400, description = "Invalid rates"),
        (status = 404, description = "Material not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn update_material(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<MaterialId>,
    Json(request): Json<MaterialUpdate>,
) -> Result<Json<MaterialResponse>, Error> {
    permissions::require(&user, Resource::Materials, Operation::UpdateAll)?;
    validate_rates(request.density_g_cm3, request.price_per_gram).map_err(|message| Error::BadRequest { message })?;
    if request.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
        return Err(Error::BadRequest {
            message: "name must not be empty".to_string(),
        });
    }

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let material = match Materials::new(&mut conn).update(id, &request.into()).await {
        Ok(material) => material,
        Err(DbError::NotFound) => return Err(not_found("Material", id)),
        Err(e) => return Err(e.into()),
    };

    Ok(Json(MaterialResponse::from(material)))
}

/// Delete a material
///
/// Materials referenced by orders cannot be deleted; mark them unavailable instead.
#[utoipa::path(
    delete,
    path = "/admin/materials/{id}",
    tag = "admin",
    params(("id" = String, Path, description = "Material ID")),
    responses(
        (status = 204, description = "Material deleted"),
        (status = 404, description = "Material not found"),
        (status = 409, description = "Material is referenced by orders"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn delete_material(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<MaterialId>,
) -> Result<StatusCode, Error> {
    permissions::require(&user, Resource::Materials, Operation::DeleteAll)?;

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    match Materials::new(&mut conn).delete(id).await {
        Ok(true) => {
            info!(material_id = %abbrev_uuid(&id), "Material deleted");
            Ok(StatusCode::NO_CONTENT)
        }
        Ok(false) => Err(not_found("Material", id)),
        Err(DbError::ForeignKeyViolation { .. }) => Err(Error::Conflict {
            message: "Material is used by existing orders; mark it unavailable instead".to_string(),
        }),
        Err(e) => Err(e.into()),
    }
}
