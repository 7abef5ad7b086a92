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
            users::{CurrentUser, ListUsersQuery, UserResponse, UserUpdate},
        },
    },
    auth::permissions,
    db::{
        errors::DbError,
        handlers::{Credits, Repository, Users, users::UserFilter},
    },
    errors::Error,
    types::{Operation, Resource, UserId, abbrev_uuid},
};

/// List user accounts
#[utoipa::path(
    get,
    path = "/admin/users",
    tag = "admin",
    params(ListUsersQuery),
    responses(
        (status = 200, description = "Users, newest first", body = PaginatedResponse<UserResponse>),
        (status = 403, description = "Staff only"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_users(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<ListUsersQuery>,
) -> Result<Json<PaginatedResponse<UserResponse>>, Error> {
    permissions::require(&user, Resource::Users, Operation::ReadAll)?;
    let (skip, limit) = query.pagination.params();

    let mut filter = UserFilter::new(skip, limit);
    filter.search = query.search.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut repo = Users::new(&mut conn);
    let users = repo.list(&filter).await?;
    let total = repo.count(&filter).await?;

    Ok(Json(PaginatedResponse::new(
        users.into_iter().map(UserResponse::from).collect(),
        total,
        skip,
        limit,
    )))
}

/// Get a user account, with its credit balance
#[utoipa::path(
    get,
    path = "/admin/users/{id}",
    tag = "admin",
    params(("id" = String, Path, description = "User ID")),
    responses(
        (status = 200, description = "User", body = UserResponse),
        (status = 404, description = "User not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn get_user(State(state): State<AppState>, user: CurrentUser, Path(id): Path<UserId>) -> Result<Json<UserResponse>, Error> {
    permissions::require(&user, Resource::Users, Operation::ReadAll)?;

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let found = Users::new(&mut conn).get_by_id(id).await?.ok_or_else(|| not_found("User", id))?;
    let balance = Credits::new(&mut conn).get_balance(id).await?;

    Ok(Json(UserResponse::from(found).with_credit_balance(balance)))
}

/// Update a user's profile or roles
///
/// `Customer` is kept on every account whatever roles are sent.
#[utoipa::path(
    patch,
    path = "/admin/users/{id}",
    tag = "admin",
    request_body = UserUpdate,
    params(("id" = String, Path, description = "User ID")),
    responses(
        (status = 200, description = "User updated", body = UserResponse),
        (status = 404, description = "User not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn update_user(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<UserId>,
    Json(request): Json<UserUpdate>,
) -> Result<Json<UserResponse>, Error> {
    permissions::require(&user, Resource::Users, Operation::UpdateAll)?;

    let roles_changed = request.roles.is_some();
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let updated = match Users::new(&mut conn).update(id, &request.into()).await {
        Ok(updated) => updated,
        Err(DbError::NotFound) => return Err(not_found("User", id)),
        Err(e) => return Err(e.into()),
    };
    if roles_changed {
        info!(user_id = %abbrev_uuid(&id), roles = ?updated.roles, by = %abbrev_uuid(&user.id), "User roles changed");
    }

    Ok(Json(UserResponse::from(updated)))
}

/// Delete a user account
///
/// Orders, uploads and payments are kept and detached from the account.
#[utoipa::path(
    delete,
    path = "/admin/users/{id}",
    tag = "admin",
    params(("id" = String, Path, description = "User ID")),
    responses(
        (status = 204, description = "User deleted"),
        (status = 400, description = "Cannot delete this account"),
        (status = 404, description = "User not found"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn delete_user(State(state): State<AppState>, user: CurrentUser, Path(id): Path<UserId>) -> Result<StatusCode, Error> {
    permissions::require(&user, Resource::Users, Operation::DeleteAll)?;

    if id == user.id {
        return Err(Error::BadRequest {
            message: "You cannot delete your own account".to_string(),
        });
    }

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut repo = Users::new(&mut conn);
    let target = repo.get_by_id(id).await?.ok_or_else(|| not_found("User", id))?;
    if target.email.eq_ignore_ascii_case(&state.config.admin_email) {
        return Err(Error::BadRequest {
            message: "The bootstrap admin account cannot be deleted".to_string(),
        });
    }

    repo.delete(id).await?;
    info!(user_id = %abbrev_uuid(&id), by = %abbrev_uuid(&user.id), "User deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::models::users::Role,
        db::models::users::UserCreateDBRequest,
        test_utils::{bearer_for, create_test_admin_user, create_test_app, create_test_order, create_test_user},
    };
    use rust_decimal::Decimal;
    use serde_json::{Value, json};
    use sqlx::PgPool;

    #[sqlx::test]
    #[test_log::test]
    async fn test_list_and_search_users(pool: PgPool) {
        let (server, state) = create_test_app(pool.clone()).await;
        let manager = create_test_user(&pool, Role::OrderManager).await;
        let customer = create_test_user(&pool, Role::Customer).await;

        let all: Value = server
            .get("/api/admin/users")
            .add_header("authorization", bearer_for(&state, &manager))
            .await
            .json();
        assert_eq!(all["total_count"], 2);

        let prefix = customer.email.split('@').next().unwrap().to_uppercase();
        let found: Value = server
            .get(&format!("/api/admin/users?search={prefix}"))
            .add_header("authorization", bearer_for(&state, &manager))
            .await
            .json();
        assert_eq!(found["total_count"], 1);
        assert_eq!(found["data"][0]["email"], customer.email);

        server
            .get("/api/admin/users")
            .add_header("authorization", bearer_for(&state, &customer))
            .await
            .assert_status(StatusCode::FORBIDDEN);

        let detail: UserResponse = server
            .get(&format!("/api/admin/users/{}", customer.id))
            .add_header("authorization", bearer_for(&state, &manager))
            .await
            .json();
        assert_eq!(detail.credit_balance, Some(Decimal::ZERO));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_role_changes_need_user_admin(pool: PgPool) {
        let (server, state) = create_test_app(pool.clone()).await;
        let admin = create_test_user(&pool, Role::ShopAdmin).await;
        let manager = create_test_user(&pool, Role::OrderManager).await;
        let customer = create_test_user(&pool, Role::Customer).await;
        let url = format!("/api/admin/users/{}", customer.id);

        server
            .patch(&url)
            .add_header("authorization", bearer_for(&state, &manager))
            .json(&json!({ "roles": ["ORDER_MANAGER"] }))
            .await
            .assert_status(StatusCode::FORBIDDEN);

        let updated: UserResponse = server
            .patch(&url)
            .add_header("authorization", bearer_for(&state, &admin))
            .json(&json!({ "roles": ["PRINT_OPERATOR"], "phone": "+48 600 100 200" }))
            .await
            .json();
        assert_eq!(updated.roles, vec![Role::Customer, Role::PrintOperator]);
        assert_eq!(updated.phone.as_deref(), Some("+48 600 100 200"));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_delete_user_guards(pool: PgPool) {
        let (server, state) = create_test_app(pool.clone()).await;
        let admin = create_test_admin_user(&pool).await;
        let customer = create_test_user(&pool, Role::Customer).await;
        let order = create_test_order(&pool, Some(customer.id)).await;

        server
            .delete(&format!("/api/admin/users/{}", admin.id))
            .add_header("authorization", bearer_for(&state, &admin))
            .await
            .assert_status(StatusCode::BAD_REQUEST);

        server
            .delete(&format!("/api/admin/users/{}", customer.id))
            .add_header("authorization", bearer_for(&state, &admin))
            .await
            .assert_status(StatusCode::NO_CONTENT);
        server
            .get(&format!("/api/admin/users/{}", customer.id))
            .add_header("authorization", bearer_for(&state, &admin))
            .await
            .assert_status(StatusCode::NOT_FOUND);

        // The order survives without an owner
        let order: Value = server
            .get(&format!("/api/orders/{}", order.id))
            .add_header("authorization", bearer_for(&state, &admin))
            .await
            .json();
        assert!(order["user_id"].is_null());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_bootstrap_admin_cannot_be_deleted(pool: PgPool) {
        let (server, state) = create_test_app(pool.clone()).await;
        let admin = create_test_admin_user(&pool).await;

        let mut conn = pool.acquire().await.unwrap();
        let bootstrap = Users::new(&mut conn)
            .create(&UserCreateDBRequest {
                email: state.config.admin_email.clone(),
                display_name: None,
                phone: None,
                is_admin: true,
                roles: vec![Role::Customer],
                auth_source: "system".to_string(),
                password_hash: None,
            })
            .await
            .unwrap();

        server
            .delete(&format!("/api/admin/users/{}", bootstrap.id))
            .add_header("authorization", bearer_for(&state, &admin))
            .await
            .assert_status(StatusCode::BAD_REQUEST);
    }
}
