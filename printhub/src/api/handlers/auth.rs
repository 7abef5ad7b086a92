use axum::{
    Json,
    extract::{Path, Request, State},
    http::StatusCode,
};
use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::{
    AppState,
    api::{
        handlers::{is_valid_email, non_blank},
        models::{
            auth::{
                AuthResponse, AuthSuccessResponse, ChangePasswordRequest, LoginRequest, LoginResponse, LogoutResponse,
                PasswordResetConfirmRequest, PasswordResetRequest, RegisterRequest, RegisterResponse, SessionResponse,
            },
            users::{CurrentUser, Role, UserResponse},
        },
    },
    auth::{
        current_user::{session_token_from_cookie, session_token_from_header},
        password::{self, Argon2Params},
        session,
    },
    db::{
        handlers::{Credits, PasswordResetTokens, Repository, Users},
        models::{
            credits::{CreditTransactionCreateDBRequest, CreditTransactionType},
            users::{UserCreateDBRequest, UserDBResponse, UserUpdateDBRequest},
        },
    },
    errors::Error,
};

fn ensure_native_auth(state: &AppState) -> Result<(), Error> {
    if state.config.auth.native.enabled {
        Ok(())
    } else {
        Err(Error::BadRequest {
            message: "Native authentication is disabled".to_string(),
        })
    }
}

fn session_for(user: UserDBResponse, status: StatusCode, message: &str, state: &AppState) -> Result<SessionResponse<AuthResponse>, Error> {
    let user_response = UserResponse::from(user.clone());
    let token = session::create_session_token(&CurrentUser::from(user), &state.config)?;

    Ok(SessionResponse {
        status,
        body: AuthResponse {
            user: user_response,
            message: message.to_string(),
        },
        cookie: session::session_cookie(&token, &state.config),
    })
}

/// Register a new customer account
#[utoipa::path(
    post,
    path = "/auth/register",
    request_body = RegisterRequest,
    tag = "authentication",
    responses(
        (status = 201, description = "User registered, session cookie set", body = AuthResponse),
        (status = 400, description = "Invalid input or registration disabled"),
        (status = 409, description = "User already exists"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn register(State(state): State<AppState>, Json(request): Json<RegisterRequest>) -> Result<RegisterResponse, Error> {
    ensure_native_auth(&state)?;
    if !state.config.auth.native.allow_registration {
        return Err(Error::BadRequest {
            message: "User registration is disabled".to_string(),
        });
    }

    if !is_valid_email(&request.email) {
        return Err(Error::BadRequest {
            message: "A valid email address is required".to_string(),
        });
    }
    let password_config = &state.config.auth.native.password;
    password::validate_password(&request.password, password_config)?;

    let password_hash = password::hash_password(request.password, Argon2Params::from(password_config)).await?;

    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;

    let mut user_repo = Users::new(&mut tx);
    if user_repo.get_user_by_email(&request.email).await?.is_some() {
        return Err(Error::Conflict {
            message: "An account with this email address already exists".to_string(),
        });
    }

    let mut roles = state.config.auth.default_user_roles.clone();
    if !roles.contains(&Role::Customer) {
        roles.insert(0, Role::Customer);
    }

    let created_user = user_repo
        .create(&UserCreateDBRequest {
            email: request.email,
            display_name: non_blank(request.display_name.as_deref()),
            phone: non_blank(request.phone.as_deref()),
            is_admin: false,
            roles,
            auth_source: "native".to_string(),
            password_hash: Some(password_hash),
        })
        .await?;

    let initial_credits = state.config.credits.initial_credits;
    if initial_credits > Decimal::ZERO {
        Credits::new(&mut tx)
            .create_transaction(&CreditTransactionCreateDBRequest {
                user_id: created_user.id,
                transaction_type: CreditTransactionType::AdminGrant,
                amount: initial_credits,
                source_id: format!("welcome_{}", created_user.id),
                description: Some("Welcome credits".to_string()),
            })
            .await?;
    }

    tx.commit().await.map_err(|e| Error::Database(e.into()))?;
    tracing::info!(user_id = %created_user.id, "Registered new customer");

    session_for(created_user, StatusCode::CREATED, "Registration successful", &state)
}

/// Login with email and password
#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    tag = "authentication",
    responses(
        (status = 200, description = "Login successful, session cookie set", body = AuthResponse),
        (status = 401, description = "Invalid credentials"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn login(State(state): State<AppState>, Json(request): Json<LoginRequest>) -> Result<LoginResponse, Error> {
    ensure_native_auth(&state)?;
    let invalid = || Error::Unauthenticated {
        message: Some("Invalid email or password".to_string()),
    };

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut user_repo = Users::new(&mut conn);

    let user = user_repo.get_user_by_email(&request.email).await?.ok_or_else(invalid)?;
    let hash = user.password_hash.clone().ok_or_else(invalid)?;

    if !password::verify_password(request.password, hash).await? {
        return Err(invalid());
    }

    user_repo.record_login(user.id).await?;
    session_for(user, StatusCode::OK, "Login successful", &state)
}

/// Logout (clear session)
#[utoipa::path(
    post,
    path = "/auth/logout",
    tag = "authentication",
    responses(
        (status = 200, description = "Logout successful", body = AuthSuccessResponse),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn logout(State(state): State<AppState>) -> Result<LogoutResponse, Error> {
    Ok(SessionResponse {
        status: StatusCode::OK,
        body: AuthSuccessResponse {
            message: "Logout successful".to_string(),
        },
        cookie: session::clear_session_cookie(&state.config),
    })
}

/// Exchange a current (or recently expired) session for a fresh one.
///
/// Roles and admin status are re-read from the database.
#[utoipa::path(
    post,
    path = "/auth/refresh",
    tag = "authentication",
    responses(
        (status = 200, description = "Session refreshed", body = AuthResponse),
        (status = 401, description = "No session, or the session is too old to refresh"),
    ),
    security(
        ("session_token" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn refresh(State(state): State<AppState>, request: Request) -> Result<LoginResponse, Error> {
    ensure_native_auth(&state)?;
    let (parts, _) = request.into_parts();

    let token = session_token_from_cookie(&parts, &state.config)
        .or_else(|| session_token_from_header(&parts))
        .ok_or(Error::Unauthenticated { message: None })?;

    let user_id = session::verify_for_refresh(token, &state.config).map_err(|e| match e {
        Error::Internal { operation } => Error::Internal { operation },
        _ => Error::Unauthenticated {
            message: Some("Session is invalid or too old to refresh".to_string()),
        },
    })?;

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let user = Users::new(&mut conn)
        .get_by_id(user_id)
        .await?
        .ok_or_else(|| Error::Unauthenticated {
            message: Some("Account no longer exists".to_string()),
        })?;

    session_for(user, StatusCode::OK, "Session refreshed", &state)
}

/// The signed-in user, with their credit balance
#[utoipa::path(
    get,
    path = "/auth/me",
    tag = "authentication",
    responses(
        (status = 200, description = "Current user", body = UserResponse),
        (status = 401, description = "Not signed in"),
    ),
    security(
        ("session_token" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn me(State(state): State<AppState>, current_user: CurrentUser) -> Result<Json<UserResponse>, Error> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let user = Users::new(&mut conn)
        .get_by_id(current_user.id)
        .await?
        .ok_or_else(|| Error::Unauthenticated {
            message: Some("Account no longer exists".to_string()),
        })?;
    let balance = Credits::new(&mut conn).get_balance(user.id).await?;

    Ok(Json(UserResponse::from(user).with_credit_balance(balance)))
}

/// Request password reset (send email)
#[utoipa::path(
    post,
    path = "/auth/password-resets",
    request_body = PasswordResetRequest,
    tag = "authentication",
    responses(
        (status = 200, description = "Reset email sent if the account exists", body = AuthSuccessResponse),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn request_password_reset(
    State(state): State<AppState>,
    Json(request): Json<PasswordResetRequest>,
) -> Result<Json<AuthSuccessResponse>, Error> {
    ensure_native_auth(&state)?;
    let response = AuthSuccessResponse {
        message: "If an account with that email exists, a password reset link has been sent.".to_string(),
    };

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    // Same answer whether or not the account exists
    let Some(user) = Users::new(&mut conn).get_user_by_email(&request.email).await? else {
        return Ok(Json(response));
    };
    if user.password_hash.is_none() {
        return Ok(Json(response));
    }

    let valid_for = state.config.auth.native.password_reset_token_duration;
    let expires_at = Utc::now()
        + chrono::Duration::from_std(valid_for).map_err(|e| Error::Internal {
            operation: format!("compute reset token expiry: {e}"),
        })?;
    let params = Argon2Params::from(&state.config.auth.native.password);
    let (raw_token, token) = PasswordResetTokens::new(&mut conn).create_for_user(user.id, expires_at, params).await?;

    if let Err(e) = state
        .email
        .send_password_reset(&user.email, user.display_name.as_deref(), &token.id, &raw_token, valid_for)
        .await
    {
        tracing::error!(user_id = %user.id, "Failed to send password reset email: {}", e);
    }

    Ok(Json(response))
}

/// Confirm password reset with token
#[utoipa::path(
    post,
    path = "/auth/password-resets/{token_id}/confirm",
    request_body = PasswordResetConfirmRequest,
    tag = "authentication",
    params(
        ("token_id" = String, Path, description = "Token id from the reset link"),
    ),
    responses(
        (status = 200, description = "Password reset", body = AuthSuccessResponse),
        (status = 400, description = "Invalid or expired token"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn confirm_password_reset(
    State(state): State<AppState>,
    Path(token_id): Path<Uuid>,
    Json(request): Json<PasswordResetConfirmRequest>,
) -> Result<Json<AuthSuccessResponse>, Error> {
    ensure_native_auth(&state)?;
    let password_config = &state.config.auth.native.password;
    password::validate_password(&request.new_password, password_config)?;

    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;

    let token = PasswordResetTokens::new(&mut tx)
        .find_valid(token_id, &request.token)
        .await?
        .ok_or_else(|| Error::BadRequest {
            message: "Invalid or expired reset token".to_string(),
        })?;

    let password_hash = password::hash_password(request.new_password, Argon2Params::from(password_config)).await?;
    Users::new(&mut tx)
        .update(
            token.user_id,
            &UserUpdateDBRequest {
                password_hash: Some(password_hash),
                ..Default::default()
            },
        )
        .await?;

    // Every outstanding token for the user dies with the one just used
    PasswordResetTokens::new(&mut tx).invalidate_for_user(token.user_id).await?;
    tx.commit().await.map_err(|e| Error::Database(e.into()))?;

    Ok(Json(AuthSuccessResponse {
        message: "Password has been reset successfully".to_string(),
    }))
}

/// Change password for authenticated user
#[utoipa::path(
    post,
    path = "/auth/password-change",
    request_body = ChangePasswordRequest,
    tag = "authentication",
    responses(
        (status = 200, description = "Password changed", body = AuthSuccessResponse),
        (status = 400, description = "Invalid new password"),
        (status = 401, description = "Current password is incorrect"),
    ),
    security(
        ("session_token" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn change_password(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Json(request): Json<ChangePasswordRequest>,
) -> Result<Json<AuthSuccessResponse>, Error> {
    ensure_native_auth(&state)?;

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut user_repo = Users::new(&mut conn);

    let user = user_repo.get_by_id(current_user.id).await?.ok_or_else(|| Error::Unauthenticated {
        message: Some("User not found".to_string()),
    })?;
    let hash = user.password_hash.clone().ok_or_else(|| Error::BadRequest {
        message: "This account has no password to change".to_string(),
    })?;

    if !password::verify_password(request.current_password, hash).await? {
        return Err(Error::Unauthenticated {
            message: Some("Current password is incorrect".to_string()),
        });
    }

    let password_config = &state.config.auth.native.password;
    password::validate_password(&request.new_password, password_config)?;
    let password_hash = password::hash_password(request.new_password, Argon2Params::from(password_config)).await?;

    user_repo
        .update(
            current_user.id,
            &UserUpdateDBRequest {
                password_hash: Some(password_hash),
                ..Default::default()
            },
        )
        .await?;

    Ok(Json(AuthSuccessResponse {
        message: "Password changed successfully".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::handlers::PasswordResetTokens,
        test_utils::{bearer_for, create_test_app, create_test_user, fast_argon2_params},
    };
    use axum::http::header;
    use serde_json::json;
    use sqlx::PgPool;

    #[sqlx::test]
    #[test_log::test]
    async fn test_register_sets_session_cookie(pool: PgPool) {
        let (server, _) = create_test_app(pool).await;

        let response = server
            .post("/api/auth/register")
            .json(&json!({
                "email": "Nowy@Example.com",
                "password": "correct horse battery",
                "display_name": "Nowy Klient"
            }))
            .await;

        response.assert_status(StatusCode::CREATED);
        let cookie = response.headers().get(header::SET_COOKIE).unwrap().to_str().unwrap().to_string();
        assert!(cookie.starts_with("printhub_session="));
        assert!(cookie.contains("HttpOnly"));

        let body: AuthResponse = response.json();
        assert_eq!(body.user.email, "nowy@example.com");
        assert_eq!(body.user.roles, vec![Role::Customer]);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_register_rejects_bad_input_and_duplicates(pool: PgPool) {
        let (server, _) = create_test_app(pool).await;

        server
            .post("/api/auth/register")
            .json(&json!({"email": "not-an-email", "password": "long enough password"}))
            .await
            .assert_status(StatusCode::BAD_REQUEST);

        server
            .post("/api/auth/register")
            .json(&json!({"email": "short@example.com", "password": "short"}))
            .await
            .assert_status(StatusCode::BAD_REQUEST);

        let body = json!({"email": "twice@example.com", "password": "long enough password"});
        server.post("/api/auth/register").json(&body).await.assert_status(StatusCode::CREATED);
        server.post("/api/auth/register").json(&body).await.assert_status(StatusCode::CONFLICT);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_login_and_me(pool: PgPool) {
        let (server, _) = create_test_app(pool).await;
        server
            .post("/api/auth/register")
            .json(&json!({"email": "login@example.com", "password": "long enough password"}))
            .await
            .assert_status(StatusCode::CREATED);

        server
            .post("/api/auth/login")
            .json(&json!({"email": "login@example.com", "password": "wrong password!"}))
            .await
            .assert_status(StatusCode::UNAUTHORIZED);

        let response = server
            .post("/api/auth/login")
            .json(&json!({"email": "LOGIN@example.com", "password": "long enough password"}))
            .await;
        response.assert_status_ok();
        let body: AuthResponse = response.json();

        // Authenticate as a non-browser client with the bearer header
        let cookie = response.headers().get(header::SET_COOKIE).unwrap().to_str().unwrap().to_string();
        let token = cookie.split(';').next().unwrap().split_once('=').unwrap().1.to_string();
        let me = server
            .get("/api/auth/me")
            .add_header(header::AUTHORIZATION, format!("Bearer {token}"))
            .await;
        me.assert_status_ok();
        let me: UserResponse = me.json();
        assert_eq!(me.id, body.user.id);
        assert_eq!(me.credit_balance, Some(Decimal::ZERO));
        assert!(me.last_login.is_some());

        server.get("/api/auth/me").await.assert_status(StatusCode::UNAUTHORIZED);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_refresh_picks_up_role_changes(pool: PgPool) {
        let (server, state) = create_test_app(pool.clone()).await;
        let user = create_test_user(&pool, Role::Customer).await;
        let bearer = bearer_for(&state, &user);

        let mut conn = pool.acquire().await.unwrap();
        Users::new(&mut conn)
            .update(
                user.id,
                &UserUpdateDBRequest {
                    roles: Some(vec![Role::Customer, Role::PrintOperator]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let response = server.post("/api/auth/refresh").add_header(header::AUTHORIZATION, bearer).await;
        response.assert_status_ok();
        let body: AuthResponse = response.json();
        assert!(body.user.roles.contains(&Role::PrintOperator));

        server
            .post("/api/auth/refresh")
            .add_header(header::AUTHORIZATION, "Bearer garbage")
            .await
            .assert_status(StatusCode::UNAUTHORIZED);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_password_reset_is_single_use(pool: PgPool) {
        let (server, _) = create_test_app(pool.clone()).await;
        server
            .post("/api/auth/register")
            .json(&json!({"email": "forgot@example.com", "password": "original password"}))
            .await
            .assert_status(StatusCode::CREATED);

        // Unknown addresses get the same answer
        server
            .post("/api/auth/password-resets")
            .json(&json!({"email": "nobody@example.com"}))
            .await
            .assert_status_ok();

        let mut conn = pool.acquire().await.unwrap();
        let user = Users::new(&mut conn).get_user_by_email("forgot@example.com").await.unwrap().unwrap();
        let (raw, token) = PasswordResetTokens::new(&mut conn)
            .create_for_user(user.id, Utc::now() + chrono::Duration::minutes(30), fast_argon2_params())
            .await
            .unwrap();

        let confirm = json!({"token": raw, "new_password": "brand new password"});
        let url = format!("/api/auth/password-resets/{}/confirm", token.id);
        server.post(&url).json(&confirm).await.assert_status_ok();
        server.post(&url).json(&confirm).await.assert_status(StatusCode::BAD_REQUEST);

        server
            .post("/api/auth/login")
            .json(&json!({"email": "forgot@example.com", "password": "brand new password"}))
            .await
            .assert_status_ok();
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_change_password_requires_current(pool: PgPool) {
        let (server, _) = create_test_app(pool).await;
        let response = server
            .post("/api/auth/register")
            .json(&json!({"email": "change@example.com", "password": "original password"}))
            .await;
        let cookie = response.headers().get(header::SET_COOKIE).unwrap().to_str().unwrap().to_string();
        let session = cookie.split(';').next().unwrap().to_string();

        server
            .post("/api/auth/password-change")
            .add_header(header::COOKIE, session.clone())
            .json(&json!({"current_password": "not it at all", "new_password": "another password"}))
            .await
            .assert_status(StatusCode::UNAUTHORIZED);

        server
            .post("/api/auth/password-change")
            .add_header(header::COOKIE, session)
            .json(&json!({"current_password": "original password", "new_password": "another password"}))
            .await
            .assert_status_ok();
    }
}
