use axum::{Json, extract::State};
use tracing::info;

use crate::{
    AppState,
    api::models::{settings::PublicSettingsResponse, users::CurrentUser},
    auth::permissions,
    db::{handlers::Settings, models::settings::ShopSettings},
    errors::Error,
    types::{Operation, Resource},
};

/// Storefront settings: currency, enabled shipping methods and opening hours
#[utoipa::path(
    get,
    path = "/settings/public",
    tag = "settings",
    responses(
        (status = 200, description = "Public shop settings", body = PublicSettingsResponse),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn get_public_settings(State(state): State<AppState>) -> Result<Json<PublicSettingsResponse>, Error> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let settings = Settings::new(&mut conn).get_shop().await?;
    Ok(Json(PublicSettingsResponse::from(settings)))
}

#[utoipa::path(
    get,
    path = "/admin/settings",
    tag = "admin",
    responses(
        (status = 200, description = "Full shop settings", body = ShopSettings),
        (status = 403, description = "Admin only"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn get_settings(State(state): State<AppState>, user: CurrentUser) -> Result<Json<ShopSettings>, Error> {
    permissions::require(&user, Resource::Settings, Operation::ReadAll)?;

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    Ok(Json(Settings::new(&mut conn).get_shop().await?))
}

/// Replace the shop settings
///
/// Omitted sections and fields take their default values.
#[utoipa::path(
    put,
    path = "/admin/settings",
    tag = "admin",
    request_body = ShopSettings,
    responses(
        (status = 200, description = "Settings saved", body = ShopSettings),
        (status = 400, description = "Settings failed validation"),
        (status = 403, description = "Admin only"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn put_settings(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(settings): Json<ShopSettings>,
) -> Result<Json<ShopSettings>, Error> {
    permissions::require(&user, Resource::Settings, Operation::UpdateAll)?;
    settings.validate().map_err(|message| Error::BadRequest { message })?;

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    Settings::new(&mut conn).put_shop(&settings).await?;
    info!(user_id = %user.id, "Shop settings updated");

    Ok(Json(settings))
}
