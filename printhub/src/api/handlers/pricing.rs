use axum::{Json, extract::State};
use rust_decimal::Decimal;
use sqlx::PgConnection;

use crate::{
    AppState,
    api::{
        handlers::{not_found, uploads::ensure_can_read},
        models::{
            pricing::{EstimateRequest, EstimateResponse},
            users::CurrentUser,
        },
    },
    auth::current_user::MaybeUser,
    db::handlers::{Files, Materials, Repository, Settings},
    errors::Error,
    pricing::{self, EstimateInput},
    types::FileId,
};

/// Combined size of the models being priced
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Geometry {
    pub volume_cm3: Decimal,
    /// Per-axis maximum over all files, used to check the models fit a printer
    pub bbox_mm: Option<[Decimal; 3]>,
}

/// Sum the measured volumes of the files, or take the explicit volume when one is given.
///
/// Every file must exist and be visible to the caller. Files without measured geometry
/// (non-STL formats) can only be priced with an explicit volume.
pub(crate) async fn resolve_geometry(
    conn: &mut PgConnection,
    file_ids: &[FileId],
    volume_override: Option<Decimal>,
    user: Option<&CurrentUser>,
) -> Result<Geometry, Error> {
    if file_ids.is_empty() && volume_override.is_none() {
        return Err(Error::BadRequest {
            message: "Provide at least one uploaded file or a volume_cm3".to_string(),
        });
    }

    let files = Files::new(conn).get_bulk(file_ids).await?;

    let mut volume = Decimal::ZERO;
    let mut unmeasured = false;
    let mut bbox: Option<[Decimal; 3]> = None;

    for id in file_ids {
        let file = files.get(id).ok_or_else(|| not_found("Upload", id))?;
        ensure_can_read(file, user)?;

        match file.volume_cm3 {
            Some(v) => volume += v,
            None => unmeasured = true,
        }
        if let Some(dims) = file.bbox_mm() {
            let merged = bbox.map_or(dims, |current| [0, 1, 2].map(|i| current[i].max(dims[i])));
            bbox = Some(merged);
        }
    }

    let volume_cm3 = match volume_override {
        Some(v) => v,
        None if unmeasured => {
            return Err(Error::BadRequest {
                message: "volume_cm3 is required for files that could not be measured".to_string(),
            });
        }
        None => volume,
    };

    Ok(Geometry { volume_cm3, bbox_mm: bbox })
}

/// Quote a print
///
/// Prices the uploaded model (or an explicit volume) in the chosen material. Without a
/// `printer_id` the cheapest printer that can take the job is used.
#[utoipa::path(
    post,
    path = "/pricing/estimate",
    tag = "pricing",
    request_body = EstimateRequest,
    responses(
        (status = 200, description = "Price breakdown", body = EstimateResponse),
        (status = 400, description = "Invalid parameters or unmeasurable model"),
        (status = 404, description = "Material, printer or upload not found"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn estimate_price(
    State(state): State<AppState>,
    user: MaybeUser,
    Json(request): Json<EstimateRequest>,
) -> Result<Json<EstimateResponse>, Error> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;

    let material = Materials::new(&mut conn)
        .get_by_id(request.material_id)
        .await?
        .ok_or_else(|| not_found("Material", request.material_id))?;
    let shop = Settings::new(&mut conn).get_shop().await?;

    let geometry = resolve_geometry(&mut conn, &request.all_file_ids(), request.volume_cm3, user.as_ref()).await?;
    let machine = pricing::machine_for(&mut conn, &material, request.printer_id, geometry.bbox_mm, &shop.pricing).await?;

    let estimate = pricing::estimate(
        &EstimateInput {
            volume_cm3: geometry.volume_cm3,
            infill_percent: request.infill_percent,
            quantity: request.quantity,
        },
        &material,
        &machine,
        &shop.pricing,
    )?;

    Ok(Json(EstimateResponse {
        material_id: material.id,
        material_name: material.name,
        currency: shop.currency,
        estimate,
    }))
}

#[cfg(test)]
mod tests {
    use crate::{
        api::models::users::Role,
        db::{
            handlers::{Materials, Repository},
            models::materials::MaterialUpdateDBRequest,
        },
        test_utils::{bearer_for, create_test_app, create_test_material, create_test_upload, create_test_user},
    };
    use axum::http::StatusCode;
    use rust_decimal::Decimal;
    use serde_json::{Value, json};
    use sqlx::PgPool;
    use std::str::FromStr;

    fn money(value: &Value) -> Decimal {
        Decimal::from_str(value.as_str().unwrap()).unwrap()
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_estimate_from_upload_uses_fallback_rates(pool: PgPool) {
        let (server, _) = create_test_app(pool.clone()).await;
        let material = create_test_material(&pool).await;
        let file = create_test_upload(&pool, None).await;

        let response = server
            .post("/api/pricing/estimate")
            .json(&json!({ "file_id": file.id, "material_id": material.id, "quantity": 3 }))
            .await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["currency"], "PLN");
        assert_eq!(body["quantity"], 3);
        assert!(body["printer_id"].is_null());
        // 12.5 cm³ at 20% infill: 5.5 cm³ extruded, 6.82 g of PLA
        assert_eq!(money(&body["weight_g"]), Decimal::new(682, 2));
        assert_eq!(money(&body["subtotal"]), Decimal::new(2669, 2));
        assert_eq!(body["minimum_applied"], false);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_estimate_applies_minimum_price(pool: PgPool) {
        let (server, _) = create_test_app(pool.clone()).await;
        let material = create_test_material(&pool).await;

        let body: Value = server
            .post("/api/pricing/estimate")
            .json(&json!({ "volume_cm3": "12.5", "material_id": material.id }))
            .await
            .json();

        assert_eq!(money(&body["subtotal"]), Decimal::new(2000, 2));
        assert_eq!(body["minimum_applied"], true);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_estimate_rejects_bad_requests(pool: PgPool) {
        let (server, _) = create_test_app(pool.clone()).await;
        let material = create_test_material(&pool).await;

        // Neither files nor volume
        server
            .post("/api/pricing/estimate")
            .json(&json!({ "material_id": material.id }))
            .await
            .assert_status(StatusCode::BAD_REQUEST);

        server
            .post("/api/pricing/estimate")
            .json(&json!({ "volume_cm3": "10", "material_id": material.id, "infill_percent": 120 }))
            .await
            .assert_status(StatusCode::BAD_REQUEST);

        server
            .post("/api/pricing/estimate")
            .json(&json!({ "volume_cm3": "10", "material_id": material.id, "quantity": 0 }))
            .await
            .assert_status(StatusCode::BAD_REQUEST);

        server
            .post("/api/pricing/estimate")
            .json(&json!({ "volume_cm3": "10", "material_id": uuid::Uuid::new_v4() }))
            .await
            .assert_status(StatusCode::NOT_FOUND);

        let mut conn = pool.acquire().await.unwrap();
        Materials::new(&mut conn)
            .update(
                material.id,
                &MaterialUpdateDBRequest {
                    available: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        server
            .post("/api/pricing/estimate")
            .json(&json!({ "volume_cm3": "10", "material_id": material.id }))
            .await
            .assert_status(StatusCode::BAD_REQUEST);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_estimate_hides_other_users_uploads(pool: PgPool) {
        let (server, state) = create_test_app(pool.clone()).await;
        let material = create_test_material(&pool).await;
        let owner = create_test_user(&pool, Role::Customer).await;
        let other = create_test_user(&pool, Role::Customer).await;
        let file = create_test_upload(&pool, Some(owner.id)).await;

        server
            .post("/api/pricing/estimate")
            .add_header("authorization", bearer_for(&state, &other))
            .json(&json!({ "file_id": file.id, "material_id": material.id }))
            .await
            .assert_status(StatusCode::FORBIDDEN);

        server
            .post("/api/pricing/estimate")
            .add_header("authorization", bearer_for(&state, &owner))
            .json(&json!({ "file_id": file.id, "material_id": material.id }))
            .await
            .assert_status_ok();
    }
}
