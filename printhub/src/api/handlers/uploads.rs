use std::path::Path as FsPath;

use axum::{
    Json,
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
};
use bytes::BytesMut;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    AppState,
    api::{
        handlers::not_found,
        models::{
            pagination::Pagination,
            uploads::{UploadDeleteResponse, UploadResponse},
            users::CurrentUser,
        },
    },
    auth::{current_user::MaybeUser, permissions},
    db::{
        handlers::Files,
        models::files::{UploadedFileCreateDBRequest, UploadedFileDBResponse},
    },
    errors::Error,
    pricing::stl,
    types::{FileId, Operation, Resource},
};

struct ReceivedFile {
    original_name: String,
    extension: String,
    content_type: Option<String>,
    data: BytesMut,
}

/// Lowercased extension if it is on the allow list
fn allowed_extension(file_name: &str, allowed: &[String]) -> Result<String, Error> {
    let extension = FsPath::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    if allowed.iter().any(|a| a.eq_ignore_ascii_case(&extension)) {
        Ok(extension)
    } else {
        Err(Error::BadRequest {
            message: format!("Unsupported file type. Allowed extensions: {}", allowed.join(", ")),
        })
    }
}

async fn receive_file(multipart: &mut Multipart, state: &AppState) -> Result<ReceivedFile, Error> {
    let limits = &state.config.uploads;

    while let Some(mut field) = multipart.next_field().await.map_err(|e| Error::BadRequest {
        message: format!("Invalid multipart data: {e}"),
    })? {
        if field.name() != Some("file") {
            continue;
        }

        let original_name = field
            .file_name()
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::BadRequest {
                message: "File name is required".to_string(),
            })?;
        let extension = allowed_extension(&original_name, &limits.allowed_extensions)?;
        let content_type = field.content_type().map(str::to_string);

        let mut data = BytesMut::new();
        while let Some(chunk) = field.chunk().await.map_err(|e| Error::BadRequest {
            message: format!("Failed to read upload: {e}"),
        })? {
            if (data.len() + chunk.len()) as u64 > limits.max_file_size {
                return Err(Error::PayloadTooLarge {
                    message: format!("File exceeds the maximum size of {} bytes", limits.max_file_size),
                });
            }
            data.extend_from_slice(&chunk);
        }

        if data.is_empty() {
            return Err(Error::BadRequest {
                message: "Uploaded file is empty".to_string(),
            });
        }

        return Ok(ReceivedFile {
            original_name,
            extension,
            content_type,
            data,
        });
    }

    Err(Error::BadRequest {
        message: "Multipart field 'file' is required".to_string(),
    })
}

/// Visible to its owner, to staff with read access, and to anyone for guest uploads
pub(crate) fn ensure_can_read(file: &UploadedFileDBResponse, user: Option<&CurrentUser>) -> Result<(), Error> {
    match (file.user_id, user) {
        (None, _) => Ok(()),
        (Some(owner), Some(user)) => permissions::require_access(user, Resource::Files, Operation::ReadOwn, Some(owner)),
        (Some(_), None) => Err(not_found("Upload", file.id)),
    }
}

/// Upload a model file
///
/// STL files are measured on upload; other formats are stored without geometry and need a
/// volume supplied when quoting.
#[utoipa::path(
    post,
    path = "/uploads",
    tag = "uploads",
    request_body(content_type = "multipart/form-data", description = "A `file` field with the model"),
    responses(
        (status = 201, description = "File stored", body = UploadResponse),
        (status = 400, description = "Missing file, unsupported type or unreadable STL"),
        (status = 413, description = "File too large"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn upload_file(
    State(state): State<AppState>,
    user: MaybeUser,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), Error> {
    let received = receive_file(&mut multipart, &state).await?;
    let id: FileId = Uuid::new_v4();
    let size_bytes = received.data.len() as i64;

    let mesh = if received.extension == "stl" {
        let data = received.data.clone().freeze();
        let stats = tokio::task::spawn_blocking(move || stl::analyze(&data))
            .await
            .map_err(|e| Error::Internal {
                operation: format!("spawn STL analysis task: {e}"),
            })?
            .map_err(|e| Error::BadRequest {
                message: format!("Could not read STL file: {e}"),
            })?;
        Some(stats)
    } else {
        None
    };

    let directory = &state.config.uploads.directory;
    tokio::fs::create_dir_all(directory).await.map_err(|e| Error::Internal {
        operation: format!("create upload directory: {e}"),
    })?;
    let storage_path = directory.join(format!("{id}.{}", received.extension));
    tokio::fs::write(&storage_path, &received.data).await.map_err(|e| Error::Internal {
        operation: format!("write upload: {e}"),
    })?;

    let request = UploadedFileCreateDBRequest {
        id,
        user_id: user.as_ref().map(|u| u.id),
        original_name: received.original_name,
        storage_path: storage_path.to_string_lossy().to_string(),
        content_type: received.content_type,
        size_bytes,
        volume_cm3: mesh.as_ref().and_then(|m| m.volume_decimal()),
        bbox_mm: mesh.as_ref().and_then(|m| m.bbox_decimal()),
        triangle_count: mesh.as_ref().map(|m| m.triangle_count as i64),
    };

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let created = match Files::new(&mut conn).create(&request).await {
        Ok(created) => created,
        Err(e) => {
            if let Err(io) = tokio::fs::remove_file(&storage_path).await {
                warn!("Failed to remove orphaned upload {}: {}", storage_path.display(), io);
            }
            return Err(e.into());
        }
    };

    metrics::counter!("printhub_uploads_total", "format" => received.extension).increment(1);
    debug!("Stored upload {} ({} bytes)", created.id, created.size_bytes);

    Ok((StatusCode::CREATED, Json(UploadResponse::from(created))))
}

/// Get upload metadata
#[utoipa::path(
    get,
    path = "/uploads/{id}",
    tag = "uploads",
    params(("id" = String, Path, description = "Upload ID")),
    responses(
        (status = 200, description = "Upload metadata", body = UploadResponse),
        (status = 404, description = "Upload not found"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn get_upload(State(state): State<AppState>, user: MaybeUser, Path(id): Path<FileId>) -> Result<Json<UploadResponse>, Error> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let file = Files::new(&mut conn).get_by_id(id).await?.ok_or_else(|| not_found("Upload", id))?;

    ensure_can_read(&file, user.as_ref())?;

    Ok(Json(UploadResponse::from(file)))
}

/// List the current user's uploads, newest first
#[utoipa::path(
    get,
    path = "/uploads",
    tag = "uploads",
    params(Pagination),
    responses(
        (status = 200, description = "Uploads", body = [UploadResponse]),
        (status = 401, description = "Not logged in"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_uploads(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(pagination): Query<Pagination>,
) -> Result<Json<Vec<UploadResponse>>, Error> {
    permissions::require(&user, Resource::Files, Operation::ReadOwn)?;
    let (skip, limit) = pagination.params();

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let files = Files::new(&mut conn).list_for_user(user.id, skip, limit).await?;

    Ok(Json(files.into_iter().map(UploadResponse::from).collect()))
}

/// Delete an upload that no order or design request refers to
#[utoipa::path(
    delete,
    path = "/uploads/{id}",
    tag = "uploads",
    params(("id" = String, Path, description = "Upload ID")),
    responses(
        (status = 200, description = "Upload deleted", body = UploadDeleteResponse),
        (status = 403, description = "Not the owner"),
        (status = 404, description = "Upload not found"),
        (status = 409, description = "Upload is attached to an order or design request"),
    ),
    security(("session_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn delete_upload(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<FileId>,
) -> Result<Json<UploadDeleteResponse>, Error> {
    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;
    let mut files = Files::new(&mut tx);

    let file = files.get_by_id(id).await?.ok_or_else(|| not_found("Upload", id))?;
    permissions::require_access(&user, Resource::Files, Operation::DeleteOwn, file.user_id)?;

    if files.is_referenced(id).await? {
        return Err(Error::Conflict {
            message: "Upload is attached to an order or design request".to_string(),
        });
    }

    let deleted = files.delete(id).await?;
    tx.commit().await.map_err(|e| Error::Database(e.into()))?;

    if let Err(e) = tokio::fs::remove_file(&file.storage_path).await {
        warn!("Failed to remove upload {} from disk: {}", file.storage_path, e);
    }

    Ok(Json(UploadDeleteResponse { id, deleted }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::models::users::Role,
        test_utils::{bearer_for, create_test_app, create_test_order, create_test_user},
    };
    use axum_test::multipart::{MultipartForm, Part};
    use rust_decimal::Decimal;
    use sqlx::PgPool;

    /// Binary STL of an axis-aligned 10 mm cube
    fn cube_stl() -> Vec<u8> {
        let v = |x: f32, y: f32, z: f32| [x, y, z];
        let (a, b, c, d) = (v(0., 0., 0.), v(10., 0., 0.), v(10., 10., 0.), v(0., 10., 0.));
        let (e, f, g, h) = (v(0., 0., 10.), v(10., 0., 10.), v(10., 10., 10.), v(0., 10., 10.));
        let triangles = [
            [a, c, b],
            [a, d, c],
            [e, f, g],
            [e, g, h],
            [a, b, f],
            [a, f, e],
            [b, c, g],
            [b, g, f],
            [c, d, h],
            [c, h, g],
            [d, a, e],
            [d, e, h],
        ];

        let mut out = vec![0u8; 80];
        out.extend_from_slice(&(triangles.len() as u32).to_le_bytes());
        for triangle in triangles {
            out.extend_from_slice(&[0u8; 12]);
            for vertex in triangle {
                for coord in vertex {
                    out.extend_from_slice(&coord.to_le_bytes());
                }
            }
            out.extend_from_slice(&[0u8; 2]);
        }
        out
    }

    fn form(bytes: Vec<u8>, file_name: &str) -> MultipartForm {
        MultipartForm::new().add_part("file", Part::bytes(bytes).file_name(file_name).mime_type("model/stl"))
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_stl_upload_is_measured(pool: PgPool) {
        let (server, state) = create_test_app(pool.clone()).await;
        let user = create_test_user(&pool, Role::Customer).await;

        let response = server
            .post("/api/uploads")
            .add_header("authorization", bearer_for(&state, &user))
            .multipart(form(cube_stl(), "Cube.STL"))
            .await;

        response.assert_status(StatusCode::CREATED);
        let body: UploadResponse = response.json();
        assert_eq!(body.original_name, "Cube.STL");
        assert_eq!(body.triangle_count, Some(12));
        assert_eq!(body.volume_cm3, Some(Decimal::ONE));

        let mut conn = pool.acquire().await.unwrap();
        let stored = Files::new(&mut conn).get_by_id(body.id).await.unwrap().unwrap();
        assert_eq!(stored.user_id, Some(user.id));
        assert!(stored.storage_path.ends_with(&format!("{}.stl", body.id)));
        assert!(tokio::fs::metadata(&stored.storage_path).await.is_ok());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_upload_rejects_bad_input(pool: PgPool) {
        let (server, _) = create_test_app(pool).await;

        server
            .post("/api/uploads")
            .multipart(form(b"MZ\x90\x00".to_vec(), "virus.exe"))
            .await
            .assert_status(StatusCode::BAD_REQUEST);

        server
            .post("/api/uploads")
            .multipart(form(vec![1, 2, 3, 4, 5, 6, 7, 8], "broken.stl"))
            .await
            .assert_status(StatusCode::BAD_REQUEST);

        server
            .post("/api/uploads")
            .multipart(MultipartForm::new().add_text("note", "no file here"))
            .await
            .assert_status(StatusCode::BAD_REQUEST);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_upload_size_limit(pool: PgPool) {
        let mut config = crate::test_utils::create_test_config();
        config.uploads.max_file_size = 64;
        let state = crate::test_utils::create_test_state(pool, config);
        let server = crate::test_utils::create_test_server(state);

        server
            .post("/api/uploads")
            .multipart(form(vec![b'x'; 65], "part.obj"))
            .await
            .assert_status(StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_guest_upload_is_public_owned_upload_is_private(pool: PgPool) {
        let (server, state) = create_test_app(pool.clone()).await;
        let owner = create_test_user(&pool, Role::Customer).await;
        let other = create_test_user(&pool, Role::Customer).await;

        let guest: UploadResponse = server.post("/api/uploads").multipart(form(cube_stl(), "guest.stl")).await.json();
        server.get(&format!("/api/uploads/{}", guest.id)).await.assert_status_ok();

        let owned: UploadResponse = server
            .post("/api/uploads")
            .add_header("authorization", bearer_for(&state, &owner))
            .multipart(form(cube_stl(), "mine.stl"))
            .await
            .json();

        server
            .get(&format!("/api/uploads/{}", owned.id))
            .await
            .assert_status(StatusCode::NOT_FOUND);
        server
            .get(&format!("/api/uploads/{}", owned.id))
            .add_header("authorization", bearer_for(&state, &other))
            .await
            .assert_status(StatusCode::FORBIDDEN);
        server
            .get(&format!("/api/uploads/{}", owned.id))
            .add_header("authorization", bearer_for(&state, &owner))
            .await
            .assert_status_ok();

        let listed: Vec<UploadResponse> = server
            .get("/api/uploads")
            .add_header("authorization", bearer_for(&state, &owner))
            .await
            .json();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, owned.id);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_delete_refuses_referenced_upload(pool: PgPool) {
        let (server, state) = create_test_app(pool.clone()).await;
        let owner = create_test_user(&pool, Role::Customer).await;

        let order = create_test_order(&pool, Some(owner.id)).await;
        server
            .delete(&format!("/api/uploads/{}", order.file_ids[0]))
            .add_header("authorization", bearer_for(&state, &owner))
            .await
            .assert_status(StatusCode::CONFLICT);

        let free: UploadResponse = server
            .post("/api/uploads")
            .add_header("authorization", bearer_for(&state, &owner))
            .multipart(form(cube_stl(), "spare.stl"))
            .await
            .json();
        let response = server
            .delete(&format!("/api/uploads/{}", free.id))
            .add_header("authorization", bearer_for(&state, &owner))
            .await;
        response.assert_status_ok();
        let body: UploadDeleteResponse = response.json();
        assert!(body.deleted);

        server
            .get(&format!("/api/uploads/{}", free.id))
            .add_header("authorization", bearer_for(&state, &owner))
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }
}
