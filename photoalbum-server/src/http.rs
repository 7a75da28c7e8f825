use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, State, multipart::MultipartError},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use serde_json::json;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnFailure, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, instrument};

use crate::catalog::{
    self, BirthdayMessage, BirthdayMessageCreate, BirthdayMessageUpdate, Catalog, NewPhoto, Photo,
    PhotoUpdate,
};
use crate::config::Settings;
use crate::error::{IngestError, ValidationError};
use crate::media;
use crate::storage::{PhotoStorage, Upload};

/// Room for the text fields that travel with the file in one form.
const FORM_OVERHEAD_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub storage: Arc<PhotoStorage>,
    pub catalog: Arc<Catalog>,
}

/// Error body shaped as `{"detail": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    fn not_found(what: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("{what} not found"))
    }

    fn internal(context: &str, err: impl std::fmt::Display) -> Self {
        tracing::error!(error = %err, "{context}");
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{context}: {err}"),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Validation(v @ ValidationError::TooLarge { .. }) => {
                Self::new(StatusCode::PAYLOAD_TOO_LARGE, v.to_string())
            }
            IngestError::Validation(v @ ValidationError::UnsupportedType(_)) => {
                Self::new(StatusCode::BAD_REQUEST, v.to_string())
            }
            e @ IngestError::WriteFailure { .. } => Self::internal("failed to save file", e),
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        Self::new(err.status(), err.body_text())
    }
}

#[derive(Serialize)]
pub struct Health {
    pub message: &'static str,
    pub version: &'static str,
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct DeletePhotoResponse {
    pub message: &'static str,
    pub file_deleted: bool,
}

// Logs all 4xx/5xx responses with method, URI, status and latency.
async fn log_error_responses(req: axum::extract::Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let start = Instant::now();
    let res = next.run(req).await;
    let status = res.status();
    if status.is_server_error() {
        tracing::error!(%method, %uri, %status, elapsed_ms = start.elapsed().as_millis(), "http 5xx");
    } else if status.is_client_error() {
        tracing::warn!(%method, %uri, %status, elapsed_ms = start.elapsed().as_millis(), "http 4xx");
    }
    res
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let trace = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO))
        .on_failure(DefaultOnFailure::new().level(Level::ERROR));

    let upload_limit =
        usize::try_from(state.settings.max_upload_bytes).unwrap_or(usize::MAX) + FORM_OVERHEAD_BYTES;

    Router::new()
        .route("/api/", get(health))
        .route(
            "/api/photos",
            get(list_photos)
                .post(create_photo)
                .layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route(
            "/api/photos/{id}",
            get(get_photo).put(update_photo).delete(delete_photo),
        )
        .route("/api/photos/{id}/file", get(photo_file))
        .route("/api/messages", get(list_messages).post(create_message))
        .route(
            "/api/messages/{id}",
            get(get_message).put(update_message).delete(delete_message),
        )
        .with_state(state)
        .layer(cors)
        .layer(trace)
        .layer(middleware::from_fn(log_error_responses))
}

/// Serve the HTTP API on `bind` (a socket address such as `0.0.0.0:8001`).
pub async fn serve(app: Router, bind: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = bind.parse()?;
    tracing::info!(addr=%addr, "starting http server");
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}

pub async fn health() -> Json<Health> {
    Json(Health {
        message: "Digital Photo Album API is running",
        version: env!("CARGO_PKG_VERSION"),
        status: "healthy",
    })
}

pub async fn list_photos(State(state): State<AppState>) -> Json<Vec<Photo>> {
    Json(state.catalog.list_photos().await)
}

pub async fn get_photo(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Photo>, ApiError> {
    state
        .catalog
        .get_photo(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Photo"))
}

fn required(fields: &mut HashMap<String, String>, name: &str) -> Result<String, ApiError> {
    fields.remove(name).ok_or_else(|| {
        ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("missing form field '{name}'"),
        )
    })
}

#[instrument(skip_all)]
pub async fn create_photo(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Photo>, ApiError> {
    let mut upload: Option<Upload> = None;
    let mut fields: HashMap<String, String> = HashMap::new();
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            let original_filename = field.file_name().unwrap_or("upload").to_string();
            let content_type = field.content_type().map(str::to_string);
            let bytes = field.bytes().await?.to_vec();
            upload = Some(Upload {
                bytes,
                declared_len: None,
                content_type,
                original_filename,
            });
        } else {
            let text = field.text().await?;
            fields.insert(name, text);
        }
    }
    let upload = upload.ok_or_else(|| {
        ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, "missing form field 'file'")
    })?;

    let raw_date = required(&mut fields, "date")?;
    let date = catalog::parse_photo_date(&raw_date).ok_or_else(|| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("Invalid data format: bad date '{raw_date}'"),
        )
    })?;
    let tags = match fields.remove("tags") {
        Some(raw) if !raw.trim().is_empty() => serde_json::from_str::<Vec<String>>(&raw)
            .map_err(|e| {
                ApiError::new(
                    StatusCode::BAD_REQUEST,
                    format!("Invalid data format: tags: {e}"),
                )
            })?,
        _ => Vec::new(),
    };
    let meta = NewPhoto {
        title: required(&mut fields, "title")?,
        caption: required(&mut fields, "caption")?,
        memory_note: required(&mut fields, "memory_note")?,
        date,
        location: required(&mut fields, "location")?,
        tags,
    };

    let stored = state.storage.save_photo(upload, date).await?;
    let photo = Photo::new(meta, &stored);
    match state.catalog.insert_photo(photo).await {
        Ok(photo) => {
            tracing::info!(id = %photo.id, filename = %photo.filename, "photo created");
            Ok(Json(photo))
        }
        Err(e) => {
            state.storage.delete_file(&stored.filename, &stored.date).await;
            Err(ApiError::internal("Failed to create photo", e))
        }
    }
}

pub async fn update_photo(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(patch): Json<PhotoUpdate>,
) -> Result<Json<Photo>, ApiError> {
    let existing = state
        .catalog
        .get_photo(&id)
        .await
        .ok_or_else(|| ApiError::not_found("Photo"))?;
    let new_date = patch.date;
    // Keep the (directory, filename) handle valid when the logical date moves.
    if let Some(to) = new_date {
        state
            .storage
            .relocate(&existing.filename, &existing.date, &to)
            .await
            .map_err(|e| ApiError::internal("Failed to move photo file", e))?;
    }
    match state.catalog.update_photo(&id, patch).await {
        Ok(Some(photo)) => Ok(Json(photo)),
        Ok(None) => Err(ApiError::not_found("Photo")),
        Err(e) => {
            if let Some(to) = new_date
                && let Err(back) = state
                    .storage
                    .relocate(&existing.filename, &to, &existing.date)
                    .await
            {
                tracing::error!(id = %id, error = %back, "failed to move photo file back after catalog error");
            }
            Err(ApiError::internal("Failed to update photo", e))
        }
    }
}

pub async fn delete_photo(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<DeletePhotoResponse>, ApiError> {
    let photo = state
        .catalog
        .get_photo(&id)
        .await
        .ok_or_else(|| ApiError::not_found("Photo"))?;
    let file_deleted = state.storage.delete_file(&photo.filename, &photo.date).await;
    state
        .catalog
        .delete_photo(&id)
        .await
        .map_err(|e| ApiError::internal("Failed to delete photo", e))?
        .ok_or_else(|| ApiError::not_found("Photo"))?;
    Ok(Json(DeletePhotoResponse {
        message: "Photo deleted successfully",
        file_deleted,
    }))
}

/// Header-safe rendition of a user supplied filename.
fn disposition_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_graphic() && c != '"' && c != '\\' || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub async fn photo_file(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let photo = state
        .catalog
        .get_photo(&id)
        .await
        .ok_or_else(|| ApiError::not_found("Photo"))?;
    let path = state
        .storage
        .file_path(&photo.filename, &photo.date)
        .ok_or_else(|| ApiError::not_found("Photo file"))?;
    if !state.storage.file_exists(&photo.filename, &photo.date).await {
        return Err(ApiError::not_found("Photo file"));
    }
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| ApiError::internal("Failed to read photo file", e))?;
    // Records written before the MIME type was tracked carry an empty one.
    let content_type = if photo.mime_type.is_empty() {
        media::mime_for_content(&path, &bytes)
    } else {
        photo.mime_type.clone()
    };
    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (
                header::CACHE_CONTROL,
                "public, max-age=31536000".to_string(),
            ),
            (header::ETAG, format!("\"{}\"", photo.id)),
            (
                header::CONTENT_DISPOSITION,
                format!(
                    "inline; filename=\"{}\"",
                    disposition_name(&photo.original_filename)
                ),
            ),
        ],
        bytes,
    )
        .into_response())
}

pub async fn list_messages(State(state): State<AppState>) -> Json<Vec<BirthdayMessage>> {
    Json(state.catalog.list_messages().await)
}

pub async fn get_message(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<BirthdayMessage>, ApiError> {
    state
        .catalog
        .get_message(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Message"))
}

pub async fn create_message(
    State(state): State<AppState>,
    Json(payload): Json<BirthdayMessageCreate>,
) -> Result<Json<BirthdayMessage>, ApiError> {
    state
        .catalog
        .insert_message(BirthdayMessage::new(payload))
        .await
        .map(Json)
        .map_err(|e| ApiError::internal("Failed to create message", e))
}

pub async fn update_message(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(patch): Json<BirthdayMessageUpdate>,
) -> Result<Json<BirthdayMessage>, ApiError> {
    state
        .catalog
        .update_message(&id, patch)
        .await
        .map_err(|e| ApiError::internal("Failed to update message", e))?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Message"))
}

pub async fn delete_message(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .catalog
        .delete_message(&id)
        .await
        .map_err(|e| ApiError::internal("Failed to delete message", e))?
        .ok_or_else(|| ApiError::not_found("Message"))?;
    Ok(Json(
        json!({ "message": "Birthday message deleted successfully" }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orientation::Orientation;
    use crate::orientation::tests::{asymmetric, jpeg_with_orientation};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    const BOUNDARY: &str = "photoalbum-test-boundary";

    async fn app(root: &std::path::Path) -> Router {
        let settings = Arc::new(Settings::for_root(root));
        let storage = PhotoStorage::new(&settings);
        storage.init().await.unwrap();
        let catalog = Catalog::open(&settings.catalog_path).await.unwrap();
        router(AppState {
            settings,
            storage: Arc::new(storage),
            catalog: Arc::new(catalog),
        })
    }

    async fn json_body(res: Response) -> Value {
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn multipart_body(file: &[u8], mime: &str, date: &str) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in [
            ("title", "Beach day"),
            ("caption", "Sandy"),
            ("memory_note", "Windy but fun"),
            ("date", date),
            ("location", "Coast"),
            ("tags", r#"["summer","family"]"#),
        ] {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"IMG_0001.JPG\"\r\nContent-Type: {mime}\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(file);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(body: Vec<u8>) -> Request<Body> {
        Request::post("/api/photos")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let root = tempfile::tempdir().unwrap();
        let res = app(root.path())
            .await
            .oneshot(Request::get("/api/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["status"], "healthy");
    }

    #[tokio::test]
    async fn photo_lifecycle() {
        let root = tempfile::tempdir().unwrap();
        let app = app(root.path()).await;
        let jpeg = jpeg_with_orientation(&asymmetric(), Orientation::Rotate90Cw);

        let res = app
            .clone()
            .oneshot(upload_request(multipart_body(
                &jpeg,
                "image/jpeg",
                "2023-05-20T10:00:00Z",
            )))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let photo = json_body(res).await;
        let id = photo["id"].as_str().unwrap().to_string();
        let filename = photo["filename"].as_str().unwrap().to_string();
        assert_eq!(photo["original_filename"], "IMG_0001.JPG");
        assert_eq!(photo["mime_type"], "image/jpeg");
        assert_eq!(photo["file_size"], jpeg.len() as u64);
        assert_eq!(photo["tags"], serde_json::json!(["summer", "family"]));
        assert!(root.path().join("photos/2023/05").join(&filename).is_file());

        let res = app
            .clone()
            .oneshot(
                Request::get(format!("/api/photos/{id}/file"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[header::CONTENT_TYPE], "image/jpeg");
        assert_eq!(res.headers()[header::ETAG], format!("\"{id}\""));

        let res = app
            .clone()
            .oneshot(json_request(
                "PUT",
                &format!("/api/photos/{id}"),
                serde_json::json!({"title": "Renamed", "date": "2024-01-02T00:00:00Z", "caption": null}),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let updated = json_body(res).await;
        assert_eq!(updated["title"], "Renamed");
        assert_eq!(updated["caption"], "Sandy");
        assert!(root.path().join("photos/2024/01").join(&filename).is_file());
        assert!(!root.path().join("photos/2023/05").join(&filename).exists());

        let res = app
            .clone()
            .oneshot(
                Request::delete(format!("/api/photos/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["file_deleted"], true);

        let res = app
            .oneshot(
                Request::get(format!("/api/photos/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn pdf_upload_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let res = app(root.path())
            .await
            .oneshot(upload_request(multipart_body(
                b"%PDF-1.4",
                "application/pdf",
                "2023-05-20",
            )))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(res).await["detail"].is_string());
    }

    #[tokio::test]
    async fn bad_date_is_a_client_error() {
        let root = tempfile::tempdir().unwrap();
        let jpeg = jpeg_with_orientation(&asymmetric(), Orientation::Identity);
        let res = app(root.path())
            .await
            .oneshot(upload_request(multipart_body(&jpeg, "image/jpeg", "someday")))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn message_crud() {
        let root = tempfile::tempdir().unwrap();
        let app = app(root.path()).await;

        let res = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/messages",
                serde_json::json!({"title": "From Sam", "message": "Happy birthday!"}),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let id = json_body(res).await["id"].as_str().unwrap().to_string();

        let res = app
            .clone()
            .oneshot(json_request(
                "PUT",
                &format!("/api/messages/{id}"),
                serde_json::json!({"message": "Happy 40th!"}),
            ))
            .await
            .unwrap();
        let body = json_body(res).await;
        assert_eq!(body["title"], "From Sam");
        assert_eq!(body["message"], "Happy 40th!");

        let res = app
            .clone()
            .oneshot(Request::get("/api/messages").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(json_body(res).await.as_array().unwrap().len(), 1);

        let res = app
            .clone()
            .oneshot(
                Request::delete(format!("/api/messages/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let res = app
            .oneshot(
                Request::delete(format!("/api/messages/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn record_without_mime_type_is_served_by_content() {
        let root = tempfile::tempdir().unwrap();
        let settings = Arc::new(Settings::for_root(root.path()));
        let storage = PhotoStorage::new(&settings);
        let catalog = Arc::new(Catalog::open(&settings.catalog_path).await.unwrap());

        let mut png = Vec::new();
        asymmetric()
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let date = catalog::parse_photo_date("2019-08-01").unwrap();
        let stored = storage
            .save_photo(
                Upload {
                    bytes: png,
                    declared_len: None,
                    content_type: Some("image/png".into()),
                    original_filename: "old.png".into(),
                },
                date,
            )
            .await
            .unwrap();
        let meta = NewPhoto {
            title: "Old".into(),
            caption: String::new(),
            memory_note: String::new(),
            date,
            location: String::new(),
            tags: Vec::new(),
        };
        let mut photo = Photo::new(meta, &stored);
        photo.mime_type.clear();
        let photo = catalog.insert_photo(photo).await.unwrap();

        let app = router(AppState {
            settings,
            storage: Arc::new(storage),
            catalog,
        });
        let res = app
            .oneshot(
                Request::get(format!("/api/photos/{}/file", photo.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[header::CONTENT_TYPE], "image/png");
    }

    #[test]
    fn disposition_names_are_header_safe() {
        assert_eq!(disposition_name("my \"best\" photo.jpg"), "my _best_ photo.jpg");
        assert_eq!(disposition_name("café.png"), "caf_.png");
    }
}
