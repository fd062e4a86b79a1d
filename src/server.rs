//! Axum router for the upload host.
//!
//! The [`app`] function wires the upload endpoints to the storage engine
//! and returns a ready-to-serve [`axum::Router`].
//!
//! - `POST /uploads`: multipart/form-data; each file part is streamed into
//!   the engine. If any part fails, the parts already stored by this
//!   request are removed again, newest first.
//! - `DELETE /uploads`: JSON descriptor from a previous upload.
//! - `GET /health`, `GET /metrics`.

use std::io;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::{HeaderMap, HeaderValue, Method, Request, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::TryStreamExt;
use metrics::counter;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::ApiError;
use crate::file::{BlobDescriptor, ByteStream, FileInfo, IncomingFile, UploadRequest};
use crate::metrics::{metrics_handler, metrics_middleware, ROLLBACKS_TOTAL};
use crate::AppState;

/// MIME type assumed for parts without a `Content-Type`.
const DEFAULT_PART_CONTENT_TYPE: &str = "application/octet-stream";

/// Build the axum [`Router`] with the upload routes.
pub fn app(state: Arc<AppState>) -> Router {
    let body_limit = state.config.server.max_upload_size;

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/uploads", post(upload_files).delete(remove_upload))
        .with_state(state)
        // Layer ordering: inner layers run first, outer layers wrap them.
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(TraceLayer::new_for_http())
        // metrics_middleware is outer (captures full request lifecycle).
        .layer(middleware::from_fn(metrics_middleware))
        .layer(DefaultBodyLimit::max(body_limit))
}

// -- Common headers middleware -----------------------------------------------

/// Adds `x-request-id` (unless already set), `Date` and `Server` to every
/// response.
async fn common_headers_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    if !headers.contains_key("x-request-id") {
        if let Ok(id) = HeaderValue::from_str(&Uuid::new_v4().simple().to_string()) {
            headers.insert("x-request-id", id);
        }
    }

    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    if let Ok(date) = HeaderValue::from_str(&date) {
        headers.insert("date", date);
    }
    headers.insert("server", HeaderValue::from_static("azure-upload-engine"));

    response
}

// -- Health check ------------------------------------------------------------

/// `GET /health` -- Returns `{"status": "ok"}` with 200 OK.
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

// -- Uploads -----------------------------------------------------------------

/// `POST /uploads` -- store every file part, return their descriptors.
async fn upload_files(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<Vec<BlobDescriptor>>, ApiError> {
    let req = UploadRequest::new(method, uri, headers);
    let mut stored: Vec<BlobDescriptor> = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                rollback(&state, &req, &stored).await;
                return Err(ApiError::BadRequest(e.body_text()));
            }
        };

        // Plain form fields are not files.
        let Some(originalname) = field.file_name().map(str::to_string) else {
            continue;
        };
        let info = FileInfo::new(
            field.name().unwrap_or_default(),
            originalname,
            field.content_type().unwrap_or(DEFAULT_PART_CONTENT_TYPE),
        );
        debug!(
            "Receiving part {} ({}, {})",
            info.fields.fieldname,
            info.original_name(),
            info.mime_type()
        );

        let stream: ByteStream<'_> = Box::pin(field.map_err(io::Error::other));
        match state
            .engine
            .handle_file(&req, IncomingFile::new(info, stream))
            .await
        {
            Ok(descriptor) => stored.push(descriptor),
            Err(e) => {
                warn!("Upload failed after {} stored file(s): {}", stored.len(), e);
                rollback(&state, &req, &stored).await;
                return Err(e.into());
            }
        }
    }

    info!("Stored {} file(s)", stored.len());
    Ok(Json(stored))
}

/// Remove the files stored so far by a failed request, newest first.
/// Removal failures are logged and do not mask the original error.
async fn rollback(state: &AppState, req: &UploadRequest, stored: &[BlobDescriptor]) {
    if stored.is_empty() {
        return;
    }
    counter!(ROLLBACKS_TOTAL).increment(1);

    for descriptor in stored.iter().rev() {
        let file = descriptor.file_info();
        if let Err(e) = state.engine.remove_file(req, &file).await {
            warn!(
                "Rollback could not remove {}/{}: {}",
                descriptor.container_name, descriptor.blob_name, e
            );
        }
    }
}

/// `DELETE /uploads` -- remove the blob described by the JSON body.
async fn remove_upload(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Json(descriptor): Json<BlobDescriptor>,
) -> Result<StatusCode, ApiError> {
    let req = UploadRequest::new(method, uri, headers);
    state
        .engine
        .remove_file(&req, &descriptor.file_info())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::AzureBlobEngine;
    use crate::options::EngineOptions;
    use crate::resolver::{generate_blob_name, Resolver};
    use crate::storage::memory::MemoryBlobBackend;
    use axum::body::Body;
    use tower::ServiceExt;

    const BOUNDARY: &str = "X-UPLOAD-BOUNDARY";

    fn test_app(options: EngineOptions) -> (Router, Arc<MemoryBlobBackend>) {
        let backend = Arc::new(MemoryBlobBackend::new());
        let engine = AzureBlobEngine::with_backend(options, backend.clone()).unwrap();
        let state = Arc::new(AppState {
            config: Config::default(),
            engine: Arc::new(engine),
        });
        (app(state), backend)
    }

    fn file_part(field: &str, filename: &str, content_type: &str, data: &str) -> String {
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n{data}\r\n"
        )
    }

    fn text_part(field: &str, value: &str) -> String {
        format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"\r\n\r\n{value}\r\n")
    }

    fn multipart_request(parts: &[String]) -> Request<Body> {
        let body = format!("{}--{BOUNDARY}--\r\n", parts.concat());
        Request::builder()
            .method("POST")
            .uri("/uploads")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_bytes(response: Response) -> bytes::Bytes {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _) = test_app(EngineOptions::new().container_name("uploads"));
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        assert_eq!(&body_bytes(response).await[..], br#"{"status":"ok"}"#);
    }

    #[tokio::test]
    async fn test_upload_returns_descriptors() {
        let (app, backend) = test_app(EngineOptions::new().container_name("uploads"));
        let request = multipart_request(&[
            file_part("avatar", "photo.png", "image/png", "PNGDATA"),
            text_part("note", "not a file"),
            file_part("doc", "readme.txt", "text/plain", "hello"),
        ]);

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let descriptors: Vec<BlobDescriptor> =
            serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].file.fieldname, "avatar");
        assert_eq!(descriptors[0].file.mimetype, "image/png");
        assert!(descriptors[0].blob_name.ends_with(".png"));
        assert!(descriptors[1].blob_name.ends_with(".txt"));
        assert_eq!(backend.blob_count("uploads").await, 2);

        let stored = backend
            .blob("uploads", &descriptors[1].blob_name)
            .await
            .unwrap();
        assert_eq!(&stored.data[..], b"hello");
    }

    #[tokio::test]
    async fn test_failed_part_rolls_back_earlier_parts() {
        let (app, backend) = test_app(
            EngineOptions::new()
                .container_name("uploads")
                .blob_name(Resolver::from_sync(|_: &UploadRequest, file: &FileInfo| {
                    if file.original_name() == "bad.txt" {
                        anyhow::bail!("rejected name");
                    }
                    Ok(generate_blob_name(file.original_name()))
                })),
        );
        let request = multipart_request(&[
            file_part("a", "one.txt", "text/plain", "1"),
            file_part("b", "two.txt", "text/plain", "2"),
            file_part("c", "bad.txt", "text/plain", "3"),
        ]);

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body["error"]["code"], "ResolutionError");
        assert_eq!(backend.blob_count("uploads").await, 0);
    }

    #[tokio::test]
    async fn test_transport_failure_is_bad_gateway() {
        let (app, _) = test_app(
            EngineOptions::new()
                .container_name("uploads")
                .auto_create_container(false),
        );
        let request = multipart_request(&[file_part("a", "one.txt", "text/plain", "1")]);

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_remove_upload() {
        let (app, backend) = test_app(EngineOptions::new().container_name("uploads"));

        let response = app
            .clone()
            .oneshot(multipart_request(&[file_part(
                "avatar",
                "photo.png",
                "image/png",
                "PNGDATA",
            )]))
            .await
            .unwrap();
        let descriptors: Vec<BlobDescriptor> =
            serde_json::from_slice(&body_bytes(response).await).unwrap();

        let delete = Request::delete("/uploads")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&descriptors[0]).unwrap()))
            .unwrap();
        let response = app.clone().oneshot(delete).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(backend.blob_count("uploads").await, 0);

        // Removing again is still a success.
        let delete = Request::delete("/uploads")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&descriptors[0]).unwrap()))
            .unwrap();
        let response = app.oneshot(delete).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_upload_without_multipart_is_rejected() {
        let (app, _) = test_app(EngineOptions::new().container_name("uploads"));
        let request = Request::post("/uploads")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert!(response.status().is_client_error());
    }
}
