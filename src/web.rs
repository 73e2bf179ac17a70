//
// web.rs
// Dicom-Intake-rs
//
// Axum-based HTTP adapter translating upload, batch, status, artifact and preview requests into intake service calls.
//
// Thales Matheus Mendonça Santos - November 2025

use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, DefaultBodyLimit, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    config::Config,
    models::{BatchView, HealthReport, IntakeStats, UploadView},
    preview,
    service::{BatchFile, BatchSubmission, FileSubmission, IntakeService, SubmitError},
    status::QueryError,
};

const FILE_NAME_HEADER: &str = "x-file-name";
const USER_HEADER: &str = "x-user-id";

#[derive(Clone)]
struct AppState {
    service: Arc<IntakeService>,
}

type ApiResult<T> = Result<T, (StatusCode, String)>;

/// Route table over an already wired intake service.
pub fn router(service: Arc<IntakeService>, max_request_bytes: usize) -> Router {
    Router::new()
        .route("/api/upload", post(upload_handler))
        .route("/api/upload/batch", post(batch_handler))
        .route("/api/upload/:id", get(upload_status))
        .route("/api/upload/:id/artifact", get(artifact_handler))
        .route("/api/upload/:id/preview", get(preview_handler))
        .route("/api/batch/:id", get(batch_status))
        .route("/api/batch/:id/files", get(batch_files))
        .route("/api/user/:owner/uploads", get(owner_uploads))
        .route("/api/user/:owner/batches", get(owner_batches))
        .route("/api/stats", get(stats_handler))
        .route("/api/health", get(health_handler))
        .with_state(AppState { service })
        .layer(DefaultBodyLimit::max(max_request_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bootstraps the intake service and serves the API until ctrl-c.
pub async fn start_server(config: &Config) -> anyhow::Result<()> {
    let owned = config.clone();
    let service = Arc::new(tokio::task::spawn_blocking(move || IntakeService::from_config(&owned)).await??);
    let app = router(service.clone(), config.server.max_request_bytes);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!(%addr, mode = %service.health().mode, "intake server listening");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Local mode drains its channel here; accepted jobs are not dropped.
    tokio::task::spawn_blocking(move || service.shutdown()).await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

async fn upload_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let filename = header_value(&headers, FILE_NAME_HEADER)
        .ok_or_else(|| bad_request(format!("missing {FILE_NAME_HEADER} header")))?;
    let submission = FileSubmission {
        filename,
        content_type: header_value(&headers, header::CONTENT_TYPE.as_str()),
        bytes: body.to_vec(),
        owner_id: header_value(&headers, USER_HEADER),
        origin: Some(addr.ip().to_string()),
    };

    let service = state.service.clone();
    let upload_id = blocking(move || service.submit(submission))
        .await?
        .map_err(submit_error)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "upload_id": upload_id, "status": "received" })),
    ))
}

#[derive(Debug, Deserialize)]
struct BatchFilePayload {
    filename: String,
    /// Base64 of the raw file.
    content: String,
    #[serde(default)]
    content_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BatchPayload {
    files: Vec<BatchFilePayload>,
}

async fn batch_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<BatchPayload>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let files = payload
        .files
        .into_iter()
        .map(|file| {
            let bytes = STANDARD
                .decode(file.content.trim())
                .map_err(|e| bad_request(format!("{}: invalid base64 content: {e}", file.filename)))?;
            Ok(BatchFile {
                filename: file.filename,
                content_type: file.content_type,
                bytes,
            })
        })
        .collect::<ApiResult<Vec<_>>>()?;
    let total = files.len();
    let submission = BatchSubmission {
        files,
        owner_id: header_value(&headers, USER_HEADER),
        origin: Some(addr.ip().to_string()),
    };

    let service = state.service.clone();
    let batch_id = blocking(move || service.submit_batch(submission))
        .await?
        .map_err(submit_error)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "batch_id": batch_id, "total_files": total, "status": "queued" })),
    ))
}

async fn upload_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<UploadView>> {
    let service = state.service.clone();
    let view = blocking(move || service.get_upload_status(&id))
        .await?
        .map_err(query_error)?;
    Ok(Json(view))
}

/// Stored artifact as written: ciphertext (nonce first) when sealing encrypts.
async fn artifact_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let service = state.service.clone();
    let lookup = id.clone();
    let artifact = blocking(move || service.get_sealed_artifact(&lookup))
        .await?
        .map_err(query_error)?;

    let (content_type, extension) = if artifact.encrypted {
        ("application/octet-stream", "dcm.enc")
    } else {
        ("application/dicom", "dcm")
    };
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!("attachment; filename=\"{id}.{extension}\""))
            .map_err(internal_error)?,
    );
    headers.insert(
        "x-content-hash",
        HeaderValue::from_str(&artifact.content_hash).map_err(internal_error)?,
    );
    headers.insert(
        "x-encrypted",
        HeaderValue::from_static(if artifact.encrypted { "true" } else { "false" }),
    );
    if let Some(nonce) = &artifact.nonce {
        headers.insert("x-nonce", HeaderValue::from_str(nonce).map_err(internal_error)?);
    }

    Ok((headers, artifact.bytes))
}

async fn preview_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let service = state.service.clone();
    // Unseal, verify and render on the blocking pool; pixel decoding is CPU bound.
    let png = blocking(move || {
        let part10 = service.export_artifact(&id).map_err(query_error)?;
        preview::first_frame_png(&part10)
            .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, format!("{e:#}")))
    })
    .await??;
    Ok(([(header::CONTENT_TYPE, "image/png")], png))
}

async fn batch_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<BatchView>> {
    let service = state.service.clone();
    let view = blocking(move || service.get_batch_status(&id))
        .await?
        .map_err(query_error)?;
    Ok(Json(view))
}

async fn batch_files(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<UploadView>>> {
    let service = state.service.clone();
    let files = blocking(move || service.get_batch_files(&id))
        .await?
        .map_err(query_error)?;
    Ok(Json(files))
}

async fn owner_uploads(
    State(state): State<AppState>,
    Path(owner): Path<String>,
) -> ApiResult<Json<Vec<UploadView>>> {
    let service = state.service.clone();
    let uploads = blocking(move || service.owner_uploads(&owner))
        .await?
        .map_err(query_error)?;
    Ok(Json(uploads))
}

async fn owner_batches(
    State(state): State<AppState>,
    Path(owner): Path<String>,
) -> ApiResult<Json<Vec<BatchView>>> {
    let service = state.service.clone();
    let batches = blocking(move || service.owner_batches(&owner))
        .await?
        .map_err(query_error)?;
    Ok(Json(batches))
}

async fn stats_handler(State(state): State<AppState>) -> ApiResult<Json<IntakeStats>> {
    let service = state.service.clone();
    let stats = blocking(move || service.stats()).await?.map_err(query_error)?;
    Ok(Json(stats))
}

async fn health_handler(
    State(state): State<AppState>,
) -> ApiResult<(StatusCode, Json<HealthReport>)> {
    let service = state.service.clone();
    let report = blocking(move || service.health()).await?;
    let code = if report.database && report.accepting && report.broker != Some(false) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok((code, Json(report)))
}

/// Run a blocking service call (SQLite, file IO, pixel decoding) off the async workers.
async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(internal_error)
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn submit_error(err: SubmitError) -> (StatusCode, String) {
    let code = match &err {
        SubmitError::Rejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        SubmitError::EmptyBatch | SubmitError::BatchTooLarge { .. } => StatusCode::BAD_REQUEST,
        SubmitError::NotAccepting | SubmitError::Dispatch { .. } => StatusCode::SERVICE_UNAVAILABLE,
        SubmitError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if code.is_server_error() {
        tracing::error!(error = %err, "submission failed");
    }
    (code, err.to_string())
}

fn query_error(err: QueryError) -> (StatusCode, String) {
    match err {
        QueryError::UploadNotFound(_) | QueryError::BatchNotFound(_) => not_found(err),
        QueryError::NotReady { .. } => (StatusCode::CONFLICT, err.to_string()),
        QueryError::Integrity(_)
        | QueryError::Store(_)
        | QueryError::Seal(_)
        | QueryError::Database(_) => {
            tracing::error!(error = %err, "status query failed");
            internal_error(err)
        }
    }
}

fn bad_request<E: Display>(err: E) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, err.to_string())
}

fn internal_error<E: Display>(err: E) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

fn not_found<E: Display>(err: E) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, err.to_string())
}
