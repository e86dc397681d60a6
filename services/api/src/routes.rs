//! API service routes

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use common::media::{
    HealthResponse, MediaClass, NotifyRequest, NotifyResponse, SERVER_BODY_LIMIT_BYTES,
    SignedUrlQuery, TranscodeJob, UploadDestination,
};
use common::storage::unique_storage_path;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    AppState,
    error::{ApiError, ApiResult},
};

/// Create the router for the API service
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/upload/signed-url", get(signed_upload_url))
        .route("/upload/notify", post(notify_upload))
        .route("/jobs/:id", get(get_job))
        .route("/queue/counts", get(queue_counts))
        .layer(DefaultBodyLimit::max(SERVER_BODY_LIMIT_BYTES))
        .with_state(state)
}

/// Latency probe; `HEAD` gets the same status with an empty body
pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        ok: true,
        ts: Utc::now().timestamp_millis(),
    })
}

/// Sign a direct-to-storage upload under a fresh storage path
pub async fn signed_upload_url(
    State(state): State<AppState>,
    Query(query): Query<SignedUrlQuery>,
) -> ApiResult<Json<UploadDestination>> {
    if query.file_name.trim().is_empty() {
        return Err(ApiError::BadRequest("fileName is required".to_string()));
    }

    let bucket = query
        .bucket
        .filter(|b| !b.trim().is_empty())
        .unwrap_or_else(|| state.settings.storage.media_bucket.clone());
    let storage_path = unique_storage_path(&query.file_name);

    let signed = state
        .storage
        .sign_upload(&bucket, &storage_path, state.settings.storage.signed_url_ttl())
        .await
        .map_err(|e| {
            error!("Failed to sign upload for {}/{}: {}", bucket, storage_path, e);
            ApiError::Signing(e)
        })?;

    let public_url = state.storage.public_url(&bucket, &storage_path);
    Ok(Json(UploadDestination {
        signed_url: signed.url,
        token: signed.token,
        storage_path,
        public_url,
    }))
}

/// Record a finished upload on its POI and queue it for transcoding
pub async fn notify_upload(
    State(state): State<AppState>,
    Json(payload): Json<NotifyRequest>,
) -> ApiResult<Json<NotifyResponse>> {
    let poi_id = payload
        .poi_id
        .ok_or_else(|| ApiError::BadRequest("poiId is required".to_string()))?;
    let public_url = payload
        .public_url
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("publicUrl is required".to_string()))?;
    if !is_storage_url(&public_url, &state.settings.storage.public_base_url) {
        warn!(poi_id = %poi_id, public_url = %public_url, "Rejected upload outside public storage");
        return Err(ApiError::BadRequest(
            "publicUrl must be an http(s) URL of the public storage".to_string(),
        ));
    }

    // The raw upload is playable from here on, whatever happens to the job
    state
        .pois
        .append_rendition(poi_id, &public_url)
        .await
        .map_err(|e| {
            error!(poi_id = %poi_id, "Failed to append rendition: {}", e);
            ApiError::Internal(e)
        })?
        .ok_or_else(|| ApiError::NotFound(format!("POI {} not found", poi_id)))?;

    let duration = payload.duration.unwrap_or(0.0);
    let media_class = payload
        .media_class
        .unwrap_or_else(|| MediaClass::classify(duration));
    let storage_path = payload
        .storage_path
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| last_segment(&public_url).to_string());
    let file_name = payload
        .file_name
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| last_segment(&storage_path).to_string());

    let job = TranscodeJob {
        poi_id,
        output_dir: TranscodeJob::output_dir_for(poi_id, &storage_path),
        public_url,
        storage_path,
        file_name,
        media_class,
        duration,
    };

    let (message, job_id) = match state
        .queue
        .enqueue(job, state.settings.queue.job_options())
        .await
    {
        Ok(job_id) => {
            info!(poi_id = %poi_id, job_id = %job_id, class = %media_class, "Transcode job queued");
            (
                format!("Upload registered, transcode job {} queued", job_id),
                Some(job_id),
            )
        }
        Err(e) => {
            warn!(
                poi_id = %poi_id,
                error = %e,
                "Failed to enqueue transcode job, raw upload stays available"
            );
            ("Upload registered, transcoding deferred".to_string(), None)
        }
    };

    Ok(Json(NotifyResponse {
        success: true,
        message,
        job_id,
    }))
}

/// Inspect a queued or retained job
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let job = state
        .queue
        .get(id)
        .await
        .map_err(|e| {
            error!(job_id = %id, "Failed to load job: {}", e);
            ApiError::Internal(e)
        })?
        .ok_or_else(|| ApiError::NotFound(format!("Job {} not found", id)))?;

    Ok(Json(job))
}

/// Number of jobs per state
pub async fn queue_counts(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let counts = state.queue.counts().await.map_err(|e| {
        error!("Failed to count jobs: {}", e);
        ApiError::Internal(e)
    })?;

    Ok(Json(counts))
}

/// `true` for an http(s) URL naming an object below `public_base`
fn is_storage_url(url: &str, public_base: &str) -> bool {
    let is_http = url.starts_with("http://") || url.starts_with("https://");
    let base = public_base.trim_end_matches('/');
    is_http
        && url
            .strip_prefix(base)
            .and_then(|rest| rest.strip_prefix('/'))
            .is_some_and(|object| !object.is_empty() && !object.split('/').any(|s| s == ".."))
}

fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
