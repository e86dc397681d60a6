//! Client side of the upload flow
//!
//! `idle → detectingDuration → requestingUploadDestination → uploading →
//! notifyingBackend → ready | failed`. The file is streamed straight to the
//! signed storage URL; the api only ever sees the JSON calls around it.
//! Nothing here retries, a failed step ends the flow.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use common::error::ProbeError;
use common::media::{
    MAX_UPLOAD_FILE_BYTES, MAX_UPLOAD_TOTAL_BYTES, MediaClass, NotifyRequest, NotifyResponse,
    UploadDestination,
};
use common::probe::probe_media;
use common::storage::content_type_for;

fn megabytes(bytes: &u64) -> String {
    format!("{:.1}", *bytes as f64 / (1024.0 * 1024.0))
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("{name} is {} MB, videos are limited to {} MB", megabytes(.size), megabytes(&MAX_UPLOAD_FILE_BYTES))]
    FileTooLarge { name: String, size: u64 },

    #[error("Selected videos total {} MB, the limit is {} MB", megabytes(.total), megabytes(&MAX_UPLOAD_TOTAL_BYTES))]
    SelectionTooLarge { total: u64 },

    #[error("Upload was refused: {0}")]
    Signing(String),

    #[error("Network error, please try again: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Storage rejected the upload with status {0}")]
    Transfer(u16),

    #[error("Point of interest {0} not found")]
    NotFound(Uuid),

    #[error("Backend answered {status}: {message}")]
    Backend { status: u16, message: String },

    #[error("Cannot read video: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum UploadState {
    Idle,
    DetectingDuration,
    RequestingUploadDestination,
    Uploading { percent: u8 },
    NotifyingBackend,
    Ready { media_class: MediaClass },
    Failed { reason: String },
}

pub trait UploadObserver: Send + Sync {
    fn on_state(&self, state: &UploadState);

    /// Called with non-decreasing percentages while bytes are sent
    fn on_progress(&self, percent: u8) {
        self.on_state(&UploadState::Uploading { percent });
    }
}

/// Observer ignoring every notification
pub struct NoopObserver;

impl UploadObserver for NoopObserver {
    fn on_state(&self, _state: &UploadState) {}
}

/// Turns byte counts into percentages that never go backwards
struct ProgressTracker {
    total: u64,
    reported: Option<u8>,
}

impl ProgressTracker {
    fn new(total: u64) -> Self {
        Self {
            total,
            reported: None,
        }
    }

    fn advance(&mut self, sent: u64, observer: &dyn UploadObserver) {
        let percent = if self.total == 0 {
            100
        } else {
            (sent.min(self.total) * 100 / self.total) as u8
        };
        // 100 is only reported once the storage accepted the body
        self.report(percent.min(99), observer);
    }

    fn finish(&mut self, observer: &dyn UploadObserver) {
        self.report(100, observer);
    }

    fn report(&mut self, percent: u8, observer: &dyn UploadObserver) {
        if self.reported.is_some_and(|last| last >= percent) {
            return;
        }
        self.reported = Some(percent);
        observer.on_progress(percent);
    }
}

/// Reads a clip's duration without decoding it
#[async_trait]
pub trait DurationProbe: Send + Sync {
    async fn duration_secs(&self, path: &Path) -> Result<f64, ProbeError>;
}

pub struct FfprobeDuration {
    ffprobe: String,
}

impl FfprobeDuration {
    pub fn new(ffprobe: impl Into<String>) -> Self {
        Self {
            ffprobe: ffprobe.into(),
        }
    }
}

#[async_trait]
impl DurationProbe for FfprobeDuration {
    async fn duration_secs(&self, path: &Path) -> Result<f64, ProbeError> {
        probe_media(&self.ffprobe, path).await?.require_duration()
    }
}

/// A video picked for upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedFile {
    pub path: PathBuf,
    pub name: String,
    pub size_bytes: u64,
}

impl SelectedFile {
    pub async fn from_path(path: impl Into<PathBuf>) -> Result<Self, UploadError> {
        let path = path.into();
        let size_bytes = tokio::fs::metadata(&path).await?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video".to_string());
        Ok(Self {
            path,
            name,
            size_bytes,
        })
    }
}

/// Enforce the per-video and per-submission size caps
pub fn validate_selection(files: &[SelectedFile]) -> Result<(), UploadError> {
    if let Some(file) = files.iter().find(|f| f.size_bytes > MAX_UPLOAD_FILE_BYTES) {
        return Err(UploadError::FileTooLarge {
            name: file.name.clone(),
            size: file.size_bytes,
        });
    }

    let total: u64 = files.iter().map(|f| f.size_bytes).sum();
    if total > MAX_UPLOAD_TOTAL_BYTES {
        return Err(UploadError::SelectionTooLarge { total });
    }
    Ok(())
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

async fn error_message(response: reqwest::Response) -> String {
    let status = response.status();
    match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status.to_string(),
    }
}

pub struct UploadClient {
    http: reqwest::Client,
    api_base: String,
    probe: Arc<dyn DurationProbe>,
}

impl UploadClient {
    pub fn new(http: reqwest::Client, api_base: &str, probe: Arc<dyn DurationProbe>) -> Self {
        Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            probe,
        }
    }

    pub async fn request_destination(
        &self,
        file_name: &str,
        bucket: Option<&str>,
    ) -> Result<UploadDestination, UploadError> {
        let mut query = vec![("fileName", file_name)];
        if let Some(bucket) = bucket {
            query.push(("bucket", bucket));
        }

        let response = self
            .http
            .get(format!("{}/upload/signed-url", self.api_base))
            .query(&query)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(UploadError::Signing(error_message(response).await));
        }
        Ok(response.json().await?)
    }

    /// Stream a file to a signed URL with a PUT, reporting progress
    pub async fn upload_direct(
        &self,
        signed_url: &str,
        path: &Path,
        observer: &dyn UploadObserver,
    ) -> Result<(), UploadError> {
        let file = tokio::fs::File::open(path).await?;
        let total = file.metadata().await?.len();

        let (sent_tx, mut sent_rx) = mpsc::unbounded_channel();
        let mut sent = 0u64;
        let body = ReaderStream::new(file).map(move |chunk| {
            if let Ok(bytes) = &chunk {
                sent += bytes.len() as u64;
                let _ = sent_tx.send(sent);
            }
            chunk
        });

        let request = self
            .http
            .put(signed_url)
            .header(CONTENT_LENGTH, total)
            .header(CONTENT_TYPE, content_type_for(path))
            .body(reqwest::Body::wrap_stream(body))
            .send();
        tokio::pin!(request);

        let mut tracker = ProgressTracker::new(total);
        tracker.advance(0, observer);
        let response = loop {
            tokio::select! {
                biased;
                Some(sent) = sent_rx.recv() => tracker.advance(sent, observer),
                response = &mut request => break response?,
            }
        };
        while let Ok(sent) = sent_rx.try_recv() {
            tracker.advance(sent, observer);
        }

        if !response.status().is_success() {
            return Err(UploadError::Transfer(response.status().as_u16()));
        }
        tracker.finish(observer);
        debug!("Uploaded {} bytes from {}", total, path.display());
        Ok(())
    }

    pub async fn notify_backend(
        &self,
        request: &NotifyRequest,
    ) -> Result<NotifyResponse, UploadError> {
        let response = self
            .http
            .post(format!("{}/upload/notify", self.api_base))
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(UploadError::NotFound(request.poi_id.unwrap_or_default()));
        }
        if !status.is_success() {
            return Err(UploadError::Backend {
                status: status.as_u16(),
                message: error_message(response).await,
            });
        }
        Ok(response.json().await?)
    }

    /// Run the whole flow for one video, ending in `Ready` or `Failed`
    pub async fn upload(
        &self,
        poi_id: Uuid,
        file: &SelectedFile,
        bucket: Option<&str>,
        observer: &dyn UploadObserver,
    ) -> Result<MediaClass, UploadError> {
        let result = self.run(poi_id, file, bucket, observer).await;
        match &result {
            Ok(media_class) => {
                info!("Uploaded {} as {}", file.name, media_class);
                observer.on_state(&UploadState::Ready {
                    media_class: *media_class,
                });
            }
            Err(e) => {
                warn!("Upload of {} failed: {}", file.name, e);
                observer.on_state(&UploadState::Failed {
                    reason: e.to_string(),
                });
            }
        }
        result
    }

    async fn run(
        &self,
        poi_id: Uuid,
        file: &SelectedFile,
        bucket: Option<&str>,
        observer: &dyn UploadObserver,
    ) -> Result<MediaClass, UploadError> {
        validate_selection(std::slice::from_ref(file))?;

        observer.on_state(&UploadState::DetectingDuration);
        let duration = match self.probe.duration_secs(&file.path).await {
            Ok(duration) => duration,
            Err(e) => {
                debug!("Duration of {} unknown: {}", file.name, e);
                0.0
            }
        };
        let media_class = MediaClass::classify(duration);

        observer.on_state(&UploadState::RequestingUploadDestination);
        let destination = self.request_destination(&file.name, bucket).await?;

        self.upload_direct(&destination.signed_url, &file.path, observer)
            .await?;

        observer.on_state(&UploadState::NotifyingBackend);
        self.notify_backend(&NotifyRequest {
            poi_id: Some(poi_id),
            public_url: Some(destination.public_url),
            storage_path: Some(destination.storage_path),
            media_class: Some(media_class),
            duration: Some(duration),
            file_name: Some(file.name.clone()),
        })
        .await?;

        Ok(media_class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use axum::extract::{Query, State};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::{get, post, put};
    use axum::{Json, Router};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MB: u64 = 1024 * 1024;

    #[derive(Default)]
    struct Recorded {
        requests: AtomicUsize,
        uploaded: Mutex<Option<(String, usize)>>,
        notified: Mutex<Option<serde_json::Value>>,
    }

    #[derive(Clone)]
    struct Backend {
        base: String,
        reject_signing: bool,
        known_poi: Uuid,
        recorded: Arc<Recorded>,
    }

    async fn signed_url(
        State(backend): State<Backend>,
        Query(query): Query<HashMap<String, String>>,
    ) -> axum::response::Response {
        backend.recorded.requests.fetch_add(1, Ordering::SeqCst);
        if backend.reject_signing {
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": "storage quota exceeded" })),
            )
                .into_response();
        }
        let storage_path = format!("raw/{}", query["fileName"]);
        Json(UploadDestination {
            signed_url: format!("{}/storage/{}", backend.base, storage_path),
            token: "sig".to_string(),
            public_url: format!("https://cdn/{}", storage_path),
            storage_path,
        })
        .into_response()
    }

    async fn storage_put(
        State(backend): State<Backend>,
        axum::extract::Path(key): axum::extract::Path<String>,
        body: Bytes,
    ) -> StatusCode {
        backend.recorded.requests.fetch_add(1, Ordering::SeqCst);
        *backend.recorded.uploaded.lock().unwrap() = Some((key, body.len()));
        StatusCode::OK
    }

    async fn notify(
        State(backend): State<Backend>,
        Json(body): Json<serde_json::Value>,
    ) -> axum::response::Response {
        backend.recorded.requests.fetch_add(1, Ordering::SeqCst);
        let known = body["poiId"] == json!(backend.known_poi);
        *backend.recorded.notified.lock().unwrap() = Some(body);
        if !known {
            return (StatusCode::NOT_FOUND, Json(json!({ "error": "POI not found" })))
                .into_response();
        }
        Json(NotifyResponse {
            success: true,
            message: "queued".to_string(),
            job_id: None,
        })
        .into_response()
    }

    async fn backend(reject_signing: bool) -> Backend {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend = Backend {
            base: format!("http://{}", listener.local_addr().unwrap()),
            reject_signing,
            known_poi: Uuid::new_v4(),
            recorded: Arc::new(Recorded::default()),
        };
        let app = Router::new()
            .route("/upload/signed-url", get(signed_url))
            .route("/upload/notify", post(notify))
            .route("/storage/raw/:key", put(storage_put))
            .with_state(backend.clone());
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        backend
    }

    struct FixedDuration(Option<f64>);

    #[async_trait]
    impl DurationProbe for FixedDuration {
        async fn duration_secs(&self, _path: &Path) -> Result<f64, ProbeError> {
            self.0.ok_or(ProbeError::MissingDuration)
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<UploadState>>);

    impl UploadObserver for Recorder {
        fn on_state(&self, state: &UploadState) {
            self.0.lock().unwrap().push(state.clone());
        }
    }

    impl Recorder {
        fn states(&self) -> Vec<UploadState> {
            self.0.lock().unwrap().clone()
        }
    }

    fn client(backend: &Backend, duration: Option<f64>) -> UploadClient {
        UploadClient::new(
            reqwest::Client::new(),
            &backend.base,
            Arc::new(FixedDuration(duration)),
        )
    }

    async fn video(dir: &tempfile::TempDir, len: usize) -> SelectedFile {
        let path = dir.path().join("clip.mp4");
        tokio::fs::write(&path, vec![1u8; len]).await.unwrap();
        SelectedFile::from_path(path).await.unwrap()
    }

    fn selected(name: &str, size_bytes: u64) -> SelectedFile {
        SelectedFile {
            path: PathBuf::from(name),
            name: name.to_string(),
            size_bytes,
        }
    }

    #[test]
    fn selection_caps_each_file_and_the_total() {
        assert!(validate_selection(&[selected("a.mp4", 15 * MB)]).is_ok());

        let err = validate_selection(&[selected("a.mp4", 15 * MB + 1)]).unwrap_err();
        assert!(matches!(err, UploadError::FileTooLarge { .. }));
        assert!(err.to_string().contains("limited to 15.0 MB"));

        let six: Vec<_> = (0..6).map(|n| selected(&format!("{n}.mp4"), 15 * MB)).collect();
        assert!(validate_selection(&six).is_ok());

        let seven: Vec<_> = (0..7).map(|n| selected(&format!("{n}.mp4"), 14 * MB)).collect();
        let err = validate_selection(&seven).unwrap_err();
        assert!(matches!(err, UploadError::SelectionTooLarge { total } if total == 98 * MB));
    }

    #[test]
    fn progress_never_goes_backwards() {
        let recorder = Recorder::default();
        let mut tracker = ProgressTracker::new(1000);
        for sent in [0, 250, 100, 250, 999, 1000] {
            tracker.advance(sent, &recorder);
        }
        tracker.finish(&recorder);

        let percents: Vec<u8> = recorder
            .states()
            .into_iter()
            .map(|s| match s {
                UploadState::Uploading { percent } => percent,
                other => panic!("unexpected state {:?}", other),
            })
            .collect();
        assert_eq!(percents, vec![0, 25, 99, 100]);
    }

    #[tokio::test]
    async fn short_clip_goes_through_every_state() {
        let backend = backend(false).await;
        let dir = tempfile::tempdir().unwrap();
        let file = video(&dir, 256 * 1024).await;
        let recorder = Recorder::default();

        let class = client(&backend, Some(12.0))
            .upload(backend.known_poi, &file, None, &recorder)
            .await
            .unwrap();
        assert_eq!(class, MediaClass::Snack);

        let states = recorder.states();
        assert_eq!(states[0], UploadState::DetectingDuration);
        assert_eq!(states[1], UploadState::RequestingUploadDestination);
        assert_eq!(states[2], UploadState::Uploading { percent: 0 });
        let notifying = states
            .iter()
            .position(|s| *s == UploadState::NotifyingBackend)
            .unwrap();
        assert_eq!(states[notifying - 1], UploadState::Uploading { percent: 100 });
        assert_eq!(
            states.last(),
            Some(&UploadState::Ready {
                media_class: MediaClass::Snack
            })
        );

        let uploaded = backend.recorded.uploaded.lock().unwrap().clone();
        assert_eq!(uploaded, Some(("clip.mp4".to_string(), 256 * 1024)));

        let notified = backend.recorded.notified.lock().unwrap().clone().unwrap();
        assert_eq!(notified["type"], "snack");
        assert_eq!(notified["duration"], 12.0);
        assert_eq!(notified["storagePath"], "raw/clip.mp4");
        assert_eq!(notified["publicUrl"], "https://cdn/raw/clip.mp4");
        assert_eq!(notified["fileName"], "clip.mp4");
    }

    #[tokio::test]
    async fn unreadable_duration_uploads_as_dinner() {
        let backend = backend(false).await;
        let dir = tempfile::tempdir().unwrap();
        let file = video(&dir, 1024).await;

        let class = client(&backend, None)
            .upload(backend.known_poi, &file, None, &NoopObserver)
            .await
            .unwrap();
        assert_eq!(class, MediaClass::Dinner);

        let notified = backend.recorded.notified.lock().unwrap().clone().unwrap();
        assert_eq!(notified["duration"], 0.0);
        assert_eq!(notified["type"], "dinner");
    }

    #[tokio::test]
    async fn oversized_video_fails_before_any_request() {
        let backend = backend(false).await;
        let recorder = Recorder::default();

        let err = client(&backend, Some(12.0))
            .upload(
                backend.known_poi,
                &selected("huge.mp4", 16 * MB),
                None,
                &recorder,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::FileTooLarge { .. }));
        assert_eq!(backend.recorded.requests.load(Ordering::SeqCst), 0);
        assert!(matches!(
            recorder.states().as_slice(),
            [UploadState::Failed { .. }]
        ));
    }

    #[tokio::test]
    async fn signing_rejection_stops_the_upload() {
        let backend = backend(true).await;
        let dir = tempfile::tempdir().unwrap();
        let file = video(&dir, 1024).await;
        let recorder = Recorder::default();

        let err = client(&backend, Some(12.0))
            .upload(backend.known_poi, &file, Some("media"), &recorder)
            .await
            .unwrap_err();
        assert!(matches!(&err, UploadError::Signing(m) if m == "storage quota exceeded"));
        assert!(backend.recorded.uploaded.lock().unwrap().is_none());
        assert_eq!(
            recorder.states().last(),
            Some(&UploadState::Failed {
                reason: err.to_string()
            })
        );
    }

    #[tokio::test]
    async fn unknown_poi_is_reported() {
        let backend = backend(false).await;
        let dir = tempfile::tempdir().unwrap();
        let file = video(&dir, 1024).await;
        let poi = Uuid::new_v4();

        let err = client(&backend, Some(45.0))
            .upload(poi, &file, None, &NoopObserver)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::NotFound(id) if id == poi));
    }
}
