//! Media models shared by the upload path, the transcoding worker and the player
//!
//! Holds the duration classifier, the hard limits of the pipeline, the
//! transcode job payload and the JSON bodies of the upload endpoints.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Clips strictly shorter than this are snacks
pub const SNACK_MAX_DURATION_SECS: f64 = 30.0;
/// Sources longer than this are rejected by the worker
pub const MAX_SOURCE_DURATION_SECS: f64 = 120.0;
/// Advisory ceiling for the total size of one job's renditions
pub const OUTPUT_BUDGET_BYTES: u64 = 35 * 1024 * 1024;
/// Hard ceiling of the client content cache
pub const CACHE_BUDGET_BYTES: u64 = 35 * 1024 * 1024;
/// Number of video URLs kept on a POI
pub const RENDITION_CAPACITY: usize = 3;
/// Per-file cap applied by the client before uploading
pub const MAX_UPLOAD_FILE_BYTES: u64 = 15 * 1024 * 1024;
/// Cap on the sum of all files of one submission
pub const MAX_UPLOAD_TOTAL_BYTES: u64 = 95 * 1024 * 1024;
/// Body ceiling of the non-direct-upload HTTP routes
pub const SERVER_BODY_LIMIT_BYTES: usize = 10 * 1024 * 1024;
/// Lifetime of a signed upload URL
pub const SIGNED_URL_TTL_SECS: u64 = 300;

/// Pipeline class of an uploaded video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaClass {
    /// Short clip: one low-bitrate progressive rendition
    Snack,
    /// Longer clip: segmented adaptive rendition plus the low-bitrate fallback
    Dinner,
}

impl MediaClass {
    /// Classify a clip from its probed duration in seconds.
    ///
    /// A duration of zero means the probe failed and takes the full pipeline.
    pub fn classify(duration_secs: f64) -> Self {
        if duration_secs > 0.0 && duration_secs < SNACK_MAX_DURATION_SECS {
            MediaClass::Snack
        } else {
            MediaClass::Dinner
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaClass::Snack => "snack",
            MediaClass::Dinner => "dinner",
        }
    }
}

impl fmt::Display for MediaClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append a video URL to a POI's rendition list, dropping the oldest beyond capacity
pub fn push_rendition(renditions: &mut Vec<String>, url: String) {
    renditions.push(url);
    if renditions.len() > RENDITION_CAPACITY {
        let overflow = renditions.len() - RENDITION_CAPACITY;
        renditions.drain(..overflow);
    }
}

/// Queue payload describing one source video to transcode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscodeJob {
    pub poi_id: Uuid,
    /// Public URL of the raw upload, or a local path
    pub public_url: String,
    pub storage_path: String,
    /// Storage prefix the renditions are written under
    pub output_dir: String,
    pub file_name: String,
    #[serde(rename = "type")]
    pub media_class: MediaClass,
    /// Duration measured by the client, zero when unknown
    pub duration: f64,
}

impl TranscodeJob {
    /// Deterministic rendition prefix for a stored upload, so reruns overwrite
    pub fn output_dir_for(poi_id: Uuid, storage_path: &str) -> String {
        let name = storage_path.rsplit('/').next().unwrap_or(storage_path);
        let stem = match name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => name,
        };
        format!("processed/{}/{}", poi_id, stem)
    }
}

/// Storage keys of the renditions a job produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenditionPaths {
    /// Segmented playlist, only for dinner jobs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high_quality: Option<String>,
    pub low_bitrate: String,
    pub thumbnail: String,
}

/// Outcome of a successful transcode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscodeResult {
    pub rendition_paths: RenditionPaths,
    pub duration_seconds: f64,
    pub total_output_bytes: u64,
}

/// Query of `GET /upload/signed-url`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedUrlQuery {
    pub file_name: String,
    pub bucket: Option<String>,
}

/// Response of `GET /upload/signed-url`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadDestination {
    pub signed_url: String,
    pub token: String,
    pub storage_path: String,
    pub public_url: String,
}

/// Body of `POST /upload/notify`
///
/// Every field is optional on the wire so missing values can be reported as
/// a 400 rather than a deserialization failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyRequest {
    pub poi_id: Option<Uuid>,
    pub public_url: Option<String>,
    pub storage_path: Option<String>,
    #[serde(rename = "type")]
    pub media_class: Option<MediaClass>,
    pub duration: Option<f64>,
    pub file_name: Option<String>,
}

/// Response of `POST /upload/notify`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyResponse {
    pub success: bool,
    pub message: String,
    /// Transcode job created for the upload, absent when queueing failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
}

/// Body of `GET /health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub ts: i64,
}
