//! Media metadata probing through `ffprobe`
//!
//! Only container and stream headers are read, never the full payload, so
//! probing is cheap enough for both the client and the worker.

use crate::error::ProbeError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, error};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub duration: Option<f64>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub format: Option<String>,
    pub bitrate: Option<i64>,
}

impl MediaMetadata {
    /// Duration in seconds, failing when the container reports none
    pub fn require_duration(&self) -> Result<f64, ProbeError> {
        self.duration
            .filter(|d| d.is_finite() && *d >= 0.0)
            .ok_or(ProbeError::MissingDuration)
    }
}

/// Run `ffprobe` against a file and parse its JSON report
pub async fn probe_media(ffprobe: &str, path: &Path) -> Result<MediaMetadata, ProbeError> {
    debug!(path = %path.display(), "Probing media");

    let output = Command::new(ffprobe)
        .arg("-v")
        .arg("quiet")
        .arg("-print_format")
        .arg("json")
        .arg("-show_format")
        .arg("-show_streams")
        .arg(path)
        .kill_on_drop(true)
        .output()
        .await?;

    if !output.status.success() {
        error!("ffprobe failed with status: {:?}", output.status);
        return Err(ProbeError::Failed(output.status.to_string()));
    }

    let report: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    Ok(parse_ffprobe_output(&report))
}

/// Extract the fields the pipeline cares about from an `ffprobe` JSON report
pub fn parse_ffprobe_output(report: &serde_json::Value) -> MediaMetadata {
    let mut metadata = MediaMetadata::default();

    if let Some(format) = report.get("format") {
        metadata.duration = format
            .get("duration")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<f64>().ok());
        metadata.format = format
            .get("format_name")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        metadata.bitrate = format
            .get("bit_rate")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<i64>().ok());
    }

    let streams = report
        .get("streams")
        .and_then(|v| v.as_array())
        .map(Vec::as_slice)
        .unwrap_or_default();

    for stream in streams {
        let codec_name = stream
            .get("codec_name")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        match stream.get("codec_type").and_then(|v| v.as_str()) {
            Some("video") if metadata.video_codec.is_none() => {
                metadata.width = stream.get("width").and_then(|v| v.as_i64()).map(|w| w as i32);
                metadata.height = stream.get("height").and_then(|v| v.as_i64()).map(|h| h as i32);
                metadata.video_codec = codec_name;
                // Some containers only carry the duration on the stream
                if metadata.duration.is_none() {
                    metadata.duration = stream
                        .get("duration")
                        .and_then(|v| v.as_str())
                        .and_then(|s| s.parse::<f64>().ok());
                }
            }
            Some("audio") if metadata.audio_codec.is_none() => {
                metadata.audio_codec = codec_name;
            }
            _ => {}
        }
    }

    metadata
}
