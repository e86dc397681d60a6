//! External transcoding engine
//!
//! Every rendition is one `ffmpeg` invocation run to completion, bounded by
//! an encoder thread ceiling and a wall-clock timeout. Probing goes through
//! `ffprobe` and reads headers only.

use async_trait::async_trait;
use common::error::ProbeError;
use common::probe::probe_media;
use common::settings::WorkerSettings;
use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error};

/// Target of one encoded output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenditionProfile {
    pub name: &'static str,
    pub height: u32,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
}

/// Progressive 480p file, produced for every job
pub const LOW_BITRATE: RenditionProfile = RenditionProfile {
    name: "low-bitrate",
    height: 480,
    video_bitrate_kbps: 500,
    audio_bitrate_kbps: 64,
};

/// Segmented 720p rendition, dinner jobs only
pub const ADAPTIVE: RenditionProfile = RenditionProfile {
    name: "adaptive",
    height: 720,
    video_bitrate_kbps: 1500,
    audio_bitrate_kbps: 128,
};

/// Length of each segment of the adaptive rendition
pub const SEGMENT_SECONDS: u32 = 6;

/// Position of the thumbnail frame
pub const THUMBNAIL_AT_SECS: f64 = 1.0;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to start engine: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Engine exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("Engine did not finish within {0:?}")]
    TimedOut(Duration),
}

#[async_trait]
pub trait TranscodeEngine: Send + Sync {
    /// Duration of the media in seconds
    async fn probe_duration(&self, input: &Path) -> Result<f64, ProbeError>;

    /// Single progressive-download file
    async fn encode_progressive(
        &self,
        input: &Path,
        output: &Path,
        profile: &RenditionProfile,
    ) -> Result<(), EngineError>;

    /// Playlist plus fixed-length segments written next to it
    async fn encode_segmented(
        &self,
        input: &Path,
        playlist: &Path,
        profile: &RenditionProfile,
    ) -> Result<(), EngineError>;

    /// One JPEG frame taken at `at_secs`
    async fn thumbnail(&self, input: &Path, output: &Path, at_secs: f64)
    -> Result<(), EngineError>;
}

/// `ffmpeg`/`ffprobe` command-line engine
#[derive(Debug, Clone)]
pub struct FfmpegEngine {
    ffmpeg: String,
    ffprobe: String,
    threads: u32,
    timeout: Duration,
}

impl FfmpegEngine {
    pub fn new(settings: &WorkerSettings) -> Self {
        Self {
            ffmpeg: settings.ffmpeg_path.clone(),
            ffprobe: settings.ffprobe_path.clone(),
            threads: settings.threads.max(1),
            timeout: settings.engine_timeout(),
        }
    }

    fn base_args(&self, input: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-y", "-hide_banner", "-loglevel", "error", "-i"]
            .iter()
            .map(OsString::from)
            .collect();
        args.push(input.as_os_str().to_owned());
        args.push("-threads".into());
        args.push(self.threads.to_string().into());
        args
    }

    fn video_args(profile: &RenditionProfile) -> Vec<OsString> {
        let rate = format!("{}k", profile.video_bitrate_kbps);
        let buffer = format!("{}k", profile.video_bitrate_kbps * 2);
        vec![
            "-vf".into(),
            format!("scale=-2:{}", profile.height).into(),
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "veryfast".into(),
            "-b:v".into(),
            rate.clone().into(),
            "-maxrate".into(),
            rate.into(),
            "-bufsize".into(),
            buffer.into(),
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            format!("{}k", profile.audio_bitrate_kbps).into(),
        ]
    }

    fn progressive_args(&self, input: &Path, output: &Path, profile: &RenditionProfile) -> Vec<OsString> {
        let mut args = self.base_args(input);
        args.extend(Self::video_args(profile));
        args.push("-movflags".into());
        args.push("+faststart".into());
        args.push(output.as_os_str().to_owned());
        args
    }

    fn segmented_args(&self, input: &Path, playlist: &Path, profile: &RenditionProfile) -> Vec<OsString> {
        let segment_pattern = playlist.with_file_name("segment_%03d.ts");
        let mut args = self.base_args(input);
        args.extend(Self::video_args(profile));
        args.extend(
            [
                "-profile:v".to_string(),
                "baseline".to_string(),
                "-level".to_string(),
                "3.1".to_string(),
                "-force_key_frames".to_string(),
                format!("expr:gte(t,n_forced*{})", SEGMENT_SECONDS),
                "-f".to_string(),
                "hls".to_string(),
                "-hls_time".to_string(),
                SEGMENT_SECONDS.to_string(),
                "-hls_playlist_type".to_string(),
                "vod".to_string(),
                "-hls_segment_filename".to_string(),
            ]
            .into_iter()
            .map(OsString::from),
        );
        args.push(segment_pattern.into_os_string());
        args.push(playlist.as_os_str().to_owned());
        args
    }

    fn thumbnail_args(&self, input: &Path, output: &Path, at_secs: f64) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-y".into(),
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-ss".into(),
            format!("{:.3}", at_secs.max(0.0)).into(),
            "-i".into(),
            input.as_os_str().to_owned(),
            "-threads".into(),
            self.threads.to_string().into(),
            "-frames:v".into(),
            "1".into(),
            "-vf".into(),
            format!("scale=-2:{}", LOW_BITRATE.height).into(),
            "-q:v".into(),
            "3".into(),
        ];
        args.push(output.as_os_str().to_owned());
        args
    }

    async fn run(&self, program: &str, args: Vec<OsString>) -> Result<(), EngineError> {
        debug!(program, ?args, "Running engine");

        let child = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Dropping the child on timeout kills it
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| EngineError::TimedOut(self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .chars()
                .rev()
                .take(500)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            error!("{} failed with status: {:?}", program, output.status);
            return Err(EngineError::Failed {
                status: output.status.to_string(),
                stderr: tail.trim().to_string(),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl TranscodeEngine for FfmpegEngine {
    async fn probe_duration(&self, input: &Path) -> Result<f64, ProbeError> {
        probe_media(&self.ffprobe, input).await?.require_duration()
    }

    async fn encode_progressive(
        &self,
        input: &Path,
        output: &Path,
        profile: &RenditionProfile,
    ) -> Result<(), EngineError> {
        self.run(&self.ffmpeg, self.progressive_args(input, output, profile))
            .await
    }

    async fn encode_segmented(
        &self,
        input: &Path,
        playlist: &Path,
        profile: &RenditionProfile,
    ) -> Result<(), EngineError> {
        self.run(&self.ffmpeg, self.segmented_args(input, playlist, profile))
            .await
    }

    async fn thumbnail(
        &self,
        input: &Path,
        output: &Path,
        at_secs: f64,
    ) -> Result<(), EngineError> {
        self.run(&self.ffmpeg, self.thumbnail_args(input, output, at_secs))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(timeout: Duration) -> FfmpegEngine {
        FfmpegEngine {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
            threads: 2,
            timeout,
        }
    }

    fn joined(args: &[OsString]) -> String {
        args.iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn progressive_targets_480p_500k_faststart() {
        let args = engine(Duration::from_secs(1)).progressive_args(
            Path::new("in.mp4"),
            Path::new("out/low.mp4"),
            &LOW_BITRATE,
        );
        let line = joined(&args);
        assert!(line.contains("-i in.mp4"));
        assert!(line.contains("scale=-2:480"));
        assert!(line.contains("-b:v 500k"));
        assert!(line.contains("-threads 2"));
        assert!(line.contains("-movflags +faststart"));
        assert!(line.ends_with("out/low.mp4"));
    }

    #[test]
    fn segmented_uses_six_second_baseline_segments() {
        let args = engine(Duration::from_secs(1)).segmented_args(
            Path::new("in.mp4"),
            Path::new("out/hls/index.m3u8"),
            &ADAPTIVE,
        );
        let line = joined(&args);
        assert!(line.contains("scale=-2:720"));
        assert!(line.contains("-profile:v baseline"));
        assert!(line.contains("-hls_time 6"));
        assert!(line.contains("-hls_segment_filename out/hls/segment_%03d.ts"));
        assert!(line.ends_with("out/hls/index.m3u8"));
    }

    #[test]
    fn thumbnail_seeks_before_input() {
        let args = engine(Duration::from_secs(1)).thumbnail_args(
            Path::new("in.mp4"),
            Path::new("thumbnail.jpg"),
            THUMBNAIL_AT_SECS,
        );
        let line = joined(&args);
        assert!(line.contains("-ss 1.000 -i in.mp4"));
        assert!(line.contains("-frames:v 1"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_invocation_is_killed_at_timeout() {
        let engine = engine(Duration::from_millis(100));
        let err = engine
            .run("sleep", vec!["5".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TimedOut(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_reported() {
        let engine = engine(Duration::from_secs(5));
        let err = engine.run("false", Vec::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::Failed { .. }));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let engine = engine(Duration::from_secs(5));
        let err = engine
            .run("no-such-transcoder-binary", Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Spawn(_)));
    }
}
