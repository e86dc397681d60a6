//! Transcoding worker
//!
//! One delivered job runs sequentially: materialize the source, probe it,
//! encode the renditions of its class into a private work directory, check
//! the output budget, then publish everything under the job's output prefix.
//! Output keys are deterministic, so a re-delivered job overwrites its own
//! earlier output.

use async_trait::async_trait;
use common::media::{
    MAX_SOURCE_DURATION_SECS, MediaClass, OUTPUT_BUDGET_BYTES, RenditionPaths, TranscodeJob,
    TranscodeResult,
};
use common::queue::{ClaimedJob, JobError, JobHandler};
use common::storage::{ObjectStorage, content_type_for};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::engine::{ADAPTIVE, LOW_BITRATE, THUMBNAIL_AT_SECS, TranscodeEngine};
use crate::error::TranscodeError;
use crate::fetcher::SourceFetcher;

const PLAYLIST: &str = "hls/index.m3u8";
const LOW_BITRATE_FILE: &str = "low.mp4";
const THUMBNAIL_FILE: &str = "thumbnail.jpg";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Bucket renditions are published to
    pub bucket: String,
    /// Fail a job on its first non-retryable error instead of using every attempt
    pub fail_fast_on_fatal: bool,
}

pub struct TranscodeWorker {
    engine: Arc<dyn TranscodeEngine>,
    storage: Arc<dyn ObjectStorage>,
    fetcher: SourceFetcher,
    config: WorkerConfig,
}

impl TranscodeWorker {
    pub fn new(
        engine: Arc<dyn TranscodeEngine>,
        storage: Arc<dyn ObjectStorage>,
        fetcher: SourceFetcher,
        config: WorkerConfig,
    ) -> Self {
        Self {
            engine,
            storage,
            fetcher,
            config,
        }
    }

    #[instrument(skip(self, job), fields(poi_id = %job.poi_id, class = %job.media_class))]
    pub async fn transcode(&self, job: &TranscodeJob) -> Result<TranscodeResult, TranscodeError> {
        // Dropped on every exit path, which removes a downloaded source
        let input = self
            .fetcher
            .materialize(&job.public_url, &job.file_name)
            .await?;

        let duration = self.engine.probe_duration(input.path()).await?;
        if duration > MAX_SOURCE_DURATION_SECS {
            return Err(TranscodeError::DurationExceeded {
                duration,
                limit: MAX_SOURCE_DURATION_SECS,
            });
        }
        info!("Probed source duration: {:.2}s", duration);

        tokio::fs::create_dir_all(self.fetcher.scratch_root()).await?;
        let workdir = tempfile::Builder::new()
            .prefix("job-")
            .tempdir_in(self.fetcher.scratch_root())?;
        let out = workdir.path();

        if job.media_class == MediaClass::Dinner {
            let playlist = out.join(PLAYLIST);
            if let Some(parent) = playlist.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            self.engine
                .encode_segmented(input.path(), &playlist, &ADAPTIVE)
                .await
                .map_err(|source| TranscodeError::EncodeFailed {
                    rendition: ADAPTIVE.name,
                    source,
                })?;
        }

        self.engine
            .encode_progressive(input.path(), &out.join(LOW_BITRATE_FILE), &LOW_BITRATE)
            .await
            .map_err(|source| TranscodeError::EncodeFailed {
                rendition: LOW_BITRATE.name,
                source,
            })?;

        let thumbnail_at = THUMBNAIL_AT_SECS.min(duration / 2.0);
        self.engine
            .thumbnail(input.path(), &out.join(THUMBNAIL_FILE), thumbnail_at)
            .await
            .map_err(|source| TranscodeError::EncodeFailed {
                rendition: "thumbnail",
                source,
            })?;

        let outputs = list_outputs(out).await?;
        let total_output_bytes: u64 = outputs.iter().map(|o| o.size).sum();
        if total_output_bytes > OUTPUT_BUDGET_BYTES {
            warn!(
                total_output_bytes,
                budget = OUTPUT_BUDGET_BYTES,
                "Renditions exceed the output budget"
            );
        }

        let prefix = job.output_dir.trim_end_matches('/');
        for output in &outputs {
            let key = format!("{}/{}", prefix, output.relative);
            self.storage
                .put_file(
                    &self.config.bucket,
                    &key,
                    &output.path,
                    content_type_for(&output.path),
                )
                .await
                .map_err(|source| TranscodeError::PublishFailed { key, source })?;
        }

        let key = |name: &str| format!("{}/{}", prefix, name);
        let rendition_paths = RenditionPaths {
            high_quality: (job.media_class == MediaClass::Dinner).then(|| key(PLAYLIST)),
            low_bitrate: key(LOW_BITRATE_FILE),
            thumbnail: key(THUMBNAIL_FILE),
        };

        info!(
            files = outputs.len(),
            total_output_bytes, "Transcode finished"
        );

        Ok(TranscodeResult {
            rendition_paths,
            duration_seconds: duration,
            total_output_bytes,
        })
    }
}

#[async_trait]
impl JobHandler<TranscodeJob> for TranscodeWorker {
    async fn handle(&self, job: &ClaimedJob<TranscodeJob>) -> anyhow::Result<serde_json::Value> {
        info!(
            job_id = %job.id,
            attempt = job.attempt,
            max_attempts = job.opts.attempts,
            "Processing transcode job"
        );

        match self.transcode(&job.data).await {
            Ok(result) => Ok(serde_json::to_value(result)?),
            Err(e) if !e.is_retryable() => {
                warn!(job_id = %job.id, error = %e, "Source must be re-recorded");
                if self.config.fail_fast_on_fatal {
                    Err(JobError::unrecoverable(e).into())
                } else {
                    Err(e.into())
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// A file produced in the work directory
#[derive(Debug)]
struct Output {
    path: PathBuf,
    /// `/`-separated path below the work directory
    relative: String,
    size: u64,
}

async fn list_outputs(root: &Path) -> std::io::Result<Vec<Output>> {
    let mut outputs = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            let path = entry.path();
            if metadata.is_dir() {
                pending.push(path);
                continue;
            }

            let relative = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            outputs.push(Output {
                path,
                relative,
                size: metadata.len(),
            });
        }
    }

    outputs.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(outputs)
}
