//! Source materialization
//!
//! Remote sources are streamed into a private scratch directory; local paths
//! are used in place. The scratch directory lives exactly as long as the
//! returned [`MaterializedInput`].

use futures::StreamExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::TranscodeError;

/// A source file readable by the engine
#[derive(Debug)]
pub struct MaterializedInput {
    path: PathBuf,
    scratch: Option<TempDir>,
}

impl MaterializedInput {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the input was downloaded and will be removed on drop
    pub fn is_scratch(&self) -> bool {
        self.scratch.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct SourceFetcher {
    http: reqwest::Client,
    scratch_root: PathBuf,
}

impl SourceFetcher {
    pub fn new(http: reqwest::Client, scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            http,
            scratch_root: scratch_root.into(),
        }
    }

    pub fn scratch_root(&self) -> &Path {
        &self.scratch_root
    }

    /// Make `source` available on local disk
    pub async fn materialize(
        &self,
        source: &str,
        file_name: &str,
    ) -> Result<MaterializedInput, TranscodeError> {
        if !is_remote(source) {
            let path = PathBuf::from(source);
            if tokio::fs::metadata(&path).await.is_err() {
                return Err(TranscodeError::DownloadFailed {
                    url: source.to_string(),
                    reason: "local source does not exist".to_string(),
                });
            }
            return Ok(MaterializedInput {
                path,
                scratch: None,
            });
        }

        tokio::fs::create_dir_all(&self.scratch_root).await?;
        let scratch = tempfile::Builder::new()
            .prefix("source-")
            .tempdir_in(&self.scratch_root)?;
        let path = scratch.path().join(scratch_file_name(file_name));

        let bytes = self.download(source, &path).await?;
        info!("Downloaded source {} ({} bytes)", source, bytes);

        Ok(MaterializedInput {
            path,
            scratch: Some(scratch),
        })
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<u64, TranscodeError> {
        let failed = |reason: String| TranscodeError::DownloadFailed {
            url: url.to_string(),
            reason,
        };

        let response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| failed(e.to_string()))?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| failed(e.to_string()))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        debug!("Wrote {} bytes to {}", written, dest.display());
        Ok(written)
    }
}

fn is_remote(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// File name safe to create inside the scratch directory
fn scratch_file_name(file_name: &str) -> String {
    let base = Path::new(file_name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    if base.is_empty() || base == "." || base == ".." {
        "source".to_string()
    } else {
        base.to_string()
    }
}
