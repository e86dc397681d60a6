//! Object storage access
//!
//! The pipeline needs three things from storage: a time-limited signed URL
//! for direct client uploads, a predictable public URL for any key, and a
//! way for the worker to write renditions.

use async_trait::async_trait;
use aws_sdk_s3::{
    Client, error::DisplayErrorContext, presigning::PresigningConfig, primitives::ByteStream,
};
use std::path::Path;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::error::StorageError;

/// Signed destination for one direct upload
#[derive(Debug, Clone, PartialEq)]
pub struct SignedUpload {
    pub url: String,
    pub token: String,
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Sign a single PUT of `key` into `bucket`, valid for `ttl`
    async fn sign_upload(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<SignedUpload, StorageError>;

    /// Public URL an object will be served from once written
    fn public_url(&self, bucket: &str, key: &str) -> String;

    /// Write a local file to `bucket/key`
    async fn put_file(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        content_type: &str,
    ) -> Result<(), StorageError>;
}

/// S3-compatible object storage
#[derive(Clone)]
pub struct S3Storage {
    client: Client,
    public_base_url: String,
}

impl S3Storage {
    pub fn new(client: Client, public_base_url: impl Into<String>) -> Self {
        Self {
            client,
            public_base_url: public_base_url.into(),
        }
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    async fn sign_upload(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<SignedUpload, StorageError> {
        let presigning =
            PresigningConfig::expires_in(ttl).map_err(|e| StorageError::Signing(e.to_string()))?;

        let request = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| StorageError::Signing(DisplayErrorContext(&e).to_string()))?;

        let url = request.uri().to_string();
        let token = signature_of(&url).unwrap_or_default();
        Ok(SignedUpload { url, token })
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        public_url(&self.public_base_url, bucket, key)
    }

    async fn put_file(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        content_type: &str,
    ) -> Result<(), StorageError> {
        info!("Uploading object to storage: {}/{}", bucket, key);

        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| StorageError::Upload(e.to_string()))?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StorageError::Upload(DisplayErrorContext(&e).to_string()))?;

        Ok(())
    }
}

/// Join a public base URL, bucket and key
pub fn public_url(base: &str, bucket: &str, key: &str) -> String {
    format!(
        "{}/{}/{}",
        base.trim_end_matches('/'),
        bucket,
        key.trim_start_matches('/')
    )
}

/// Collision-free storage key for an upload, keeping the original extension
pub fn unique_storage_path(file_name: &str) -> String {
    let id = Uuid::new_v4();
    match Path::new(file_name).extension().and_then(|e| e.to_str()) {
        Some(ext) if !ext.is_empty() => format!("{}.{}", id, ext.to_ascii_lowercase()),
        _ => id.to_string(),
    }
}

/// Content type of a rendition file, from its extension
pub fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("m3u8") => "application/vnd.apple.mpegurl",
        Some("ts") => "video/mp2t",
        Some("mp4") => "video/mp4",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
}

fn signature_of(url: &str) -> Option<String> {
    let (_, query) = url.split_once('?')?;
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("X-Amz-Signature="))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_url_is_predictable_from_key() {
        assert_eq!(
            public_url("https://cdn.example.com/", "videos", "/abc.mp4"),
            "https://cdn.example.com/videos/abc.mp4"
        );
    }

    #[test]
    fn storage_path_keeps_extension() {
        let path = unique_storage_path("My Clip.MOV");
        assert!(path.ends_with(".mov"));
        assert_ne!(path, unique_storage_path("My Clip.MOV"));

        let bare = unique_storage_path("noext");
        assert!(Uuid::parse_str(&bare).is_ok());
    }

    #[test]
    fn content_types_by_extension() {
        assert_eq!(
            content_type_for(Path::new("a/index.m3u8")),
            "application/vnd.apple.mpegurl"
        );
        assert_eq!(content_type_for(Path::new("seg_001.ts")), "video/mp2t");
        assert_eq!(content_type_for(Path::new("low.mp4")), "video/mp4");
        assert_eq!(content_type_for(Path::new("thumbnail.jpg")), "image/jpeg");
        assert_eq!(content_type_for(Path::new("x.bin")), "application/octet-stream");
    }

    #[test]
    fn token_is_the_request_signature() {
        let url = "https://s3/bucket/key?X-Amz-Algorithm=AWS4&X-Amz-Signature=deadbeef&x-id=PutObject";
        assert_eq!(signature_of(url).as_deref(), Some("deadbeef"));
        assert_eq!(signature_of("https://s3/bucket/key"), None);
    }
}
