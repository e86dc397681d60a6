//! Client half of the media pipeline
//!
//! Uploading a clip through the api, watching the network, keeping a
//! budgeted offline cache and choosing which rendition a player streams.

pub mod cache;
pub mod delivery;
pub mod network;
pub mod upload;

pub use cache::{BlobStore, CacheError, ContentCache, FsBlobStore, MemoryBlobStore};
pub use delivery::{MediaSources, Player, PlayerState, SourceKind, resolve_source};
pub use network::{NetworkMonitor, NetworkSample};
pub use upload::{UploadClient, UploadError, UploadObserver, UploadState};
