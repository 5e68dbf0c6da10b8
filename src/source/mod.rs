pub mod api;

use async_trait::async_trait;

use crate::error::DownloadError;
use crate::model::{RemoteResource, TrackDescriptor, TranscodingOption};

/// The track metadata service: resolves user-facing URLs into descriptors,
/// batches track lookups, and hands out stream and original-file locations.
#[async_trait]
pub trait TrackSource: Send + Sync {
    async fn resolve(&self, url: &str) -> Result<RemoteResource, DownloadError>;

    /// Batched metadata lookup. The result preserves the requested order;
    /// ids the service no longer knows are silently absent.
    async fn resolve_tracks(&self, ids: &[u64]) -> Result<Vec<TrackDescriptor>, DownloadError>;

    /// Follow the transcoding indirection to the actual stream/manifest URL.
    async fn stream_location(&self, transcoding: &TranscodingOption)
        -> Result<String, DownloadError>;

    /// The original uploaded file's URL, when download permission and the
    /// uploader's remaining quota allow it. `None` means "skip this
    /// candidate", not an error.
    async fn original_download_url(
        &self,
        track: &TrackDescriptor,
    ) -> Result<Option<String>, DownloadError>;
}
