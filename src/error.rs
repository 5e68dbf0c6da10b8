use thiserror::Error;

use crate::tags::TagError;

/// Failure kinds surfaced by the download pipeline.
///
/// `RemuxFailure` and `TagWriteFailure` are always absorbed inside the
/// pipeline with a fallback to the pre-remux / untagged buffer; only stream
/// exhaustion and save failures propagate out of a track pipeline.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// HTTP 429 from the remote service. Kept distinct from generic
    /// transport failures so callers can special-case backoff messaging.
    #[error("rate limited by the remote server")]
    RateLimited,

    #[error("track {id} is not downloadable: {reason}")]
    InvalidTrack { id: u64, reason: String },

    /// Every transcoding candidate for the track was tried and failed.
    #[error("no downloadable stream for track {0}")]
    NoDownloadableStream(u64),

    #[error("remux failed: {0}")]
    RemuxFailure(String),

    #[error("tag write failed: {0}")]
    TagWriteFailure(#[from] TagError),

    #[error("failed to save file: {0}")]
    SaveFailure(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed manifest: {0}")]
    Manifest(String),

    #[error("invalid range: {0}")]
    InvalidRange(String),
}

impl DownloadError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        DownloadError::Transport(err.to_string())
    }
}
