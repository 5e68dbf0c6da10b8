use serde::{Deserialize, Serialize};

/// Terminal progress sentinel: every track finished cleanly.
pub const PROGRESS_DONE: f32 = 101.0;
/// Terminal progress sentinel: finished, but at least one track failed.
pub const PROGRESS_DONE_WITH_ERRORS: f32 = 102.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamProtocol {
    Progressive,
    Hls,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamQuality {
    Standard,
    High,
}

/// One server-offered encoded variant of a track.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodingOption {
    pub url: String,
    pub protocol: StreamProtocol,
    pub quality: StreamQuality,
    pub mime_type: String,
    /// Truncated preview; never downloadable.
    #[serde(default)]
    pub snipped: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackDescriptor {
    pub id: u64,
    pub title: String,
    pub uploader: String,
    pub uploader_handle: String,
    pub permalink_url: Option<String>,
    pub duration_ms: u64,
    pub artwork_url: Option<String>,
    pub genre: Option<String>,
    pub year: Option<i32>,
    pub playable: bool,
    pub downloadable: bool,
    pub download_url: Option<String>,
    pub transcodings: Vec<TranscodingOption>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetDescriptor {
    pub id: u64,
    pub title: String,
    pub uploader: String,
    pub track_ids: Vec<u64>,
}

/// A resolved remote resource: a single track, or an ordered set of tracks.
#[derive(Debug, Clone)]
pub enum RemoteResource {
    Track(Box<TrackDescriptor>),
    Set(SetDescriptor),
}
