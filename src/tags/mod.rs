//! Binary metadata tag writers. Pure encoders: they take the downloaded
//! audio bytes plus field setters and produce a new buffer, no I/O.

pub mod id3v2;
pub mod mp4;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TagError {
    #[error("invalid {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("unrecognized artwork format")]
    UnknownArtworkFormat,
}

impl TagError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        TagError::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

pub struct TaggedBuffer {
    pub bytes: Vec<u8>,
    pub tags_applied: bool,
    pub message: Option<String>,
}

/// Common contract for both container formats. Setters validate their input
/// and fail loudly; a failed setter must not prevent the others, nor prevent
/// `into_buffer` from returning a usable buffer; the caller applies fields
/// individually and absorbs per-field failures.
pub trait TagWriter: Send {
    fn set_title(&mut self, title: &str) -> Result<(), TagError>;
    fn set_artists(&mut self, artists: &[String]) -> Result<(), TagError>;
    fn set_album(&mut self, album: &str) -> Result<(), TagError>;
    fn set_comment(&mut self, comment: &str) -> Result<(), TagError>;
    fn set_track_number(&mut self, number: u16, total: Option<u16>) -> Result<(), TagError>;
    fn set_year(&mut self, year: i32) -> Result<(), TagError>;
    fn set_grouping(&mut self, grouping: &str) -> Result<(), TagError>;
    fn set_artwork(&mut self, image: &[u8]) -> Result<(), TagError>;
    /// Custom identifier recorded so download history can later be recovered
    /// from files on disk.
    fn set_external_track_id(&mut self, id: &str) -> Result<(), TagError>;
    fn into_buffer(self: Box<Self>) -> TaggedBuffer;
}

pub(crate) fn require_non_empty(field: &'static str, value: &str) -> Result<(), TagError> {
    if value.trim().is_empty() {
        Err(TagError::invalid(field, "must not be empty"))
    } else {
        Ok(())
    }
}

pub(crate) fn require_track_number(number: u16) -> Result<(), TagError> {
    if (1..=32767).contains(&number) {
        Ok(())
    } else {
        Err(TagError::invalid("track number", format!("{} out of range 1-32767", number)))
    }
}

pub(crate) fn require_year(year: i32) -> Result<(), TagError> {
    if year >= 1 {
        Ok(())
    } else {
        Err(TagError::invalid("year", format!("{} must be positive", year)))
    }
}

/// Detect an image MIME type from its magic bytes.
pub fn sniff_artwork_mime(data: &[u8]) -> Option<&'static str> {
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if data.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        Some("image/png")
    } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if data.len() >= 12 && data.starts_with(b"RIFF") && &data[8..12] == b"WEBP" {
        Some("image/webp")
    } else if data.starts_with(&[0x49, 0x49, 0x2A, 0x00]) || data.starts_with(&[0x4D, 0x4D, 0x00, 0x2A]) {
        Some("image/tiff")
    } else if data.starts_with(b"BM") {
        Some("image/bmp")
    } else if data.starts_with(&[0x00, 0x00, 0x01, 0x00]) {
        Some("image/x-icon")
    } else {
        None
    }
}
