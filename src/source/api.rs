//! HTTP implementation of `TrackSource` against the service's public JSON
//! API. Endpoints take the registered client id as a query parameter.

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::StatusCode;
use serde::Deserialize;

use super::TrackSource;
use crate::error::DownloadError;
use crate::model::{
    RemoteResource, SetDescriptor, StreamProtocol, StreamQuality, TrackDescriptor,
    TranscodingOption,
};

pub struct HttpTrackSource {
    client: reqwest::Client,
    api_base: String,
    client_id: String,
}

#[derive(Deserialize)]
struct PlaylistDto {
    id: u64,
    title: String,
    user: Option<UserDto>,
    #[serde(default)]
    tracks: Vec<TrackStubDto>,
}

#[derive(Deserialize)]
struct TrackStubDto {
    id: u64,
}

#[derive(Deserialize, Clone)]
struct UserDto {
    username: String,
    permalink: String,
}

#[derive(Deserialize)]
struct TrackDto {
    id: u64,
    title: String,
    user: UserDto,
    #[serde(default)]
    duration: u64,
    artwork_url: Option<String>,
    genre: Option<String>,
    release_date: Option<String>,
    created_at: Option<String>,
    permalink_url: Option<String>,
    #[serde(default)]
    streamable: bool,
    policy: Option<String>,
    #[serde(default)]
    downloadable: bool,
    download_url: Option<String>,
    media: Option<MediaDto>,
}

#[derive(Deserialize)]
struct MediaDto {
    #[serde(default)]
    transcodings: Vec<TranscodingDto>,
}

#[derive(Deserialize)]
struct TranscodingDto {
    url: String,
    quality: String,
    #[serde(default)]
    snipped: bool,
    format: FormatDto,
}

#[derive(Deserialize)]
struct FormatDto {
    protocol: String,
    mime_type: String,
}

#[derive(Deserialize)]
struct StreamLocationDto {
    url: String,
}

#[derive(Deserialize)]
struct DownloadLocationDto {
    #[serde(rename = "redirectUri")]
    redirect_uri: String,
}

impl HttpTrackSource {
    pub fn new(api_base: impl Into<String>, client_id: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("tunedl/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            client_id: client_id.into(),
        }
    }

    fn with_client_id(&self, url: &str) -> String {
        let separator = if url.contains('?') { '&' } else { '?' };
        format!("{}{}client_id={}", url, separator, self.client_id)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, DownloadError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(DownloadError::transport)?;

        if resp.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(DownloadError::RateLimited);
        }
        if !resp.status().is_success() {
            return Err(DownloadError::Transport(format!(
                "HTTP {} for {}",
                resp.status(),
                url
            )));
        }

        let body = resp.text().await.map_err(DownloadError::transport)?;
        serde_json::from_str(&body)
            .map_err(|e| DownloadError::Transport(format!("unexpected API response: {}", e)))
    }
}

fn year_from_date(date: Option<&str>) -> Option<i32> {
    date.and_then(|d| d.get(0..4)).and_then(|y| y.parse().ok())
}

fn map_transcoding(dto: TranscodingDto) -> Option<TranscodingOption> {
    let protocol = match dto.format.protocol.as_str() {
        "progressive" => StreamProtocol::Progressive,
        "hls" => StreamProtocol::Hls,
        other => {
            debug!("skipping transcoding with unsupported protocol {}", other);
            return None;
        }
    };
    let quality = if dto.quality.eq_ignore_ascii_case("hq") {
        StreamQuality::High
    } else {
        StreamQuality::Standard
    };
    Some(TranscodingOption {
        url: dto.url,
        protocol,
        quality,
        mime_type: dto.format.mime_type,
        snipped: dto.snipped,
    })
}

fn map_track(dto: TrackDto) -> TrackDescriptor {
    let playable = dto.streamable && dto.policy.as_deref() != Some("BLOCK");
    let year = year_from_date(dto.release_date.as_deref())
        .or_else(|| year_from_date(dto.created_at.as_deref()));

    TrackDescriptor {
        id: dto.id,
        title: dto.title,
        uploader: dto.user.username,
        uploader_handle: dto.user.permalink,
        permalink_url: dto.permalink_url,
        duration_ms: dto.duration,
        artwork_url: dto.artwork_url,
        genre: dto.genre,
        year,
        playable,
        downloadable: dto.downloadable,
        download_url: dto.download_url,
        transcodings: dto
            .media
            .map(|m| m.transcodings.into_iter().filter_map(map_transcoding).collect())
            .unwrap_or_default(),
    }
}

#[async_trait]
impl TrackSource for HttpTrackSource {
    async fn resolve(&self, url: &str) -> Result<RemoteResource, DownloadError> {
        let endpoint = self.with_client_id(&format!(
            "{}/resolve?url={}",
            self.api_base,
            urlencode(url)
        ));
        let value: serde_json::Value = self.get_json(&endpoint).await?;
        let kind = value
            .get("kind")
            .and_then(|k| k.as_str())
            .unwrap_or_default()
            .to_string();

        match kind.as_str() {
            "track" => {
                let track: TrackDto = serde_json::from_value(value).map_err(|e| {
                    DownloadError::Transport(format!("unexpected track response: {}", e))
                })?;
                Ok(RemoteResource::Track(Box::new(map_track(track))))
            }
            "playlist" | "album" => {
                let playlist: PlaylistDto = serde_json::from_value(value).map_err(|e| {
                    DownloadError::Transport(format!("unexpected playlist response: {}", e))
                })?;
                Ok(RemoteResource::Set(SetDescriptor {
                    id: playlist.id,
                    title: playlist.title,
                    uploader: playlist.user.map(|u| u.username).unwrap_or_default(),
                    track_ids: playlist.tracks.into_iter().map(|t| t.id).collect(),
                }))
            }
            other => Err(DownloadError::Transport(format!(
                "cannot download resource of kind {}",
                other
            ))),
        }
    }

    async fn resolve_tracks(&self, ids: &[u64]) -> Result<Vec<TrackDescriptor>, DownloadError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let joined = ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let endpoint = self.with_client_id(&format!("{}/tracks?ids={}", self.api_base, joined));
        let dtos: Vec<TrackDto> = self.get_json(&endpoint).await?;

        // the service answers in its own order; put the batch back in ours
        let mut tracks: Vec<TrackDescriptor> = dtos.into_iter().map(map_track).collect();
        tracks.sort_by_key(|t| ids.iter().position(|&id| id == t.id).unwrap_or(usize::MAX));
        Ok(tracks)
    }

    async fn stream_location(
        &self,
        transcoding: &TranscodingOption,
    ) -> Result<String, DownloadError> {
        let endpoint = self.with_client_id(&transcoding.url);
        let dto: StreamLocationDto = self.get_json(&endpoint).await?;
        Ok(dto.url)
    }

    async fn original_download_url(
        &self,
        track: &TrackDescriptor,
    ) -> Result<Option<String>, DownloadError> {
        if !track.downloadable {
            return Ok(None);
        }
        if let Some(direct) = &track.download_url {
            return Ok(Some(self.with_client_id(direct)));
        }

        let endpoint =
            self.with_client_id(&format!("{}/tracks/{}/download", self.api_base, track.id));
        match self.get_json::<DownloadLocationDto>(&endpoint).await {
            Ok(dto) => Ok(Some(dto.redirect_uri)),
            Err(DownloadError::RateLimited) => Err(DownloadError::RateLimited),
            Err(e) => {
                // permission or quota said no; fall through to transcodings
                warn!("original file for track {} unavailable: {}", track.id, e);
                Ok(None)
            }
        }
    }
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
