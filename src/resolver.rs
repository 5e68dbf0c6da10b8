//! Stream acquisition: pick the best candidate for a track, download it, and
//! for fragmented streams reassemble the segments into one contiguous
//! buffer.
//!
//! Candidates are tried in order and a failure moves on to the next one;
//! only when every candidate failed does the track surface an error. Rate
//! limiting is the exception: it aborts immediately so the caller can back
//! off instead of hammering the remaining candidates.

use std::time::Duration;

use log::{debug, info, warn};

use crate::error::DownloadError;
use crate::fetch::BufferFetcher;
use crate::hls;
use crate::model::{StreamProtocol, StreamQuality, TrackDescriptor, TranscodingOption};
use crate::source::TrackSource;
use crate::utils::{extension_for_content_type, infer_extension};

#[derive(Debug, Clone, Default)]
pub struct ResolverOptions {
    /// High-quality transcodings are dropped entirely unless enabled.
    pub prefer_high_quality: bool,
    /// Optional fixed pause between HLS segment fetches.
    pub segment_delay: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ResolvedStream {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    pub extension: String,
    /// Reassembled from a fragmented stream; an mp4-family buffer will need
    /// a remux into a plain container before tagging.
    pub from_hls: bool,
}

enum Candidate {
    OriginalFile { url: String },
    Transcoded(TranscodingOption),
}

pub struct StreamResolver<'a> {
    fetcher: &'a dyn BufferFetcher,
    source: &'a dyn TrackSource,
    options: ResolverOptions,
}

impl<'a> StreamResolver<'a> {
    pub fn new(
        fetcher: &'a dyn BufferFetcher,
        source: &'a dyn TrackSource,
        options: ResolverOptions,
    ) -> Self {
        Self {
            fetcher,
            source,
            options,
        }
    }

    pub async fn resolve(
        &self,
        track: &TrackDescriptor,
        progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Result<ResolvedStream, DownloadError> {
        if !track.playable {
            return Err(DownloadError::InvalidTrack {
                id: track.id,
                reason: "track is not playable".into(),
            });
        }

        let candidates = self.candidates(track).await?;
        if candidates.is_empty() {
            return Err(DownloadError::NoDownloadableStream(track.id));
        }

        for candidate in candidates {
            match self.try_candidate(&candidate, progress).await {
                Ok(stream) => return Ok(stream),
                Err(DownloadError::RateLimited) => return Err(DownloadError::RateLimited),
                Err(e) => {
                    warn!("candidate for track {} failed: {}", track.id, e);
                }
            }
        }

        Err(DownloadError::NoDownloadableStream(track.id))
    }

    async fn candidates(&self, track: &TrackDescriptor) -> Result<Vec<Candidate>, DownloadError> {
        let mut candidates = Vec::new();

        match self.source.original_download_url(track).await {
            Ok(Some(url)) => candidates.push(Candidate::OriginalFile { url }),
            Ok(None) => {}
            Err(DownloadError::RateLimited) => return Err(DownloadError::RateLimited),
            Err(e) => warn!("original-file lookup for track {} failed: {}", track.id, e),
        }

        for transcoding in filter_and_sort_transcodings(
            &track.transcodings,
            self.options.prefer_high_quality,
        ) {
            candidates.push(Candidate::Transcoded(transcoding));
        }

        Ok(candidates)
    }

    async fn try_candidate(
        &self,
        candidate: &Candidate,
        progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Result<ResolvedStream, DownloadError> {
        match candidate {
            Candidate::OriginalFile { url } => {
                debug!("downloading original file");
                let report = |received: u64, total: Option<u64>| {
                    if let Some(total) = total {
                        if total > 0 {
                            progress((received as f64 / total as f64 * 100.0) as f32);
                        }
                    }
                };
                let fetched = self.fetcher.fetch(url, Some(&report)).await?;
                let extension =
                    infer_extension(&fetched.final_url, fetched.content_type.as_deref());
                progress(100.0);
                Ok(ResolvedStream {
                    bytes: fetched.bytes,
                    content_type: fetched.content_type,
                    extension,
                    from_hls: false,
                })
            }
            Candidate::Transcoded(transcoding) => {
                let location = self.source.stream_location(transcoding).await?;
                match transcoding.protocol {
                    StreamProtocol::Progressive => {
                        self.download_progressive(&location, transcoding, progress).await
                    }
                    StreamProtocol::Hls => {
                        self.reconstruct_hls(&location, transcoding, progress).await
                    }
                }
            }
        }
    }

    async fn download_progressive(
        &self,
        url: &str,
        transcoding: &TranscodingOption,
        progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Result<ResolvedStream, DownloadError> {
        let report = |received: u64, total: Option<u64>| {
            if let Some(total) = total {
                if total > 0 {
                    progress((received as f64 / total as f64 * 100.0) as f32);
                }
            }
        };
        let fetched = self.fetcher.fetch(url, Some(&report)).await?;
        let content_type = fetched
            .content_type
            .clone()
            .or_else(|| Some(transcoding.mime_type.clone()));
        let extension = infer_extension(&fetched.final_url, content_type.as_deref());
        progress(100.0);
        Ok(ResolvedStream {
            bytes: fetched.bytes,
            content_type,
            extension,
            from_hls: false,
        })
    }

    /// Fetch the manifest, then every segment strictly in order (the remote
    /// is rate-sensitive and the pieces must be concatenated in sequence
    /// anyway), init segment first.
    async fn reconstruct_hls(
        &self,
        manifest_url: &str,
        transcoding: &TranscodingOption,
        progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Result<ResolvedStream, DownloadError> {
        let text = self.fetcher.fetch_text(manifest_url).await?;
        let mut manifest = hls::parse(&text, manifest_url)?;

        if manifest.is_master() {
            let variant = manifest.variants[0].clone();
            debug!("master playlist; following first variant");
            let variant_text = self.fetcher.fetch_text(&variant).await?;
            manifest = hls::parse(&variant_text, &variant)?;
        }
        if manifest.is_encrypted() {
            let key = manifest.key.as_ref();
            return Err(DownloadError::Manifest(format!(
                "stream is encrypted ({} key at {})",
                key.map(|k| k.method.as_str()).unwrap_or("unknown"),
                key.and_then(|k| k.uri.as_deref()).unwrap_or("unknown location")
            )));
        }
        if manifest.segments.is_empty() {
            return Err(DownloadError::Manifest("playlist has no media segments".into()));
        }
        debug!(
            "media playlist: version {:?}, media sequence {}, {} segments, ended {}",
            manifest.version,
            manifest.media_sequence,
            manifest.segments.len(),
            manifest.ended
        );

        let total = manifest.segments.len() + usize::from(manifest.init_segment.is_some());
        let mut assembled: Vec<u8> = Vec::new();
        let mut done = 0usize;
        let mut range_state: Option<RangeFetchState> = None;

        if let Some(init) = &manifest.init_segment {
            let data = self.download_segment(init, &mut range_state).await?;
            assembled.extend_from_slice(&data);
            done += 1;
            progress(done as f32 / total as f32 * 100.0);
        }

        for segment in &manifest.segments {
            if let Some(delay) = self.options.segment_delay {
                tokio::time::sleep(delay).await;
            }
            let data = self.download_segment(segment, &mut range_state).await?;
            assembled.extend_from_slice(&data);
            done += 1;
            progress(done as f32 / total as f32 * 100.0);
        }

        let known_duration: f64 = manifest.segments.iter().filter_map(|s| s.duration).sum();
        info!(
            "reassembled {} segments (~{:.0}s) into {} bytes",
            total,
            known_duration,
            assembled.len()
        );
        Ok(ResolvedStream {
            bytes: assembled,
            content_type: Some(transcoding.mime_type.clone()),
            extension: extension_for_content_type(&transcoding.mime_type).to_string(),
            from_hls: true,
        })
    }

    async fn download_segment(
        &self,
        segment: &hls::SegmentRef,
        range_state: &mut Option<RangeFetchState>,
    ) -> Result<Vec<u8>, DownloadError> {
        let Some(range) = &segment.byte_range else {
            let fetched = self.fetcher.fetch(&segment.uri, None).await?;
            return Ok(fetched.bytes);
        };

        // Byte-ranged playlists address sub-ranges of one backing resource;
        // fetch it once and slice locally.
        let reuse = matches!(range_state, Some(state) if state.uri == segment.uri);
        if !reuse {
            let fetched = self.fetcher.fetch(&segment.uri, None).await?;
            *range_state = Some(RangeFetchState {
                uri: segment.uri.clone(),
                data: fetched.bytes,
                cursor: 0,
            });
        }

        let state = range_state
            .as_mut()
            .expect("range state populated above");
        let offset = range.offset.unwrap_or(state.cursor) as usize;
        let end = offset + range.length as usize;
        let slice = state.data.get(offset..end).ok_or_else(|| {
            DownloadError::Manifest(format!(
                "byte range {}..{} outside resource of {} bytes",
                offset,
                end,
                state.data.len()
            ))
        })?;
        state.cursor = end as u64;
        Ok(slice.to_vec())
    }
}

struct RangeFetchState {
    uri: String,
    data: Vec<u8>,
    cursor: u64,
}

/// Keep progressive/HLS candidates in the mpeg or mp4 mime families, never
/// previews; order by quality (high first) then protocol (progressive
/// first). High quality is dropped wholesale unless asked for.
fn filter_and_sort_transcodings(
    transcodings: &[TranscodingOption],
    prefer_high_quality: bool,
) -> Vec<TranscodingOption> {
    let mut usable: Vec<TranscodingOption> = transcodings
        .iter()
        .filter(|t| !t.snipped)
        .filter(|t| {
            let essence = t.mime_type.split(';').next().unwrap_or("").trim();
            essence.starts_with("audio/mpeg") || essence.starts_with("audio/mp4")
        })
        .filter(|t| prefer_high_quality || t.quality != StreamQuality::High)
        .cloned()
        .collect();

    usable.sort_by_key(|t| {
        let quality_rank = match t.quality {
            StreamQuality::High => 0,
            StreamQuality::Standard => 1,
        };
        let protocol_rank = match t.protocol {
            StreamProtocol::Progressive => 0,
            StreamProtocol::Hls => 1,
        };
        (quality_rank, protocol_rank)
    });
    usable
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{ByteProgress, FetchedBuffer};
    use crate::model::{RemoteResource, StreamQuality};
    use crate::source::TrackSource;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn transcoding(
        url: &str,
        protocol: StreamProtocol,
        quality: StreamQuality,
        mime: &str,
        snipped: bool,
    ) -> TranscodingOption {
        TranscodingOption {
            url: url.to_string(),
            protocol,
            quality,
            mime_type: mime.to_string(),
            snipped,
        }
    }

    fn track_with(transcodings: Vec<TranscodingOption>) -> TrackDescriptor {
        TrackDescriptor {
            id: 7,
            title: "T".into(),
            uploader: "U".into(),
            uploader_handle: "u".into(),
            permalink_url: None,
            duration_ms: 60_000,
            artwork_url: None,
            genre: None,
            year: None,
            playable: true,
            downloadable: false,
            download_url: None,
            transcodings,
        }
    }

    /// Serves canned responses per URL; missing URLs fail the fetch.
    #[derive(Default)]
    struct MockFetcher {
        responses: HashMap<String, (Vec<u8>, Option<String>)>,
        requests: Mutex<Vec<String>>,
    }

    impl MockFetcher {
        fn with(mut self, url: &str, bytes: &[u8], content_type: Option<&str>) -> Self {
            self.responses.insert(
                url.to_string(),
                (bytes.to_vec(), content_type.map(|s| s.to_string())),
            );
            self
        }

        fn requested(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BufferFetcher for MockFetcher {
        async fn fetch(
            &self,
            url: &str,
            on_progress: Option<ByteProgress<'_>>,
        ) -> Result<FetchedBuffer, DownloadError> {
            self.requests.lock().unwrap().push(url.to_string());
            let (bytes, content_type) = self
                .responses
                .get(url)
                .cloned()
                .ok_or_else(|| DownloadError::Transport(format!("no response for {}", url)))?;
            if let Some(report) = on_progress {
                report(bytes.len() as u64, Some(bytes.len() as u64));
            }
            Ok(FetchedBuffer {
                bytes,
                content_type,
                final_url: url.to_string(),
            })
        }
    }

    /// Stream locations resolve to "<transcoding url>!stream".
    struct MockSource {
        original: Option<String>,
    }

    #[async_trait]
    impl TrackSource for MockSource {
        async fn resolve(&self, _url: &str) -> Result<RemoteResource, DownloadError> {
            unimplemented!("not used by resolver tests")
        }

        async fn resolve_tracks(
            &self,
            _ids: &[u64],
        ) -> Result<Vec<TrackDescriptor>, DownloadError> {
            unimplemented!("not used by resolver tests")
        }

        async fn stream_location(
            &self,
            transcoding: &TranscodingOption,
        ) -> Result<String, DownloadError> {
            Ok(format!("{}!stream", transcoding.url))
        }

        async fn original_download_url(
            &self,
            _track: &TrackDescriptor,
        ) -> Result<Option<String>, DownloadError> {
            Ok(self.original.clone())
        }
    }

    fn no_progress() -> impl Fn(f32) + Send + Sync {
        |_| {}
    }

    #[test]
    fn ordering_prefers_quality_then_protocol() {
        let list = vec![
            transcoding("sq-hls", StreamProtocol::Hls, StreamQuality::Standard, "audio/mp4", false),
            transcoding("sq-prog", StreamProtocol::Progressive, StreamQuality::Standard, "audio/mpeg", false),
            transcoding("hq-hls", StreamProtocol::Hls, StreamQuality::High, "audio/mp4", false),
            transcoding("hq-prog", StreamProtocol::Progressive, StreamQuality::High, "audio/mpeg", false),
        ];

        let urls: Vec<String> = filter_and_sort_transcodings(&list, true)
            .into_iter()
            .map(|t| t.url)
            .collect();
        assert_eq!(urls, vec!["hq-prog", "hq-hls", "sq-prog", "sq-hls"]);

        // high quality disappears without the preference
        let urls: Vec<String> = filter_and_sort_transcodings(&list, false)
            .into_iter()
            .map(|t| t.url)
            .collect();
        assert_eq!(urls, vec!["sq-prog", "sq-hls"]);
    }

    #[test]
    fn previews_and_foreign_mimes_are_filtered() {
        let list = vec![
            transcoding("snip", StreamProtocol::Progressive, StreamQuality::Standard, "audio/mpeg", true),
            transcoding("ogg", StreamProtocol::Progressive, StreamQuality::Standard, "audio/ogg", false),
            transcoding("ok", StreamProtocol::Progressive, StreamQuality::Standard, "audio/mpeg; level=3", false),
        ];
        let urls: Vec<String> = filter_and_sort_transcodings(&list, false)
            .into_iter()
            .map(|t| t.url)
            .collect();
        assert_eq!(urls, vec!["ok"]);
    }

    #[tokio::test]
    async fn unplayable_track_is_rejected_up_front() {
        let fetcher = MockFetcher::default();
        let source = MockSource { original: None };
        let resolver = StreamResolver::new(&fetcher, &source, ResolverOptions::default());

        let mut track = track_with(vec![]);
        track.playable = false;
        let err = resolver.resolve(&track, &no_progress()).await.unwrap_err();
        assert!(matches!(err, DownloadError::InvalidTrack { .. }));
    }

    #[tokio::test]
    async fn original_file_wins_over_transcodings() {
        let fetcher = MockFetcher::default().with(
            "https://dl.example.com/orig.wav",
            b"WAVDATA",
            Some("audio/wav"),
        );
        let source = MockSource {
            original: Some("https://dl.example.com/orig.wav".to_string()),
        };
        let resolver = StreamResolver::new(&fetcher, &source, ResolverOptions::default());

        let track = track_with(vec![transcoding(
            "t1",
            StreamProtocol::Progressive,
            StreamQuality::Standard,
            "audio/mpeg",
            false,
        )]);
        let stream = resolver.resolve(&track, &no_progress()).await.unwrap();
        assert_eq!(stream.bytes, b"WAVDATA");
        assert_eq!(stream.extension, "wav");
        assert!(!stream.from_hls);
    }

    #[tokio::test]
    async fn falls_back_to_next_candidate_on_failure() {
        // the original file URL is not served, the progressive stream is
        let fetcher = MockFetcher::default().with("t1!stream", b"MP3DATA", Some("audio/mpeg"));
        let source = MockSource {
            original: Some("https://dl.example.com/broken".to_string()),
        };
        let resolver = StreamResolver::new(&fetcher, &source, ResolverOptions::default());

        let track = track_with(vec![transcoding(
            "t1",
            StreamProtocol::Progressive,
            StreamQuality::Standard,
            "audio/mpeg",
            false,
        )]);
        let stream = resolver.resolve(&track, &no_progress()).await.unwrap();
        assert_eq!(stream.bytes, b"MP3DATA");
        assert_eq!(stream.extension, "mp3");
    }

    /// Stream locations resolve to a fixed CDN playlist URL so relative
    /// segment URIs have a real base.
    struct HlsOnlySource;

    #[async_trait]
    impl TrackSource for HlsOnlySource {
        async fn resolve(&self, _url: &str) -> Result<RemoteResource, DownloadError> {
            unimplemented!("not used by resolver tests")
        }

        async fn resolve_tracks(&self, _ids: &[u64]) -> Result<Vec<TrackDescriptor>, DownloadError> {
            unimplemented!("not used by resolver tests")
        }

        async fn stream_location(
            &self,
            _t: &TranscodingOption,
        ) -> Result<String, DownloadError> {
            Ok("https://cdn.example.com/a/playlist.m3u8".to_string())
        }

        async fn original_download_url(
            &self,
            _track: &TrackDescriptor,
        ) -> Result<Option<String>, DownloadError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn hls_reconstruction_concatenates_init_and_segments_in_order() {
        let manifest = "#EXTM3U\n#EXT-X-MAP:URI=\"init.mp4\"\n#EXTINF:4,\nseg0.m4s\n#EXTINF:4,\nseg1.m4s\n#EXT-X-ENDLIST\n";
        let fetcher = MockFetcher::default()
            .with("https://cdn.example.com/a/playlist.m3u8", manifest.as_bytes(), None)
            .with("https://cdn.example.com/a/init.mp4", b"INIT", None)
            .with("https://cdn.example.com/a/seg0.m4s", b"SEG0", None)
            .with("https://cdn.example.com/a/seg1.m4s", b"SEG1", None);
        let resolver = StreamResolver::new(&fetcher, &HlsOnlySource, ResolverOptions::default());

        let track = track_with(vec![transcoding(
            "hls",
            StreamProtocol::Hls,
            StreamQuality::Standard,
            "audio/mp4",
            false,
        )]);
        let stream = resolver.resolve(&track, &no_progress()).await.unwrap();
        assert_eq!(stream.bytes, b"INITSEG0SEG1");
        assert_eq!(stream.extension, "m4a");
        assert!(stream.from_hls);

        // segments were fetched strictly in playlist order
        assert_eq!(
            fetcher.requested(),
            vec![
                "https://cdn.example.com/a/playlist.m3u8",
                "https://cdn.example.com/a/init.mp4",
                "https://cdn.example.com/a/seg0.m4s",
                "https://cdn.example.com/a/seg1.m4s",
            ]
        );
    }

    #[tokio::test]
    async fn one_bad_segment_fails_the_whole_candidate() {
        let manifest = "#EXTM3U\n#EXTINF:4,\nseg0.m4s\n#EXTINF:4,\nseg1.m4s\n#EXTINF:4,\nseg2.m4s\n";
        let fetcher = MockFetcher::default()
            .with("https://cdn.example.com/a/playlist.m3u8", manifest.as_bytes(), None)
            .with("https://cdn.example.com/a/seg0.m4s", b"SEG0", None)
            // seg1 missing
            .with("https://cdn.example.com/a/seg2.m4s", b"SEG2", None);

        let resolver = StreamResolver::new(&fetcher, &HlsOnlySource, ResolverOptions::default());
        let track = track_with(vec![transcoding(
            "hls",
            StreamProtocol::Hls,
            StreamQuality::Standard,
            "audio/mp4",
            false,
        )]);

        // no partial buffer comes back: exhaustion surfaces as no-stream
        let err = resolver.resolve(&track, &no_progress()).await.unwrap_err();
        assert!(matches!(err, DownloadError::NoDownloadableStream(7)));
    }

    #[tokio::test]
    async fn rate_limiting_aborts_instead_of_falling_back() {
        struct RateLimitedSource;
        #[async_trait]
        impl TrackSource for RateLimitedSource {
            async fn resolve(&self, _url: &str) -> Result<RemoteResource, DownloadError> {
                unimplemented!()
            }
            async fn resolve_tracks(
                &self,
                _ids: &[u64],
            ) -> Result<Vec<TrackDescriptor>, DownloadError> {
                unimplemented!()
            }
            async fn stream_location(
                &self,
                _t: &TranscodingOption,
            ) -> Result<String, DownloadError> {
                Err(DownloadError::RateLimited)
            }
            async fn original_download_url(
                &self,
                _track: &TrackDescriptor,
            ) -> Result<Option<String>, DownloadError> {
                Ok(None)
            }
        }

        let fetcher = MockFetcher::default();
        let resolver = StreamResolver::new(&fetcher, &RateLimitedSource, ResolverOptions::default());
        let track = track_with(vec![
            transcoding("a", StreamProtocol::Progressive, StreamQuality::Standard, "audio/mpeg", false),
            transcoding("b", StreamProtocol::Hls, StreamQuality::Standard, "audio/mp4", false),
        ]);

        let err = resolver.resolve(&track, &no_progress()).await.unwrap_err();
        assert!(matches!(err, DownloadError::RateLimited));
        // nothing was fetched at all
        assert!(fetcher.requested().is_empty());
    }

    #[tokio::test]
    async fn byte_ranged_segments_slice_one_backing_resource() {
        let manifest = "#EXTM3U\n#EXT-X-BYTERANGE:4@0\nall.bin\n#EXT-X-BYTERANGE:3\nall.bin\n";
        let fetcher = MockFetcher::default()
            .with("https://cdn.example.com/a/playlist.m3u8", manifest.as_bytes(), None)
            .with("https://cdn.example.com/a/all.bin", b"AAAABBBCC", None);

        let resolver = StreamResolver::new(&fetcher, &HlsOnlySource, ResolverOptions::default());
        let track = track_with(vec![transcoding(
            "hls",
            StreamProtocol::Hls,
            StreamQuality::Standard,
            "audio/mp4",
            false,
        )]);

        let stream = resolver.resolve(&track, &no_progress()).await.unwrap();
        assert_eq!(stream.bytes, b"AAAABBB");
        // the backing resource was fetched exactly once
        let hits = fetcher
            .requested()
            .iter()
            .filter(|u| u.ends_with("all.bin"))
            .count();
        assert_eq!(hits, 1);
    }
}
