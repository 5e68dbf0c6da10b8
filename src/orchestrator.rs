//! Top-level wiring: consumes commands from the bridge, resolves the URL
//! into a track or set, and drives the per-track pipeline (stream, optional
//! remux, tag, save) or hands sets to the playlist coordinator. All outcomes
//! leave as notifications; nothing here touches UI state directly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::bridge::{Command, CommandEnvelope, Notifier, TransferStatus};
use crate::coordinator::{
    wait_while_paused, PauseControls, PlaylistCoordinator, SetSelection, TrackNumbering,
    TrackRunner,
};
use crate::error::DownloadError;
use crate::fetch::BufferFetcher;
use crate::model::{
    RemoteResource, TrackDescriptor, PROGRESS_DONE, PROGRESS_DONE_WITH_ERRORS,
};
use crate::remux::{RemuxPool, RemuxProgressFn};
use crate::resolver::{ResolverOptions, StreamResolver};
use crate::source::TrackSource;
use crate::storage::Storage;
use crate::tags::id3v2::Id3v2Writer;
use crate::tags::mp4::Mp4Writer;
use crate::tags::{TagError, TagWriter, TaggedBuffer};
use crate::utils::build_track_filename;

/// Share of the overall progress budget given to each pipeline stage.
const DOWNLOAD_SHARE: f32 = 0.85;
const REMUX_SHARE: f32 = 0.10;

#[derive(Debug, Clone)]
pub struct TrackOutcome {
    pub external_handle: u64,
    pub path: std::path::PathBuf,
    pub tags_applied: bool,
}

/// The single-track pipeline, shared between the direct path and the
/// playlist coordinator.
#[derive(Clone)]
pub struct TrackPipeline {
    fetcher: Arc<dyn BufferFetcher>,
    source: Arc<dyn TrackSource>,
    remux: RemuxPool,
    storage: Arc<Storage>,
    options: ResolverOptions,
}

impl TrackPipeline {
    pub fn new(
        fetcher: Arc<dyn BufferFetcher>,
        source: Arc<dyn TrackSource>,
        remux: RemuxPool,
        storage: Arc<Storage>,
        options: ResolverOptions,
    ) -> Self {
        Self {
            fetcher,
            source,
            remux,
            storage,
            options,
        }
    }

    pub async fn download_track(
        &self,
        download_id: &str,
        track: &TrackDescriptor,
        numbering: Option<TrackNumbering>,
        album: Option<&str>,
        progress: Arc<dyn Fn(f32) + Send + Sync>,
    ) -> Result<TrackOutcome, DownloadError> {
        let resolver =
            StreamResolver::new(self.fetcher.as_ref(), self.source.as_ref(), self.options.clone());

        let download_progress = {
            let progress = Arc::clone(&progress);
            move |pct: f32| (*progress)(pct * DOWNLOAD_SHARE)
        };
        let stream = resolver.resolve(track, &download_progress).await?;
        (*progress)(DOWNLOAD_SHARE * 100.0);

        // A reassembled fragmented mp4 is not a plain container yet; remux
        // it before tagging. Progressive buffers are already fine.
        let needs_remux = stream.from_hls && stream.extension == "m4a";
        let extension = stream.extension.clone();
        let bytes = if needs_remux {
            let remux_progress: RemuxProgressFn = {
                let progress = Arc::clone(&progress);
                Arc::new(move |pct: f32| {
                    (*progress)(DOWNLOAD_SHARE * 100.0 + pct * REMUX_SHARE)
                })
            };
            // keep the pre-remux buffer; rejection falls back to it
            let original = stream.bytes.clone();
            let pending = self.remux.request_remux(
                download_id,
                stream.bytes,
                &extension,
                Some(Duration::from_millis(track.duration_ms)),
                remux_progress,
            );
            match pending.await {
                Ok(Ok(remuxed)) => remuxed,
                Ok(Err(e)) => {
                    warn!(
                        "remux failed for track {}; saving the raw stream: {}",
                        track.id, e
                    );
                    original
                }
                Err(_) => {
                    warn!(
                        "remux worker for track {} went away; saving the raw stream",
                        track.id
                    );
                    original
                }
            }
        } else {
            stream.bytes
        };
        (*progress)((DOWNLOAD_SHARE + REMUX_SHARE) * 100.0);

        let tagged = self.apply_tags(track, numbering, album, bytes, &extension).await;

        let filename = build_track_filename(&track.uploader, &track.title, &extension);
        let saved = self.storage.save_file(&tagged.bytes, &filename).await?;
        info!("track {} saved as {:?}", track.id, saved.path);
        (*progress)(100.0);

        Ok(TrackOutcome {
            external_handle: saved.handle,
            path: saved.path,
            tags_applied: tagged.tags_applied,
        })
    }

    /// Apply every available field individually; a field that fails to
    /// validate is logged and skipped, it never takes the buffer down.
    async fn apply_tags(
        &self,
        track: &TrackDescriptor,
        numbering: Option<TrackNumbering>,
        album: Option<&str>,
        bytes: Vec<u8>,
        extension: &str,
    ) -> TaggedBuffer {
        let mut writer: Box<dyn TagWriter> = match extension {
            "mp3" => Box::new(Id3v2Writer::new(bytes)),
            "m4a" | "mp4" => Box::new(Mp4Writer::new(bytes)),
            other => {
                debug!("no tag writer for .{} files", other);
                return TaggedBuffer {
                    bytes,
                    tags_applied: false,
                    message: Some(format!("no tag writer for .{}", other)),
                };
            }
        };

        let absorb = |field: &str, result: Result<(), TagError>| {
            if let Err(e) = result {
                warn!("skipping {} for track {}: {}", field, track.id, e);
            }
        };

        absorb("title", writer.set_title(&track.title));
        absorb("artists", writer.set_artists(&[track.uploader.clone()]));
        if let Some(album) = album {
            absorb("album", writer.set_album(album));
        }
        if let Some(permalink) = &track.permalink_url {
            absorb("comment", writer.set_comment(permalink));
        }
        if let Some(numbering) = numbering {
            absorb(
                "track number",
                writer.set_track_number(numbering.number, Some(numbering.total)),
            );
        }
        if let Some(year) = track.year {
            absorb("year", writer.set_year(year));
        }
        if let Some(genre) = &track.genre {
            absorb("grouping", writer.set_grouping(genre));
        }
        absorb(
            "external id",
            writer.set_external_track_id(&track.id.to_string()),
        );

        if let Some(artwork_url) = &track.artwork_url {
            match self.fetcher.fetch(artwork_url, None).await {
                Ok(art) => absorb("artwork", writer.set_artwork(&art.bytes)),
                Err(e) => warn!("artwork fetch failed for track {}: {}", track.id, e),
            }
        }

        writer.into_buffer()
    }
}

#[async_trait]
impl TrackRunner for TrackPipeline {
    async fn run_track(
        &self,
        download_id: &str,
        track: &TrackDescriptor,
        numbering: Option<TrackNumbering>,
        album: Option<&str>,
        progress: Arc<dyn Fn(f32) + Send + Sync>,
    ) -> Result<(), DownloadError> {
        self.download_track(download_id, track, numbering, album, progress)
            .await
            .map(|_| ())
    }
}

enum DownloadRequest {
    Single { url: String },
    Set { url: String, selection: SetSelection },
}

pub struct Orchestrator {
    pipeline: Arc<TrackPipeline>,
    source: Arc<dyn TrackSource>,
    notifier: Notifier,
    controls: PauseControls,
}

impl Orchestrator {
    pub fn new(
        pipeline: Arc<TrackPipeline>,
        source: Arc<dyn TrackSource>,
        notifier: Notifier,
        controls: PauseControls,
    ) -> Self {
        Self {
            pipeline,
            source,
            notifier,
            controls,
        }
    }

    /// Consume commands until the channel closes. Download commands spawn so
    /// pause/resume keep flowing while transfers run.
    pub async fn run(self: Arc<Self>, mut commands: mpsc::UnboundedReceiver<CommandEnvelope>) {
        while let Some(envelope) = commands.recv().await {
            let id = envelope.correlation_id.clone();
            match envelope.command {
                Command::Pause => {
                    if self.controls.pause(&id) {
                        debug!("pause requested for download {}", id);
                    } else {
                        warn!("pause for unknown download {}", id);
                    }
                }
                Command::Resume => {
                    if self.controls.resume(&id) {
                        // explicit acknowledgement; the UI leaves Resuming on it
                        self.notifier.status(&id, TransferStatus::Resuming);
                    } else {
                        warn!("resume for unknown download {}", id);
                    }
                }
                Command::Download { url } => {
                    self.spawn_download(id, DownloadRequest::Single { url });
                }
                Command::DownloadSet { url } => {
                    self.spawn_download(
                        id,
                        DownloadRequest::Set {
                            url,
                            selection: SetSelection::Full,
                        },
                    );
                }
                Command::DownloadSetRange { url, start, end } => {
                    self.spawn_download(
                        id,
                        DownloadRequest::Set {
                            url,
                            selection: SetSelection::Range { start, end },
                        },
                    );
                }
            }
        }
    }

    fn spawn_download(self: &Arc<Self>, id: String, request: DownloadRequest) {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.run_download(&id, request).await;
        });
    }

    async fn run_download(&self, id: &str, request: DownloadRequest) {
        self.controls.register(id);
        let outcome = self.execute(id, request).await;
        self.controls.unregister(id);

        match outcome {
            Ok((code, external_handle)) => self.notifier.completion(id, code, external_handle),
            Err(e) => {
                warn!("download {} failed: {}", id, e);
                self.notifier.error(id, &e.to_string());
            }
        }
    }

    async fn execute(
        &self,
        id: &str,
        request: DownloadRequest,
    ) -> Result<(f32, Option<u64>), DownloadError> {
        let (url, selection) = match &request {
            DownloadRequest::Single { url } => (url.as_str(), None),
            DownloadRequest::Set { url, selection } => (url.as_str(), Some(*selection)),
        };

        match self.source.resolve(url).await? {
            RemoteResource::Track(track) => {
                if selection.is_some() {
                    debug!("set command resolved to a single track; downloading it alone");
                }
                self.single_track(id, &track).await
            }
            RemoteResource::Set(set) => {
                let coordinator = PlaylistCoordinator::new(
                    Arc::clone(&self.source),
                    Arc::clone(&self.pipeline) as Arc<dyn TrackRunner>,
                    self.notifier.clone(),
                    self.controls.clone(),
                );
                let outcome = coordinator
                    .download_set(id, &set, selection.unwrap_or(SetSelection::Full))
                    .await?;
                let code = if outcome.failed > 0 {
                    PROGRESS_DONE_WITH_ERRORS
                } else {
                    PROGRESS_DONE
                };
                Ok((code, None))
            }
        }
    }

    async fn single_track(
        &self,
        id: &str,
        track: &TrackDescriptor,
    ) -> Result<(f32, Option<u64>), DownloadError> {
        if let Some(mut gate) = self.controls.receiver(id) {
            wait_while_paused(id, &mut gate, &self.notifier).await;
        }

        let progress: Arc<dyn Fn(f32) + Send + Sync> = {
            let notifier = self.notifier.clone();
            let id = id.to_string();
            Arc::new(move |pct: f32| notifier.progress(&id, pct))
        };

        let outcome = self
            .pipeline
            .download_track(id, track, None, None, progress)
            .await?;
        Ok((PROGRESS_DONE, Some(outcome.external_handle)))
    }
}
