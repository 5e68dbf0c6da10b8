//! Chunked multi-track download coordination: clamp the requested range,
//! walk the set in fixed-size chunks, resolve each chunk's metadata in one
//! batched lookup, run the per-track pipelines concurrently within a chunk,
//! and aggregate their progress into one number for the bridge.
//!
//! Pause is cooperative: a watch-channel gate per download id, consulted
//! before each chunk and before each track, never mid-segment. Chunk N+1
//! does not start until every track of chunk N settled.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::watch;

use crate::bridge::{Notifier, TransferStatus};
use crate::error::DownloadError;
use crate::model::{SetDescriptor, TrackDescriptor};
use crate::source::TrackSource;

/// Whole-set downloads take bigger bites than ranged ones; a range is often
/// retried interactively and should hold less in memory at once.
pub const FULL_SET_CHUNK_SIZE: usize = 10;
pub const RANGED_CHUNK_SIZE: usize = 5;

#[derive(Debug, Clone, Copy)]
pub enum SetSelection {
    Full,
    Range { start: usize, end: Option<usize> },
}

/// 1-based inclusive clamp: `start = max(1, min(start, n))`, a missing end
/// means "to the last track", a present one is pulled into `[start, n]`.
pub fn clamp_range(start: usize, end: Option<usize>, len: usize) -> Result<(usize, usize), DownloadError> {
    if len == 0 {
        return Err(DownloadError::InvalidRange("the set has no tracks".into()));
    }
    let start = start.clamp(1, len);
    let end = match end {
        Some(end) => end.clamp(start, len),
        None => len,
    };
    if start > end {
        return Err(DownloadError::InvalidRange(format!(
            "start {} is past end {}",
            start, end
        )));
    }
    Ok((start, end))
}

/// Per-download pause flags, woken through watch channels instead of being
/// polled on a timer.
#[derive(Clone, Default)]
pub struct PauseControls {
    inner: Arc<Mutex<HashMap<String, watch::Sender<bool>>>>,
}

impl PauseControls {
    pub fn register(&self, id: &str) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id.to_string(), tx);
        rx
    }

    pub fn receiver(&self, id: &str) -> Option<watch::Receiver<bool>> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(id)
            .map(|tx| tx.subscribe())
    }

    pub fn pause(&self, id: &str) -> bool {
        self.signal(id, true)
    }

    pub fn resume(&self, id: &str) -> bool {
        self.signal(id, false)
    }

    pub fn unregister(&self, id: &str) {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(id);
    }

    fn signal(&self, id: &str, paused: bool) -> bool {
        match self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(id)
        {
            Some(tx) => {
                tx.send_replace(paused);
                true
            }
            None => false,
        }
    }
}

/// Block while the download is paused. Announces `Paused` once on entry;
/// resumption is silent, the next progress report implies it.
pub async fn wait_while_paused(
    download_id: &str,
    gate: &mut watch::Receiver<bool>,
    notifier: &Notifier,
) {
    if !*gate.borrow() {
        return;
    }
    debug!("download {} paused", download_id);
    notifier.status(download_id, TransferStatus::Paused);
    while *gate.borrow() {
        if gate.changed().await.is_err() {
            // controls dropped; nothing can unpause us, run on
            return;
        }
    }
}

/// Position of a track in the *unclamped* set: ranged downloads still tag
/// with the original index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackNumbering {
    pub number: u16,
    pub total: u16,
}

/// One track's full pipeline (stream, remux, tag, save), injected so the
/// coordinator can be exercised without any of it.
#[async_trait]
pub trait TrackRunner: Send + Sync {
    async fn run_track(
        &self,
        download_id: &str,
        track: &TrackDescriptor,
        numbering: Option<TrackNumbering>,
        album: Option<&str>,
        progress: Arc<dyn Fn(f32) + Send + Sync>,
    ) -> Result<(), DownloadError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetOutcome {
    pub attempted: usize,
    pub failed: usize,
}

pub struct PlaylistCoordinator {
    source: Arc<dyn TrackSource>,
    runner: Arc<dyn TrackRunner>,
    notifier: Notifier,
    controls: PauseControls,
}

impl PlaylistCoordinator {
    pub fn new(
        source: Arc<dyn TrackSource>,
        runner: Arc<dyn TrackRunner>,
        notifier: Notifier,
        controls: PauseControls,
    ) -> Self {
        Self {
            source,
            runner,
            notifier,
            controls,
        }
    }

    pub async fn download_set(
        &self,
        download_id: &str,
        set: &SetDescriptor,
        selection: SetSelection,
    ) -> Result<SetOutcome, DownloadError> {
        let total_tracks = set.track_ids.len();
        let (start, end, chunk_size) = match selection {
            SetSelection::Full => {
                let (s, e) = clamp_range(1, None, total_tracks)?;
                (s, e, FULL_SET_CHUNK_SIZE)
            }
            SetSelection::Range { start, end } => {
                let (s, e) = clamp_range(start, end, total_tracks)?;
                (s, e, RANGED_CHUNK_SIZE)
            }
        };

        // selected tracks keep their original 1-based position for tagging
        let selected: Vec<(usize, u64)> = set.track_ids[start - 1..end]
            .iter()
            .enumerate()
            .map(|(i, id)| (start + i, *id))
            .collect();
        let selected_count = selected.len();

        let progress_table: Arc<Mutex<HashMap<u64, f32>>> = Arc::new(Mutex::new(
            selected.iter().map(|(_, id)| (*id, 0.0f32)).collect(),
        ));

        let mut gate = self.controls.receiver(download_id);
        let mut failed = 0usize;

        for chunk in selected.chunks(chunk_size) {
            if let Some(gate) = gate.as_mut() {
                wait_while_paused(download_id, gate, &self.notifier).await;
            }

            let ids: Vec<u64> = chunk.iter().map(|(_, id)| *id).collect();
            let descriptors = match self.source.resolve_tracks(&ids).await {
                Ok(descriptors) => descriptors,
                Err(e) => {
                    warn!(
                        "metadata lookup failed for chunk of download {}: {}",
                        download_id, e
                    );
                    failed += chunk.len();
                    self.mark_chunk_settled(&ids, &progress_table, selected_count, download_id);
                    continue;
                }
            };
            let by_id: HashMap<u64, &TrackDescriptor> =
                descriptors.iter().map(|d| (d.id, d)).collect();

            let mut pipelines = Vec::with_capacity(chunk.len());
            for (original_index, track_id) in chunk {
                pipelines.push(self.run_one(
                    download_id,
                    *track_id,
                    *original_index,
                    total_tracks,
                    set,
                    by_id.get(track_id).copied(),
                    &progress_table,
                    selected_count,
                ));
            }

            // chunk barrier: every sibling settles before the next chunk
            let results = futures::future::join_all(pipelines).await;
            failed += results.iter().filter(|r| r.is_err()).count();
        }

        Ok(SetOutcome {
            attempted: selected_count,
            failed,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_one(
        &self,
        download_id: &str,
        track_id: u64,
        original_index: usize,
        total_tracks: usize,
        set: &SetDescriptor,
        descriptor: Option<&TrackDescriptor>,
        progress_table: &Arc<Mutex<HashMap<u64, f32>>>,
        selected_count: usize,
    ) -> Result<(), DownloadError> {
        // pause can land between siblings of one chunk too
        if let Some(mut gate) = self.controls.receiver(download_id) {
            wait_while_paused(download_id, &mut gate, &self.notifier).await;
        }

        let report: Arc<dyn Fn(f32) + Send + Sync> = {
            let table = Arc::clone(progress_table);
            let notifier = self.notifier.clone();
            let download_id = download_id.to_string();
            Arc::new(move |pct: f32| {
                let aggregate = {
                    let mut table = table.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                    table.insert(track_id, pct.clamp(0.0, 100.0));
                    table.values().sum::<f32>() / selected_count as f32
                };
                notifier.progress(&download_id, aggregate);
            })
        };

        let result = match descriptor {
            Some(track) => {
                self.runner
                    .run_track(
                        download_id,
                        track,
                        Some(TrackNumbering {
                            number: original_index as u16,
                            total: total_tracks as u16,
                        }),
                        Some(&set.title),
                        Arc::clone(&report),
                    )
                    .await
            }
            None => Err(DownloadError::InvalidTrack {
                id: track_id,
                reason: "metadata lookup did not return this track".into(),
            }),
        };

        if let Err(e) = &result {
            warn!("track {} of download {} failed: {}", track_id, download_id, e);
        }
        // settled either way; a failed track counts as fully consumed so the
        // aggregate can still reach 100
        (*report)(100.0);
        result
    }

    fn mark_chunk_settled(
        &self,
        ids: &[u64],
        progress_table: &Arc<Mutex<HashMap<u64, f32>>>,
        selected_count: usize,
        download_id: &str,
    ) {
        let aggregate = {
            let mut table = progress_table
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            for id in ids {
                table.insert(*id, 100.0);
            }
            table.values().sum::<f32>() / selected_count as f32
        };
        self.notifier.progress(download_id, aggregate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{ChannelNotificationPort, Notification};
    use crate::model::RemoteResource;
    use crate::model::TranscodingOption;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn descriptor(id: u64) -> TrackDescriptor {
        TrackDescriptor {
            id,
            title: format!("Track {}", id),
            uploader: "Uploader".into(),
            uploader_handle: "uploader".into(),
            permalink_url: None,
            duration_ms: 1000,
            artwork_url: None,
            genre: None,
            year: None,
            playable: true,
            downloadable: false,
            download_url: None,
            transcodings: vec![],
        }
    }

    struct MapSource;

    #[async_trait]
    impl TrackSource for MapSource {
        async fn resolve(&self, _url: &str) -> Result<RemoteResource, DownloadError> {
            unimplemented!("not used by coordinator tests")
        }

        async fn resolve_tracks(&self, ids: &[u64]) -> Result<Vec<TrackDescriptor>, DownloadError> {
            Ok(ids.iter().map(|&id| descriptor(id)).collect())
        }

        async fn stream_location(
            &self,
            _t: &TranscodingOption,
        ) -> Result<String, DownloadError> {
            unimplemented!("not used by coordinator tests")
        }

        async fn original_download_url(
            &self,
            _track: &TrackDescriptor,
        ) -> Result<Option<String>, DownloadError> {
            Ok(None)
        }
    }

    #[derive(Default)]
    struct RecordingRunner {
        runs: Mutex<Vec<(u64, Option<TrackNumbering>, Option<String>)>>,
        fail_ids: Vec<u64>,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    #[async_trait]
    impl TrackRunner for RecordingRunner {
        async fn run_track(
            &self,
            _download_id: &str,
            track: &TrackDescriptor,
            numbering: Option<TrackNumbering>,
            album: Option<&str>,
            progress: Arc<dyn Fn(f32) + Send + Sync>,
        ) -> Result<(), DownloadError> {
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now_active, Ordering::SeqCst);

            (*progress)(50.0);
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            self.runs
                .lock()
                .unwrap()
                .push((track.id, numbering, album.map(|a| a.to_string())));

            if self.fail_ids.contains(&track.id) {
                return Err(DownloadError::NoDownloadableStream(track.id));
            }
            (*progress)(100.0);
            Ok(())
        }
    }

    fn set_of(n: u64) -> SetDescriptor {
        SetDescriptor {
            id: 1,
            title: "The Set".into(),
            uploader: "Uploader".into(),
            track_ids: (1..=n).collect(),
        }
    }

    fn coordinator(
        runner: Arc<RecordingRunner>,
        controls: PauseControls,
    ) -> (PlaylistCoordinator, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let notifier = Notifier::new(Arc::new(ChannelNotificationPort::new(tx)));
        (
            PlaylistCoordinator::new(Arc::new(MapSource), runner, notifier, controls),
            rx,
        )
    }

    #[test]
    fn clamping_covers_the_corner_cases() {
        assert_eq!(clamp_range(1, None, 12).unwrap(), (1, 12));
        assert_eq!(clamp_range(5, None, 12).unwrap(), (5, 12));
        assert_eq!(clamp_range(5, Some(9), 12).unwrap(), (5, 9));
        assert_eq!(clamp_range(0, Some(900), 12).unwrap(), (1, 12));
        assert_eq!(clamp_range(40, Some(50), 12).unwrap(), (12, 12));
        // end before start is pulled up to start
        assert_eq!(clamp_range(7, Some(3), 12).unwrap(), (7, 7));
        assert!(clamp_range(1, None, 0).is_err());
    }

    #[test]
    fn clamped_range_always_selects_expected_count() {
        for n in 1usize..=15 {
            for start in 1..=n {
                assert_eq!(clamp_range(start, None, n).unwrap(), (start, n));
                for end in start..=n {
                    let (s, e) = clamp_range(start, Some(end), n).unwrap();
                    assert_eq!((s, e), (start, end));
                    assert_eq!(e - s + 1, end - start + 1);
                }
            }
        }
    }

    #[tokio::test]
    async fn ranged_download_keeps_original_numbering() {
        let runner = Arc::new(RecordingRunner::default());
        let (coordinator, _rx) = coordinator(Arc::clone(&runner), PauseControls::default());

        let outcome = coordinator
            .download_set(
                "dl-1",
                &set_of(12),
                SetSelection::Range { start: 5, end: None },
            )
            .await
            .unwrap();

        assert_eq!(outcome, SetOutcome { attempted: 8, failed: 0 });

        let runs = runner.runs.lock().unwrap();
        assert_eq!(runs.len(), 8);
        let mut ids: Vec<u64> = runs.iter().map(|(id, _, _)| *id).collect();
        ids.sort();
        assert_eq!(ids, (5..=12).collect::<Vec<u64>>());

        // the track originally at position 9 is tagged 9 of 12, not 5 of 8
        let ninth = runs.iter().find(|(id, _, _)| *id == 9).unwrap();
        assert_eq!(ninth.1, Some(TrackNumbering { number: 9, total: 12 }));
        assert_eq!(ninth.2.as_deref(), Some("The Set"));
    }

    #[tokio::test]
    async fn chunk_concurrency_is_bounded_and_chunks_are_barriers() {
        let runner = Arc::new(RecordingRunner::default());
        let (coordinator, _rx) = coordinator(Arc::clone(&runner), PauseControls::default());

        coordinator
            .download_set("dl-1", &set_of(12), SetSelection::Full)
            .await
            .unwrap();

        assert_eq!(runner.runs.lock().unwrap().len(), 12);
        let max = runner.max_active.load(Ordering::SeqCst);
        assert!(max <= FULL_SET_CHUNK_SIZE, "observed {} concurrent tracks", max);

        // the second chunk (tracks 11, 12) only ran after the first settled
        let runs = runner.runs.lock().unwrap();
        let first_chunk_done = runs
            .iter()
            .position(|(id, _, _)| *id == 11 || *id == 12)
            .unwrap();
        assert!(first_chunk_done >= 10);
    }

    #[tokio::test]
    async fn failures_are_aggregated_not_fatal() {
        let runner = Arc::new(RecordingRunner {
            fail_ids: vec![2, 3],
            ..Default::default()
        });
        let (coordinator, mut rx) = coordinator(Arc::clone(&runner), PauseControls::default());

        let outcome = coordinator
            .download_set("dl-1", &set_of(4), SetSelection::Full)
            .await
            .unwrap();
        assert_eq!(outcome, SetOutcome { attempted: 4, failed: 2 });
        // siblings of the failed tracks still ran
        assert_eq!(runner.runs.lock().unwrap().len(), 4);

        // aggregate progress still reaches 100
        let mut last = 0.0f32;
        while let Ok(n) = rx.try_recv() {
            if let Some(p) = n.progress {
                last = p;
            }
        }
        assert!((last - 100.0).abs() < 0.01, "final aggregate was {}", last);
    }

    #[tokio::test]
    async fn empty_selection_downloads_nothing() {
        let runner = Arc::new(RecordingRunner::default());
        let (coordinator, _rx) = coordinator(Arc::clone(&runner), PauseControls::default());

        let err = coordinator
            .download_set("dl-1", &set_of(0), SetSelection::Full)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::InvalidRange(_)));
        assert!(runner.runs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn pause_gate_blocks_between_tracks_and_announces_once() {
        let runner = Arc::new(RecordingRunner::default());
        let controls = PauseControls::default();
        let (coordinator, mut rx) = coordinator(Arc::clone(&runner), controls.clone());

        controls.register("dl-1");
        controls.pause("dl-1");

        let set = set_of(2);
        let handle = tokio::spawn(async move {
            coordinator
                .download_set("dl-1", &set, SetSelection::Full)
                .await
        });

        // paused before the first chunk: nothing runs, one Paused status
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(runner.runs.lock().unwrap().is_empty());
        let n = rx.recv().await.unwrap();
        assert_eq!(n.status, Some(TransferStatus::Paused));

        controls.resume("dl-1");
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.failed, 0);
        assert_eq!(runner.runs.lock().unwrap().len(), 2);
    }
}
