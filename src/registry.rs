//! Source of truth for in-flight downloads on the UI side: one record per
//! correlation id, mutated only here in response to local transitions or
//! validated incoming notifications.

use std::collections::HashMap;

use log::{debug, warn};

use crate::bridge::{Notification, RecordSnapshot, TransferStatus};
use crate::model::{PROGRESS_DONE, PROGRESS_DONE_WITH_ERRORS};

/// How long a finished download stays visible before reverting to idle.
pub const RESET_DELAY_MS: i64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStage {
    Idle,
    Preparing,
    Downloading,
    Pausing,
    Paused,
    Resuming,
    Finishing,
    Downloaded,
    Error,
}

impl DownloadStage {
    pub fn is_active(self) -> bool {
        use DownloadStage::*;
        matches!(self, Preparing | Downloading | Pausing | Paused | Resuming | Finishing)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DownloadStage::Downloaded | DownloadStage::Error)
    }

    /// While a pause/resume round-trip is in flight, stale progress must not
    /// flap the visible state; only explicit acknowledgements pass.
    fn suppresses_notifications(self) -> bool {
        use DownloadStage::*;
        matches!(self, Pausing | Paused | Resuming)
    }
}

#[derive(Debug, Clone)]
pub struct DownloadRecord {
    pub id: String,
    pub stage: DownloadStage,
    pub progress: f32,
    /// Finished, but some tracks failed (styled differently by the UI).
    pub partial: bool,
    pub error: Option<String>,
    pub last_progress_at: Option<i64>,
    pub external_handle: Option<u64>,
    pub reset_deadline: Option<i64>,
    /// Progress went quiet; flagged for the user, state unchanged.
    pub stall_flagged: bool,
}

impl DownloadRecord {
    fn new(id: String) -> Self {
        Self {
            id,
            stage: DownloadStage::Preparing,
            progress: 0.0,
            partial: false,
            error: None,
            last_progress_at: None,
            external_handle: None,
            reset_deadline: None,
            stall_flagged: false,
        }
    }
}

/// What a received notification did to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Ignored,
    Updated,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy)]
pub struct StallPolicy {
    pub warn_after_ms: i64,
    pub assume_complete_after_ms: i64,
    /// The silent-completion tier is a guess, not a guarantee; it can be
    /// switched off wholesale.
    pub assume_completion: bool,
}

impl Default for StallPolicy {
    fn default() -> Self {
        Self {
            warn_after_ms: 30_000,
            assume_complete_after_ms: 180_000,
            assume_completion: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StallEvent {
    PossiblyStuck(String),
    AssumedComplete(String),
}

#[derive(Debug, Default)]
pub struct DownloadRegistry {
    records: HashMap<String, DownloadRecord>,
}

impl DownloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new download in `Preparing`. Refused while an active
    /// record already holds the id.
    pub fn create(&mut self, id: &str) -> Option<&mut DownloadRecord> {
        if self.records.get(id).is_some_and(|r| r.stage.is_active()) {
            return None;
        }
        self.records
            .insert(id.to_string(), DownloadRecord::new(id.to_string()));
        self.records.get_mut(id)
    }

    pub fn get(&self, id: &str) -> Option<&DownloadRecord> {
        self.records.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut DownloadRecord> {
        self.records.get_mut(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<DownloadRecord> {
        self.records.remove(id)
    }

    pub fn snapshots(&self) -> Vec<RecordSnapshot> {
        self.records
            .values()
            .map(|r| RecordSnapshot {
                id: r.id.clone(),
                active: r.stage.is_active(),
                external_handle: r.external_handle,
                last_progress_at: r.last_progress_at,
            })
            .collect()
    }

    /// Apply a validated notification to the record it was bound to.
    pub fn apply_notification(&mut self, id: &str, notification: &Notification) -> Applied {
        let Some(record) = self.records.get_mut(id) else {
            debug!("notification for unknown download {} dropped", id);
            return Applied::Ignored;
        };

        if let Some(handle) = notification.external_handle {
            record.external_handle = Some(handle);
        }

        // Duplicate completions for a finished record are no-ops, and an
        // errored record only leaves Error through an explicit retry.
        if record.stage.is_terminal() {
            return Applied::Ignored;
        }

        if record.stage.suppresses_notifications() {
            return match notification.status {
                Some(TransferStatus::Paused) => {
                    record.stage = DownloadStage::Paused;
                    Applied::Updated
                }
                Some(TransferStatus::Resuming) => {
                    record.stage = DownloadStage::Downloading;
                    Applied::Updated
                }
                None => Applied::Ignored,
            };
        }

        if let Some(message) = &notification.error {
            record.stage = DownloadStage::Error;
            record.error = Some(message.clone());
            return Applied::Failed;
        }

        if let Some(status) = notification.status {
            match status {
                TransferStatus::Paused => record.stage = DownloadStage::Paused,
                TransferStatus::Resuming => record.stage = DownloadStage::Downloading,
            }
            return Applied::Updated;
        }

        let terminal_progress = notification
            .progress
            .is_some_and(|p| p >= PROGRESS_DONE);
        if terminal_progress || notification.completed == Some(true) {
            record.partial = notification
                .progress
                .is_some_and(|p| p >= PROGRESS_DONE_WITH_ERRORS);
            record.progress = 100.0;
            record.stage = DownloadStage::Downloaded;
            record.reset_deadline = Some(notification.timestamp + RESET_DELAY_MS);
            return Applied::Completed;
        }

        if let Some(progress) = notification.progress {
            if record.stage == DownloadStage::Preparing {
                record.stage = DownloadStage::Downloading;
            }
            // monotone while downloading; stale lower values are ignored
            if progress > record.progress {
                record.progress = progress.min(100.0);
            }
            record.last_progress_at = Some(notification.timestamp);
            record.stall_flagged = false;
            if record.progress >= 100.0 {
                record.stage = DownloadStage::Finishing;
            }
            return Applied::Updated;
        }

        Applied::Ignored
    }

    /// Local transition when the user asks to pause/resume; the bridge
    /// command goes out separately.
    pub fn mark_pausing(&mut self, id: &str) -> bool {
        match self.records.get_mut(id) {
            Some(r) if r.stage == DownloadStage::Downloading || r.stage == DownloadStage::Finishing => {
                r.stage = DownloadStage::Pausing;
                true
            }
            _ => false,
        }
    }

    pub fn mark_resuming(&mut self, id: &str) -> bool {
        match self.records.get_mut(id) {
            Some(r) if r.stage == DownloadStage::Paused => {
                r.stage = DownloadStage::Resuming;
                true
            }
            _ => false,
        }
    }

    /// Flag quiet downloads, and past the longer window optimistically
    /// assume they finished while the completion notification was lost.
    pub fn scan_stalls(&mut self, now_ms: i64, policy: &StallPolicy) -> Vec<StallEvent> {
        let mut events = Vec::new();
        for record in self.records.values_mut() {
            if record.stage != DownloadStage::Downloading {
                continue;
            }
            let Some(last) = record.last_progress_at else {
                continue;
            };
            let quiet_for = now_ms - last;

            if policy.assume_completion && quiet_for >= policy.assume_complete_after_ms {
                warn!(
                    "download {} silent for {}s, assuming it completed",
                    record.id,
                    quiet_for / 1000
                );
                record.progress = 100.0;
                record.stage = DownloadStage::Downloaded;
                record.reset_deadline = Some(now_ms + RESET_DELAY_MS);
                events.push(StallEvent::AssumedComplete(record.id.clone()));
            } else if quiet_for >= policy.warn_after_ms && !record.stall_flagged {
                record.stall_flagged = true;
                events.push(StallEvent::PossiblyStuck(record.id.clone()));
            }
        }
        events
    }

    /// Remove finished records whose settle delay has elapsed; they revert
    /// to the absent/idle state. Errors stay until an explicit retry.
    pub fn take_due_resets(&mut self, now_ms: i64) -> Vec<String> {
        let due: Vec<String> = self
            .records
            .values()
            .filter(|r| {
                r.stage == DownloadStage::Downloaded
                    && r.reset_deadline.is_some_and(|d| d <= now_ms)
            })
            .map(|r| r.id.clone())
            .collect();
        for id in &due {
            self.records.remove(id);
        }
        due
    }
}
