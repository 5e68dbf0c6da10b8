//! Cross-context request/response and notification channel.
//!
//! Delivery is at-least-once with no ordering guarantee across distinct
//! sends, and notifications may arrive before a correlation id is known on
//! the producing side. `reconcile` is the pure function that binds such a
//! notification to a tracked download, with explicit, ordered fallback
//! tiers; anything it cannot bind is discarded, never guessed at.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::model::PROGRESS_DONE;

/// Delay before a completion notification is sent a second time. The channel
/// is not reliable, and a lost completion would strand the UI in
/// `Downloading` until the stall timer guesses.
pub const COMPLETION_ECHO_DELAY: Duration = Duration::from_millis(1500);

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Download { url: String },
    DownloadSet { url: String },
    DownloadSetRange { url: String, start: usize, end: Option<usize> },
    Pause,
    Resume,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub correlation_id: String,
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    Paused,
    Resuming,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Notification {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TransferStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_handle: Option<u64>,
    pub timestamp: i64,
}

impl Notification {
    fn for_id(id: &str) -> Self {
        Notification {
            correlation_id: Some(id.to_string()),
            timestamp: now_ms(),
            ..Default::default()
        }
    }

    pub fn progress(id: &str, progress: f32) -> Self {
        Notification {
            progress: Some(progress),
            ..Self::for_id(id)
        }
    }

    pub fn status(id: &str, status: TransferStatus) -> Self {
        Notification {
            status: Some(status),
            ..Self::for_id(id)
        }
    }

    pub fn error(id: &str, message: impl Into<String>) -> Self {
        Notification {
            error: Some(message.into()),
            ..Self::for_id(id)
        }
    }

    pub fn completion(id: &str, code: f32, external_handle: Option<u64>) -> Self {
        Notification {
            progress: Some(code),
            completed: Some(true),
            external_handle,
            ..Self::for_id(id)
        }
    }

    /// A completion signal judged by shape: an explicit flag, a terminal
    /// progress sentinel, or an otherwise empty payload.
    pub fn is_pure_completion(&self) -> bool {
        if self.completed == Some(true) {
            return true;
        }
        if matches!(self.progress, Some(p) if p >= PROGRESS_DONE) {
            return true;
        }
        self.progress.is_none()
            && self.status.is_none()
            && self.error.is_none()
            && self.completed.is_none()
    }
}

/// The registry state `reconcile` is allowed to see.
#[derive(Debug, Clone)]
pub struct RecordSnapshot {
    pub id: String,
    pub active: bool,
    pub external_handle: Option<u64>,
    pub last_progress_at: Option<i64>,
}

/// Bind a notification that arrived without a correlation id to a tracked
/// download, or decline. Tiers, in order:
///
/// 1. an external handle carried by exactly one record,
/// 2. a pure completion signal while exactly one record is active,
/// 3. the active record with the most recent progress (the notification's
///    own timestamp is only a tie-breaker, never the key),
/// 4. give up; the caller logs and drops the notification.
pub fn reconcile(notification: &Notification, records: &[RecordSnapshot]) -> Option<String> {
    if let Some(id) = &notification.correlation_id {
        return Some(id.clone());
    }

    if let Some(handle) = notification.external_handle {
        let mut matching = records.iter().filter(|r| r.external_handle == Some(handle));
        if let (Some(found), None) = (matching.next(), matching.next()) {
            return Some(found.id.clone());
        }
    }

    let actives: Vec<&RecordSnapshot> = records.iter().filter(|r| r.active).collect();

    if notification.is_pure_completion() && actives.len() == 1 {
        return Some(actives[0].id.clone());
    }

    let mut dated: Vec<&RecordSnapshot> = actives
        .into_iter()
        .filter(|r| r.last_progress_at.is_some())
        .collect();
    if !dated.is_empty() {
        dated.sort_by_key(|r| {
            let at = r.last_progress_at.unwrap_or(i64::MIN);
            // recency first; distance to the notification timestamp breaks ties
            (at, -(notification.timestamp - at).abs())
        });
        return dated.last().map(|r| r.id.clone());
    }

    None
}

#[derive(Debug, Error)]
pub enum BridgeError {
    /// A routed request reached the send path without a correlation id.
    /// That is a programmer error and must never go over the wire.
    #[error("command {0} sent without a correlation id")]
    MissingCorrelationId(String),

    #[error("bridge channel closed")]
    Closed,
}

pub trait NotificationSink: Send + Sync {
    fn send(&self, notification: Notification) -> Result<(), BridgeError>;
}

pub trait CommandSink: Send + Sync {
    fn send(&self, envelope: CommandEnvelope) -> Result<(), BridgeError>;
}

pub struct ChannelNotificationPort {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotificationPort {
    pub fn new(tx: mpsc::UnboundedSender<Notification>) -> Self {
        Self { tx }
    }
}

impl NotificationSink for ChannelNotificationPort {
    fn send(&self, notification: Notification) -> Result<(), BridgeError> {
        self.tx.send(notification).map_err(|_| BridgeError::Closed)
    }
}

pub struct ChannelCommandPort {
    tx: mpsc::UnboundedSender<CommandEnvelope>,
}

impl ChannelCommandPort {
    pub fn new(tx: mpsc::UnboundedSender<CommandEnvelope>) -> Self {
        Self { tx }
    }
}

impl CommandSink for ChannelCommandPort {
    fn send(&self, envelope: CommandEnvelope) -> Result<(), BridgeError> {
        if envelope.correlation_id.trim().is_empty() {
            return Err(BridgeError::MissingCorrelationId(format!(
                "{:?}",
                envelope.command
            )));
        }
        self.tx.send(envelope).map_err(|_| BridgeError::Closed)
    }
}

/// Producer-side helper wrapping a sink with timestamped convenience sends.
#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    pub fn progress(&self, id: &str, progress: f32) {
        if let Err(e) = self.sink.send(Notification::progress(id, progress)) {
            debug!("progress notification dropped: {}", e);
        }
    }

    pub fn status(&self, id: &str, status: TransferStatus) {
        if let Err(e) = self.sink.send(Notification::status(id, status)) {
            debug!("status notification dropped: {}", e);
        }
    }

    pub fn error(&self, id: &str, message: &str) {
        if let Err(e) = self.sink.send(Notification::error(id, message)) {
            warn!("error notification dropped: {}", e);
        }
    }

    /// Send a terminal notification, then echo it once after a short delay.
    /// Duplicates are idempotent on the receiving side.
    pub fn completion(&self, id: &str, code: f32, external_handle: Option<u64>) {
        let first = Notification::completion(id, code, external_handle);
        if let Err(e) = self.sink.send(first) {
            warn!("completion notification dropped: {}", e);
        }

        let sink = Arc::clone(&self.sink);
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(COMPLETION_ECHO_DELAY).await;
            let _ = sink.send(Notification::completion(&id, code, external_handle));
        });
    }
}
