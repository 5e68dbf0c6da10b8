//! The UI side of the bridge: issues commands, owns the download registry,
//! reconciles incoming notifications, and renders one progress bar per
//! download under a summary header.

use std::collections::HashMap;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::bridge::{
    now_ms, reconcile, Command, CommandEnvelope, CommandSink, Notification,
};
use crate::registry::{Applied, DownloadRegistry, DownloadStage, StallEvent, StallPolicy};

#[derive(Debug, Clone)]
pub struct DownloadSpec {
    pub label: String,
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    CompletedWithErrors,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UiSummary {
    pub completed: usize,
    pub partial: usize,
    pub failed: usize,
}

/// Signals forwarded from the daemon control surface.
#[derive(Debug, Clone, Copy)]
pub enum ControlEvent {
    PauseAll,
    ResumeAll,
}

pub struct UiSide {
    registry: DownloadRegistry,
    commands: Box<dyn CommandSink>,
    stall_policy: StallPolicy,
    multi: MultiProgress,
    header: ProgressBar,
    bars: HashMap<String, ProgressBar>,
    labels: HashMap<String, String>,
    outcomes: HashMap<String, Outcome>,
    expected: usize,
}

impl UiSide {
    pub fn new(commands: Box<dyn CommandSink>, stall_policy: StallPolicy) -> Self {
        let multi = MultiProgress::new();
        multi.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));

        let header = multi.add(ProgressBar::new(0));
        header.set_style(
            ProgressStyle::default_bar()
                .template("{msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        Self {
            registry: DownloadRegistry::new(),
            commands,
            stall_policy,
            multi,
            header,
            bars: HashMap::new(),
            labels: HashMap::new(),
            outcomes: HashMap::new(),
            expected: 0,
        }
    }

    /// Issue the commands and consume notifications until every download
    /// reached a terminal state.
    pub async fn run(
        mut self,
        specs: Vec<DownloadSpec>,
        mut notifications: mpsc::UnboundedReceiver<Notification>,
        mut control: mpsc::UnboundedReceiver<ControlEvent>,
    ) -> anyhow::Result<UiSummary> {
        self.expected = specs.len();
        for spec in specs {
            self.start(spec)?;
        }
        self.refresh_header();

        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if self.outcomes.len() >= self.expected {
                break;
            }

            tokio::select! {
                notification = notifications.recv() => {
                    match notification {
                        Some(n) => self.on_notification(n),
                        None => {
                            warn!("notification channel closed early");
                            break;
                        }
                    }
                }
                event = control.recv() => {
                    if let Some(event) = event {
                        self.on_control(event);
                    }
                }
                _ = ticker.tick() => {
                    self.on_tick();
                }
            }
        }

        self.header.finish_and_clear();
        Ok(self.summary())
    }

    fn start(&mut self, spec: DownloadSpec) -> anyhow::Result<()> {
        let id = Uuid::new_v4().to_string();
        if self.registry.create(&id).is_none() {
            anyhow::bail!("correlation id collision for {}", id);
        }

        let bar = self.multi.add(ProgressBar::new(100));
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        bar.set_message(format!("Preparing   {}", spec.label));
        self.bars.insert(id.clone(), bar);
        self.labels.insert(id.clone(), spec.label);

        self.commands.send(CommandEnvelope {
            correlation_id: id,
            command: spec.command,
        })?;
        Ok(())
    }

    fn on_notification(&mut self, notification: Notification) {
        let id = match reconcile(&notification, &self.registry.snapshots()) {
            Some(id) => id,
            None => {
                debug!("unroutable notification discarded: {:?}", notification);
                return;
            }
        };

        let applied = self.registry.apply_notification(&id, &notification);
        match applied {
            Applied::Ignored => {}
            Applied::Updated => self.render(&id),
            Applied::Completed => {
                let partial = self.registry.get(&id).map(|r| r.partial).unwrap_or(false);
                self.outcomes.insert(
                    id.clone(),
                    if partial {
                        Outcome::CompletedWithErrors
                    } else {
                        Outcome::Completed
                    },
                );
                self.finish_bar(&id, partial);
                self.refresh_header();
            }
            Applied::Failed => {
                self.outcomes.insert(id.clone(), Outcome::Failed);
                let message = self
                    .registry
                    .get(&id)
                    .and_then(|r| r.error.clone())
                    .unwrap_or_else(|| "unknown error".to_string());
                if let Some(bar) = self.bars.get(&id) {
                    bar.abandon_with_message(format!(
                        "Error       {} ({})",
                        self.labels.get(&id).map(String::as_str).unwrap_or(&id),
                        message
                    ));
                }
                self.refresh_header();
            }
        }
    }

    fn on_control(&mut self, event: ControlEvent) {
        let ids: Vec<String> = self.bars.keys().cloned().collect();
        match event {
            ControlEvent::PauseAll => {
                info!("pausing all active downloads");
                for id in ids {
                    if self.registry.mark_pausing(&id) {
                        let _ = self.commands.send(CommandEnvelope {
                            correlation_id: id.clone(),
                            command: Command::Pause,
                        });
                        self.render(&id);
                    }
                }
            }
            ControlEvent::ResumeAll => {
                info!("resuming paused downloads");
                for id in ids {
                    if self.registry.mark_resuming(&id) {
                        let _ = self.commands.send(CommandEnvelope {
                            correlation_id: id.clone(),
                            command: Command::Resume,
                        });
                        self.render(&id);
                    }
                }
            }
        }
    }

    fn on_tick(&mut self) {
        let now = now_ms();
        for event in self.registry.scan_stalls(now, &self.stall_policy) {
            match event {
                StallEvent::PossiblyStuck(id) => {
                    if let Some(bar) = self.bars.get(&id) {
                        let label = self.labels.get(&id).map(String::as_str).unwrap_or(&id);
                        bar.set_message(format!("Stalled?    {}", label));
                    }
                }
                StallEvent::AssumedComplete(id) => {
                    self.outcomes.entry(id.clone()).or_insert(Outcome::Completed);
                    self.finish_bar(&id, false);
                    self.refresh_header();
                }
            }
        }

        for id in self.registry.take_due_resets(now) {
            debug!("download {} settled back to idle", id);
            if let Some(bar) = self.bars.remove(&id) {
                bar.finish_and_clear();
            }
        }
    }

    fn render(&self, id: &str) {
        let Some(record) = self.registry.get(id) else {
            return;
        };
        let Some(bar) = self.bars.get(id) else {
            return;
        };
        let label = self.labels.get(id).map(String::as_str).unwrap_or(id);

        bar.set_position(record.progress.clamp(0.0, 100.0) as u64);
        let verb = match record.stage {
            DownloadStage::Preparing => "Preparing",
            DownloadStage::Downloading => "Downloading",
            DownloadStage::Pausing => "Pausing",
            DownloadStage::Paused => "Paused",
            DownloadStage::Resuming => "Resuming",
            DownloadStage::Finishing => "Finishing",
            DownloadStage::Downloaded => "Completed",
            DownloadStage::Error => "Error",
            DownloadStage::Idle => "Idle",
        };
        bar.set_message(format!("{:<11} {}", verb, label));
    }

    fn finish_bar(&self, id: &str, partial: bool) {
        if let Some(bar) = self.bars.get(id) {
            let label = self.labels.get(id).map(String::as_str).unwrap_or(id);
            bar.set_position(100);
            if partial {
                bar.finish_with_message(format!("Completed*  {} (some tracks failed)", label));
            } else {
                bar.finish_with_message(format!("Completed   {}", label));
            }
        }
    }

    fn refresh_header(&self) {
        let done = self.outcomes.len();
        self.header
            .set_message(format!("Downloads: {}/{}", done, self.expected));
        self.header.tick();
    }

    fn summary(&self) -> UiSummary {
        let mut summary = UiSummary::default();
        for outcome in self.outcomes.values() {
            match outcome {
                Outcome::Completed => summary.completed += 1,
                Outcome::CompletedWithErrors => summary.partial += 1,
                Outcome::Failed => summary.failed += 1,
            }
        }
        summary
    }
}
