//! Bounded pool of native remux workers over a FIFO task queue.
//!
//! Dispatch runs on enqueue and on every worker completion, always under the
//! pool lock and never across an await point, so two tasks can never land on
//! the same worker slot. A worker whose task blows up, or whose scratch
//! directory cannot be cleaned afterwards, is retired and replaced; when the
//! replacement itself fails the pool permanently shrinks by one.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;

use crate::error::DownloadError;

pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 10;

pub type RemuxProgressFn = Arc<dyn Fn(f32) + Send + Sync>;

/// The native remux operation itself, kept behind a trait so the pool's
/// queueing, assignment and replacement logic is testable without ffmpeg.
#[async_trait]
pub trait RemuxBackend: Send + Sync + 'static {
    async fn prepare(&self, workdir: &Path) -> std::io::Result<()>;

    async fn run(
        &self,
        workdir: &Path,
        input: &[u8],
        extension: &str,
        duration_hint: Option<Duration>,
        progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Result<Vec<u8>, DownloadError>;

    /// Remove whatever `run` left in `workdir`. Failure here compromises
    /// the worker.
    async fn cleanup(&self, workdir: &Path) -> std::io::Result<()>;
}

struct WorkerSlot {
    id: u32,
    busy: bool,
    workdir: PathBuf,
}

struct QueuedTask {
    task_id: String,
    input: Vec<u8>,
    extension: String,
    duration_hint: Option<Duration>,
    progress: RemuxProgressFn,
    reply: oneshot::Sender<Result<Vec<u8>, DownloadError>>,
}

struct PoolState {
    workers: Vec<WorkerSlot>,
    queue: VecDeque<QueuedTask>,
    next_worker_id: u32,
}

struct PoolShared {
    state: Mutex<PoolState>,
    backend: Arc<dyn RemuxBackend>,
    scratch_root: PathBuf,
}

#[derive(Clone)]
pub struct RemuxPool {
    shared: Arc<PoolShared>,
}

impl RemuxPool {
    pub fn new(backend: Arc<dyn RemuxBackend>, max_concurrent: usize, scratch_root: PathBuf) -> Self {
        let size = max_concurrent.clamp(MIN_WORKERS, MAX_WORKERS);
        let workers = (0..size as u32)
            .map(|id| WorkerSlot {
                id,
                busy: false,
                workdir: scratch_root.join(format!("worker-{}", id)),
            })
            .collect();

        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    workers,
                    queue: VecDeque::new(),
                    next_worker_id: size as u32,
                }),
                backend,
                scratch_root,
            }),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.lock_state().workers.len()
    }

    /// Queue a remux and get a future for the rewrapped buffer. Progress
    /// from the operation is forwarded verbatim (0-100); scaling it into an
    /// overall budget is the caller's job. The caller keeps its original
    /// buffer and falls back to it on rejection.
    pub fn request_remux(
        &self,
        task_id: &str,
        input: Vec<u8>,
        extension: &str,
        duration_hint: Option<Duration>,
        progress: RemuxProgressFn,
    ) -> oneshot::Receiver<Result<Vec<u8>, DownloadError>> {
        let (reply, rx) = oneshot::channel();
        {
            let mut state = self.lock_state();
            state.queue.push_back(QueuedTask {
                task_id: task_id.to_string(),
                input,
                extension: extension.to_string(),
                duration_hint,
                progress,
                reply,
            });
        }
        self.dispatch();
        rx
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Assign queued tasks to free workers. Assignment happens under the
    /// lock; the actual work is spawned after it is released.
    fn dispatch(&self) {
        let mut assignments = Vec::new();
        {
            let mut guard = self.lock_state();
            let state = &mut *guard;

            if state.workers.is_empty() {
                // every worker was lost and could not be replaced; fail the
                // queue instead of letting callers wait forever
                while let Some(task) = state.queue.pop_front() {
                    let _ = task.reply.send(Err(DownloadError::RemuxFailure(
                        "no remux workers left".into(),
                    )));
                }
                return;
            }

            while !state.queue.is_empty() {
                let Some(slot) = state.workers.iter_mut().find(|w| !w.busy) else {
                    break;
                };
                slot.busy = true;
                let worker_id = slot.id;
                let workdir = slot.workdir.clone();
                let Some(task) = state.queue.pop_front() else {
                    break;
                };
                assignments.push((worker_id, workdir, task));
            }
        }

        for (worker_id, workdir, task) in assignments {
            let pool = self.clone();
            tokio::spawn(async move {
                pool.run_assignment(worker_id, workdir, task).await;
            });
        }
    }

    async fn run_assignment(&self, worker_id: u32, workdir: PathBuf, task: QueuedTask) {
        let backend = Arc::clone(&self.shared.backend);
        debug!("remux worker {} takes task {}", worker_id, task.task_id);

        let result = match backend.prepare(&workdir).await {
            Ok(()) => {
                backend
                    .run(
                        &workdir,
                        &task.input,
                        &task.extension,
                        task.duration_hint,
                        task.progress.as_ref(),
                    )
                    .await
            }
            Err(e) => Err(DownloadError::RemuxFailure(format!(
                "could not prepare worker directory: {}",
                e
            ))),
        };

        let cleanup_ok = match backend.cleanup(&workdir).await {
            Ok(()) => true,
            Err(e) => {
                warn!("remux worker {} cleanup failed: {}", worker_id, e);
                false
            }
        };

        let compromised = result.is_err() || !cleanup_ok;
        if task.reply.send(result).is_err() {
            debug!("remux task {} finished after its caller went away", task.task_id);
        }

        self.finish_worker(worker_id, compromised);
    }

    fn finish_worker(&self, worker_id: u32, compromised: bool) {
        {
            let mut state = self.lock_state();
            if compromised {
                state.workers.retain(|w| w.id != worker_id);
                let new_id = state.next_worker_id;
                state.next_worker_id += 1;
                let workdir = self.shared.scratch_root.join(format!("worker-{}", new_id));
                match std::fs::create_dir_all(&workdir) {
                    Ok(()) => {
                        warn!("remux worker {} retired, replaced by {}", worker_id, new_id);
                        state.workers.push(WorkerSlot {
                            id: new_id,
                            busy: false,
                            workdir,
                        });
                    }
                    Err(e) => {
                        error!(
                            "remux worker {} retired and replacement failed ({}); pool shrinks to {}",
                            worker_id,
                            e,
                            state.workers.len()
                        );
                    }
                }
            } else if let Some(slot) = state.workers.iter_mut().find(|w| w.id == worker_id) {
                slot.busy = false;
            }
        }
        self.dispatch();
    }
}

/// Stream-copy remux through an ffmpeg subprocess, progress read from its
/// machine-readable `-progress` output.
pub struct FfmpegBackend {
    binary: PathBuf,
}

impl FfmpegBackend {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    /// Look for ffmpeg on PATH, falling back to the bare name.
    pub fn discover() -> Self {
        let binary = std::process::Command::new("which")
            .arg("ffmpeg")
            .output()
            .ok()
            .filter(|out| out.status.success())
            .and_then(|out| {
                let path = String::from_utf8_lossy(&out.stdout).trim().to_string();
                if path.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(path))
                }
            })
            .unwrap_or_else(|| PathBuf::from("ffmpeg"));
        Self { binary }
    }
}

#[async_trait]
impl RemuxBackend for FfmpegBackend {
    async fn prepare(&self, workdir: &Path) -> std::io::Result<()> {
        tokio::fs::create_dir_all(workdir).await
    }

    async fn run(
        &self,
        workdir: &Path,
        input: &[u8],
        extension: &str,
        duration_hint: Option<Duration>,
        progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Result<Vec<u8>, DownloadError> {
        let input_path = workdir.join("input.bin");
        let output_path = workdir.join(format!("output.{}", extension));

        tokio::fs::write(&input_path, input)
            .await
            .map_err(|e| DownloadError::RemuxFailure(format!("writing remux input: {}", e)))?;

        let mut child = tokio::process::Command::new(&self.binary)
            .arg("-y")
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-i")
            .arg(&input_path)
            .arg("-c")
            .arg("copy")
            .arg("-progress")
            .arg("pipe:1")
            .arg(&output_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DownloadError::RemuxFailure(format!("spawning ffmpeg: {}", e)))?;

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(value) = line.strip_prefix("out_time_us=") {
                    if let (Ok(elapsed_us), Some(total)) = (value.trim().parse::<u64>(), duration_hint)
                    {
                        let total_us = total.as_micros() as u64;
                        if total_us > 0 {
                            let pct = (elapsed_us as f64 / total_us as f64 * 100.0).min(100.0);
                            progress(pct as f32);
                        }
                    }
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| DownloadError::RemuxFailure(format!("waiting for ffmpeg: {}", e)))?;
        if !status.success() {
            return Err(DownloadError::RemuxFailure(format!(
                "ffmpeg exited with {}",
                status
            )));
        }
        progress(100.0);

        tokio::fs::read(&output_path)
            .await
            .map_err(|e| DownloadError::RemuxFailure(format!("reading remux output: {}", e)))
    }

    async fn cleanup(&self, workdir: &Path) -> std::io::Result<()> {
        match tokio::fs::remove_dir_all(workdir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
