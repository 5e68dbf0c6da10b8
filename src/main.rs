mod bridge;
mod cli;
mod config;
mod coordinator;
mod daemon;
mod error;
mod fetch;
mod hls;
mod model;
mod orchestrator;
mod registry;
mod remux;
mod resolver;
mod source;
mod storage;
mod tags;
mod ui;
mod utils;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::mpsc;

use crate::bridge::{ChannelCommandPort, ChannelNotificationPort, Command, Notifier};
use crate::cli::RangeSpec;
use crate::config::Config;
use crate::coordinator::PauseControls;
use crate::fetch::HttpFetcher;
use crate::orchestrator::{Orchestrator, TrackPipeline};
use crate::registry::StallPolicy;
use crate::remux::{FfmpegBackend, RemuxPool};
use crate::resolver::ResolverOptions;
use crate::source::api::HttpTrackSource;
use crate::storage::Storage;
use crate::ui::{ControlEvent, DownloadSpec, UiSide, UiSummary};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Track or set URL to download
    #[arg(index = 1)]
    url: Option<String>,

    /// Treat the URL as a set and download every track
    #[arg(short = 's', long)]
    set: bool,

    /// Download a 1-based track range of a set: "5", "5:9" or ":9"
    #[arg(short = 'R', long)]
    range: Option<RangeSpec>,

    /// Directory to save downloaded files
    #[arg(short = 'd', long = "download-dir")]
    download_dir: Option<PathBuf>,

    /// Consider high-quality transcodings
    #[arg(long)]
    hq: bool,

    /// Remux worker pool size (clamped to 1-10)
    #[arg(short = 'c', long)]
    concurrency: Option<usize>,

    /// Global rate limit in bytes per second (e.g., 1048576 for 1MB/s)
    #[arg(short = 'r', long)]
    rate_limit: Option<u32>,

    /// Milliseconds to wait between HLS segment downloads
    #[arg(long)]
    segment_delay_ms: Option<u64>,

    /// Never assume a silent download completed
    #[arg(long)]
    no_assume_completion: bool,

    /// Path of the JSON config file
    #[arg(long, default_value = "tunedl.json")]
    config: PathBuf,

    /// Search prior downloads by filename (regex allowed) and exit
    #[arg(long)]
    search: Option<String>,

    /// Print one config value and exit
    #[arg(long = "get-option")]
    get_option: Option<String>,

    /// Set one config value as "key=value" (value in JSON) and exit
    #[arg(long = "set-option")]
    set_option: Option<String>,

    /// Run in background (daemon mode) [Unix only]
    #[arg(long)]
    daemon: bool,

    /// Stop the daemon process [Unix only]
    #[arg(short = 'x', long)]
    stop: bool,

    /// Ask the daemon to pause its downloads [Unix only]
    #[arg(short = 'p', long)]
    pause: bool,

    /// Ask the daemon to resume its downloads [Unix only]
    #[arg(short = 'u', long)]
    resume: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = Config::load(&args.config);
    if let Some(dir) = &args.download_dir {
        config.download_dir = dir.clone();
    }
    if args.hq {
        config.high_quality = true;
    }
    if let Some(concurrency) = args.concurrency {
        config.max_concurrent_remux = concurrency;
    }
    if let Some(rate_limit) = args.rate_limit {
        config.rate_limit = Some(rate_limit);
    }
    if let Some(delay) = args.segment_delay_ms {
        config.segment_delay_ms = delay;
    }
    if args.no_assume_completion {
        config.assume_completion = false;
    }

    if let Some(key) = &args.get_option {
        match config.get(key) {
            Some(value) => println!("{}", value),
            None => anyhow::bail!("unknown option '{}'", key),
        }
        return Ok(());
    }
    if let Some(assignment) = &args.set_option {
        let (key, raw) = assignment
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("expected key=value, got '{}'", assignment))?;
        let value = serde_json::from_str(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        if !config.set(key, value) {
            anyhow::bail!("unknown option or wrong type for '{}'", key);
        }
        config.save(&args.config)?;
        println!("{} updated", key);
        return Ok(());
    }

    if let Some(query) = &args.search {
        let storage = Storage::new(config.download_dir.clone());
        let hits = storage.search_prior_downloads(query);
        if hits.is_empty() {
            println!("No prior downloads match '{}'", query);
        }
        for path in hits {
            println!("{}", path.display());
        }
        return Ok(());
    }

    #[cfg(unix)]
    {
        if args.stop {
            return daemon::stop_daemon();
        }
        if args.pause {
            return daemon::pause_daemon();
        }
        if args.resume {
            return daemon::resume_daemon();
        }
    }

    let Some(url) = args.url.clone() else {
        anyhow::bail!("no URL given; pass a track or set URL");
    };

    #[cfg(unix)]
    if args.daemon {
        daemon::start_daemon()?;
    }

    let rt = tokio::runtime::Runtime::new()?;
    let summary = rt.block_on(run(url, &args, &config))?;

    #[cfg(unix)]
    if args.daemon {
        daemon::cleanup_pid_file();
    }

    if summary.failed > 0 {
        anyhow::bail!("{} download(s) failed", summary.failed);
    }
    Ok(())
}

async fn run(url: String, args: &Args, config: &Config) -> Result<UiSummary> {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (note_tx, note_rx) = mpsc::unbounded_channel();
    let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel::<ControlEvent>();

    let fetcher = Arc::new(HttpFetcher::new(config.rate_limit));
    let source = Arc::new(HttpTrackSource::new(
        config.api_base.clone(),
        config.client_id.clone(),
    ));
    let storage = Arc::new(Storage::new(config.download_dir.clone()));
    let scratch = std::env::temp_dir().join(format!("tunedl-remux-{}", std::process::id()));
    let remux = RemuxPool::new(
        Arc::new(FfmpegBackend::discover()),
        config.max_concurrent_remux,
        scratch,
    );
    let options = ResolverOptions {
        prefer_high_quality: config.high_quality,
        segment_delay: (config.segment_delay_ms > 0)
            .then(|| Duration::from_millis(config.segment_delay_ms)),
    };

    let notifier = Notifier::new(Arc::new(ChannelNotificationPort::new(note_tx)));
    let controls = PauseControls::default();
    let pipeline = Arc::new(TrackPipeline::new(
        fetcher,
        source.clone(),
        remux,
        storage,
        options,
    ));
    let orchestrator = Arc::new(Orchestrator::new(pipeline, source, notifier, controls));
    tokio::spawn(orchestrator.run(cmd_rx));

    #[cfg(unix)]
    spawn_signal_forwarder(ctrl_tx.clone());
    // keep the control channel open for the whole run
    let _ctrl_tx = ctrl_tx;

    let command = if let Some(range) = args.range {
        Command::DownloadSetRange {
            url: url.clone(),
            start: range.start,
            end: range.end,
        }
    } else if args.set {
        Command::DownloadSet { url: url.clone() }
    } else {
        Command::Download { url: url.clone() }
    };

    let stall_policy = StallPolicy {
        assume_completion: config.assume_completion,
        ..StallPolicy::default()
    };
    let ui = UiSide::new(Box::new(ChannelCommandPort::new(cmd_tx)), stall_policy);
    ui.run(vec![DownloadSpec { label: url, command }], note_rx, ctrl_rx)
        .await
}

#[cfg(unix)]
fn spawn_signal_forwarder(ctrl_tx: mpsc::UnboundedSender<ControlEvent>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let (Ok(mut pause), Ok(mut resume)) = (
            signal(SignalKind::user_defined1()),
            signal(SignalKind::user_defined2()),
        ) else {
            log::warn!("could not install signal handlers; pause/resume via signals disabled");
            return;
        };
        loop {
            tokio::select! {
                _ = pause.recv() => {
                    let _ = ctrl_tx.send(ControlEvent::PauseAll);
                }
                _ = resume.recv() => {
                    let _ = ctrl_tx.send(ControlEvent::ResumeAll);
                }
            }
        }
    });
}
