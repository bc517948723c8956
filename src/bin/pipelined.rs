//! pipelined - SurgiTrack pipeline daemon
//!
//! This daemon:
//! 1. Opens the job queue and re-enqueues jobs abandoned by a previous run
//! 2. Serves the job API (unless `--no-api`)
//! 3. Runs the job runner until Ctrl-C; the job in flight is finished first
//!
//! Only animated GIF uploads decode in the default build. MP4 and other
//! containers need `--features extract-ffmpeg`; without it those jobs fail
//! with an extraction error.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use surgitrack::{
    api::{ApiConfig, ApiServer},
    config::PipelineConfig,
    BackendRegistry, ClassLabels, FilesystemBlobStore, JobQueue, JobRunner, RunnerSettings,
    SqliteJobQueue, StateTracker,
};

#[derive(Parser, Debug)]
#[command(
    name = "pipelined",
    about = "Video to pick-up/place-back event pipeline worker",
    long_about = "Video to pick-up/place-back event pipeline worker.\n\n\
                  This build decodes animated GIF uploads; MP4 and other containers \
                  require building with --features extract-ffmpeg."
)]
struct Args {
    /// JSON config file. Env overrides still apply on top of it.
    #[arg(long, env = "PIPELINE_CONFIG")]
    config: Option<PathBuf>,
    /// Run the worker only, without the HTTP job API.
    #[arg(long)]
    no_api: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if !surgitrack::extract::FFMPEG_ENABLED {
        log::warn!("built without extract-ffmpeg: only GIF uploads can be decoded");
    }

    let args = Args::parse();
    let cfg = PipelineConfig::load_from(args.config.as_deref())?;

    let queue: Arc<dyn JobQueue> = Arc::new(SqliteJobQueue::open(&cfg.db_path)?);
    let recovered = queue.recover_stale(cfg.worker.stale_after)?;
    log::info!(
        "job queue open at {} ({} pending, {} recovered)",
        cfg.db_path,
        queue.pending()?,
        recovered
    );

    let api_handle = if args.no_api {
        None
    } else {
        let handle = ApiServer::new(
            ApiConfig {
                addr: cfg.api_addr.clone(),
            },
            queue.clone(),
        )
        .spawn()?;
        log::info!("job api listening on {}", handle.addr);
        Some(handle)
    };

    let registry = BackendRegistry::from_settings(&cfg.detector)?;
    let backend = registry.prepare_default()?;
    let blobs = Arc::new(FilesystemBlobStore::new(&cfg.storage.blob_root)?);
    let runner = JobRunner::new(
        queue,
        blobs,
        backend,
        ClassLabels::new(cfg.detector.class_labels.clone()),
        StateTracker::new(&cfg.tracker.container_label, &cfg.tracker.object_label),
        RunnerSettings {
            poll_interval: cfg.worker.poll_interval,
            max_backoff: cfg.worker.max_backoff,
            job_timeout: cfg.worker.job_timeout,
            work_root: cfg.storage.work_root.clone(),
            artifact_dir: cfg.storage.artifact_dir.clone(),
            default_fps: cfg.tracker.default_fps,
        },
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_signal = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_signal.store(true, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!(
        "pipelined running. blobs in {}, workspaces in {}",
        cfg.storage.blob_root.display(),
        cfg.storage.work_root.display()
    );
    runner.run(&shutdown);

    if let Some(handle) = api_handle {
        log::info!("stopping job api...");
        handle.stop()?;
    }
    Ok(())
}
