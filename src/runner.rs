//! The job runner loop.
//!
//! One runner processes one job at a time: pop, mark `processing`, run the
//! three stages inside a private workspace, then record `completed` or
//! `failed`. A failing job never stops the loop. Queue transport errors are
//! retried with exponential backoff.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::blob::BlobStore;
use crate::cancel::CancelToken;
use crate::detect::{ClassLabels, DetectionAggregator, SharedBackend, DETECTIONS_ARTIFACT};
use crate::error::{PipelineError, Result};
use crate::extract::FrameExtractor;
use crate::job::{Job, JobId};
use crate::queue::JobQueue;
use crate::track::{Event, StateTracker};

const VIDEO_FILE: &str = "video";
const FRAMES_DIR: &str = "frames";

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// How long one `pop` waits for work; also the initial backoff.
    pub poll_interval: Duration,
    pub max_backoff: Duration,
    pub job_timeout: Option<Duration>,
    pub work_root: PathBuf,
    pub artifact_dir: Option<PathBuf>,
    /// Frame rate used when the container does not declare one.
    pub default_fps: f64,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            job_timeout: None,
            work_root: PathBuf::from("data/work"),
            artifact_dir: None,
            default_fps: 30.0,
        }
    }
}

/// What happened to one delivered job.
#[derive(Clone, Debug, PartialEq)]
pub enum JobOutcome {
    Completed { events: Vec<Event> },
    Failed(String),
    /// Duplicate delivery of a job that is already terminal (or unknown).
    Skipped,
}

pub struct JobRunner {
    queue: Arc<dyn JobQueue>,
    blobs: Arc<dyn BlobStore>,
    backend: SharedBackend,
    labels: ClassLabels,
    tracker: StateTracker,
    settings: RunnerSettings,
}

impl JobRunner {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        blobs: Arc<dyn BlobStore>,
        backend: SharedBackend,
        labels: ClassLabels,
        tracker: StateTracker,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            queue,
            blobs,
            backend,
            labels,
            tracker,
            settings,
        }
    }

    /// Process jobs until `shutdown` is set. The job in flight when the flag
    /// flips is finished first.
    pub fn run(&self, shutdown: &AtomicBool) {
        let mut backoff = self.settings.poll_interval;
        while !shutdown.load(Ordering::SeqCst) {
            match self.run_once() {
                Ok(_) => backoff = self.settings.poll_interval,
                Err(e) => {
                    log::warn!("queue unavailable ({}); retrying in {:?}", e, backoff);
                    sleep_unless(shutdown, backoff);
                    backoff = (backoff * 2).min(self.settings.max_backoff);
                }
            }
        }
        log::info!("job runner stopped");
    }

    /// Wait up to one poll interval for a job and process it. `Ok(None)` when
    /// the queue stayed empty.
    pub fn run_once(&self) -> Result<Option<(JobId, JobOutcome)>> {
        let Some(job) = self.queue.pop(self.settings.poll_interval)? else {
            return Ok(None);
        };
        let id = job.id.clone();
        let outcome = self.process(job)?;
        Ok(Some((id, outcome)))
    }

    /// Run a popped job to a terminal state. An `Err` means a status write
    /// failed; the job has then been pushed back for redelivery.
    pub fn process(&self, job: Job) -> Result<JobOutcome> {
        match self.queue.mark_processing(&job.id) {
            Ok(true) => {}
            Ok(false) => {
                log::info!("job {} is already {}; skipping", job.id, job.status.as_str());
                return Ok(JobOutcome::Skipped);
            }
            Err(e) => return Err(self.requeue(&job.id, e)),
        }
        log::info!("job {} processing video '{}'", job.id, job.input.video_key);

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.execute(&job)))
            .unwrap_or_else(|payload| Err(PipelineError::Panicked(panic_message(payload.as_ref()))));
        match result {
            Ok(events) => {
                log::info!("job {} completed with {} events", job.id, events.len());
                self.queue
                    .complete(&job.id, &events)
                    .map_err(|e| self.requeue(&job.id, e))?;
                Ok(JobOutcome::Completed { events })
            }
            Err(e) => {
                let message = e.to_string();
                log::error!("job {} failed: {}", job.id, message);
                self.queue
                    .fail(&job.id, &message)
                    .map_err(|e| self.requeue(&job.id, e))?;
                Ok(JobOutcome::Failed(message))
            }
        }
    }

    fn execute(&self, job: &Job) -> Result<Vec<Event>> {
        let cancel = match self.settings.job_timeout {
            Some(timeout) => CancelToken::with_timeout(timeout),
            None => CancelToken::new(),
        };
        let workspace = JobWorkspace::create(&self.settings.work_root, &job.id)?;

        cancel.check("video fetch")?;
        let video_path = workspace.path().join(VIDEO_FILE);
        self.blobs.fetch_to(&job.input.video_key, &video_path)?;

        let extractor = FrameExtractor::new(workspace.path().join(FRAMES_DIR));
        let extraction = extractor.extract(&video_path, &cancel)?;

        let artifact = workspace.path().join(DETECTIONS_ARTIFACT);
        let aggregator = DetectionAggregator::new(self.backend.clone(), self.labels.clone())
            .with_artifact_path(&artifact);
        let detections = aggregator.detect_all(extractor.frames_dir(), &cancel);
        self.keep_artifact(&job.id, &artifact);
        let detections = detections?;

        cancel.check("tracking")?;
        let fps = extraction
            .frame_rate
            .filter(|fps| fps.is_finite() && *fps > 0.0)
            .unwrap_or(self.settings.default_fps);
        self.tracker.track(&detections, fps)
    }

    fn keep_artifact(&self, id: &JobId, artifact: &Path) {
        let Some(dir) = &self.settings.artifact_dir else {
            return;
        };
        if !artifact.exists() {
            return;
        }
        let dest = dir.join(format!("{}.{}", id, DETECTIONS_ARTIFACT));
        let copied = std::fs::create_dir_all(dir).and_then(|_| std::fs::copy(artifact, &dest));
        if let Err(e) = copied {
            log::warn!("failed to keep detection artifact {}: {}", dest.display(), e);
        }
    }

    fn requeue(&self, id: &JobId, err: PipelineError) -> PipelineError {
        log::warn!("status write for job {} failed ({}); pushing it back", id, err);
        if let Err(push_err) = self.queue.push_back(id) {
            log::error!("push back of job {} failed: {}", id, push_err);
        }
        err
    }
}

fn sleep_unless(shutdown: &AtomicBool, total: Duration) {
    let step = Duration::from_millis(50);
    let mut slept = Duration::ZERO;
    while slept < total && !shutdown.load(Ordering::SeqCst) {
        let nap = step.min(total - slept);
        std::thread::sleep(nap);
        slept += nap;
    }
}

/// `<work_root>/<job_id>`, removed when dropped.
struct JobWorkspace {
    path: PathBuf,
}

impl JobWorkspace {
    fn create(work_root: &Path, id: &JobId) -> Result<Self> {
        let path = work_root.join(id.as_str());
        if path.exists() {
            std::fs::remove_dir_all(&path).map_err(|e| workspace_err(&path, e))?;
        }
        std::fs::create_dir_all(&path).map_err(|e| workspace_err(&path, e))?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for JobWorkspace {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            log::warn!("failed to remove workspace {}: {}", self.path.display(), e);
        }
    }
}

fn workspace_err(path: &Path, e: std::io::Error) -> PipelineError {
    PipelineError::Workspace(format!("prepare {}: {}", path.display(), e))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use image::codecs::gif::GifEncoder;
    use image::{Delay, Frame, Rgba, RgbaImage, RgbImage};

    use crate::blob::FilesystemBlobStore;
    use crate::detect::backends::StubBackend;
    use crate::detect::{DetectorBackend, RawDetection};
    use crate::job::JobStatus;
    use crate::queue::InMemoryJobQueue;

    /// Queue whose status writes fail until `healthy` is set.
    struct FlakyQueue {
        inner: InMemoryJobQueue,
        healthy: AtomicBool,
    }

    impl FlakyQueue {
        fn check(&self) -> Result<()> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(PipelineError::Queue("database is locked".to_string()))
            }
        }
    }

    impl JobQueue for FlakyQueue {
        fn enqueue_input(&self, input: crate::job::JobInput) -> Result<JobId> {
            self.inner.enqueue_input(input)
        }
        fn pop(&self, wait: Duration) -> Result<Option<Job>> {
            self.inner.pop(wait)
        }
        fn push_back(&self, id: &JobId) -> Result<()> {
            self.inner.push_back(id)
        }
        fn mark_processing(&self, id: &JobId) -> Result<bool> {
            self.check()?;
            self.inner.mark_processing(id)
        }
        fn complete(&self, id: &JobId, events: &[Event]) -> Result<bool> {
            self.check()?;
            self.inner.complete(id, events)
        }
        fn fail(&self, id: &JobId, error: &str) -> Result<bool> {
            self.check()?;
            self.inner.fail(id, error)
        }
        fn load(&self, id: &JobId) -> Result<Option<Job>> {
            self.inner.load(id)
        }
        fn recover_stale(&self, older_than: Duration) -> Result<usize> {
            self.inner.recover_stale(older_than)
        }
        fn pending(&self) -> Result<usize> {
            self.inner.pending()
        }
    }

    /// Panics on its first frame, then behaves like the stub backend.
    struct PanicsOnce {
        panicked: bool,
    }

    impl DetectorBackend for PanicsOnce {
        fn name(&self) -> &'static str {
            "panics-once"
        }

        fn detect(&mut self, _frame: &RgbImage) -> anyhow::Result<Vec<RawDetection>> {
            if !self.panicked {
                self.panicked = true;
                panic!("model produced a malformed tensor");
            }
            Ok(Vec::new())
        }
    }

    fn write_gif(blobs: &FilesystemBlobStore, key: &str) {
        let mut bytes = Vec::new();
        {
            let mut encoder = GifEncoder::new(&mut bytes);
            for _ in 0..2 {
                let image = RgbaImage::from_pixel(16, 16, Rgba([255, 255, 255, 255]));
                let frame = Frame::from_parts(image, 0, 0, Delay::from_numer_denom_ms(100, 1));
                encoder.encode_frame(frame).unwrap();
            }
        }
        blobs.put(key, &bytes).unwrap();
    }

    fn runner(queue: Arc<dyn JobQueue>, root: &Path) -> JobRunner {
        runner_with(queue, root, Arc::new(Mutex::new(StubBackend::new())))
    }

    fn runner_with(queue: Arc<dyn JobQueue>, root: &Path, backend: SharedBackend) -> JobRunner {
        let blobs = Arc::new(FilesystemBlobStore::new(root.join("blobs")).unwrap());
        JobRunner::new(
            queue,
            blobs,
            backend,
            ClassLabels::default(),
            StateTracker::new("tray", "cup"),
            RunnerSettings {
                poll_interval: Duration::from_millis(10),
                work_root: root.join("work"),
                ..RunnerSettings::default()
            },
        )
    }

    #[test]
    fn missing_blob_fails_job_and_cleans_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(InMemoryJobQueue::new());
        let runner = runner(queue.clone(), dir.path());
        let id = queue.enqueue("missing.gif").unwrap();

        let (ran, outcome) = runner.run_once().unwrap().unwrap();
        assert_eq!(ran, id);
        assert!(matches!(outcome, JobOutcome::Failed(ref msg) if msg.contains("missing.gif")));
        let job = queue.load(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(!dir.path().join("work").join(id.as_str()).exists());
    }

    #[test]
    fn terminal_job_redelivery_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(InMemoryJobQueue::new());
        let runner = runner(queue.clone(), dir.path());
        let id = queue.enqueue("missing.gif").unwrap();
        runner.run_once().unwrap();

        queue.push_back(&id).unwrap();
        let (_, outcome) = runner.run_once().unwrap().unwrap();
        assert_eq!(outcome, JobOutcome::Skipped);
        assert_eq!(queue.load(&id).unwrap().unwrap().status, JobStatus::Failed);
    }

    #[test]
    fn failed_status_write_pushes_job_back() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(FlakyQueue {
            inner: InMemoryJobQueue::new(),
            healthy: AtomicBool::new(false),
        });
        let runner = runner(queue.clone(), dir.path());
        let id = queue.enqueue("missing.gif").unwrap();

        assert!(runner.run_once().unwrap_err().is_transient());
        assert_eq!(queue.pending().unwrap(), 1);
        assert_eq!(queue.load(&id).unwrap().unwrap().status, JobStatus::Queued);

        queue.healthy.store(true, Ordering::SeqCst);
        let (ran, outcome) = runner.run_once().unwrap().unwrap();
        assert_eq!(ran, id);
        assert!(matches!(outcome, JobOutcome::Failed(_)));
    }

    #[test]
    fn panicking_backend_fails_job_and_runner_continues() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(InMemoryJobQueue::new());
        let backend: SharedBackend = Arc::new(Mutex::new(PanicsOnce { panicked: false }));
        let runner = runner_with(queue.clone(), dir.path(), backend);
        let blobs = FilesystemBlobStore::new(dir.path().join("blobs")).unwrap();
        write_gif(&blobs, "first.gif");
        write_gif(&blobs, "second.gif");
        let first = queue.enqueue("first.gif").unwrap();
        let second = queue.enqueue("second.gif").unwrap();

        let (ran, outcome) = runner.run_once().unwrap().unwrap();
        assert_eq!(ran, first);
        assert!(
            matches!(outcome, JobOutcome::Failed(ref msg) if msg.contains("malformed tensor"))
        );
        let job = queue.load(&first).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().starts_with("stage panicked"));
        assert!(!dir.path().join("work").join(first.as_str()).exists());

        let (ran, outcome) = runner.run_once().unwrap().unwrap();
        assert_eq!(ran, second);
        assert_eq!(outcome, JobOutcome::Completed { events: Vec::new() });
    }

    #[test]
    fn unusable_work_root_is_a_workspace_error() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(InMemoryJobQueue::new());
        let runner = runner(queue.clone(), dir.path());
        std::fs::write(dir.path().join("work"), b"not a directory").unwrap();
        let id = queue.enqueue("clip.gif").unwrap();

        let (_, outcome) = runner.run_once().unwrap().unwrap();
        assert!(matches!(outcome, JobOutcome::Failed(ref msg) if msg.starts_with("job workspace")));
        assert_eq!(queue.load(&id).unwrap().unwrap().status, JobStatus::Failed);
    }

    #[test]
    fn empty_queue_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(Arc::new(InMemoryJobQueue::new()), dir.path());
        assert!(runner.run_once().unwrap().is_none());
    }

    #[test]
    fn run_returns_once_shutdown_is_set() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(Arc::new(InMemoryJobQueue::new()), dir.path());
        let shutdown = AtomicBool::new(true);
        runner.run(&shutdown);
    }
}
