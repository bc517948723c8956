use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_DB_PATH: &str = "surgitrack.db";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8800";
const DEFAULT_BLOB_ROOT: &str = "data/blobs";
const DEFAULT_WORK_ROOT: &str = "data/work";
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;
const DEFAULT_STALE_AFTER_SECS: u64 = 60 * 60;
const DEFAULT_BACKEND: &str = "cpu";
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;
const DEFAULT_IOU_THRESHOLD: f32 = 0.45;
const DEFAULT_CONTAINER_LABEL: &str = "tray";
const DEFAULT_OBJECT_LABEL: &str = "cup";
const DEFAULT_FPS: f64 = 30.0;

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    db_path: Option<String>,
    api: Option<ApiConfigFile>,
    storage: Option<StorageConfigFile>,
    worker: Option<WorkerConfigFile>,
    detector: Option<DetectorConfigFile>,
    tracker: Option<TrackerConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    blob_root: Option<PathBuf>,
    work_root: Option<PathBuf>,
    artifact_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct WorkerConfigFile {
    poll_interval_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    job_timeout_secs: Option<u64>,
    stale_after_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
    confidence_threshold: Option<f32>,
    iou_threshold: Option<f32>,
    class_labels: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackerConfigFile {
    container_label: Option<String>,
    object_label: Option<String>,
    default_fps: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub db_path: String,
    pub api_addr: String,
    pub storage: StorageSettings,
    pub worker: WorkerSettings,
    pub detector: DetectorSettings,
    pub tracker: TrackerSettings,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub blob_root: PathBuf,
    pub work_root: PathBuf,
    /// Where a copy of each job's detection map is kept, if anywhere.
    pub artifact_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub max_backoff: Duration,
    pub job_timeout: Option<Duration>,
    pub stale_after: Duration,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub input_size: u32,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub class_labels: Vec<String>,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: DEFAULT_BACKEND.to_string(),
            model_path: None,
            input_size: DEFAULT_INPUT_SIZE,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            class_labels: default_class_labels(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub container_label: String,
    pub object_label: String,
    /// Used when the video container does not report a frame rate.
    pub default_fps: f64,
}

impl PipelineConfig {
    /// Loads the file named by `PIPELINE_CONFIG` (if set), then env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("PIPELINE_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    pub fn load_from(config_path: Option<&Path>) -> Result<Self> {
        let file_cfg = match config_path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Self {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());

        let storage = file.storage.unwrap_or_default();
        let storage = StorageSettings {
            blob_root: storage
                .blob_root
                .unwrap_or_else(|| PathBuf::from(DEFAULT_BLOB_ROOT)),
            work_root: storage
                .work_root
                .unwrap_or_else(|| PathBuf::from(DEFAULT_WORK_ROOT)),
            artifact_dir: storage.artifact_dir,
        };

        let worker = file.worker.unwrap_or_default();
        let worker = WorkerSettings {
            poll_interval: Duration::from_millis(
                worker.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            max_backoff: Duration::from_millis(
                worker.max_backoff_ms.unwrap_or(DEFAULT_MAX_BACKOFF_MS),
            ),
            job_timeout: worker.job_timeout_secs.map(Duration::from_secs),
            stale_after: Duration::from_secs(
                worker.stale_after_secs.unwrap_or(DEFAULT_STALE_AFTER_SECS),
            ),
        };

        let detector = file.detector.unwrap_or_default();
        let defaults = DetectorSettings::default();
        let detector = DetectorSettings {
            backend: detector.backend.unwrap_or(defaults.backend),
            model_path: detector.model_path,
            input_size: detector.input_size.unwrap_or(defaults.input_size),
            confidence_threshold: detector
                .confidence_threshold
                .unwrap_or(defaults.confidence_threshold),
            iou_threshold: detector.iou_threshold.unwrap_or(defaults.iou_threshold),
            class_labels: detector.class_labels.unwrap_or(defaults.class_labels),
        };

        let tracker = file.tracker.unwrap_or_default();
        let tracker = TrackerSettings {
            container_label: tracker
                .container_label
                .unwrap_or_else(|| DEFAULT_CONTAINER_LABEL.to_string()),
            object_label: tracker
                .object_label
                .unwrap_or_else(|| DEFAULT_OBJECT_LABEL.to_string()),
            default_fps: tracker.default_fps.unwrap_or(DEFAULT_FPS),
        };

        Self {
            db_path,
            api_addr,
            storage,
            worker,
            detector,
            tracker,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_nonempty("PIPELINE_DB_PATH") {
            self.db_path = path;
        }
        if let Some(addr) = env_nonempty("PIPELINE_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(root) = env_nonempty("PIPELINE_BLOB_ROOT") {
            self.storage.blob_root = PathBuf::from(root);
        }
        if let Some(root) = env_nonempty("PIPELINE_WORK_ROOT") {
            self.storage.work_root = PathBuf::from(root);
        }
        if let Some(dir) = env_nonempty("PIPELINE_ARTIFACT_DIR") {
            self.storage.artifact_dir = Some(PathBuf::from(dir));
        }
        if let Some(backend) = env_nonempty("PIPELINE_DETECTOR") {
            self.detector.backend = backend;
        }
        if let Some(path) = env_nonempty("PIPELINE_MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(path));
        }
        if let Some(fps) = env_nonempty("PIPELINE_DEFAULT_FPS") {
            self.tracker.default_fps = fps
                .parse()
                .map_err(|_| anyhow!("PIPELINE_DEFAULT_FPS must be a number"))?;
        }
        if let Some(secs) = env_nonempty("PIPELINE_JOB_TIMEOUT_SECS") {
            let seconds: u64 = secs.parse().map_err(|_| {
                anyhow!("PIPELINE_JOB_TIMEOUT_SECS must be an integer number of seconds")
            })?;
            self.worker.job_timeout = Some(Duration::from_secs(seconds));
        }
        if let Some(ms) = env_nonempty("PIPELINE_POLL_INTERVAL_MS") {
            let millis: u64 = ms.parse().map_err(|_| {
                anyhow!("PIPELINE_POLL_INTERVAL_MS must be an integer number of milliseconds")
            })?;
            self.worker.poll_interval = Duration::from_millis(millis);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if !self.tracker.default_fps.is_finite() || self.tracker.default_fps <= 0.0 {
            return Err(anyhow!(
                "tracker.default_fps must be a positive number, got {}",
                self.tracker.default_fps
            ));
        }
        if self.worker.poll_interval.is_zero() {
            return Err(anyhow!("worker.poll_interval_ms must be greater than zero"));
        }
        if self.worker.max_backoff < self.worker.poll_interval {
            self.worker.max_backoff = self.worker.poll_interval;
        }
        if self.worker.job_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(anyhow!("worker.job_timeout_secs must be greater than zero"));
        }
        for (name, value) in [
            ("detector.confidence_threshold", self.detector.confidence_threshold),
            ("detector.iou_threshold", self.detector.iou_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{name} must be within [0, 1], got {value}"));
            }
        }
        if self.detector.input_size == 0 {
            return Err(anyhow!("detector.input_size must be greater than zero"));
        }

        self.detector.backend = self.detector.backend.trim().to_lowercase();
        if self.detector.backend == "tract" && self.detector.model_path.is_none() {
            return Err(anyhow!("detector.backend 'tract' requires detector.model_path"));
        }

        self.tracker.container_label = self.tracker.container_label.trim().to_string();
        self.tracker.object_label = self.tracker.object_label.trim().to_string();
        if self.tracker.container_label.is_empty() || self.tracker.object_label.is_empty() {
            return Err(anyhow!("tracker labels cannot be empty"));
        }
        if self.tracker.container_label == self.tracker.object_label {
            return Err(anyhow!(
                "tracker.container_label and tracker.object_label must differ"
            ));
        }
        for label in [&self.tracker.container_label, &self.tracker.object_label] {
            if !self.detector.class_labels.iter().any(|known| known == label) {
                log::warn!(
                    "tracker label '{}' is not among detector.class_labels; it will never be detected",
                    label
                );
            }
        }
        Ok(())
    }
}

fn default_class_labels() -> Vec<String> {
    vec![
        DEFAULT_OBJECT_LABEL.to_string(),
        DEFAULT_CONTAINER_LABEL.to_string(),
    ]
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
