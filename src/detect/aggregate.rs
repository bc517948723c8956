//! Detection aggregation.
//!
//! Runs the configured backend over every frame of a run, strictly in
//! frame order, and collects the labelled boxes into a `DetectionMap`.
//! The first failing frame aborts the whole aggregation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::blob::write_atomic;
use crate::cancel::CancelToken;
use crate::detect::backend::SharedBackend;
use crate::detect::labels::ClassLabels;
use crate::detect::result::Detection;
use crate::error::{PipelineError, Result};
use crate::frame::{list_frames, FrameId};

/// File name of the persisted detection map inside a job workspace.
pub const DETECTIONS_ARTIFACT: &str = "detections.json";

/// Frame to detections map, iterated in ascending frame order.
///
/// Serialized as a JSON object keyed by frame identifier (`"frame_12"`),
/// each value an ordered list of detections.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DetectionMap(BTreeMap<FrameId, Vec<Detection>>);

impl DetectionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, frame: FrameId, detections: Vec<Detection>) {
        self.0.insert(frame, detections);
    }

    pub fn get(&self, frame: FrameId) -> Option<&[Detection]> {
        self.0.get(&frame).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (FrameId, &[Detection])> {
        self.0.iter().map(|(id, dets)| (*id, dets.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Every box must have finite coordinates, `x1 < x2`, `y1 < y2` and a
    /// confidence in `[0, 1]`.
    pub fn validate(&self) -> Result<()> {
        for (frame, detections) in &self.0 {
            if let Some(bad) = detections.iter().find(|d| !d.is_well_formed()) {
                return Err(PipelineError::TrackingInput(format!(
                    "{frame} has an invalid box {bad:?}"
                )));
            }
        }
        Ok(())
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let map: Self = serde_json::from_str(raw)
            .map_err(|e| PipelineError::TrackingInput(e.to_string()))?;
        map.validate()?;
        Ok(map)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::TrackingInput(format!("read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &json)
    }
}

pub struct DetectionAggregator {
    backend: SharedBackend,
    labels: ClassLabels,
    artifact_path: Option<PathBuf>,
}

impl DetectionAggregator {
    pub fn new(backend: SharedBackend, labels: ClassLabels) -> Self {
        Self {
            backend,
            labels,
            artifact_path: None,
        }
    }

    /// Persist the map (partial on failure) to `path` when aggregation ends.
    pub fn with_artifact_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.artifact_path = Some(path.into());
        self
    }

    pub fn detect_all(&self, frames_dir: &Path, cancel: &CancelToken) -> Result<DetectionMap> {
        let frames = match list_frames(frames_dir) {
            Ok(frames) => frames,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PipelineError::NoFrames(frames_dir.to_path_buf()))
            }
            Err(e) => {
                return Err(PipelineError::Detector {
                    frame: frames_dir.display().to_string(),
                    message: format!("list frames: {e}"),
                })
            }
        };
        if frames.is_empty() {
            return Err(PipelineError::NoFrames(frames_dir.to_path_buf()));
        }

        let mut map = DetectionMap::new();
        let outcome = self.detect_frames(&frames, &mut map, cancel);
        self.persist(&map);
        outcome?;

        log::info!(
            "detection finished: {} frames, {} boxes",
            map.len(),
            map.iter().map(|(_, dets)| dets.len()).sum::<usize>()
        );
        Ok(map)
    }

    fn detect_frames(
        &self,
        frames: &[(FrameId, PathBuf)],
        map: &mut DetectionMap,
        cancel: &CancelToken,
    ) -> Result<()> {
        // Poisoned when a backend panicked during an earlier job.
        let mut backend = self.backend.lock().unwrap_or_else(|poisoned| {
            log::warn!("detector backend recovered after an earlier panic");
            poisoned.into_inner()
        });

        for (frame, path) in frames {
            cancel.check("detection")?;
            let detector_err = |message: String| PipelineError::Detector {
                frame: frame.to_string(),
                message,
            };
            let image = image::open(path)
                .map_err(|e| detector_err(format!("read {}: {}", path.display(), e)))?
                .into_rgb8();
            let raw = backend
                .detect(&image)
                .map_err(|e| detector_err(format!("{:#}", e)))?;
            let detections: Vec<Detection> = raw
                .into_iter()
                .filter_map(|r| r.normalize(&self.labels))
                .collect();
            log::debug!("{}: {} detections", frame, detections.len());
            map.insert(*frame, detections);
        }
        Ok(())
    }

    fn persist(&self, map: &DetectionMap) {
        let Some(path) = &self.artifact_path else {
            return;
        };
        if let Err(e) = map.save(path) {
            log::warn!("failed to write detection map {}: {}", path.display(), e);
        }
    }
}
