//! Object detection over extracted frames.
//!
//! - `backend`: the detector capability (`DetectorBackend`)
//! - `backends`: concrete detectors (cpu colour segmentation, stub, tract ONNX)
//! - `registry`: name-keyed backend selection
//! - `aggregate`: runs a backend over every frame and builds a `DetectionMap`

pub mod aggregate;
pub mod backend;
pub mod backends;
pub mod labels;
pub mod registry;
pub mod result;

pub use aggregate::{DetectionAggregator, DetectionMap, DETECTIONS_ARTIFACT};
pub use backend::{DetectorBackend, SharedBackend};
pub use labels::{ClassLabels, UNKNOWN_LABEL};
pub use registry::BackendRegistry;
pub use result::{Detection, RawDetection};
