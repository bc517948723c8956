use std::sync::{Arc, Mutex};

use anyhow::Result;
use image::RgbImage;

use crate::detect::result::RawDetection;

/// Backend shared between the registry and the aggregator.
///
/// Wrapped in `Mutex` because `DetectorBackend::detect` takes `&mut self`.
pub type SharedBackend = Arc<Mutex<dyn DetectorBackend>>;

/// Detector capability: given one frame, return zero or more labelled boxes.
///
/// Boxes are in frame pixel coordinates. Backends report class ids only;
/// labels are attached by the aggregator. No identity is carried across
/// frames.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a single RGB frame.
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<RawDetection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
