use serde::{Deserialize, Serialize};

use crate::detect::labels::ClassLabels;

/// Box as reported by a backend, before labelling.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RawDetection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub class_id: u32,
}

impl RawDetection {
    /// Attach a label and bring the box into canonical shape.
    ///
    /// Swapped corners are reordered and confidence is clamped to `[0, 1]`.
    /// Returns `None` for non-finite or zero-area boxes.
    pub fn normalize(self, labels: &ClassLabels) -> Option<Detection> {
        let coords = [self.x1, self.y1, self.x2, self.y2];
        if coords.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let (x1, x2) = (self.x1.min(self.x2), self.x1.max(self.x2));
        let (y1, y2) = (self.y1.min(self.y2), self.y1.max(self.y2));
        if x1 == x2 || y1 == y2 {
            return None;
        }
        let confidence = if self.confidence.is_finite() {
            self.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Some(Detection {
            x1,
            y1,
            x2,
            y2,
            confidence,
            class_id: self.class_id,
            label: labels.label_for(self.class_id).to_string(),
        })
    }
}

/// Labelled bounding box in pixel coordinates (`x1 < x2`, `y1 < y2`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub class_id: u32,
    pub label: String,
}

impl Detection {
    pub fn centroid(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Point-in-box test, inclusive on all four edges.
    pub fn contains(&self, x: f32, y: f32) -> bool {
        self.x1 <= x && x <= self.x2 && self.y1 <= y && y <= self.y2
    }

    pub(crate) fn is_well_formed(&self) -> bool {
        [self.x1, self.y1, self.x2, self.y2, self.confidence]
            .iter()
            .all(|v| v.is_finite())
            && self.x1 < self.x2
            && self.y1 < self.y2
            && (0.0..=1.0).contains(&self.confidence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(x1: f32, y1: f32, x2: f32, y2: f32) -> RawDetection {
        RawDetection {
            x1,
            y1,
            x2,
            y2,
            confidence: 0.9,
            class_id: 0,
        }
    }

    #[test]
    fn normalize_reorders_swapped_corners() {
        let labels = ClassLabels::new(vec!["cup".into()]);
        let det = raw(30.0, 40.0, 10.0, 20.0).normalize(&labels).unwrap();
        assert_eq!((det.x1, det.y1, det.x2, det.y2), (10.0, 20.0, 30.0, 40.0));
        assert_eq!(det.label, "cup");
    }

    #[test]
    fn normalize_drops_degenerate_boxes() {
        let labels = ClassLabels::default();
        assert!(raw(5.0, 5.0, 5.0, 9.0).normalize(&labels).is_none());
        assert!(raw(f32::NAN, 0.0, 1.0, 1.0).normalize(&labels).is_none());
    }

    #[test]
    fn normalize_clamps_confidence_and_labels_unknown_classes() {
        let labels = ClassLabels::new(vec!["cup".into()]);
        let mut r = raw(0.0, 0.0, 2.0, 2.0);
        r.confidence = 1.7;
        r.class_id = 12;
        let det = r.normalize(&labels).unwrap();
        assert_eq!(det.confidence, 1.0);
        assert_eq!(det.label, "unknown");
    }

    #[test]
    fn containment_is_inclusive_on_edges() {
        let labels = ClassLabels::default();
        let det = raw(0.0, 0.0, 10.0, 10.0).normalize(&labels).unwrap();
        assert!(det.contains(0.0, 0.0));
        assert!(det.contains(10.0, 10.0));
        assert!(det.contains(10.0, 5.0));
        assert!(!det.contains(10.01, 5.0));
        assert_eq!(det.centroid(), (5.0, 5.0));
    }
}
