use anyhow::Result;
use image::RgbImage;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::RawDetection;

/// One colour class for the CPU backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColorRule {
    pub class_id: u32,
    pub color: [u8; 3],
    /// Maximum per-channel distance from `color`.
    pub tolerance: u8,
    /// Fewer matching pixels than this means "not present".
    pub min_pixels: u32,
}

/// CPU colour-segmentation detector.
///
/// Each rule yields at most one box per frame: the bounding box of all
/// pixels within tolerance of the rule colour. Confidence is the fraction
/// of that box covered by matching pixels.
pub struct CpuBackend {
    rules: Vec<ColorRule>,
}

impl CpuBackend {
    pub fn new(rules: Vec<ColorRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[ColorRule] {
        &self.rules
    }
}

impl Default for CpuBackend {
    /// Red marks the cup (class 0), blue marks the tray (class 1).
    fn default() -> Self {
        Self::new(vec![
            ColorRule {
                class_id: 0,
                color: [255, 0, 0],
                tolerance: 60,
                min_pixels: 4,
            },
            ColorRule {
                class_id: 1,
                color: [0, 0, 255],
                tolerance: 60,
                min_pixels: 4,
            },
        ])
    }
}

#[derive(Default)]
struct Extent {
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
    count: u32,
}

impl Extent {
    fn add(&mut self, x: u32, y: u32) {
        if self.count == 0 {
            (self.min_x, self.min_y, self.max_x, self.max_y) = (x, y, x, y);
        } else {
            self.min_x = self.min_x.min(x);
            self.min_y = self.min_y.min(y);
            self.max_x = self.max_x.max(x);
            self.max_y = self.max_y.max(y);
        }
        self.count += 1;
    }
}

fn matches(pixel: &[u8; 3], rule: &ColorRule) -> bool {
    pixel
        .iter()
        .zip(rule.color.iter())
        .all(|(p, c)| p.abs_diff(*c) <= rule.tolerance)
}

impl DetectorBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<RawDetection>> {
        let mut extents: Vec<Extent> = self.rules.iter().map(|_| Extent::default()).collect();
        for (x, y, pixel) in frame.enumerate_pixels() {
            for (rule, extent) in self.rules.iter().zip(extents.iter_mut()) {
                if matches(&pixel.0, rule) {
                    extent.add(x, y);
                }
            }
        }

        let detections = self
            .rules
            .iter()
            .zip(extents)
            .filter(|(rule, extent)| extent.count > 0 && extent.count >= rule.min_pixels)
            .map(|(rule, extent)| {
                let x2 = extent.max_x + 1;
                let y2 = extent.max_y + 1;
                let area = (x2 - extent.min_x) as f32 * (y2 - extent.min_y) as f32;
                RawDetection {
                    x1: extent.min_x as f32,
                    y1: extent.min_y as f32,
                    x2: x2 as f32,
                    y2: y2 as f32,
                    confidence: extent.count as f32 / area,
                    class_id: rule.class_id,
                }
            })
            .collect();
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn fill(frame: &mut RgbImage, x0: u32, y0: u32, x1: u32, y1: u32, color: [u8; 3]) {
        for y in y0..y1 {
            for x in x0..x1 {
                frame.put_pixel(x, y, Rgb(color));
            }
        }
    }

    #[test]
    fn finds_one_box_per_colour() {
        let mut frame = RgbImage::from_pixel(64, 48, Rgb([255, 255, 255]));
        fill(&mut frame, 8, 8, 40, 40, [0, 0, 255]);
        fill(&mut frame, 16, 16, 24, 24, [250, 10, 5]);

        let mut backend = CpuBackend::default();
        let detections = backend.detect(&frame).unwrap();
        assert_eq!(detections.len(), 2);

        let cup = detections.iter().find(|d| d.class_id == 0).unwrap();
        assert_eq!((cup.x1, cup.y1, cup.x2, cup.y2), (16.0, 16.0, 24.0, 24.0));
        assert_eq!(cup.confidence, 1.0);

        let tray = detections.iter().find(|d| d.class_id == 1).unwrap();
        assert_eq!((tray.x1, tray.y1, tray.x2, tray.y2), (8.0, 8.0, 40.0, 40.0));
        assert!(tray.confidence < 1.0);
    }

    #[test]
    fn ignores_specks_below_min_pixels() {
        let mut frame = RgbImage::from_pixel(16, 16, Rgb([255, 255, 255]));
        fill(&mut frame, 2, 2, 3, 4, [255, 0, 0]);
        let mut backend = CpuBackend::default();
        assert!(backend.detect(&frame).unwrap().is_empty());
    }
}
