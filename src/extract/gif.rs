use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use image::codecs::gif::GifDecoder;
use image::{AnimationDecoder, DynamicImage};

use super::FrameWriter;
use crate::error::{PipelineError, Result};

/// Decodes every frame of an animated GIF. The frame rate comes from the
/// first frame's delay.
pub(super) fn decode(path: &Path, writer: &mut FrameWriter<'_>) -> Result<Option<f64>> {
    let file = File::open(path)
        .map_err(|e| PipelineError::Extraction(format!("open {}: {}", path.display(), e)))?;
    let decoder = GifDecoder::new(BufReader::new(file))
        .map_err(|e| PipelineError::Extraction(format!("open gif {}: {}", path.display(), e)))?;

    let mut frame_rate = None;
    for frame in decoder.into_frames() {
        let frame = frame.map_err(|e| {
            PipelineError::Extraction(format!(
                "decode gif frame {} of {}: {}",
                writer.written(),
                path.display(),
                e
            ))
        })?;
        if writer.written() == 0 {
            let (numer, denom) = frame.delay().numer_denom_ms();
            if numer > 0 {
                frame_rate = Some(1000.0 * f64::from(denom) / f64::from(numer));
            }
        }
        let rgb = DynamicImage::ImageRgba8(frame.into_buffer()).into_rgb8();
        writer.write(&rgb)?;
    }
    Ok(frame_rate)
}
