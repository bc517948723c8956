//! Frame extraction.
//!
//! The extractor decodes one video into `frame_<n>.jpg` stills under a
//! working directory that it owns. The directory is wiped at the start of
//! every run so frames from a previous run never leak into the next one.
//!
//! Supported containers:
//! - animated GIF (always available)
//! - anything FFmpeg can open (feature: extract-ffmpeg)

#[cfg(feature = "extract-ffmpeg")]
mod ffmpeg;
mod gif;

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use image::{ImageFormat, RgbImage};

use crate::cancel::CancelToken;
use crate::error::{PipelineError, Result};
use crate::frame::FrameId;

/// Whether containers other than GIF can be decoded in this build.
pub const FFMPEG_ENABLED: bool = cfg!(feature = "extract-ffmpeg");

/// Outcome of a successful extraction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Extraction {
    pub frame_count: usize,
    /// Container frame rate, when the container declares one.
    pub frame_rate: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Container {
    Gif,
    Other,
}

pub struct FrameExtractor {
    frames_dir: PathBuf,
}

impl FrameExtractor {
    pub fn new(frames_dir: impl Into<PathBuf>) -> Self {
        Self {
            frames_dir: frames_dir.into(),
        }
    }

    pub fn frames_dir(&self) -> &Path {
        &self.frames_dir
    }

    /// Decode `video_path` into numbered frames, returning how many were written.
    pub fn extract(&self, video_path: &Path, cancel: &CancelToken) -> Result<Extraction> {
        cancel.check("frame extraction")?;
        self.reset_frames_dir()?;

        let container = sniff_container(video_path)?;
        let mut writer = FrameWriter {
            dir: &self.frames_dir,
            next: 0,
            cancel,
        };
        let frame_rate = match container {
            Container::Gif => gif::decode(video_path, &mut writer)?,
            Container::Other => decode_other(video_path, &mut writer)?,
        };

        let frame_count = writer.next as usize;
        if frame_count == 0 {
            return Err(PipelineError::Extraction(format!(
                "{} decoded to zero frames",
                video_path.display()
            )));
        }
        log::info!(
            "extracted {} frames from {} into {} (fps={:?})",
            frame_count,
            video_path.display(),
            self.frames_dir.display(),
            frame_rate
        );
        Ok(Extraction {
            frame_count,
            frame_rate,
        })
    }

    fn reset_frames_dir(&self) -> Result<()> {
        match fs::remove_dir_all(&self.frames_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(PipelineError::Extraction(format!(
                    "clear {}: {}",
                    self.frames_dir.display(),
                    e
                )))
            }
        }
        fs::create_dir_all(&self.frames_dir).map_err(|e| {
            PipelineError::Extraction(format!("create {}: {}", self.frames_dir.display(), e))
        })
    }
}

#[cfg(feature = "extract-ffmpeg")]
fn decode_other(video_path: &Path, writer: &mut FrameWriter<'_>) -> Result<Option<f64>> {
    ffmpeg::decode(video_path, writer)
}

#[cfg(not(feature = "extract-ffmpeg"))]
fn decode_other(video_path: &Path, _writer: &mut FrameWriter<'_>) -> Result<Option<f64>> {
    Err(PipelineError::Extraction(format!(
        "{} is not a GIF; other containers require the extract-ffmpeg feature",
        video_path.display()
    )))
}

fn sniff_container(video_path: &Path) -> Result<Container> {
    let mut file = File::open(video_path).map_err(|e| {
        PipelineError::Extraction(format!("open {}: {}", video_path.display(), e))
    })?;
    let mut header = [0u8; 6];
    let mut filled = 0;
    while filled < header.len() {
        let n = file.read(&mut header[filled..]).map_err(|e| {
            PipelineError::Extraction(format!("read {}: {}", video_path.display(), e))
        })?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled == 0 {
        return Err(PipelineError::Extraction(format!(
            "{} is empty",
            video_path.display()
        )));
    }
    if &header[..filled] == b"GIF87a" || &header[..filled] == b"GIF89a" {
        Ok(Container::Gif)
    } else {
        Ok(Container::Other)
    }
}

/// Writes decoded frames with consecutive indices starting at zero.
pub(crate) struct FrameWriter<'a> {
    dir: &'a Path,
    next: u32,
    cancel: &'a CancelToken,
}

impl FrameWriter<'_> {
    pub(crate) fn write(&mut self, image: &RgbImage) -> Result<()> {
        self.cancel.check("frame extraction")?;
        let id = FrameId::new(self.next);
        let path = self.dir.join(id.file_name());
        image
            .save_with_format(&path, ImageFormat::Jpeg)
            .map_err(|e| PipelineError::Extraction(format!("write {}: {}", path.display(), e)))?;
        self.next += 1;
        Ok(())
    }

    pub(crate) fn written(&self) -> u32 {
        self.next
    }
}
