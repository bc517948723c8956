//! Frame identifiers and on-disk frame listing.
//!
//! Frames of one run live in a single directory as `frame_<n>.<ext>`, with
//! `n` counting up from zero. Ordering is always by the numeric suffix, so
//! `frame_2` sorts before `frame_10`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::PipelineError;

const FRAME_PREFIX: &str = "frame_";

/// Extension used by the extractor when writing frames.
pub const FRAME_EXTENSION: &str = "jpg";

/// Numeric frame identifier, rendered as `frame_<n>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(u32);

impl FrameId {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(self) -> u32 {
        self.0
    }

    /// File name of this frame inside a frames directory.
    pub fn file_name(self) -> String {
        format!("{FRAME_PREFIX}{}.{FRAME_EXTENSION}", self.0)
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{FRAME_PREFIX}{}", self.0)
    }
}

impl FromStr for FrameId {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let index = s
            .strip_prefix(FRAME_PREFIX)
            .filter(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|digits| digits.parse::<u32>().ok())
            .ok_or_else(|| PipelineError::TrackingInput(format!("invalid frame identifier '{s}'")))?;
        Ok(Self(index))
    }
}

impl Serialize for FrameId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FrameId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

fn frame_file_re() -> &'static Regex {
    static FRAME_FILE_RE: OnceLock<Regex> = OnceLock::new();
    FRAME_FILE_RE.get_or_init(|| {
        Regex::new(r"(?i)^frame_(\d+)\.(jpg|jpeg|png)$").expect("frame file pattern is valid")
    })
}

/// Parses a frame file name such as `frame_12.jpg`.
pub fn parse_frame_file_name(name: &str) -> Option<FrameId> {
    let caps = frame_file_re().captures(name)?;
    caps.get(1)?.as_str().parse::<u32>().ok().map(FrameId)
}

/// Lists the frame files in `dir`, ordered by frame index.
///
/// Entries that do not look like frames are skipped.
pub fn list_frames(dir: &Path) -> std::io::Result<Vec<(FrameId, PathBuf)>> {
    let mut frames = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(id) = name.to_str().and_then(parse_frame_file_name) else {
            log::debug!("skipping non-frame entry {}", entry.path().display());
            continue;
        };
        frames.push((id, entry.path()));
    }
    frames.sort_by_key(|(id, _)| *id);
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_ids_order_numerically() {
        let mut ids: Vec<FrameId> = ["frame_10", "frame_2", "frame_9", "frame_0"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        ids.sort();
        let rendered: Vec<String> = ids.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, ["frame_0", "frame_2", "frame_9", "frame_10"]);
    }

    #[test]
    fn rejects_malformed_identifiers() {
        for bad in ["frame_", "frame_x", "frame_-1", "img_3", "3", "frame_1.jpg"] {
            assert!(bad.parse::<FrameId>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn parses_frame_file_names() {
        assert_eq!(parse_frame_file_name("frame_7.jpg"), Some(FrameId::new(7)));
        assert_eq!(parse_frame_file_name("frame_7.PNG"), Some(FrameId::new(7)));
        assert_eq!(parse_frame_file_name("frame_7.txt"), None);
        assert_eq!(parse_frame_file_name("detections.json"), None);
    }

    #[test]
    fn lists_frames_in_numeric_order() -> std::io::Result<()> {
        let dir = tempfile::tempdir()?;
        for i in [10u32, 1, 9, 0, 2, 100] {
            std::fs::write(dir.path().join(format!("frame_{i}.jpg")), b"x")?;
        }
        std::fs::write(dir.path().join("notes.txt"), b"x")?;
        std::fs::create_dir(dir.path().join("frame_3.jpg.d"))?;

        let frames = list_frames(dir.path())?;
        let order: Vec<u32> = frames.iter().map(|(id, _)| id.index()).collect();
        assert_eq!(order, vec![0, 1, 2, 9, 10, 100]);
        assert!(frames[4].1.ends_with("frame_10.jpg"));
        Ok(())
    }

    #[test]
    fn serializes_as_string_key() {
        let json = serde_json::to_string(&FrameId::new(4)).unwrap();
        assert_eq!(json, "\"frame_4\"");
        let back: FrameId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, FrameId::new(4));
    }
}
