//! SurgiTrack pipeline worker
//!
//! Turns an uploaded video into a timeline of pick-up / place-back events
//! for one tracked object relative to one container (a cup and its tray).
//!
//! # Pipeline
//!
//! 1. **Frame extraction**: the video is decoded into `frame_<n>.jpg` files.
//! 2. **Detection aggregation**: a detector backend runs on every frame, in
//!    numeric frame order, building a `DetectionMap`.
//! 3. **State tracking**: a two-state machine (`on_target` / `off_target`)
//!    walks the map and emits an `Event` on every transition.
//!
//! Jobs are submitted to a durable FIFO (`queue`), processed one at a time by
//! a `JobRunner`, and polled through the `JobStatusService`. A job's status
//! only ever moves `queued -> processing -> completed | failed`.
//!
//! # Features
//!
//! - `extract-ffmpeg`: decode MP4 and other containers through FFmpeg.
//!   Without it only animated GIF uploads can be extracted; any other
//!   container fails the job with `PipelineError::Extraction`.
//! - `backend-tract`: the ONNX detector backend.
//!
//! # Module Structure
//!
//! - `frame`: frame identifiers and frame directory listing
//! - `extract`: video decoding into frame files
//! - `detect`: detector backends and the detection aggregator
//! - `track`: the pick-up / place-back state machine
//! - `job`, `queue`, `runner`, `status`: job lifecycle
//! - `blob`: video blob storage
//! - `api`: HTTP surface for submitting and polling jobs
//! - `config`: daemon configuration

use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod api;
pub mod blob;
pub mod cancel;
pub mod config;
pub mod detect;
pub mod error;
pub mod extract;
pub mod frame;
pub mod job;
pub mod queue;
pub mod runner;
pub mod status;
pub mod track;

pub use blob::{BlobStore, FilesystemBlobStore};
pub use cancel::CancelToken;
pub use detect::{
    BackendRegistry, ClassLabels, Detection, DetectionAggregator, DetectionMap, DetectorBackend,
    RawDetection, SharedBackend,
};
pub use error::{PipelineError, Result};
pub use extract::{Extraction, FrameExtractor};
pub use frame::FrameId;
pub use job::{Job, JobId, JobInput, JobKind, JobStatus, JobStatusView};
pub use queue::{InMemoryJobQueue, JobQueue, SqliteJobQueue};
pub use runner::{JobOutcome, JobRunner, RunnerSettings};
pub use status::JobStatusService;
pub use track::{Event, EventKind, StateTracker, TrackState};

/// URI of a fresh, uniquely named shared in-memory SQLite database.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:surgitrack_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

/// Milliseconds since the Unix epoch; zero if the clock is before it.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
