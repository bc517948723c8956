//! Durable FIFO of pipeline jobs plus the per-job status records.
//!
//! Queue implementations must make `pop` exclusive: two runners sharing a
//! queue never receive the same delivery. Delivery is at-least-once:
//! `recover_stale` puts abandoned jobs back on the FIFO, so a job may be
//! processed again after a crash.

mod memory;
mod sqlite;

use std::time::Duration;

pub use memory::InMemoryJobQueue;
pub use sqlite::SqliteJobQueue;

use crate::error::Result;
use crate::job::{Job, JobId, JobInput};
use crate::track::Event;

pub trait JobQueue: Send + Sync {
    /// Create a `queued` pipeline job for `video_key` and append it to the FIFO.
    fn enqueue(&self, video_key: &str) -> Result<JobId> {
        self.enqueue_input(JobInput {
            video_key: video_key.to_string(),
        })
    }

    fn enqueue_input(&self, input: JobInput) -> Result<JobId>;

    /// Remove and return the oldest queued item, waiting up to `wait` for one
    /// to arrive.
    fn pop(&self, wait: Duration) -> Result<Option<Job>>;

    /// Put a popped job back at the tail of the FIFO.
    fn push_back(&self, id: &JobId) -> Result<()>;

    /// `queued | processing -> processing`. Returns false when the job is
    /// unknown or already terminal.
    fn mark_processing(&self, id: &JobId) -> Result<bool>;

    /// `processing -> completed`. Returns false when the job is not processing.
    fn complete(&self, id: &JobId, events: &[Event]) -> Result<bool>;

    /// `processing -> failed`. Returns false when the job is not processing.
    fn fail(&self, id: &JobId, error: &str) -> Result<bool>;

    fn load(&self, id: &JobId) -> Result<Option<Job>>;

    /// Re-deliver jobs left behind by a crashed runner: `processing` jobs not
    /// updated for `older_than`, and `queued` jobs missing from the FIFO.
    /// Returns how many were put back.
    fn recover_stale(&self, older_than: Duration) -> Result<usize>;

    /// Number of items waiting in the FIFO.
    fn pending(&self) -> Result<usize>;
}
