//! Read-only job status lookup for clients.

use std::sync::Arc;

use crate::error::{PipelineError, Result};
use crate::job::{JobId, JobStatusView};
use crate::queue::JobQueue;

#[derive(Clone)]
pub struct JobStatusService {
    queue: Arc<dyn JobQueue>,
}

impl JobStatusService {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self { queue }
    }

    /// Current status of `job_id`. Malformed and unknown ids both yield
    /// `PipelineError::NotFound`.
    pub fn get_status(&self, job_id: &str) -> Result<JobStatusView> {
        let id: JobId = job_id.trim().parse()?;
        self.queue
            .load(&id)?
            .map(JobStatusView::from)
            .ok_or_else(|| PipelineError::NotFound(job_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::job::JobStatus;
    use crate::queue::InMemoryJobQueue;

    #[test]
    fn reports_queued_then_failed_with_error() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let service = JobStatusService::new(queue.clone());
        let id = queue.enqueue("clip.gif").unwrap();

        let view = service.get_status(id.as_str()).unwrap();
        assert_eq!(view.status, JobStatus::Queued);
        assert_eq!(view.job_id, id);

        queue.pop(Duration::ZERO).unwrap();
        queue.mark_processing(&id).unwrap();
        assert_eq!(service.get_status(id.as_str()).unwrap().status, JobStatus::Processing);
        queue.fail(&id, "blob store: no blob stored under 'clip.gif'").unwrap();

        let view = service.get_status(id.as_str()).unwrap();
        assert_eq!(view.status, JobStatus::Failed);
        assert!(view.error.unwrap().contains("clip.gif"));
        assert!(view.result.is_none());
    }

    #[test]
    fn unknown_and_malformed_ids_are_not_found() {
        let service = JobStatusService::new(Arc::new(InMemoryJobQueue::new()));
        let unknown = JobId::generate();
        assert!(matches!(
            service.get_status(unknown.as_str()),
            Err(PipelineError::NotFound(_))
        ));
        assert!(matches!(
            service.get_status("not-a-job"),
            Err(PipelineError::NotFound(_))
        ));
    }
}
