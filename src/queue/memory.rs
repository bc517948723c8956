use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::JobQueue;
use crate::error::{PipelineError, Result};
use crate::job::{Job, JobId, JobInput, JobStatus};
use crate::now_ms;
use crate::track::Event;

/// Process-local queue for tests and single-binary setups. Nothing survives
/// a restart.
#[derive(Default)]
pub struct InMemoryJobQueue {
    state: Mutex<State>,
    available: Condvar,
}

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    fifo: VecDeque<JobId>,
}

impl State {
    fn transition(
        &mut self,
        id: &JobId,
        allowed: &[JobStatus],
        apply: impl FnOnce(&mut Job),
    ) -> bool {
        match self.jobs.get_mut(id) {
            Some(job) if allowed.contains(&job.status) => {
                apply(job);
                job.updated_at = now_ms();
                true
            }
            _ => false,
        }
    }
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| PipelineError::Queue("queue state lock poisoned".to_string()))
    }
}

impl JobQueue for InMemoryJobQueue {
    fn enqueue_input(&self, input: JobInput) -> Result<JobId> {
        let job = Job::new_queued(input, now_ms());
        let id = job.id.clone();
        let mut state = self.lock()?;
        state.jobs.insert(id.clone(), job);
        state.fifo.push_back(id.clone());
        self.available.notify_one();
        Ok(id)
    }

    fn pop(&self, wait: Duration) -> Result<Option<Job>> {
        let started = Instant::now();
        let mut state = self.lock()?;
        loop {
            while let Some(id) = state.fifo.pop_front() {
                match state.jobs.get(&id) {
                    Some(job) => return Ok(Some(job.clone())),
                    None => log::error!("dropped queue entry {} with no job record", id),
                }
            }
            let elapsed = started.elapsed();
            if elapsed >= wait {
                return Ok(None);
            }
            state = self
                .available
                .wait_timeout(state, wait - elapsed)
                .map_err(|_| PipelineError::Queue("queue state lock poisoned".to_string()))?
                .0;
        }
    }

    fn push_back(&self, id: &JobId) -> Result<()> {
        let mut state = self.lock()?;
        if !state.fifo.contains(id) {
            state.fifo.push_back(id.clone());
            self.available.notify_one();
        }
        Ok(())
    }

    fn mark_processing(&self, id: &JobId) -> Result<bool> {
        let mut state = self.lock()?;
        Ok(state.transition(id, &[JobStatus::Queued, JobStatus::Processing], |job| {
            job.status = JobStatus::Processing;
        }))
    }

    fn complete(&self, id: &JobId, events: &[Event]) -> Result<bool> {
        let mut state = self.lock()?;
        Ok(state.transition(id, &[JobStatus::Processing], |job| {
            job.status = JobStatus::Completed;
            job.result = Some(events.to_vec());
            job.error = None;
        }))
    }

    fn fail(&self, id: &JobId, error: &str) -> Result<bool> {
        let mut state = self.lock()?;
        Ok(state.transition(id, &[JobStatus::Processing], |job| {
            job.status = JobStatus::Failed;
            job.error = Some(error.to_string());
            job.result = None;
        }))
    }

    fn load(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(self.lock()?.jobs.get(id).cloned())
    }

    fn recover_stale(&self, older_than: Duration) -> Result<usize> {
        let now = now_ms();
        let cutoff = now.saturating_sub(u64::try_from(older_than.as_millis()).unwrap_or(u64::MAX));
        let mut state = self.lock()?;
        let mut abandoned: Vec<(u64, JobId)> = state
            .jobs
            .values()
            .filter(|job| !state.fifo.contains(&job.id))
            .filter(|job| match job.status {
                JobStatus::Queued => true,
                JobStatus::Processing => job.updated_at <= cutoff,
                JobStatus::Completed | JobStatus::Failed => false,
            })
            .map(|job| (job.enqueued_at, job.id.clone()))
            .collect();
        abandoned.sort();
        for (_, id) in &abandoned {
            if let Some(job) = state.jobs.get_mut(id) {
                if job.status == JobStatus::Processing {
                    job.updated_at = now;
                }
            }
            state.fifo.push_back(id.clone());
        }
        if !abandoned.is_empty() {
            log::warn!("re-enqueued {} abandoned jobs", abandoned.len());
            self.available.notify_all();
        }
        Ok(abandoned.len())
    }

    fn pending(&self) -> Result<usize> {
        Ok(self.lock()?.fifo.len())
    }
}
