use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::JobQueue;
use crate::error::{PipelineError, Result};
use crate::job::{Job, JobId, JobInput, JobKind, JobStatus};
use crate::track::Event;
use crate::{now_ms, open_db_connection, shared_memory_uri};

const POLL_STEP: Duration = Duration::from_millis(50);

/// SQLite-backed queue. Several processes may share one database file;
/// `pop` runs inside an immediate transaction so only one of them can claim
/// the head of the FIFO.
pub struct SqliteJobQueue {
    conn: Mutex<Connection>,
}

impl SqliteJobQueue {
    pub fn open(db_path: &str) -> Result<Self> {
        let db_path = if db_path == ":memory:" {
            shared_memory_uri()
        } else {
            db_path.to_string()
        };
        let conn = open_db_connection(&db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let queue = Self {
            conn: Mutex::new(conn),
        };
        queue.ensure_schema()?;
        Ok(queue)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.lock()?.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS jobs (
              id TEXT PRIMARY KEY,
              kind TEXT NOT NULL,
              input_json TEXT NOT NULL,
              status TEXT NOT NULL,
              result_json TEXT,
              error TEXT,
              enqueued_at INTEGER NOT NULL,
              updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS job_queue (
              seq INTEGER PRIMARY KEY AUTOINCREMENT,
              job_id TEXT NOT NULL UNIQUE
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status, updated_at);
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PipelineError::Queue("queue connection lock poisoned".to_string()))
    }

    /// Claims the head of the FIFO, discarding entries whose job record is
    /// gone, until a live job is found or the FIFO is empty.
    fn try_pop(&self) -> Result<Option<Job>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let job = loop {
            let head = tx
                .query_row(
                    "SELECT seq, job_id FROM job_queue ORDER BY seq ASC LIMIT 1",
                    [],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()?;
            let Some((seq, job_id)) = head else {
                break None;
            };
            tx.execute("DELETE FROM job_queue WHERE seq = ?1", params![seq])?;
            match load_job(&tx, &job_id)? {
                Some(job) => break Some(job),
                None => log::error!("dropped queue entry {} with no job record", job_id),
            }
        };
        tx.commit()?;
        Ok(job)
    }
}

impl JobQueue for SqliteJobQueue {
    fn enqueue_input(&self, input: JobInput) -> Result<JobId> {
        let job = Job::new_queued(input, now_ms());
        let input_json = serde_json::to_string(&job.input)
            .map_err(|e| PipelineError::Queue(format!("encode job input: {e}")))?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO jobs(id, kind, input_json, status, enqueued_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                job.id.as_str(),
                job.kind.as_str(),
                input_json,
                job.status.as_str(),
                to_sql_ms(job.enqueued_at),
                to_sql_ms(job.updated_at)
            ],
        )?;
        tx.execute(
            "INSERT INTO job_queue(job_id) VALUES (?1)",
            params![job.id.as_str()],
        )?;
        tx.commit()?;
        Ok(job.id)
    }

    fn pop(&self, wait: Duration) -> Result<Option<Job>> {
        let started = Instant::now();
        loop {
            if let Some(job) = self.try_pop()? {
                return Ok(Some(job));
            }
            let elapsed = started.elapsed();
            if elapsed >= wait {
                return Ok(None);
            }
            std::thread::sleep(POLL_STEP.min(wait - elapsed));
        }
    }

    fn push_back(&self, id: &JobId) -> Result<()> {
        self.lock()?.execute(
            "INSERT OR IGNORE INTO job_queue(job_id) VALUES (?1)",
            params![id.as_str()],
        )?;
        Ok(())
    }

    fn mark_processing(&self, id: &JobId) -> Result<bool> {
        let changed = self.lock()?.execute(
            r#"
            UPDATE jobs SET status = 'processing', updated_at = ?2
            WHERE id = ?1 AND status IN ('queued', 'processing')
            "#,
            params![id.as_str(), to_sql_ms(now_ms())],
        )?;
        Ok(changed > 0)
    }

    fn complete(&self, id: &JobId, events: &[Event]) -> Result<bool> {
        let result_json = serde_json::to_string(events)
            .map_err(|e| PipelineError::Queue(format!("encode job result: {e}")))?;
        let changed = self.lock()?.execute(
            r#"
            UPDATE jobs SET status = 'completed', result_json = ?2, error = NULL, updated_at = ?3
            WHERE id = ?1 AND status = 'processing'
            "#,
            params![id.as_str(), result_json, to_sql_ms(now_ms())],
        )?;
        Ok(changed > 0)
    }

    fn fail(&self, id: &JobId, error: &str) -> Result<bool> {
        let changed = self.lock()?.execute(
            r#"
            UPDATE jobs SET status = 'failed', error = ?2, result_json = NULL, updated_at = ?3
            WHERE id = ?1 AND status = 'processing'
            "#,
            params![id.as_str(), error, to_sql_ms(now_ms())],
        )?;
        Ok(changed > 0)
    }

    fn load(&self, id: &JobId) -> Result<Option<Job>> {
        let conn = self.lock()?;
        load_job(&conn, id.as_str())
    }

    fn recover_stale(&self, older_than: Duration) -> Result<usize> {
        let now = now_ms();
        let cutoff = now.saturating_sub(u64::try_from(older_than.as_millis()).unwrap_or(u64::MAX));
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let abandoned: Vec<String> = {
            let mut stmt = tx.prepare(
                r#"
                SELECT id FROM jobs
                WHERE id NOT IN (SELECT job_id FROM job_queue)
                  AND (status = 'queued' OR (status = 'processing' AND updated_at <= ?1))
                ORDER BY enqueued_at ASC, id ASC
                "#,
            )?;
            let ids = stmt
                .query_map(params![to_sql_ms(cutoff)], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            ids
        };
        for id in &abandoned {
            tx.execute(
                "UPDATE jobs SET updated_at = ?2 WHERE id = ?1 AND status = 'processing'",
                params![id, to_sql_ms(now)],
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO job_queue(job_id) VALUES (?1)",
                params![id],
            )?;
        }
        tx.commit()?;
        if !abandoned.is_empty() {
            log::warn!("re-enqueued {} abandoned jobs", abandoned.len());
        }
        Ok(abandoned.len())
    }

    fn pending(&self) -> Result<usize> {
        let count: i64 =
            self.lock()?
                .query_row("SELECT COUNT(*) FROM job_queue", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

fn to_sql_ms(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

fn load_job(conn: &Connection, id: &str) -> Result<Option<Job>> {
    let row = conn
        .query_row(
            r#"
            SELECT id, kind, input_json, status, result_json, error, enqueued_at, updated_at
            FROM jobs WHERE id = ?1
            "#,
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                ))
            },
        )
        .optional()?;
    let Some((id, kind, input_json, status, result_json, error, enqueued_at, updated_at)) = row
    else {
        return Ok(None);
    };

    let corrupt = |what: &str, e: &dyn std::fmt::Display| {
        PipelineError::Queue(format!("corrupt job record {id}: {what}: {e}"))
    };
    let input: JobInput =
        serde_json::from_str(&input_json).map_err(|e| corrupt("input", &e))?;
    let result = result_json
        .map(|raw| serde_json::from_str::<Vec<Event>>(&raw))
        .transpose()
        .map_err(|e| corrupt("result", &e))?;
    Ok(Some(Job {
        id: id.parse().map_err(|e| corrupt("id", &e))?,
        kind: kind.parse::<JobKind>()?,
        input,
        status: status.parse::<JobStatus>()?,
        result,
        error,
        enqueued_at: u64::try_from(enqueued_at).unwrap_or(0),
        updated_at: u64::try_from(updated_at).unwrap_or(0),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameId;
    use crate::track::EventKind;

    fn queue() -> SqliteJobQueue {
        SqliteJobQueue::open(":memory:").unwrap()
    }

    #[test]
    fn pops_in_submission_order() {
        let q = queue();
        let a = q.enqueue("a.gif").unwrap();
        let b = q.enqueue("b.gif").unwrap();
        assert_eq!(q.pending().unwrap(), 2);

        let first = q.pop(Duration::ZERO).unwrap().unwrap();
        let second = q.pop(Duration::ZERO).unwrap().unwrap();
        assert_eq!((first.id, second.id), (a, b));
        assert_eq!(first.input.video_key, "a.gif");
        assert_eq!(first.status, JobStatus::Queued);
        assert!(q.pop(Duration::from_millis(20)).unwrap().is_none());
    }

    #[test]
    fn terminal_states_never_revert() {
        let q = queue();
        let id = q.enqueue("clip.gif").unwrap();
        q.pop(Duration::ZERO).unwrap();
        assert!(q.mark_processing(&id).unwrap());
        let events = vec![Event {
            frame: FrameId::new(3),
            timestamp: Duration::from_millis(500),
            event: EventKind::PickedUp,
        }];
        assert!(q.complete(&id, &events).unwrap());

        assert!(!q.mark_processing(&id).unwrap());
        assert!(!q.fail(&id, "late failure").unwrap());
        assert!(!q.complete(&id, &[]).unwrap());

        let job = q.load(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(events));
        assert_eq!(job.error, None);
    }

    #[test]
    fn complete_requires_processing() {
        let q = queue();
        let id = q.enqueue("clip.gif").unwrap();
        assert!(!q.complete(&id, &[]).unwrap());
        assert!(!q.fail(&id, "boom").unwrap());
        assert_eq!(q.load(&id).unwrap().unwrap().status, JobStatus::Queued);
    }

    #[test]
    fn recover_requeues_abandoned_jobs_once() {
        let q = queue();
        let crashed = q.enqueue("crashed.gif").unwrap();
        let lost = q.enqueue("lost.gif").unwrap();
        let done = q.enqueue("done.gif").unwrap();

        // crashed: popped and marked processing, runner died.
        let job = q.pop(Duration::ZERO).unwrap().unwrap();
        assert_eq!(job.id, crashed);
        q.mark_processing(&crashed).unwrap();
        // lost: popped but the runner died before writing any status.
        assert_eq!(q.pop(Duration::ZERO).unwrap().unwrap().id, lost);
        // done: finished normally.
        q.pop(Duration::ZERO).unwrap();
        q.mark_processing(&done).unwrap();
        q.fail(&done, "bad video").unwrap();

        assert_eq!(q.pending().unwrap(), 0);
        assert_eq!(q.recover_stale(Duration::ZERO).unwrap(), 2);
        assert_eq!(q.recover_stale(Duration::from_secs(3600)).unwrap(), 0);

        let mut redelivered = vec![
            q.pop(Duration::ZERO).unwrap().unwrap().id,
            q.pop(Duration::ZERO).unwrap().unwrap().id,
        ];
        redelivered.sort();
        let mut expected = vec![crashed, lost];
        expected.sort();
        assert_eq!(redelivered, expected);
        assert!(q.pop(Duration::ZERO).unwrap().is_none());
    }

    #[test]
    fn pop_skips_entries_without_a_job_record() {
        let q = queue();
        let id = q.enqueue("clip.gif").unwrap();
        {
            let conn = q.lock().unwrap();
            conn.execute(
                "INSERT INTO job_queue(seq, job_id) VALUES (0, ?1)",
                params!["0123456789abcdef0123456789abcdef"],
            )
            .unwrap();
        }
        assert_eq!(q.pending().unwrap(), 2);

        let job = q.pop(Duration::ZERO).unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(q.pending().unwrap(), 0);
    }

    #[test]
    fn push_back_redelivers() {
        let q = queue();
        let id = q.enqueue("clip.gif").unwrap();
        let job = q.pop(Duration::ZERO).unwrap().unwrap();
        q.push_back(&job.id).unwrap();
        q.push_back(&job.id).unwrap();
        assert_eq!(q.pending().unwrap(), 1);
        assert_eq!(q.pop(Duration::ZERO).unwrap().unwrap().id, id);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let path = path.to_string_lossy().to_string();
        let id = SqliteJobQueue::open(&path).unwrap().enqueue("clip.gif").unwrap();

        let reopened = SqliteJobQueue::open(&path).unwrap();
        assert_eq!(reopened.load(&id).unwrap().unwrap().status, JobStatus::Queued);
        assert_eq!(reopened.pop(Duration::ZERO).unwrap().unwrap().id, id);
    }
}
