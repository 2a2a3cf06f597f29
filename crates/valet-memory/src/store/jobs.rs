use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::Result;
use crate::types::{now_ms, Job, JobStatus, JobType};

use super::{json_col, Store};

/// Deterministic job id over `(job_type, session_key, turn_id)`. Scheduling
/// the same turn's maintenance twice collides here and dedupes.
pub fn job_id(job_type: JobType, session_key: &str, turn_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(job_type.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(session_key.as_bytes());
    hasher.update(b"|");
    hasher.update(turn_id.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

impl Store {
    /// Enqueue a job. A job with the same deterministic id already present
    /// acts as an idempotent lock: the insert is ignored.
    pub fn enqueue_job(
        &self,
        id: &str,
        job_type: JobType,
        session_key: &str,
        priority: i64,
        payload: &serde_json::Value,
        run_after: i64,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let now = now_ms();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO jobs
                 (id, job_type, session_key, status, priority, payload,
                  run_after, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?7, ?7)",
            rusqlite::params![
                id,
                job_type.to_string(),
                session_key,
                priority,
                serde_json::to_string(payload)?,
                run_after,
                now,
            ],
        )?;
        if inserted > 0 {
            debug!(job_id = %id, %job_type, session = %session_key, "job enqueued");
        }
        Ok(inserted > 0)
    }

    /// Atomic claim: SELECT the next eligible job, then a conditional UPDATE
    /// that only wins if the row is still eligible. Exactly one claimant
    /// observes each job as its runnable instance.
    pub fn claim_next_job(&self, now: i64, lease_ms: i64) -> Result<Option<Job>> {
        let conn = self.conn.lock().unwrap();
        loop {
            let candidate: Option<String> = conn
                .query_row(
                    "SELECT id FROM jobs
                     WHERE (status = 'pending' AND run_after <= ?1)
                        OR (status = 'running' AND lease_until < ?1)
                     ORDER BY priority ASC, created_at ASC
                     LIMIT 1",
                    rusqlite::params![now],
                    |row| row.get(0),
                )
                .ok();
            let Some(id) = candidate else {
                return Ok(None);
            };

            let won = conn.execute(
                "UPDATE jobs
                 SET status = 'running', lease_until = ?1, updated_at = ?2
                 WHERE id = ?3
                   AND ((status = 'pending' AND run_after <= ?2)
                        OR (status = 'running' AND lease_until < ?2))",
                rusqlite::params![now + lease_ms, now, id],
            )?;
            if won == 1 {
                return Ok(self.get_job_locked(&conn, &id)?);
            }
            // Another claimant won the row between SELECT and UPDATE; retry.
        }
    }

    /// Flip running jobs whose lease has expired back to pending so the
    /// next tick can re-claim them.
    pub fn requeue_expired_leases(&self, now: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE jobs
             SET status = 'pending', lease_until = 0, updated_at = ?1
             WHERE status = 'running' AND lease_until < ?1",
            rusqlite::params![now],
        )?;
        if n > 0 {
            warn!(count = n, "requeued jobs with expired leases");
        }
        Ok(n)
    }

    pub fn complete_job(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = now_ms();
        conn.execute(
            "UPDATE jobs
             SET status = 'completed', completed_at = ?1, updated_at = ?1, error = ''
             WHERE id = ?2",
            rusqlite::params![now, id],
        )?;
        Ok(())
    }

    pub fn fail_job(&self, id: &str, error: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = now_ms();
        conn.execute(
            "UPDATE jobs
             SET status = 'failed', completed_at = ?1, updated_at = ?1, error = ?2
             WHERE id = ?3",
            rusqlite::params![now, error, id],
        )?;
        Ok(())
    }

    /// Diagnostics: jobs by status, oldest first. `None` lists everything.
    pub fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        let conn = self.conn.lock().unwrap();
        let mut jobs = Vec::new();
        match status {
            Some(s) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {JOB_COLS} FROM jobs WHERE status = ?1 ORDER BY created_at"
                ))?;
                let rows = stmt.query_map(rusqlite::params![s.to_string()], row_to_job)?;
                jobs.extend(rows.filter_map(|r| r.ok()));
            }
            None => {
                let mut stmt =
                    conn.prepare(&format!("SELECT {JOB_COLS} FROM jobs ORDER BY created_at"))?;
                let rows = stmt.query_map([], row_to_job)?;
                jobs.extend(rows.filter_map(|r| r.ok()));
            }
        }
        Ok(jobs)
    }

    pub fn count_jobs_for_session(&self, session_key: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let n = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE session_key = ?1",
            rusqlite::params![session_key],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    fn get_job_locked(
        &self,
        conn: &rusqlite::Connection,
        id: &str,
    ) -> rusqlite::Result<Option<Job>> {
        match conn.query_row(
            &format!("SELECT {JOB_COLS} FROM jobs WHERE id = ?1"),
            rusqlite::params![id],
            row_to_job,
        ) {
            Ok(job) => Ok(Some(job)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

const JOB_COLS: &str = "id, job_type, session_key, status, priority, payload, error, \
                        run_after, lease_until, created_at, updated_at, completed_at";

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let type_str: String = row.get(1)?;
    let status_str: String = row.get(3)?;
    let payload_raw: String = row.get(5)?;
    Ok(Job {
        id: row.get(0)?,
        job_type: type_str.parse().unwrap_or(JobType::Consolidate),
        session_key: row.get(2)?,
        status: status_str.parse().unwrap_or(JobStatus::Pending),
        priority: row.get(4)?,
        payload: json_col(payload_raw),
        error: row.get(6)?,
        run_after: row.get(7)?,
        lease_until: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
        completed_at: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enqueue(store: &Store, job_type: JobType, turn: &str, priority: i64, run_after: i64) {
        let id = job_id(job_type, "cli:j", turn);
        store
            .enqueue_job(
                &id,
                job_type,
                "cli:j",
                priority,
                &serde_json::json!({ "turn_id": turn }),
                run_after,
            )
            .unwrap();
    }

    #[test]
    fn duplicate_schedules_dedupe() {
        let store = Store::open_in_memory().unwrap();
        enqueue(&store, JobType::Consolidate, "t1", 30, 0);
        enqueue(&store, JobType::Consolidate, "t1", 30, 0);
        enqueue(&store, JobType::Compact, "t1", 80, 0);
        assert_eq!(store.count_jobs_for_session("cli:j").unwrap(), 2);
    }

    #[test]
    fn claim_orders_by_priority_then_age() {
        let store = Store::open_in_memory().unwrap();
        enqueue(&store, JobType::Compact, "t1", 80, 0);
        enqueue(&store, JobType::Consolidate, "t1", 30, 0);

        let now = now_ms();
        let first = store.claim_next_job(now, 60_000).unwrap().unwrap();
        assert_eq!(first.job_type, JobType::Consolidate);
        assert_eq!(first.status, JobStatus::Running);

        let second = store.claim_next_job(now, 60_000).unwrap().unwrap();
        assert_eq!(second.job_type, JobType::Compact);

        // Both leased: nothing further to claim.
        assert!(store.claim_next_job(now, 60_000).unwrap().is_none());
    }

    #[test]
    fn run_after_gates_eligibility() {
        let store = Store::open_in_memory().unwrap();
        let now = now_ms();
        enqueue(&store, JobType::Compact, "t2", 80, now + 60_000);
        assert!(store.claim_next_job(now, 60_000).unwrap().is_none());
        assert!(store.claim_next_job(now + 61_000, 60_000).unwrap().is_some());
    }

    #[test]
    fn expired_lease_is_reclaimable() {
        let store = Store::open_in_memory().unwrap();
        enqueue(&store, JobType::Consolidate, "t3", 30, 0);
        let now = now_ms();
        let job = store.claim_next_job(now, 1_000).unwrap().unwrap();

        // Lease expires; the same job becomes claimable again.
        let later = now + 2_000;
        let reclaimed = store.claim_next_job(later, 1_000).unwrap().unwrap();
        assert_eq!(reclaimed.id, job.id);
    }

    #[test]
    fn failure_records_error_text() {
        let store = Store::open_in_memory().unwrap();
        enqueue(&store, JobType::Consolidate, "t4", 30, 0);
        let job = store.claim_next_job(now_ms(), 60_000).unwrap().unwrap();
        store.fail_job(&job.id, "extractor blew up").unwrap();
        let failed = store.list_jobs(Some(JobStatus::Failed)).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error, "extractor blew up");
    }
}
