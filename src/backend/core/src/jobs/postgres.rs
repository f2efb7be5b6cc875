//! PostgreSQL job store.
//!
//! Claims lock candidate rows with `FOR UPDATE SKIP LOCKED` and flip them in
//! the same transaction, so racing workers skip each other's rows instead of
//! waiting on them. Transitions lock the job row and re-check the claim
//! before writing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use uuid::Uuid;

use super::job::{
    ClaimedJob, DeadLetterEntry, EventLevel, Job, JobEvent, JobFilter, JobId, JobRun, JobStatus,
    RunId, StatsSnapshot,
};
use super::store::{apply_transition, guard_open_claim, EnqueueOutcome, JobStore, Transition, TransitionRecord};
use crate::config::DatabaseConfig;
use crate::error::{BusError, Result};

const JOB_COLUMNS: &str = "id, source, job_type, payload, status, priority, idempotency_key, \
     max_retries, retry_count, scheduled_at, created_at, updated_at, started_at, completed_at, \
     worker_id, result, error";

const RUN_COLUMNS: &str =
    "id, job_id, run_number, status, worker_id, started_at, completed_at, duration_ms, result, error";

const DEAD_LETTER_COLUMNS: &str =
    "id, job_id, job_type, error, attempts, resolved, created_at, resolved_at";

/// Job store backed by PostgreSQL.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    /// Create a connection pool from configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| BusError::from(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn claim_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        worker_id: &str,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedJob>> {
        let sql = format!(
            r#"
            WITH candidates AS (
                SELECT id FROM jobs
                WHERE status = 'queued' AND scheduled_at <= $3
                ORDER BY priority DESC, created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'processing', started_at = $3, worker_id = $1, updated_at = $3
            FROM candidates
            WHERE jobs.id = candidates.id
            RETURNING {}
            "#,
            qualified(JOB_COLUMNS, "jobs")
        );

        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(worker_id)
            .bind(batch_size as i64)
            .bind(now)
            .fetch_all(&mut **tx)
            .await?;

        let mut jobs = rows.into_iter().map(Job::try_from).collect::<Result<Vec<_>>>()?;
        // UPDATE ... RETURNING does not preserve the CTE ordering.
        jobs.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));

        let mut claimed = Vec::with_capacity(jobs.len());
        for job in jobs {
            let run = JobRun::open(&job, worker_id, now);
            sqlx::query(
                r#"
                INSERT INTO job_runs (id, job_id, run_number, status, worker_id, started_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(run.id.0)
            .bind(run.job_id.0)
            .bind(to_i32(run.run_number))
            .bind(run.status.as_str())
            .bind(&run.worker_id)
            .bind(run.started_at)
            .execute(&mut **tx)
            .await?;
            claimed.push(ClaimedJob { job, run });
        }

        Ok(claimed)
    }

    async fn fetch_job_for_update(tx: &mut Transaction<'_, Postgres>, job_id: JobId) -> Result<Option<Job>> {
        let sql = format!("SELECT {} FROM jobs WHERE id = $1 FOR UPDATE", JOB_COLUMNS);
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(job_id.0)
            .fetch_optional(&mut **tx)
            .await?
            .map(Job::try_from)
            .transpose()
    }
}

fn qualified(columns: &str, table: &str) -> String {
    columns
        .split(',')
        .map(|c| format!("{}.{}", table, c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn clamp_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert_job(&self, job: Job) -> Result<EnqueueOutcome> {
        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (id, source, job_type, payload, status, priority, idempotency_key,
                              max_retries, retry_count, scheduled_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(job.id.0)
        .bind(&job.source)
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(job.status.as_str())
        .bind(job.priority)
        .bind(&job.idempotency_key)
        .bind(to_i32(job.max_retries))
        .bind(to_i32(job.retry_count))
        .bind(job.scheduled_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(id) = inserted {
            return Ok(EnqueueOutcome::Inserted(JobId(id)));
        }

        let key = job
            .idempotency_key
            .as_deref()
            .ok_or_else(|| BusError::internal("insert returned no row for a job without idempotency key"))?;
        let existing: Uuid = sqlx::query_scalar("SELECT id FROM jobs WHERE idempotency_key = $1")
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        Ok(EnqueueOutcome::Existing(JobId(existing)))
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>> {
        let sql = format!("SELECT {} FROM jobs WHERE id = $1", JOB_COLUMNS);
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(job_id.0)
            .fetch_optional(&self.pool)
            .await?
            .map(Job::try_from)
            .transpose()
    }

    async fn list_jobs(&self, filter: &JobFilter, limit: usize) -> Result<Vec<Job>> {
        let sql = format!(
            r#"
            SELECT {} FROM jobs
            WHERE ($1::TEXT IS NULL OR source = $1)
              AND ($2::TEXT IS NULL OR job_type = $2)
              AND ($3::TEXT IS NULL OR status = $3)
            ORDER BY created_at DESC
            LIMIT $4
            "#,
            JOB_COLUMNS
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(&filter.source)
            .bind(&filter.job_type)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(clamp_limit(limit))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn cancel_job(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'cancelled', completed_at = $2, updated_at = $2
            WHERE id = $1 AND status = 'queued'
            RETURNING {}
            "#,
            JOB_COLUMNS
        );
        let cancelled = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job_id.0)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = cancelled {
            return Job::try_from(row);
        }

        let status: Option<String> = sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1")
            .bind(job_id.0)
            .fetch_optional(&self.pool)
            .await?;
        match status {
            None => Err(BusError::job_not_found(job_id)),
            Some(status) => Err(BusError::invalid_state_transition(
                job_id,
                status,
                JobStatus::Cancelled,
            )),
        }
    }

    async fn claim(&self, worker_id: &str, batch_size: usize, now: DateTime<Utc>) -> Result<Vec<ClaimedJob>> {
        let attempt = async {
            let mut tx = self.pool.begin().await?;
            let claimed = Self::claim_in_tx(&mut tx, worker_id, batch_size, now).await?;
            tx.commit().await?;
            Ok::<_, BusError>(claimed)
        };
        // A dropped transaction rolls back, so a failure leaves nothing flipped.
        attempt.await.map_err(|e| {
            let reason = e.internal_message().unwrap_or(e.user_message()).to_string();
            BusError::claim_failure(reason).with_source(e)
        })
    }

    async fn transition(
        &self,
        job_id: JobId,
        run_id: RunId,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<TransitionRecord> {
        let mut tx = self.pool.begin().await?;

        let mut job = Self::fetch_job_for_update(&mut tx, job_id)
            .await?
            .ok_or_else(|| BusError::job_not_found(job_id))?;

        let sql = format!("SELECT {} FROM job_runs WHERE id = $1 AND job_id = $2 FOR UPDATE", RUN_COLUMNS);
        let run = sqlx::query_as::<_, RunRow>(&sql)
            .bind(run_id.0)
            .bind(job_id.0)
            .fetch_optional(&mut *tx)
            .await?
            .map(JobRun::try_from)
            .transpose()?;

        guard_open_claim(&job, run.as_ref(), run_id)?;
        let mut run = run.ok_or_else(|| BusError::stale_claim(job_id, run_id))?;
        let dead_letter = apply_transition(&mut job, &mut run, transition, now)?;

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2, retry_count = $3, scheduled_at = $4, worker_id = $5,
                completed_at = $6, updated_at = $7, result = $8, error = $9
            WHERE id = $1
            "#,
        )
        .bind(job.id.0)
        .bind(job.status.as_str())
        .bind(to_i32(job.retry_count))
        .bind(job.scheduled_at)
        .bind(&job.worker_id)
        .bind(job.completed_at)
        .bind(job.updated_at)
        .bind(&job.result)
        .bind(&job.error)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE job_runs
            SET status = $2, completed_at = $3, duration_ms = $4, result = $5, error = $6
            WHERE id = $1
            "#,
        )
        .bind(run.id.0)
        .bind(run.status.as_str())
        .bind(run.completed_at)
        .bind(run.duration_ms)
        .bind(&run.result)
        .bind(&run.error)
        .execute(&mut *tx)
        .await?;

        if let Some(entry) = &dead_letter {
            sqlx::query(
                r#"
                INSERT INTO dead_letters (id, job_id, job_type, error, attempts, resolved, created_at)
                VALUES ($1, $2, $3, $4, $5, FALSE, $6)
                "#,
            )
            .bind(entry.id)
            .bind(entry.job_id.0)
            .bind(&entry.job_type)
            .bind(&entry.error)
            .bind(to_i32(entry.attempts))
            .bind(entry.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(TransitionRecord {
            job,
            run,
            dead_letter,
        })
    }

    async fn append_event(
        &self,
        job_id: JobId,
        level: EventLevel,
        message: &str,
        payload: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<JobEvent> {
        let id = Uuid::new_v4();
        let seq: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO job_events (id, job_id, level, message, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING seq
            "#,
        )
        .bind(id)
        .bind(job_id.0)
        .bind(level.as_str())
        .bind(message)
        .bind(&payload)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => BusError::job_not_found(job_id),
            _ => BusError::from(e),
        })?;

        Ok(JobEvent {
            id,
            job_id,
            seq,
            level,
            message: message.to_string(),
            payload,
            created_at: now,
        })
    }

    async fn runs_for(&self, job_id: JobId) -> Result<Vec<JobRun>> {
        let sql = format!("SELECT {} FROM job_runs WHERE job_id = $1 ORDER BY run_number", RUN_COLUMNS);
        let rows = sqlx::query_as::<_, RunRow>(&sql)
            .bind(job_id.0)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(JobRun::try_from).collect()
    }

    async fn events_for(&self, job_id: JobId) -> Result<Vec<JobEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT seq, id, job_id, level, message, payload, created_at
            FROM job_events
            WHERE job_id = $1
            ORDER BY seq
            "#,
        )
        .bind(job_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(JobEvent::try_from).collect()
    }

    async fn expired_claims(&self, started_before: DateTime<Utc>) -> Result<Vec<ClaimedJob>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM job_runs
            JOIN jobs ON jobs.id = job_runs.job_id
            WHERE jobs.status = 'processing'
              AND job_runs.status = 'started'
              AND job_runs.run_number = jobs.retry_count + 1
              AND job_runs.started_at < $1
            ORDER BY job_runs.started_at
            "#,
            qualified(RUN_COLUMNS, "job_runs")
        );
        let runs = sqlx::query_as::<_, RunRow>(&sql)
            .bind(started_before)
            .fetch_all(&self.pool)
            .await?;

        let mut expired = Vec::with_capacity(runs.len());
        for row in runs {
            let run = JobRun::try_from(row)?;
            // The job may have moved on between the two reads; the reclaimer's
            // transition re-checks the claim anyway.
            if let Some(job) = self.get_job(run.job_id).await? {
                expired.push(ClaimedJob { job, run });
            }
        }
        Ok(expired)
    }

    async fn dead_letters(&self, include_resolved: bool, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        let sql = format!(
            r#"
            SELECT {} FROM dead_letters
            WHERE ($1 OR NOT resolved)
            ORDER BY created_at DESC
            LIMIT $2
            "#,
            DEAD_LETTER_COLUMNS
        );
        let rows = sqlx::query_as::<_, DeadLetterRow>(&sql)
            .bind(include_resolved)
            .bind(clamp_limit(limit))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(DeadLetterEntry::from).collect())
    }

    async fn resolve_dead_letter(&self, entry_id: Uuid, now: DateTime<Utc>) -> Result<DeadLetterEntry> {
        let sql = format!(
            r#"
            UPDATE dead_letters
            SET resolved = TRUE, resolved_at = COALESCE(resolved_at, $2)
            WHERE id = $1
            RETURNING {}
            "#,
            DEAD_LETTER_COLUMNS
        );
        sqlx::query_as::<_, DeadLetterRow>(&sql)
            .bind(entry_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?
            .map(DeadLetterEntry::from)
            .ok_or_else(|| BusError::dead_letter_not_found(entry_id))
    }

    async fn stats(&self, since: DateTime<Utc>) -> Result<StatsSnapshot> {
        let mut snapshot = StatsSnapshot::default();

        let counts: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM jobs WHERE created_at >= $1 GROUP BY status",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        for (status, count) in counts {
            snapshot.counts.add(status.parse()?, u64::try_from(count).unwrap_or(0));
        }

        let dead_letters: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters WHERE created_at >= $1")
            .bind(since)
            .fetch_one(&self.pool)
            .await?;
        snapshot.dead_letter_count = u64::try_from(dead_letters).unwrap_or(0);

        let avg: Option<f64> = sqlx::query_scalar(
            "SELECT AVG(duration_ms)::FLOAT8 FROM job_runs WHERE completed_at >= $1 AND duration_ms IS NOT NULL",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        snapshot.avg_duration_ms = avg.unwrap_or(0.0);

        Ok(snapshot)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Database Row Types
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    source: String,
    job_type: String,
    payload: Value,
    status: String,
    priority: i32,
    idempotency_key: Option<String>,
    max_retries: i32,
    retry_count: i32,
    scheduled_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    worker_id: Option<String>,
    result: Option<Value>,
    error: Option<String>,
}

impl TryFrom<JobRow> for Job {
    type Error = BusError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Self {
            id: JobId(row.id),
            source: row.source,
            job_type: row.job_type,
            payload: row.payload,
            status: row.status.parse()?,
            priority: row.priority,
            idempotency_key: row.idempotency_key,
            max_retries: to_u32(row.max_retries),
            retry_count: to_u32(row.retry_count),
            scheduled_at: row.scheduled_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            worker_id: row.worker_id,
            result: row.result,
            error: row.error,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    job_id: Uuid,
    run_number: i32,
    status: String,
    worker_id: String,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
    result: Option<Value>,
    error: Option<String>,
}

impl TryFrom<RunRow> for JobRun {
    type Error = BusError;

    fn try_from(row: RunRow) -> Result<Self> {
        Ok(Self {
            id: RunId(row.id),
            job_id: JobId(row.job_id),
            run_number: to_u32(row.run_number),
            status: row.status.parse()?,
            worker_id: row.worker_id,
            started_at: row.started_at,
            completed_at: row.completed_at,
            duration_ms: row.duration_ms,
            result: row.result,
            error: row.error,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    seq: i64,
    id: Uuid,
    job_id: Uuid,
    level: String,
    message: String,
    payload: Option<Value>,
    created_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for JobEvent {
    type Error = BusError;

    fn try_from(row: EventRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            job_id: JobId(row.job_id),
            seq: row.seq,
            level: row.level.parse()?,
            message: row.message,
            payload: row.payload,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DeadLetterRow {
    id: Uuid,
    job_id: Uuid,
    job_type: String,
    error: String,
    attempts: i32,
    resolved: bool,
    created_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl From<DeadLetterRow> for DeadLetterEntry {
    fn from(row: DeadLetterRow) -> Self {
        Self {
            id: row.id,
            job_id: JobId(row.job_id),
            job_type: row.job_type,
            error: row.error,
            attempts: to_u32(row.attempts),
            resolved: row.resolved,
            created_at: row.created_at,
            resolved_at: row.resolved_at,
        }
    }
}
