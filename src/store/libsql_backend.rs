//! libSQL backend: async `Database` trait implementation.
//!
//! A single connection is shared by every task and guarded by `lock`.
//! Every write that spans more than one statement runs in a transaction
//! taken under the lock, so a job's row and its transition records always
//! change together and reads only ever see committed state.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Transaction, params};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::checkpoint::{Checkpoint, StoredCheckpoint};
use crate::dead_letter::{DeadLetterEntry, DeadLetterFilter, ResolutionStatus};
use crate::error::{DatabaseError, ErrorKind, HandlerError, JobError};
use crate::jobs::{Job, JobFilter, JobId, JobState, StateTransition};
use crate::queue::Partition;
use crate::store::migrations;
use crate::store::traits::{Database, Ownership, Restart, StaleJob};

const DEFAULT_LIST_LIMIT: usize = 100;
const MAX_LIST_LIMIT: usize = 1000;

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    /// Held for every statement on `conn`, reads included, so no reader
    /// sees rows from another task's open transaction.
    lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            lock: Mutex::new(()),
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn begin(&self, op: &str) -> Result<Transaction, DatabaseError> {
        self.conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("begin {op}: {e}")))
    }
}

/// Commit on success, roll back on failure.
async fn finish<T>(tx: Transaction, op: &str, result: Result<T, JobError>) -> Result<T, JobError> {
    match result {
        Ok(value) => {
            tx.commit()
                .await
                .map_err(|e| DatabaseError::Query(format!("commit {op}: {e}")))?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                warn!(op, error = %rollback, "Rollback failed");
            }
            Err(e)
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format. Fixed precision keeps text comparison in SQL
/// equal to time order.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_str(s: Option<&str>) -> libsql::Value {
    opt_text_owned(s.map(str::to_string))
}

fn query_error(op: &'static str) -> impl Fn(libsql::Error) -> DatabaseError {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

fn list_limit(limit: Option<usize>) -> i64 {
    limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT) as i64
}

// ── Job rows ────────────────────────────────────────────────────────

const JOB_COLUMNS: &str = "id, task_type, partition, priority, payload, status, progress, \
    retry_count, last_error, last_error_kind, result, created_at, started_at, completed_at, \
    updated_at, eligible_at, lease_owner, lease_expires_at";

/// A job row with every column as stored, so a row whose payload no
/// longer parses can still be moved and dead-lettered.
#[derive(Debug, Clone)]
struct JobRow {
    id: String,
    task_type: String,
    partition: String,
    priority: String,
    payload: String,
    status: String,
    progress: i64,
    retry_count: i64,
    last_error: Option<String>,
    last_error_kind: Option<String>,
    result: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    updated_at: String,
    eligible_at: String,
    lease_owner: Option<String>,
    lease_expires_at: Option<String>,
}

impl JobRow {
    fn read(row: &libsql::Row) -> Result<Self, libsql::Error> {
        Ok(Self {
            id: row.get(0)?,
            task_type: row.get(1)?,
            partition: row.get(2)?,
            priority: row.get(3)?,
            payload: row.get(4)?,
            status: row.get(5)?,
            progress: row.get(6)?,
            retry_count: row.get(7)?,
            last_error: row.get::<String>(8).ok(),
            last_error_kind: row.get::<String>(9).ok(),
            result: row.get::<String>(10).ok(),
            created_at: row.get(11)?,
            started_at: row.get::<String>(12).ok(),
            completed_at: row.get::<String>(13).ok(),
            updated_at: row.get(14)?,
            eligible_at: row.get(15)?,
            lease_owner: row.get::<String>(16).ok(),
            lease_expires_at: row.get::<String>(17).ok(),
        })
    }

    fn state(&self) -> Result<JobState, DatabaseError> {
        self.status.parse().map_err(DatabaseError::Serialization)
    }

    /// Payload as JSON, or the raw text as a JSON string if it is corrupt.
    fn payload_value(&self) -> serde_json::Value {
        serde_json::from_str(&self.payload)
            .unwrap_or_else(|_| serde_json::Value::String(self.payload.clone()))
    }

    fn to_job(&self) -> Result<Job, String> {
        Ok(Job {
            id: Uuid::parse_str(&self.id).map_err(|e| format!("id: {e}"))?,
            task_type: self.task_type.parse()?,
            priority: self.priority.parse()?,
            partition: self.partition.parse()?,
            payload: serde_json::from_str(&self.payload).map_err(|e| format!("payload: {e}"))?,
            state: self.status.parse()?,
            progress: self.progress.clamp(0, 100) as u8,
            retry_count: self.retry_count.max(0) as u32,
            created_at: parse_datetime(&self.created_at),
            started_at: parse_optional_datetime(&self.started_at),
            completed_at: parse_optional_datetime(&self.completed_at),
            updated_at: parse_datetime(&self.updated_at),
            eligible_at: parse_datetime(&self.eligible_at),
            last_error: self.last_error.clone(),
            last_error_kind: self
                .last_error_kind
                .as_deref()
                .map(|s| s.parse::<ErrorKind>())
                .transpose()?,
            result: self
                .result
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .map_err(|e| format!("result: {e}"))?,
            lease_owner: self.lease_owner.clone(),
            lease_expires_at: parse_optional_datetime(&self.lease_expires_at),
        })
    }
}

async fn fetch_row(conn: &Connection, id: JobId) -> Result<Option<JobRow>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            params![id.to_string()],
        )
        .await
        .map_err(query_error("fetch_row"))?;

    match rows.next().await.map_err(query_error("fetch_row"))? {
        Some(row) => Ok(Some(JobRow::read(&row).map_err(query_error("fetch_row parse"))?)),
        None => Ok(None),
    }
}

async fn write_row(conn: &Connection, job: &JobRow) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE jobs SET status = ?1, progress = ?2, retry_count = ?3, last_error = ?4,
                last_error_kind = ?5, result = ?6, started_at = ?7, completed_at = ?8,
                updated_at = ?9, eligible_at = ?10, lease_owner = ?11, lease_expires_at = ?12
         WHERE id = ?13",
        params![
            job.status.as_str(),
            job.progress,
            job.retry_count,
            opt_text_owned(job.last_error.clone()),
            opt_text_owned(job.last_error_kind.clone()),
            opt_text_owned(job.result.clone()),
            opt_text_owned(job.started_at.clone()),
            opt_text_owned(job.completed_at.clone()),
            job.updated_at.as_str(),
            job.eligible_at.as_str(),
            opt_text_owned(job.lease_owner.clone()),
            opt_text_owned(job.lease_expires_at.clone()),
            job.id.as_str(),
        ],
    )
    .await
    .map_err(query_error("write_row"))?;
    Ok(())
}

/// Sequence and timestamp of the newest transition, `(0, None)` if none.
async fn last_transition(
    conn: &Connection,
    id: JobId,
) -> Result<(i64, Option<DateTime<Utc>>), DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT sequence, at FROM job_transitions WHERE job_id = ?1
             ORDER BY sequence DESC LIMIT 1",
            params![id.to_string()],
        )
        .await
        .map_err(query_error("last_transition"))?;

    match rows.next().await.map_err(query_error("last_transition"))? {
        Some(row) => {
            let sequence: i64 = row.get(0).map_err(query_error("last_transition parse"))?;
            let at: String = row.get(1).map_err(query_error("last_transition parse"))?;
            Ok((sequence, Some(parse_datetime(&at))))
        }
        None => Ok((0, None)),
    }
}

// ── Transitions ─────────────────────────────────────────────────────

/// Where a plan moves the job.
#[derive(Debug, Clone, Copy)]
enum Target {
    /// Shortest chain of ordinary transitions to this state.
    Route(JobState),
    /// `FailedDead -> Queued`, operator only.
    Revive,
    Cancel,
}

#[derive(Debug, Clone, Copy)]
enum RetryCount {
    Keep,
    Increment,
    Reset,
}

#[derive(Debug, Clone)]
enum LeaseChange {
    Keep,
    Clear,
    Grant {
        owner: String,
        expires_at: DateTime<Utc>,
    },
}

struct Plan<'a> {
    target: Target,
    ownership: Ownership<'a>,
    metadata: serde_json::Value,
    retry: RetryCount,
    error: Option<&'a HandlerError>,
    eligible_at: Option<DateTime<Utc>>,
    result: Option<String>,
    progress: Option<i64>,
    lease: LeaseChange,
}

impl<'a> Plan<'a> {
    fn new(target: Target, ownership: Ownership<'a>) -> Self {
        Self {
            target,
            ownership,
            metadata: json!({}),
            retry: RetryCount::Keep,
            error: None,
            eligible_at: None,
            result: None,
            progress: None,
            lease: LeaseChange::Clear,
        }
    }
}

fn check_ownership(id: JobId, job: &JobRow, ownership: Ownership<'_>) -> Result<(), JobError> {
    match ownership {
        Ownership::Any => Ok(()),
        Ownership::Owner(owner) => {
            if job.lease_owner.as_deref() == Some(owner) {
                Ok(())
            } else {
                Err(JobError::LeaseLost {
                    id,
                    owner: owner.to_string(),
                })
            }
        }
        Ownership::Stale { now } => {
            let live = job.lease_owner.is_some()
                && job
                    .lease_expires_at
                    .as_deref()
                    .map(parse_datetime)
                    .is_some_and(|expires| expires > now);
            if live {
                Err(JobError::LeaseHeld { id })
            } else {
                Ok(())
            }
        }
    }
}

/// Validate and apply a plan: append one transition per step, then write
/// the job row. Must run inside a transaction.
async fn apply(conn: &Connection, id: JobId, plan: Plan<'_>) -> Result<JobRow, JobError> {
    let mut job = fetch_row(conn, id).await?.ok_or(JobError::NotFound { id })?;
    let current = job.state()?;
    check_ownership(id, &job, plan.ownership)?;

    let steps = match plan.target {
        Target::Route(to) => current
            .route_to(to)
            .filter(|steps| !steps.is_empty())
            .ok_or(JobError::InvalidTransition {
                id,
                from: current,
                to,
            })?,
        Target::Revive if current.can_revive_to(JobState::Queued) => vec![JobState::Queued],
        Target::Revive => {
            return Err(JobError::InvalidTransition {
                id,
                from: current,
                to: JobState::Queued,
            });
        }
        Target::Cancel if current.can_transition_to(JobState::Cancelled) => {
            vec![JobState::Cancelled]
        }
        Target::Cancel => {
            return Err(JobError::InvalidTransition {
                id,
                from: current,
                to: JobState::Cancelled,
            });
        }
    };

    // Transition timestamps never go backwards, even if the clock does.
    let now = Utc::now();
    let (last_sequence, last_at) = last_transition(conn, id).await?;
    let at = last_at.map_or(now, |last| last.max(now));
    let metadata = plan.metadata.to_string();

    let mut from = current;
    for (offset, to) in steps.iter().copied().enumerate() {
        conn.execute(
            "INSERT INTO job_transitions (job_id, sequence, from_state, to_state, at, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id.to_string(),
                last_sequence + 1 + offset as i64,
                from.as_str(),
                to.as_str(),
                ts(at),
                metadata.as_str(),
            ],
        )
        .await
        .map_err(query_error("append transition"))?;
        from = to;
    }
    let target = from;

    job.status = target.as_str().to_string();
    job.updated_at = ts(at);
    if steps.contains(&JobState::Executing) && job.started_at.is_none() {
        job.started_at = Some(ts(at));
    }
    job.completed_at = target.is_terminal().then(|| ts(at));
    match plan.retry {
        RetryCount::Keep => {}
        RetryCount::Increment => job.retry_count += 1,
        RetryCount::Reset => job.retry_count = 0,
    }
    if let Some(error) = plan.error {
        job.last_error = Some(error.to_string());
        job.last_error_kind = Some(error.kind.as_str().to_string());
    }
    if let Some(eligible_at) = plan.eligible_at {
        job.eligible_at = ts(eligible_at);
    }
    if let Some(result) = plan.result {
        job.result = Some(result);
    }
    if let Some(progress) = plan.progress {
        job.progress = progress;
    }
    match plan.lease {
        LeaseChange::Keep => {}
        LeaseChange::Clear => {
            job.lease_owner = None;
            job.lease_expires_at = None;
        }
        LeaseChange::Grant { owner, expires_at } => {
            job.lease_owner = Some(owner);
            job.lease_expires_at = Some(ts(expires_at));
        }
    }

    write_row(conn, &job).await?;
    debug!(job_id = %id, from = %current, to = %target, "Job transitioned");
    Ok(job)
}

/// Park a failed attempt in `Retrying` until `delay` has passed.
async fn park_in(
    conn: &Connection,
    id: JobId,
    ownership: Ownership<'_>,
    error: &HandlerError,
    delay: Duration,
    retry: RetryCount,
) -> Result<JobRow, JobError> {
    let mut metadata = json!({
        "error_kind": error.kind,
        "error": error.message,
        "retry_in_ms": delay.as_millis() as u64,
    });
    if matches!(retry, RetryCount::Keep) {
        metadata["deferred"] = json!(true);
    }
    let plan = Plan {
        metadata,
        retry,
        error: Some(error),
        eligible_at: Some(after(Utc::now(), delay)),
        ..Plan::new(Target::Route(JobState::Retrying), ownership)
    };
    apply(conn, id, plan).await
}

/// Move `Retrying` jobs whose backoff has elapsed back to `Queued`.
async fn promote_due_retries(
    conn: &Connection,
    partition: Partition,
    now: DateTime<Utc>,
) -> Result<usize, JobError> {
    let mut ids = Vec::new();
    {
        let mut rows = conn
            .query(
                "SELECT id FROM jobs WHERE partition = ?1 AND status = 'retrying' AND eligible_at <= ?2",
                params![partition.as_str(), ts(now)],
            )
            .await
            .map_err(query_error("promote_due_retries"))?;
        while let Some(row) = rows.next().await.map_err(query_error("promote_due_retries"))? {
            let raw: String = row.get(0).map_err(query_error("promote_due_retries parse"))?;
            let id = Uuid::parse_str(&raw)
                .map_err(|e| DatabaseError::Serialization(format!("job id {raw}: {e}")))?;
            ids.push(id);
        }
    }

    for id in &ids {
        let plan = Plan {
            metadata: json!({"reason": "backoff_elapsed"}),
            ..Plan::new(Target::Route(JobState::Queued), Ownership::Any)
        };
        apply(conn, *id, plan).await?;
    }
    Ok(ids.len())
}

async fn claim_in(
    conn: &Connection,
    partition: Partition,
    owner: &str,
    lease_ttl: Duration,
) -> Result<Option<Job>, JobError> {
    let now = Utc::now();
    promote_due_retries(conn, partition, now).await?;

    loop {
        let raw_id = {
            let mut rows = conn
                .query(
                    "SELECT id FROM jobs
                     WHERE partition = ?1 AND status = 'queued' AND eligible_at <= ?2
                     ORDER BY priority_rank ASC, eligible_at ASC, created_at ASC
                     LIMIT 1",
                    params![partition.as_str(), ts(now)],
                )
                .await
                .map_err(query_error("claim_next"))?;
            match rows.next().await.map_err(query_error("claim_next"))? {
                Some(row) => row.get::<String>(0).map_err(query_error("claim_next parse"))?,
                None => return Ok(None),
            }
        };
        let id = Uuid::parse_str(&raw_id)
            .map_err(|e| DatabaseError::Serialization(format!("job id {raw_id}: {e}")))?;

        let plan = Plan {
            metadata: json!({"worker": owner}),
            lease: LeaseChange::Grant {
                owner: owner.to_string(),
                expires_at: after(now, lease_ttl),
            },
            ..Plan::new(Target::Route(JobState::Executing), Ownership::Any)
        };
        let row = apply(conn, id, plan).await?;

        match row.to_job() {
            Ok(job) => return Ok(Some(job)),
            Err(reason) => {
                warn!(job_id = %id, %reason, "Unreadable job record, dead-lettering");
                let error = HandlerError::invalid_input(format!("unreadable job record: {reason}"));
                dead_letter_in(conn, id, Ownership::Owner(owner), &error, ErrorKind::InvalidInput)
                    .await?;
            }
        }
    }
}

// ── Checkpoint rows ─────────────────────────────────────────────────

const CHECKPOINT_COLUMNS: &str =
    "job_id, sequence, stage_name, payload, schema_version, saved_at, discarded";

fn row_to_checkpoint(row: &libsql::Row) -> Result<StoredCheckpoint, DatabaseError> {
    let parse = query_error("checkpoint row parse");
    let job_id: String = row.get(0).map_err(&parse)?;
    Ok(StoredCheckpoint {
        job_id: Uuid::parse_str(&job_id)
            .map_err(|e| DatabaseError::Serialization(format!("job id {job_id}: {e}")))?,
        sequence: row.get::<i64>(1).map_err(&parse)?.max(0) as u32,
        stage_name: row.get(2).map_err(&parse)?,
        raw_payload: row.get(3).map_err(&parse)?,
        schema_version: row.get::<i64>(4).map_err(&parse)?.max(0) as u32,
        saved_at: parse_datetime(&row.get::<String>(5).map_err(&parse)?),
        discarded: row.get::<i64>(6).map_err(&parse)? != 0,
    })
}

async fn max_sequence(conn: &Connection, id: JobId) -> Result<u32, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT COALESCE(MAX(sequence), 0) FROM checkpoints WHERE job_id = ?1",
            params![id.to_string()],
        )
        .await
        .map_err(query_error("max_checkpoint_sequence"))?;
    match rows.next().await.map_err(query_error("max_checkpoint_sequence"))? {
        Some(row) => Ok(row
            .get::<i64>(0)
            .map_err(query_error("max_checkpoint_sequence parse"))?
            .max(0) as u32),
        None => Ok(0),
    }
}

async fn discard_in(conn: &Connection, id: JobId) -> Result<usize, DatabaseError> {
    let discarded = conn
        .execute(
            "UPDATE checkpoints SET discarded = 1 WHERE job_id = ?1 AND discarded = 0",
            params![id.to_string()],
        )
        .await
        .map_err(query_error("discard_checkpoints"))?;
    Ok(discarded as usize)
}

// ── Dead-letter rows ────────────────────────────────────────────────

const DEAD_LETTER_COLUMNS: &str = "job_id, task_type, original_payload, final_error, error_kind, \
    retry_count_at_failure, failed_at, resolution_status, resolved_at";

fn row_to_dead_letter(row: &libsql::Row) -> Result<DeadLetterEntry, DatabaseError> {
    let parse = query_error("dead letter row parse");
    let job_id: String = row.get(0).map_err(&parse)?;
    let raw_payload: String = row.get(2).map_err(&parse)?;
    Ok(DeadLetterEntry {
        job_id: Uuid::parse_str(&job_id)
            .map_err(|e| DatabaseError::Serialization(format!("job id {job_id}: {e}")))?,
        task_type: row
            .get::<String>(1)
            .map_err(&parse)?
            .parse()
            .map_err(DatabaseError::Serialization)?,
        original_payload: serde_json::from_str(&raw_payload)
            .unwrap_or(serde_json::Value::String(raw_payload)),
        final_error: row.get(3).map_err(&parse)?,
        error_kind: row
            .get::<String>(4)
            .map_err(&parse)?
            .parse()
            .map_err(DatabaseError::Serialization)?,
        retry_count_at_failure: row.get::<i64>(5).map_err(&parse)?.max(0) as u32,
        failed_at: parse_datetime(&row.get::<String>(6).map_err(&parse)?),
        resolution_status: row
            .get::<String>(7)
            .map_err(&parse)?
            .parse()
            .map_err(DatabaseError::Serialization)?,
        resolved_at: row.get::<String>(8).ok().map(|s| parse_datetime(&s)),
    })
}

async fn get_dead_letter_in(
    conn: &Connection,
    id: JobId,
) -> Result<Option<DeadLetterEntry>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE job_id = ?1"),
            params![id.to_string()],
        )
        .await
        .map_err(query_error("get_dead_letter"))?;
    match rows.next().await.map_err(query_error("get_dead_letter"))? {
        Some(row) => Ok(Some(row_to_dead_letter(&row)?)),
        None => Ok(None),
    }
}

async fn dead_letter_in(
    conn: &Connection,
    id: JobId,
    ownership: Ownership<'_>,
    error: &HandlerError,
    kind: ErrorKind,
) -> Result<DeadLetterEntry, JobError> {
    let plan = Plan {
        metadata: json!({"error_kind": kind, "error": error.to_string()}),
        error: Some(error),
        ..Plan::new(Target::Route(JobState::FailedDead), ownership)
    };
    let job = apply(conn, id, plan).await?;

    let entry = DeadLetterEntry {
        job_id: id,
        task_type: job.task_type.parse().map_err(DatabaseError::Serialization)?,
        original_payload: job.payload_value(),
        final_error: error.to_string(),
        error_kind: kind,
        retry_count_at_failure: job.retry_count.max(0) as u32,
        failed_at: parse_datetime(&job.updated_at),
        resolution_status: ResolutionStatus::Pending,
        resolved_at: None,
    };

    conn.execute(
        "INSERT INTO dead_letters (job_id, task_type, original_payload, final_error, error_kind,
                                   retry_count_at_failure, failed_at, resolution_status, resolved_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', NULL)
         ON CONFLICT(job_id) DO UPDATE SET
             task_type = excluded.task_type,
             original_payload = excluded.original_payload,
             final_error = excluded.final_error,
             error_kind = excluded.error_kind,
             retry_count_at_failure = excluded.retry_count_at_failure,
             failed_at = excluded.failed_at,
             resolution_status = 'pending',
             resolved_at = NULL",
        params![
            id.to_string(),
            job.task_type.as_str(),
            job.payload.as_str(),
            entry.final_error.as_str(),
            kind.as_str(),
            job.retry_count,
            job.updated_at.as_str(),
        ],
    )
    .await
    .map_err(query_error("upsert dead letter"))?;

    Ok(entry)
}

/// Fetch a dead-letter entry that is still awaiting an operator.
async fn pending_dead_letter(conn: &Connection, id: JobId) -> Result<DeadLetterEntry, JobError> {
    let entry = get_dead_letter_in(conn, id)
        .await?
        .ok_or(JobError::DeadLetterNotFound { id })?;
    if entry.resolution_status != ResolutionStatus::Pending {
        return Err(JobError::DeadLetterResolved {
            id,
            status: entry.resolution_status.to_string(),
        });
    }
    Ok(entry)
}

async fn resolve_dead_letter(
    conn: &Connection,
    id: JobId,
    status: ResolutionStatus,
    at: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE dead_letters SET resolution_status = ?1, resolved_at = ?2 WHERE job_id = ?3",
        params![status.as_str(), ts(at), id.to_string()],
    )
    .await
    .map_err(query_error("resolve dead letter"))?;
    Ok(())
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        let _guard = self.lock.lock().await;
        migrations::migrate(self.conn()).await
    }

    async fn ping(&self) -> Result<(), DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn()
            .query("SELECT 1 FROM jobs LIMIT 1", ())
            .await
            .map_err(query_error("ping"))?;
        rows.next().await.map_err(query_error("ping"))?;
        Ok(())
    }

    async fn ping_checkpoints(&self) -> Result<(), DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn()
            .query("SELECT 1 FROM checkpoints LIMIT 1", ())
            .await
            .map_err(query_error("ping_checkpoints"))?;
        rows.next().await.map_err(query_error("ping_checkpoints"))?;
        Ok(())
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &Job) -> Result<(), JobError> {
        let payload = serde_json::to_string(&job.payload)
            .map_err(|e| JobError::InvalidPayload(e.to_string()))?;

        let _guard = self.lock.lock().await;
        let tx = self.begin("insert_job").await?;
        let result = async {
            tx.execute(
                "INSERT INTO jobs (id, task_type, partition, priority, priority_rank, payload, status,
                                   progress, retry_count, created_at, updated_at, eligible_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, 0, ?7, ?7, ?8)",
                params![
                    job.id.to_string(),
                    job.task_type.as_str(),
                    job.partition.as_str(),
                    job.priority.as_str(),
                    job.priority.rank(),
                    payload,
                    ts(job.created_at),
                    ts(job.eligible_at),
                ],
            )
            .await
            .map_err(query_error("insert_job"))?;

            tx.execute(
                "INSERT INTO job_transitions (job_id, sequence, from_state, to_state, at, metadata)
                 VALUES (?1, 1, NULL, 'pending', ?2, ?3)",
                params![
                    job.id.to_string(),
                    ts(job.created_at),
                    json!({"task_type": job.task_type, "priority": job.priority}).to_string(),
                ],
            )
            .await
            .map_err(query_error("insert_job transition"))?;
            Ok(())
        }
        .await;
        finish(tx, "insert_job", result).await?;

        debug!(job_id = %job.id, task_type = %job.task_type, "Job inserted");
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, DatabaseError> {
        let _guard = self.lock.lock().await;
        match fetch_row(self.conn(), id).await? {
            Some(row) => row.to_job().map(Some).map_err(|reason| {
                DatabaseError::Serialization(format!("job {id} is unreadable: {reason}"))
            }),
            None => Ok(None),
        }
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs
                     WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR task_type = ?2)
                     ORDER BY created_at DESC LIMIT ?3"
                ),
                params![
                    opt_str(filter.state.as_ref().map(JobState::as_str)),
                    opt_str(filter.task_type.as_ref().map(|t| t.as_str())),
                    list_limit(filter.limit),
                ],
            )
            .await
            .map_err(query_error("list_jobs"))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_error("list_jobs"))? {
            let row = JobRow::read(&row).map_err(query_error("list_jobs parse"))?;
            match row.to_job() {
                Ok(job) => jobs.push(job),
                Err(reason) => warn!(job_id = %row.id, %reason, "Skipping unreadable job"),
            }
        }
        Ok(jobs)
    }

    async fn list_transitions(&self, id: JobId) -> Result<Vec<StateTransition>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn()
            .query(
                "SELECT sequence, from_state, to_state, at, metadata FROM job_transitions
                 WHERE job_id = ?1 ORDER BY sequence ASC",
                params![id.to_string()],
            )
            .await
            .map_err(query_error("list_transitions"))?;

        let parse = query_error("list_transitions parse");
        let mut transitions = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_error("list_transitions"))? {
            let from = row
                .get::<String>(1)
                .ok()
                .map(|s| s.parse::<JobState>())
                .transpose()
                .map_err(DatabaseError::Serialization)?;
            let to = row
                .get::<String>(2)
                .map_err(&parse)?
                .parse::<JobState>()
                .map_err(DatabaseError::Serialization)?;
            let metadata = serde_json::from_str(&row.get::<String>(4).map_err(&parse)?)
                .unwrap_or_else(|_| json!({}));
            transitions.push(StateTransition {
                job_id: id,
                sequence: row.get::<i64>(0).map_err(&parse)?.max(0) as u32,
                from,
                to,
                at: parse_datetime(&row.get::<String>(3).map_err(&parse)?),
                metadata,
            });
        }
        Ok(transitions)
    }

    async fn requeue(
        &self,
        id: JobId,
        ownership: Ownership<'_>,
        metadata: serde_json::Value,
    ) -> Result<JobState, JobError> {
        let _guard = self.lock.lock().await;
        let tx = self.begin("requeue").await?;
        let plan = Plan {
            metadata,
            eligible_at: Some(Utc::now()),
            ..Plan::new(Target::Route(JobState::Queued), ownership)
        };
        let result = apply(&tx, id, plan).await.map(|_| JobState::Queued);
        finish(tx, "requeue", result).await
    }

    async fn complete_job(
        &self,
        id: JobId,
        owner: &str,
        result: &serde_json::Value,
    ) -> Result<(), JobError> {
        let output = serde_json::to_string(result)
            .map_err(|e| JobError::InvalidPayload(e.to_string()))?;

        let _guard = self.lock.lock().await;
        let tx = self.begin("complete_job").await?;
        let plan = Plan {
            result: Some(output),
            progress: Some(100),
            ..Plan::new(Target::Route(JobState::Completed), Ownership::Owner(owner))
        };
        let result = apply(&tx, id, plan).await.map(|_| ());
        finish(tx, "complete_job", result).await
    }

    async fn schedule_retry(
        &self,
        id: JobId,
        ownership: Ownership<'_>,
        error: &HandlerError,
        delay: Duration,
    ) -> Result<u32, JobError> {
        let _guard = self.lock.lock().await;
        let tx = self.begin("schedule_retry").await?;
        let result = park_in(&tx, id, ownership, error, delay, RetryCount::Increment)
            .await
            .map(|job| job.retry_count.max(0) as u32);
        finish(tx, "schedule_retry", result).await
    }

    async fn defer(
        &self,
        id: JobId,
        ownership: Ownership<'_>,
        error: &HandlerError,
        delay: Duration,
    ) -> Result<(), JobError> {
        let _guard = self.lock.lock().await;
        let tx = self.begin("defer").await?;
        let result = park_in(&tx, id, ownership, error, delay, RetryCount::Keep)
            .await
            .map(|_| ());
        finish(tx, "defer", result).await
    }

    async fn restart(
        &self,
        id: JobId,
        ownership: Ownership<'_>,
        error: &HandlerError,
        restart: Restart,
    ) -> Result<usize, JobError> {
        let _guard = self.lock.lock().await;
        let tx = self.begin("restart").await?;
        let result = async {
            match restart {
                Restart::Retry => {
                    park_in(&tx, id, ownership, error, Duration::ZERO, RetryCount::Increment)
                        .await?;
                }
                Restart::DeadLetter(kind) => {
                    dead_letter_in(&tx, id, ownership, error, kind).await?;
                }
            }
            Ok(discard_in(&tx, id).await?)
        }
        .await;
        finish(tx, "restart", result).await
    }

    async fn cancel_job(&self, id: JobId, reason: &str) -> Result<bool, JobError> {
        let _guard = self.lock.lock().await;
        let tx = self.begin("cancel_job").await?;
        let result = async {
            let job = fetch_row(&tx, id).await?.ok_or(JobError::NotFound { id })?;
            if job.state()?.is_terminal() {
                return Ok(false);
            }
            let plan = Plan {
                metadata: json!({"reason": reason}),
                // The worker keeps its lease so it sees the cancellation.
                lease: LeaseChange::Keep,
                ..Plan::new(Target::Cancel, Ownership::Any)
            };
            apply(&tx, id, plan).await?;
            Ok(true)
        }
        .await;
        finish(tx, "cancel_job", result).await
    }

    // ── Queue ───────────────────────────────────────────────────────

    async fn claim_next(
        &self,
        partition: Partition,
        owner: &str,
        lease_ttl: Duration,
    ) -> Result<Option<Job>, JobError> {
        let _guard = self.lock.lock().await;
        let tx = self.begin("claim_next").await?;
        let result = claim_in(&tx, partition, owner, lease_ttl).await;
        finish(tx, "claim_next", result).await
    }

    async fn renew_lease(
        &self,
        id: JobId,
        owner: &str,
        lease_ttl: Duration,
    ) -> Result<JobState, JobError> {
        let _guard = self.lock.lock().await;
        let conn = self.conn();
        let job = fetch_row(conn, id).await?.ok_or(JobError::NotFound { id })?;
        let lost = || JobError::LeaseLost {
            id,
            owner: owner.to_string(),
        };
        if job.lease_owner.as_deref() != Some(owner) {
            return Err(lost());
        }

        match job.state()? {
            JobState::Executing => {
                conn.execute(
                    "UPDATE jobs SET lease_expires_at = ?1 WHERE id = ?2 AND lease_owner = ?3",
                    params![ts(after(Utc::now(), lease_ttl)), id.to_string(), owner],
                )
                .await
                .map_err(query_error("renew_lease"))?;
                Ok(JobState::Executing)
            }
            JobState::Cancelled => Ok(JobState::Cancelled),
            _ => Err(lost()),
        }
    }

    async fn queue_depth(&self, partition: Partition) -> Result<usize, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM jobs WHERE partition = ?1 AND status = 'queued'",
                params![partition.as_str()],
            )
            .await
            .map_err(query_error("queue_depth"))?;
        match rows.next().await.map_err(query_error("queue_depth"))? {
            Some(row) => Ok(row.get::<i64>(0).map_err(query_error("queue_depth parse"))? as usize),
            None => Ok(0),
        }
    }

    async fn list_stale_jobs(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<StaleJob>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn()
            .query(
                "SELECT j.id, j.status, j.task_type, j.retry_count, j.payload, j.eligible_at, t.at
                 FROM jobs j
                 JOIN job_transitions t ON t.job_id = j.id
                 WHERE t.sequence = (SELECT MAX(sequence) FROM job_transitions WHERE job_id = j.id)
                   AND j.status IN ('pending', 'queued', 'executing', 'failed', 'retrying')
                   AND t.at <= ?1
                   AND (j.lease_expires_at IS NULL OR j.lease_expires_at <= ?2)
                 ORDER BY t.at ASC",
                params![ts(stale_before), ts(now)],
            )
            .await
            .map_err(query_error("list_stale_jobs"))?;

        let parse = query_error("list_stale_jobs parse");
        let mut stale = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_error("list_stale_jobs"))? {
            let raw_id: String = row.get(0).map_err(&parse)?;
            let payload: String = row.get(4).map_err(&parse)?;
            stale.push(StaleJob {
                id: Uuid::parse_str(&raw_id)
                    .map_err(|e| DatabaseError::Serialization(format!("job id {raw_id}: {e}")))?,
                state: row
                    .get::<String>(1)
                    .map_err(&parse)?
                    .parse()
                    .map_err(DatabaseError::Serialization)?,
                task_type: row
                    .get::<String>(2)
                    .map_err(&parse)?
                    .parse()
                    .map_err(DatabaseError::Serialization)?,
                retry_count: row.get::<i64>(3).map_err(&parse)?.max(0) as u32,
                eligible_at: parse_datetime(&row.get::<String>(5).map_err(&parse)?),
                last_transition_at: parse_datetime(&row.get::<String>(6).map_err(&parse)?),
                unreadable: serde_json::from_str::<serde_json::Value>(&payload)
                    .err()
                    .map(|e| format!("payload: {e}")),
            });
        }
        Ok(stale)
    }

    // ── Checkpoints ─────────────────────────────────────────────────

    async fn save_checkpoint(
        &self,
        owner: &str,
        checkpoint: &Checkpoint,
        progress: u8,
    ) -> Result<(), JobError> {
        let id = checkpoint.job_id;
        let payload = serde_json::to_string(&checkpoint.payload)
            .map_err(|e| JobError::InvalidPayload(e.to_string()))?;

        let _guard = self.lock.lock().await;
        let tx = self.begin("save_checkpoint").await?;
        let result = async {
            let job = fetch_row(&tx, id).await?.ok_or(JobError::NotFound { id })?;
            if job.lease_owner.as_deref() != Some(owner) {
                return Err(JobError::LeaseLost {
                    id,
                    owner: owner.to_string(),
                });
            }
            match job.state()? {
                JobState::Executing => {}
                JobState::Cancelled => return Err(JobError::Cancelled { id }),
                _ => {
                    return Err(JobError::LeaseLost {
                        id,
                        owner: owner.to_string(),
                    });
                }
            }

            let latest = max_sequence(&tx, id).await?;
            if checkpoint.sequence <= latest {
                return Err(JobError::CheckpointSequence {
                    id,
                    latest,
                    sequence: checkpoint.sequence,
                });
            }

            tx.execute(
                "INSERT INTO checkpoints (job_id, sequence, stage_name, payload, schema_version, saved_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.to_string(),
                    i64::from(checkpoint.sequence),
                    checkpoint.stage_name.as_str(),
                    payload,
                    i64::from(checkpoint.schema_version),
                    ts(checkpoint.saved_at),
                ],
            )
            .await
            .map_err(query_error("save_checkpoint"))?;

            tx.execute(
                "UPDATE jobs SET progress = ?1, updated_at = ?2 WHERE id = ?3",
                params![i64::from(progress), ts(Utc::now()), id.to_string()],
            )
            .await
            .map_err(query_error("save_checkpoint progress"))?;
            Ok(())
        }
        .await;
        finish(tx, "save_checkpoint", result).await
    }

    async fn latest_checkpoint(&self, id: JobId) -> Result<Option<StoredCheckpoint>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints
                     WHERE job_id = ?1 AND discarded = 0
                     ORDER BY sequence DESC LIMIT 1"
                ),
                params![id.to_string()],
            )
            .await
            .map_err(query_error("latest_checkpoint"))?;
        match rows.next().await.map_err(query_error("latest_checkpoint"))? {
            Some(row) => Ok(Some(row_to_checkpoint(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_checkpoints(&self, id: JobId) -> Result<Vec<StoredCheckpoint>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE job_id = ?1 ORDER BY sequence ASC"
                ),
                params![id.to_string()],
            )
            .await
            .map_err(query_error("list_checkpoints"))?;

        let mut checkpoints = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_error("list_checkpoints"))? {
            checkpoints.push(row_to_checkpoint(&row)?);
        }
        Ok(checkpoints)
    }

    async fn max_checkpoint_sequence(&self, id: JobId) -> Result<u32, DatabaseError> {
        let _guard = self.lock.lock().await;
        max_sequence(self.conn(), id).await
    }

    // ── Dead letters ────────────────────────────────────────────────

    async fn dead_letter(
        &self,
        id: JobId,
        ownership: Ownership<'_>,
        error: &HandlerError,
        kind: ErrorKind,
    ) -> Result<DeadLetterEntry, JobError> {
        let _guard = self.lock.lock().await;
        let tx = self.begin("dead_letter").await?;
        let result = dead_letter_in(&tx, id, ownership, error, kind).await;
        finish(tx, "dead_letter", result).await
    }

    async fn get_dead_letter(&self, id: JobId) -> Result<Option<DeadLetterEntry>, DatabaseError> {
        let _guard = self.lock.lock().await;
        get_dead_letter_in(self.conn(), id).await
    }

    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterEntry>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters
                     WHERE (?1 IS NULL OR resolution_status = ?1) AND (?2 IS NULL OR task_type = ?2)
                     ORDER BY failed_at DESC LIMIT ?3"
                ),
                params![
                    opt_str(filter.resolution_status.as_ref().map(ResolutionStatus::as_str)),
                    opt_str(filter.task_type.as_ref().map(|t| t.as_str())),
                    list_limit(filter.limit),
                ],
            )
            .await
            .map_err(query_error("list_dead_letters"))?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_error("list_dead_letters"))? {
            entries.push(row_to_dead_letter(&row)?);
        }
        Ok(entries)
    }

    async fn retry_dead_letter(&self, id: JobId) -> Result<JobState, JobError> {
        let _guard = self.lock.lock().await;
        let tx = self.begin("retry_dead_letter").await?;
        let result = async {
            let entry = pending_dead_letter(&tx, id).await?;
            if entry.error_kind == ErrorKind::CheckpointCorrupt {
                discard_in(&tx, id).await?;
            }

            let now = Utc::now();
            let plan = Plan {
                metadata: json!({"reason": "operator_retry"}),
                retry: RetryCount::Reset,
                eligible_at: Some(now),
                ..Plan::new(Target::Revive, Ownership::Any)
            };
            apply(&tx, id, plan).await?;
            resolve_dead_letter(&tx, id, ResolutionStatus::Retried, now).await?;
            Ok(JobState::Queued)
        }
        .await;
        finish(tx, "retry_dead_letter", result).await
    }

    async fn dismiss_dead_letter(&self, id: JobId) -> Result<DeadLetterEntry, JobError> {
        let _guard = self.lock.lock().await;
        let tx = self.begin("dismiss_dead_letter").await?;
        let result = async {
            let mut entry = pending_dead_letter(&tx, id).await?;
            let now = Utc::now();
            resolve_dead_letter(&tx, id, ResolutionStatus::Dismissed, now).await?;
            entry.resolution_status = ResolutionStatus::Dismissed;
            entry.resolved_at = Some(now);
            Ok(entry)
        }
        .await;
        finish(tx, "dismiss_dead_letter", result).await
    }

    async fn count_dead_letters(
        &self,
        status: Option<ResolutionStatus>,
    ) -> Result<usize, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM dead_letters WHERE (?1 IS NULL OR resolution_status = ?1)",
                params![opt_str(status.as_ref().map(ResolutionStatus::as_str))],
            )
            .await
            .map_err(query_error("count_dead_letters"))?;
        match rows.next().await.map_err(query_error("count_dead_letters"))? {
            Some(row) => Ok(row
                .get::<i64>(0)
                .map_err(query_error("count_dead_letters parse"))? as usize),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CHECKPOINT_SCHEMA_VERSION;
    use crate::jobs::{Priority, TaskType, is_valid_history};

    const OWNER: &str = "worker-a";
    const TTL: Duration = Duration::from_secs(60);

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    async fn queued(db: &LibSqlBackend, task_type: TaskType, priority: Priority) -> JobId {
        let job = Job::new(task_type, json!({"topic": "otters"}), priority);
        db.insert_job(&job).await.unwrap();
        db.requeue(job.id, Ownership::Any, json!({})).await.unwrap();
        job.id
    }

    async fn claimed(db: &LibSqlBackend) -> JobId {
        queued(db, TaskType::ContentGeneration, Priority::Standard).await;
        db.claim_next(Partition::Generation, OWNER, TTL)
            .await
            .unwrap()
            .unwrap()
            .id
    }

    fn states(transitions: &[StateTransition]) -> Vec<JobState> {
        transitions.iter().map(|t| t.to).collect()
    }

    // ── Job tests ───────────────────────────────────────────────────

    #[tokio::test]
    async fn insert_and_get_by_id() {
        let db = test_db().await;
        let job = Job::new(TaskType::VideoRender, json!({"clip": 7}), Priority::Critical);
        db.insert_job(&job).await.unwrap();

        let fetched = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, job.id);
        assert_eq!(fetched.state, JobState::Pending);
        assert_eq!(fetched.partition, Partition::Media);
        assert_eq!(fetched.payload["clip"], 7);

        let history = db.list_transitions(job.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].from, None);
        assert_eq!(history[0].to, JobState::Pending);
    }

    #[tokio::test]
    async fn get_by_id_not_found() {
        let db = test_db().await;
        assert!(db.get_job(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn every_task_type_passes_schema_checks() {
        let db = test_db().await;
        for task_type in TaskType::ALL {
            let job = Job::new(task_type, json!({}), Priority::Standard);
            db.insert_job(&job).await.unwrap();
        }
        let jobs = db.list_jobs(&JobFilter::default()).await.unwrap();
        assert_eq!(jobs.len(), TaskType::ALL.len());
    }

    #[tokio::test]
    async fn list_jobs_filters_by_state_and_type() {
        let db = test_db().await;
        queued(&db, TaskType::VideoRender, Priority::Standard).await;
        queued(&db, TaskType::Maintenance, Priority::Standard).await;
        db.insert_job(&Job::new(TaskType::VideoRender, json!({}), Priority::Low))
            .await
            .unwrap();

        let filter = JobFilter {
            state: Some(JobState::Queued),
            task_type: Some(TaskType::VideoRender),
            limit: None,
        };
        let jobs = db.list_jobs(&filter).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].task_type, TaskType::VideoRender);
        assert_eq!(jobs[0].state, JobState::Queued);
    }

    // ── Queue tests ─────────────────────────────────────────────────

    #[tokio::test]
    async fn claim_prefers_priority_then_age() {
        let db = test_db().await;
        let low = queued(&db, TaskType::ContentGeneration, Priority::Low).await;
        let standard = queued(&db, TaskType::ContentGeneration, Priority::Standard).await;
        let critical = queued(&db, TaskType::ContentGeneration, Priority::Critical).await;

        let mut order = Vec::new();
        while let Some(job) = db.claim_next(Partition::Generation, OWNER, TTL).await.unwrap() {
            order.push(job.id);
        }
        assert_eq!(order, vec![critical, standard, low]);
    }

    #[tokio::test]
    async fn claim_grants_lease_and_only_once() {
        let db = test_db().await;
        let id = queued(&db, TaskType::ContentGeneration, Priority::Standard).await;

        let job = db
            .claim_next(Partition::Generation, OWNER, TTL)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.state, JobState::Executing);
        assert_eq!(job.lease_owner.as_deref(), Some(OWNER));
        assert!(job.started_at.is_some());

        assert!(
            db.claim_next(Partition::Generation, "worker-b", TTL)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn claim_ignores_other_partitions() {
        let db = test_db().await;
        queued(&db, TaskType::BatchGeneration, Priority::Critical).await;
        assert!(
            db.claim_next(Partition::Generation, OWNER, TTL)
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(db.queue_depth(Partition::Batch).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_claims_never_share_a_job() {
        let db = Arc::new(test_db().await);
        for _ in 0..10 {
            queued(&db, TaskType::ThumbnailRender, Priority::Standard).await;
        }

        let mut handles = Vec::new();
        for n in 0..4 {
            let db = Arc::clone(&db);
            handles.push(tokio::spawn(async move {
                let owner = format!("worker-{n}");
                let mut mine = Vec::new();
                while let Some(job) = db.claim_next(Partition::Media, &owner, TTL).await.unwrap() {
                    mine.push(job.id);
                }
                mine
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(total, 10);
        assert_eq!(all.len(), 10);
    }

    #[tokio::test]
    async fn renew_lease_reports_cancellation_and_loss() {
        let db = test_db().await;
        let id = claimed(&db).await;

        assert_eq!(db.renew_lease(id, OWNER, TTL).await.unwrap(), JobState::Executing);
        assert!(matches!(
            db.renew_lease(id, "intruder", TTL).await,
            Err(JobError::LeaseLost { .. })
        ));

        assert!(db.cancel_job(id, "operator").await.unwrap());
        assert_eq!(db.renew_lease(id, OWNER, TTL).await.unwrap(), JobState::Cancelled);
    }

    // ── Transition tests ────────────────────────────────────────────

    #[tokio::test]
    async fn complete_requires_the_lease() {
        let db = test_db().await;
        let id = claimed(&db).await;

        assert!(matches!(
            db.complete_job(id, "intruder", &json!({})).await,
            Err(JobError::LeaseLost { .. })
        ));

        db.complete_job(id, OWNER, &json!({"url": "s3://out"})).await.unwrap();
        let job = db.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.result, Some(json!({"url": "s3://out"})));
        assert!(job.completed_at.is_some());
        assert!(job.lease_owner.is_none());

        let history = db.list_transitions(id).await.unwrap();
        assert_eq!(
            states(&history),
            vec![
                JobState::Pending,
                JobState::Queued,
                JobState::Executing,
                JobState::Completed
            ]
        );
        assert!(is_valid_history(&history));
    }

    #[tokio::test]
    async fn retry_parks_until_backoff_elapses() {
        let db = test_db().await;
        let id = claimed(&db).await;

        let err = HandlerError::network_timeout("upstream slow");
        let count = db
            .schedule_retry(id, Ownership::Owner(OWNER), &err, Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(count, 1);

        let job = db.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Retrying);
        assert_eq!(job.last_error_kind, Some(ErrorKind::NetworkTimeout));
        assert!(
            db.claim_next(Partition::Generation, OWNER, TTL)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn due_retry_is_promoted_and_claimed() {
        let db = test_db().await;
        let id = claimed(&db).await;
        db.schedule_retry(
            id,
            Ownership::Owner(OWNER),
            &HandlerError::rate_limited("429"),
            Duration::ZERO,
        )
        .await
        .unwrap();

        let job = db
            .claim_next(Partition::Generation, "worker-b", TTL)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.retry_count, 1);

        let history = db.list_transitions(id).await.unwrap();
        assert_eq!(
            states(&history)[2..],
            [
                JobState::Executing,
                JobState::Failed,
                JobState::Retrying,
                JobState::Queued,
                JobState::Executing
            ]
        );
        assert!(is_valid_history(&history));
    }

    #[tokio::test]
    async fn defer_parks_without_charging_the_budget() {
        let db = test_db().await;
        let id = claimed(&db).await;

        let err = HandlerError::circuit_open("render-farm", Duration::from_secs(90));
        db.defer(id, Ownership::Owner(OWNER), &err, Duration::from_secs(90))
            .await
            .unwrap();

        let job = db.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Retrying);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.last_error_kind, Some(ErrorKind::CircuitOpen));
        assert!(job.eligible_at > Utc::now() + chrono::Duration::seconds(80));

        let history = db.list_transitions(id).await.unwrap();
        assert_eq!(history.last().unwrap().metadata["deferred"], true);
        assert!(is_valid_history(&history));
    }

    #[tokio::test]
    async fn refused_restart_keeps_checkpoints() {
        let db = test_db().await;
        let id = claimed(&db).await;
        db.save_checkpoint(OWNER, &checkpoint(id, 1, "script"), 25)
            .await
            .unwrap();

        // The owner renewed its lease after the scan listed the job.
        let err = HandlerError::new(ErrorKind::CheckpointCorrupt, "bad schema");
        let stale = Ownership::Stale { now: Utc::now() };
        assert!(matches!(
            db.restart(id, stale, &err, Restart::DeadLetter(ErrorKind::CheckpointCorrupt))
                .await,
            Err(JobError::LeaseHeld { .. })
        ));

        assert_eq!(db.latest_checkpoint(id).await.unwrap().unwrap().sequence, 1);
        assert_eq!(
            db.get_job(id).await.unwrap().unwrap().state,
            JobState::Executing
        );
        assert!(db.get_dead_letter(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reads_wait_for_open_transactions() {
        let db = Arc::new(test_db().await);
        let id = queued(&db, TaskType::Maintenance, Priority::Standard).await;

        let guard = db.lock.lock().await;
        let tx = db.begin("test").await.unwrap();
        apply(&tx, id, Plan::new(Target::Cancel, Ownership::Any))
            .await
            .unwrap();

        let reader = {
            let db = Arc::clone(&db);
            tokio::spawn(async move {
                let state = db.get_job(id).await.unwrap().unwrap().state;
                let history = db.list_transitions(id).await.unwrap();
                (state, history.len())
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reader.is_finished());

        tx.rollback().await.unwrap();
        drop(guard);

        let (state, transitions) = reader.await.unwrap();
        assert_eq!(state, JobState::Queued);
        assert_eq!(transitions, 2);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_on_terminal_jobs() {
        let db = test_db().await;
        let id = queued(&db, TaskType::Maintenance, Priority::Standard).await;

        assert!(db.cancel_job(id, "no longer needed").await.unwrap());
        assert!(!db.cancel_job(id, "again").await.unwrap());
        assert_eq!(
            db.get_job(id).await.unwrap().unwrap().state,
            JobState::Cancelled
        );
        assert!(matches!(
            db.cancel_job(Uuid::new_v4(), "x").await,
            Err(JobError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn worker_cannot_complete_a_cancelled_job() {
        let db = test_db().await;
        let id = claimed(&db).await;
        db.cancel_job(id, "operator").await.unwrap();

        assert!(matches!(
            db.complete_job(id, OWNER, &json!({})).await,
            Err(JobError::InvalidTransition {
                from: JobState::Cancelled,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn stale_ownership_respects_live_leases() {
        let db = test_db().await;
        let id = claimed(&db).await;

        let result = db
            .requeue(id, Ownership::Stale { now: Utc::now() }, json!({}))
            .await;
        assert!(matches!(result, Err(JobError::LeaseHeld { .. })));

        let later = Utc::now() + chrono::Duration::seconds(120);
        db.requeue(id, Ownership::Stale { now: later }, json!({"recovery": "resume"}))
            .await
            .unwrap();
        let job = db.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.retry_count, 0);
        assert!(job.lease_owner.is_none());
    }

    #[tokio::test]
    async fn stale_scan_skips_live_leases() {
        let db = test_db().await;
        let live = claimed(&db).await;
        let expired_job = queued(&db, TaskType::ContentGeneration, Priority::Standard).await;
        db.claim_next(Partition::Generation, "dead-worker", Duration::ZERO)
            .await
            .unwrap();

        let now = Utc::now() + chrono::Duration::milliseconds(5);
        let stale = db.list_stale_jobs(now, now).await.unwrap();
        let ids: Vec<_> = stale.iter().map(|s| s.id).collect();
        assert!(ids.contains(&expired_job));
        assert!(!ids.contains(&live));
        assert!(stale.iter().all(|s| s.unreadable.is_none()));
    }

    // ── Checkpoint tests ────────────────────────────────────────────

    fn checkpoint(id: JobId, sequence: u32, stage: &str) -> Checkpoint {
        Checkpoint {
            job_id: id,
            stage_name: stage.to_string(),
            sequence,
            payload: json!({"stage": stage}),
            saved_at: Utc::now(),
            schema_version: CHECKPOINT_SCHEMA_VERSION,
        }
    }

    #[tokio::test]
    async fn checkpoints_are_ordered_and_owned() {
        let db = test_db().await;
        let id = claimed(&db).await;

        db.save_checkpoint(OWNER, &checkpoint(id, 1, "script"), 25)
            .await
            .unwrap();
        db.save_checkpoint(OWNER, &checkpoint(id, 2, "voiceover"), 50)
            .await
            .unwrap();

        assert!(matches!(
            db.save_checkpoint(OWNER, &checkpoint(id, 2, "again"), 50).await,
            Err(JobError::CheckpointSequence { latest: 2, .. })
        ));
        assert!(matches!(
            db.save_checkpoint("intruder", &checkpoint(id, 3, "x"), 75).await,
            Err(JobError::LeaseLost { .. })
        ));

        let latest = db.latest_checkpoint(id).await.unwrap().unwrap();
        assert_eq!(latest.stage_name, "voiceover");
        assert_eq!(db.get_job(id).await.unwrap().unwrap().progress, 50);
        assert_eq!(db.max_checkpoint_sequence(id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn discarded_checkpoints_keep_their_sequence() {
        let db = test_db().await;
        let id = claimed(&db).await;
        db.save_checkpoint(OWNER, &checkpoint(id, 1, "script"), 25)
            .await
            .unwrap();

        // Lease already expired, as recovery would find it.
        db.renew_lease(id, OWNER, Duration::ZERO).await.unwrap();
        let err = HandlerError::new(ErrorKind::CheckpointCorrupt, "bad schema");
        let stale = Ownership::Stale { now: Utc::now() };
        assert_eq!(db.restart(id, stale, &err, Restart::Retry).await.unwrap(), 1);
        assert!(db.latest_checkpoint(id).await.unwrap().is_none());
        assert_eq!(db.get_job(id).await.unwrap().unwrap().retry_count, 1);
        assert_eq!(db.max_checkpoint_sequence(id).await.unwrap(), 1);
        assert!(db.list_checkpoints(id).await.unwrap()[0].discarded);
    }

    #[tokio::test]
    async fn checkpoint_on_cancelled_job_is_refused() {
        let db = test_db().await;
        let id = claimed(&db).await;
        db.cancel_job(id, "operator").await.unwrap();
        assert!(matches!(
            db.save_checkpoint(OWNER, &checkpoint(id, 1, "script"), 10).await,
            Err(JobError::Cancelled { .. })
        ));
    }

    // ── Dead-letter tests ───────────────────────────────────────────

    #[tokio::test]
    async fn dead_letter_records_entry_and_state() {
        let db = test_db().await;
        let id = claimed(&db).await;

        let entry = db
            .dead_letter(
                id,
                Ownership::Owner(OWNER),
                &HandlerError::auth_failure("bad key"),
                ErrorKind::AuthFailure,
            )
            .await
            .unwrap();
        assert_eq!(entry.error_kind, ErrorKind::AuthFailure);
        assert_eq!(entry.original_payload, json!({"topic": "otters"}));
        assert_eq!(entry.resolution_status, ResolutionStatus::Pending);

        let job = db.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::FailedDead);
        assert!(is_valid_history(&db.list_transitions(id).await.unwrap()));
        assert_eq!(db.count_dead_letters(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dead_letter_from_queued_walks_valid_edges() {
        let db = test_db().await;
        let id = queued(&db, TaskType::Maintenance, Priority::Standard).await;

        db.dead_letter(
            id,
            Ownership::Any,
            &HandlerError::invalid_input("bad"),
            ErrorKind::InvalidInput,
        )
        .await
        .unwrap();
        let history = db.list_transitions(id).await.unwrap();
        assert_eq!(
            states(&history)[1..],
            [
                JobState::Queued,
                JobState::Executing,
                JobState::Failed,
                JobState::FailedDead
            ]
        );
        assert!(is_valid_history(&history));
    }

    #[tokio::test]
    async fn retry_dead_letter_revives_with_fresh_budget() {
        let db = test_db().await;
        let id = claimed(&db).await;
        db.schedule_retry(
            id,
            Ownership::Owner(OWNER),
            &HandlerError::network_timeout("t"),
            Duration::ZERO,
        )
        .await
        .unwrap();
        db.claim_next(Partition::Generation, OWNER, TTL)
            .await
            .unwrap()
            .unwrap();
        db.dead_letter(
            id,
            Ownership::Owner(OWNER),
            &HandlerError::network_timeout("t"),
            ErrorKind::RetryBudgetExhausted,
        )
        .await
        .unwrap();
        assert_eq!(
            db.get_dead_letter(id).await.unwrap().unwrap().retry_count_at_failure,
            1
        );

        assert_eq!(db.retry_dead_letter(id).await.unwrap(), JobState::Queued);
        let job = db.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.retry_count, 0);
        assert!(job.completed_at.is_none());

        let entry = db.get_dead_letter(id).await.unwrap().unwrap();
        assert_eq!(entry.resolution_status, ResolutionStatus::Retried);
        assert!(entry.resolved_at.is_some());
        assert!(is_valid_history(&db.list_transitions(id).await.unwrap()));

        assert!(matches!(
            db.retry_dead_letter(id).await,
            Err(JobError::DeadLetterResolved { .. })
        ));
    }

    #[tokio::test]
    async fn dismiss_keeps_job_dead() {
        let db = test_db().await;
        let id = claimed(&db).await;
        db.dead_letter(
            id,
            Ownership::Owner(OWNER),
            &HandlerError::invalid_input("no topic"),
            ErrorKind::InvalidInput,
        )
        .await
        .unwrap();

        let entry = db.dismiss_dead_letter(id).await.unwrap();
        assert_eq!(entry.resolution_status, ResolutionStatus::Dismissed);
        assert_eq!(
            db.get_job(id).await.unwrap().unwrap().state,
            JobState::FailedDead
        );
        assert_eq!(
            db.count_dead_letters(Some(ResolutionStatus::Pending)).await.unwrap(),
            0
        );
        assert!(matches!(
            db.dismiss_dead_letter(Uuid::new_v4()).await,
            Err(JobError::DeadLetterNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn list_dead_letters_filters() {
        let db = test_db().await;
        for _ in 0..3 {
            let id = queued(&db, TaskType::Maintenance, Priority::Standard).await;
            db.dead_letter(
                id,
                Ownership::Any,
                &HandlerError::invalid_input("x"),
                ErrorKind::InvalidInput,
            )
            .await
            .unwrap();
        }
        let dismissed = db
            .list_dead_letters(&DeadLetterFilter::default())
            .await
            .unwrap()[0]
            .job_id;
        db.dismiss_dead_letter(dismissed).await.unwrap();

        let pending = db
            .list_dead_letters(&DeadLetterFilter {
                resolution_status: Some(ResolutionStatus::Pending),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);

        let limited = db
            .list_dead_letters(&DeadLetterFilter {
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);

        let other_type = db
            .list_dead_letters(&DeadLetterFilter {
                task_type: Some(TaskType::VideoRender),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(other_type.is_empty());
    }

    #[tokio::test]
    async fn unreadable_payload_is_dead_lettered_on_claim() {
        let db = test_db().await;
        let bad = queued(&db, TaskType::ContentGeneration, Priority::Critical).await;
        let good = queued(&db, TaskType::ContentGeneration, Priority::Standard).await;
        db.conn()
            .execute(
                "UPDATE jobs SET payload = '{\"topic\": ' WHERE id = ?1",
                params![bad.to_string()],
            )
            .await
            .unwrap();

        let job = db
            .claim_next(Partition::Generation, OWNER, TTL)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.id, good);

        let entry = db.get_dead_letter(bad).await.unwrap().unwrap();
        assert_eq!(entry.error_kind, ErrorKind::InvalidInput);
        assert_eq!(entry.original_payload, json!("{\"topic\": "));
    }
}
