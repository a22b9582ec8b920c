//! Schema migrations for the libSQL store, applied in version order.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Append only; never edit a released step.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "job_state_store",
        sql: r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                task_type TEXT NOT NULL CHECK (task_type IN (
                    'content_generation', 'video_render', 'caption_generation',
                    'thumbnail_render', 'batch_generation', 'maintenance'
                )),
                partition TEXT NOT NULL CHECK (partition IN ('generation', 'media', 'default', 'batch')),
                priority TEXT NOT NULL,
                priority_rank INTEGER NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status IN (
                    'pending', 'queued', 'executing', 'completed',
                    'failed', 'retrying', 'failed_dead', 'cancelled'
                )),
                progress INTEGER NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                last_error_kind TEXT,
                result TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                updated_at TEXT NOT NULL,
                eligible_at TEXT NOT NULL,
                lease_owner TEXT,
                lease_expires_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_dispatch
                ON jobs(partition, status, priority_rank, eligible_at, created_at);
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);

            CREATE TABLE IF NOT EXISTS job_transitions (
                job_id TEXT NOT NULL REFERENCES jobs(id),
                sequence INTEGER NOT NULL,
                from_state TEXT,
                to_state TEXT NOT NULL,
                at TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                PRIMARY KEY (job_id, sequence)
            );

            CREATE TRIGGER IF NOT EXISTS job_transitions_no_update
                BEFORE UPDATE ON job_transitions
            BEGIN
                SELECT RAISE(ABORT, 'job_transitions is append-only');
            END;
            CREATE TRIGGER IF NOT EXISTS job_transitions_no_delete
                BEFORE DELETE ON job_transitions
            BEGIN
                SELECT RAISE(ABORT, 'job_transitions is append-only');
            END;
        "#,
    },
    Migration {
        version: 2,
        name: "checkpoints",
        sql: r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                job_id TEXT NOT NULL REFERENCES jobs(id),
                sequence INTEGER NOT NULL,
                stage_name TEXT NOT NULL,
                payload TEXT NOT NULL,
                schema_version INTEGER NOT NULL,
                saved_at TEXT NOT NULL,
                discarded INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (job_id, sequence)
            );
        "#,
    },
    Migration {
        version: 3,
        name: "dead_letters",
        sql: r#"
            CREATE TABLE IF NOT EXISTS dead_letters (
                job_id TEXT PRIMARY KEY REFERENCES jobs(id),
                task_type TEXT NOT NULL,
                original_payload TEXT NOT NULL,
                final_error TEXT NOT NULL,
                error_kind TEXT NOT NULL,
                retry_count_at_failure INTEGER NOT NULL,
                failed_at TEXT NOT NULL,
                resolution_status TEXT NOT NULL DEFAULT 'pending',
                resolved_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_dead_letters_status
                ON dead_letters(resolution_status, failed_at);
        "#,
    },
];

/// Bring the schema up to the newest version.
///
/// Each step runs in its own transaction together with its row in
/// `schema_versions`, so a crash mid-step leaves the previous version intact.
pub async fn migrate(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_versions (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("schema_versions: {e}")))?;

    let applied = applied_version(conn).await?;
    for step in MIGRATIONS.iter().filter(|m| m.version > applied) {
        tracing::info!(version = step.version, name = step.name, "Applying schema migration");
        apply_step(conn, step).await.map_err(|e| {
            DatabaseError::Migration(format!("V{} {}: {e}", step.version, step.name))
        })?;
    }

    let version = applied_version(conn).await?;
    tracing::debug!(version, "Schema up to date");
    Ok(())
}

async fn apply_step(conn: &Connection, step: &Migration) -> Result<(), libsql::Error> {
    let tx = conn.transaction().await?;
    tx.execute_batch(step.sql).await?;
    tx.execute(
        "INSERT INTO schema_versions (version, name) VALUES (?1, ?2)",
        libsql::params![step.version, step.name],
    )
    .await?;
    tx.commit().await
}

/// Newest applied version; 0 on a fresh database.
async fn applied_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Migration(format!("schema version: {e}"));
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_versions", ())
        .await
        .map_err(read)?;
    match rows.next().await.map_err(read)? {
        Some(row) => row.get::<i64>(0).map_err(read),
        None => Ok(0),
    }
}
