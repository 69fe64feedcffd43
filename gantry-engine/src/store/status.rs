//! Status Store
//!
//! The append-only status history. Rows are never updated or deleted;
//! corrections are further events. The autoincrement id is the arrival
//! order and breaks ties between events sharing an emit time.

use gantry_core::domain::status::StatusEvent;
use sqlx::SqlitePool;
use uuid::Uuid;

/// Append one observed event
pub async fn append(pool: &SqlitePool, event: &StatusEvent) -> Result<(), sqlx::Error> {
    let event_json =
        serde_json::to_string(event).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

    sqlx::query(
        r#"
        INSERT INTO statuses (job_id, status, emit_time, event)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(event.job_id().to_string())
    .bind(event.status.to_string())
    .bind(event.emit_millis())
    .bind(event_json)
    .execute(pool)
    .await?;

    Ok(())
}

/// Most recent event for a job
pub async fn latest(pool: &SqlitePool, job_id: Uuid) -> Result<Option<StatusEvent>, sqlx::Error> {
    let row = sqlx::query_as::<_, EventRow>(
        r#"
        SELECT event
        FROM statuses
        WHERE job_id = $1
        ORDER BY id DESC
        LIMIT 1
        "#,
    )
    .bind(job_id.to_string())
    .fetch_optional(pool)
    .await?;

    row.map(|r| r.decode()).transpose()
}

/// Full history for a job, oldest first
pub async fn history(pool: &SqlitePool, job_id: Uuid) -> Result<Vec<StatusEvent>, sqlx::Error> {
    let rows = sqlx::query_as::<_, EventRow>(
        r#"
        SELECT event
        FROM statuses
        WHERE job_id = $1
        ORDER BY id ASC
        "#,
    )
    .bind(job_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(|r| r.decode()).collect()
}

/// The latest event of every job with any history.
///
/// Startup reconciliation uses this to find jobs that were still in flight
/// when the engine last stopped.
pub async fn latest_per_job(pool: &SqlitePool) -> Result<Vec<StatusEvent>, sqlx::Error> {
    let rows = sqlx::query_as::<_, EventRow>(
        r#"
        SELECT event
        FROM statuses s
        WHERE id = (SELECT MAX(id) FROM statuses WHERE job_id = s.job_id)
        ORDER BY id ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(|r| r.decode()).collect()
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct EventRow {
    event: String,
}

impl EventRow {
    fn decode(self) -> Result<StatusEvent, sqlx::Error> {
        serde_json::from_str(&self.event).map_err(|e| sqlx::Error::Decode(Box::new(e)))
    }
}
