//! Data Lineage Store
//!
//! One row per observed data movement, derived from the `Info` events repo
//! operations emit. Lineage answers both directions: what data a job
//! touched, and which jobs touched a piece of data.

use chrono::{DateTime, Utc};
use gantry_core::domain::status::{JobStatus, StatusEvent};
use sqlx::SqlitePool;
use uuid::Uuid;

/// One recorded data movement.
#[derive(Debug, Clone)]
pub struct DataRecord {
    pub job_id: Uuid,
    pub op: String,
    pub local_ref: String,
    pub site_ref: String,
    pub site_name: String,
    pub recorded_at: DateTime<Utc>,
}

impl DataRecord {
    /// Extract a lineage record from a status event, if it is an `Info`
    /// event carrying the repo signature.
    pub fn from_event(event: &StatusEvent) -> Option<Self> {
        if event.status != JobStatus::Info {
            return None;
        }
        let info = event.info.as_ref()?;
        Some(Self {
            job_id: event.job_id(),
            op: info.get("op")?.clone(),
            local_ref: info.get("local")?.clone(),
            site_ref: info.get("remote")?.clone(),
            site_name: event.context.site_name.clone(),
            recorded_at: event.emit_time,
        })
    }
}

/// Append a lineage record
pub async fn record(pool: &SqlitePool, data: &DataRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO data_lineage (job_id, op, local_ref, site_ref, site_name, recorded_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(data.job_id.to_string())
    .bind(&data.op)
    .bind(&data.local_ref)
    .bind(&data.site_ref)
    .bind(&data.site_name)
    .bind(data.recorded_at.timestamp_millis())
    .execute(pool)
    .await?;

    Ok(())
}

/// Movements of one site reference, oldest first
pub async fn find_by_site_ref(
    pool: &SqlitePool,
    site_ref: &str,
) -> Result<Vec<DataRecord>, sqlx::Error> {
    let rows = sqlx::query_as::<_, DataRow>(
        r#"
        SELECT job_id, op, local_ref, site_ref, site_name, recorded_at
        FROM data_lineage
        WHERE site_ref = $1
        ORDER BY id ASC
        "#,
    )
    .bind(site_ref)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(DataRecord::from).collect())
}

/// Movements performed under one job, oldest first
pub async fn find_by_job(pool: &SqlitePool, job_id: Uuid) -> Result<Vec<DataRecord>, sqlx::Error> {
    let rows = sqlx::query_as::<_, DataRow>(
        r#"
        SELECT job_id, op, local_ref, site_ref, site_name, recorded_at
        FROM data_lineage
        WHERE job_id = $1
        ORDER BY id ASC
        "#,
    )
    .bind(job_id.to_string())
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(DataRecord::from).collect())
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct DataRow {
    job_id: String,
    op: String,
    local_ref: String,
    site_ref: String,
    site_name: String,
    recorded_at: i64,
}

impl From<DataRow> for DataRecord {
    fn from(row: DataRow) -> Self {
        DataRecord {
            job_id: Uuid::parse_str(&row.job_id).unwrap_or_default(),
            op: row.op,
            local_ref: row.local_ref,
            site_ref: row.site_ref,
            site_name: row.site_name,
            recorded_at: chrono::DateTime::from_timestamp_millis(row.recorded_at)
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use gantry_core::domain::job::JobContext;

    #[tokio::test]
    async fn repo_info_events_become_lineage_rows() {
        let pool = memory_pool().await;
        let ctx = JobContext::new("local");
        let event = StatusEvent::info(
            ctx.clone(),
            StatusEvent::repo_signature("put", "/tmp/in.dat", "archive/in.dat"),
        );

        let data = DataRecord::from_event(&event).unwrap();
        record(&pool, &data).await.unwrap();

        let by_ref = find_by_site_ref(&pool, "archive/in.dat").await.unwrap();
        assert_eq!(by_ref.len(), 1);
        assert_eq!(by_ref[0].job_id, ctx.job_id);
        assert_eq!(by_ref[0].op, "put");

        let by_job = find_by_job(&pool, ctx.job_id).await.unwrap();
        assert_eq!(by_job.len(), 1);
        assert_eq!(by_job[0].local_ref, "/tmp/in.dat");
    }

    #[tokio::test]
    async fn non_repo_events_carry_no_lineage() {
        let ctx = JobContext::new("local");
        assert!(DataRecord::from_event(&StatusEvent::new(ctx.clone(), JobStatus::Complete)).is_none());

        // an info event without the full signature is not a movement
        let partial = StatusEvent::info(
            ctx,
            [("op".to_string(), "put".to_string())].into(),
        );
        assert!(DataRecord::from_event(&partial).is_none());
    }

    #[tokio::test]
    async fn lineage_accumulates_per_reference() {
        let pool = memory_pool().await;
        let producer = JobContext::new("local");
        let consumer = JobContext::new("local");

        for (ctx, op, local) in [
            (&producer, "put", "/tmp/out.dat"),
            (&consumer, "get", "/scratch/out.dat"),
        ] {
            let event = StatusEvent::info(
                (*ctx).clone(),
                StatusEvent::repo_signature(op, local, "archive/out.dat"),
            );
            record(&pool, &DataRecord::from_event(&event).unwrap())
                .await
                .unwrap();
        }

        let history = find_by_site_ref(&pool, "archive/out.dat").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].op, "put");
        assert_eq!(history[0].job_id, producer.job_id);
        assert_eq!(history[1].op, "get");
        assert_eq!(history[1].job_id, consumer.job_id);
    }
}
