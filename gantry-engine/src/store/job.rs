//! Job Store
//!
//! One row per submitted job, written before the submission is handed to
//! the destination site so a chained child row can never precede its
//! parent's. The native id the site assigns is folded in afterwards; every
//! other field is fixed at creation.

use gantry_core::domain::job::{JobContext, JobDefn};
use sqlx::SqlitePool;
use uuid::Uuid;

/// A job as recorded in the thread.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub context: JobContext,
    pub defn: JobDefn,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Record a submitted job
pub async fn record(
    pool: &SqlitePool,
    context: &JobContext,
    defn: &JobDefn,
) -> Result<(), sqlx::Error> {
    let now = chrono::Utc::now();
    let context_json = to_json(context)?;
    let defn_json = to_json(defn)?;

    sqlx::query(
        r#"
        INSERT INTO jobs (job_id, parent_job_id, origin_job_id, workflow_id,
                          site_name, native_id, context, defn, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(context.job_id.to_string())
    .bind(context.parent_job_id.map(|id| id.to_string()))
    .bind(context.origin_job_id.to_string())
    .bind(context.workflow_id.to_string())
    .bind(&context.site_name)
    .bind(context.native_id())
    .bind(context_json)
    .bind(defn_json)
    .bind(now.timestamp_millis())
    .execute(pool)
    .await?;

    Ok(())
}

/// Fold the site-assigned native id into an existing row
pub async fn update_context(pool: &SqlitePool, context: &JobContext) -> Result<(), sqlx::Error> {
    let context_json = to_json(context)?;

    sqlx::query("UPDATE jobs SET context = $1, native_id = $2 WHERE job_id = $3")
        .bind(context_json)
        .bind(context.native_id())
        .bind(context.job_id.to_string())
        .execute(pool)
        .await?;

    Ok(())
}

/// Find a job by ID
pub async fn find_by_id(pool: &SqlitePool, job_id: Uuid) -> Result<Option<JobRecord>, sqlx::Error> {
    let row = sqlx::query_as::<_, JobRow>(
        r#"
        SELECT context, defn, created_at
        FROM jobs
        WHERE job_id = $1
        "#,
    )
    .bind(job_id.to_string())
    .fetch_optional(pool)
    .await?;

    row.map(JobRecord::try_from).transpose()
}

/// All jobs in a workflow, parents before children.
///
/// Insertion order is causal order: a parent's row exists before its
/// submission starts, and only that submission's events can create a child.
pub async fn find_by_workflow(
    pool: &SqlitePool,
    workflow_id: Uuid,
) -> Result<Vec<JobRecord>, sqlx::Error> {
    let rows = sqlx::query_as::<_, JobRow>(
        r#"
        SELECT context, defn, created_at
        FROM jobs
        WHERE workflow_id = $1
        ORDER BY created_at ASC, rowid ASC
        "#,
    )
    .bind(workflow_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(JobRecord::try_from).collect()
}

/// Jobs recorded within the time window, oldest first.
pub async fn find_by_created_range(
    pool: &SqlitePool,
    start: chrono::DateTime<chrono::Utc>,
    end: chrono::DateTime<chrono::Utc>,
) -> Result<Vec<JobRecord>, sqlx::Error> {
    let rows = sqlx::query_as::<_, JobRow>(
        r#"
        SELECT context, defn, created_at
        FROM jobs
        WHERE created_at >= $1 AND created_at <= $2
        ORDER BY created_at ASC, rowid ASC
        "#,
    )
    .bind(start.timestamp_millis())
    .bind(end.timestamp_millis())
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(JobRecord::try_from).collect()
}

/// The parent chain of a job, origin first, the job itself last.
pub async fn causal_chain(pool: &SqlitePool, job_id: Uuid) -> Result<Vec<JobRecord>, sqlx::Error> {
    let mut chain = Vec::new();
    let mut cursor = Some(job_id);

    while let Some(id) = cursor {
        let Some(record) = find_by_id(pool, id).await? else {
            break;
        };
        cursor = record.context.parent_job_id;
        chain.push(record);
    }

    chain.reverse();
    Ok(chain)
}

// =============================================================================
// Helper Functions
// =============================================================================

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, sqlx::Error> {
    serde_json::to_string(value).map_err(|e| sqlx::Error::Encode(Box::new(e)))
}

fn from_json<T: serde::de::DeserializeOwned>(json: &str) -> Result<T, sqlx::Error> {
    serde_json::from_str(json).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct JobRow {
    context: String,
    defn: String,
    created_at: i64,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = sqlx::Error;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(JobRecord {
            context: from_json(&row.context)?,
            defn: from_json(&row.defn)?,
            created_at: chrono::DateTime::from_timestamp_millis(row.created_at)
                .unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;

    #[tokio::test]
    async fn record_round_trips_context_and_defn() {
        let pool = memory_pool().await;

        let mut context = JobContext::new("cluster");
        context.set_native_id("4471");
        let defn = JobDefn::new("run.sh").with_args(["--fast"]).with_name("calibrate");
        record(&pool, &context, &defn).await.unwrap();

        let found = find_by_id(&pool, context.job_id).await.unwrap().unwrap();
        assert_eq!(found.context.job_id, context.job_id);
        assert_eq!(found.context.native_id(), Some("4471"));
        assert_eq!(found.defn.entry_point, "run.sh");
        assert_eq!(found.defn.name.as_deref(), Some("calibrate"));
    }

    #[tokio::test]
    async fn native_id_is_folded_in_after_submission() {
        let pool = memory_pool().await;

        let mut context = JobContext::new("cluster");
        record(&pool, &context, &JobDefn::new("run.sh")).await.unwrap();
        assert!(
            find_by_id(&pool, context.job_id)
                .await
                .unwrap()
                .unwrap()
                .context
                .native_id()
                .is_none()
        );

        context.set_native_id("8122");
        update_context(&pool, &context).await.unwrap();

        let found = find_by_id(&pool, context.job_id).await.unwrap().unwrap();
        assert_eq!(found.context.native_id(), Some("8122"));
    }

    #[tokio::test]
    async fn workflow_listing_preserves_submission_order() {
        let pool = memory_pool().await;

        let root = JobContext::new("local");
        let child = JobContext::child_of(&root, "local");
        let grandchild = JobContext::child_of(&child, "cluster");
        for ctx in [&root, &child, &grandchild] {
            record(&pool, ctx, &JobDefn::new("step")).await.unwrap();
        }

        let jobs = find_by_workflow(&pool, root.workflow_id).await.unwrap();
        let ids: Vec<_> = jobs.iter().map(|j| j.context.job_id).collect();
        assert_eq!(ids, vec![root.job_id, child.job_id, grandchild.job_id]);
    }

    #[tokio::test]
    async fn causal_chain_walks_back_to_origin() {
        let pool = memory_pool().await;

        let root = JobContext::new("local");
        let child = JobContext::child_of(&root, "local");
        let grandchild = JobContext::child_of(&child, "cluster");
        for ctx in [&root, &child, &grandchild] {
            record(&pool, ctx, &JobDefn::new("step")).await.unwrap();
        }

        let chain = causal_chain(&pool, grandchild.job_id).await.unwrap();
        let ids: Vec<_> = chain.iter().map(|j| j.context.job_id).collect();
        assert_eq!(ids, vec![root.job_id, child.job_id, grandchild.job_id]);

        // unrelated jobs in the same workflow are not in the chain
        let sibling = JobContext::child_of(&root, "local");
        record(&pool, &sibling, &JobDefn::new("step")).await.unwrap();
        let chain = causal_chain(&pool, sibling.job_id).await.unwrap();
        assert_eq!(chain.len(), 2);
    }

    #[tokio::test]
    async fn time_range_bounds_are_inclusive() {
        let pool = memory_pool().await;

        let before = chrono::Utc::now() - chrono::Duration::seconds(5);
        let ctx = JobContext::new("local");
        record(&pool, &ctx, &JobDefn::new("step")).await.unwrap();
        let after = chrono::Utc::now() + chrono::Duration::seconds(5);

        let hit = find_by_created_range(&pool, before, after).await.unwrap();
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0].context.job_id, ctx.job_id);

        let early = before - chrono::Duration::seconds(60);
        let miss = find_by_created_range(&pool, early, before).await.unwrap();
        assert!(miss.is_empty());
    }

    #[tokio::test]
    async fn missing_job_is_none() {
        let pool = memory_pool().await;
        assert!(find_by_id(&pool, Uuid::new_v4()).await.unwrap().is_none());
    }
}
