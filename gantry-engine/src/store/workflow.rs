//! Workflow Store

use gantry_core::domain::workflow::Workflow;
use sqlx::SqlitePool;
use uuid::Uuid;

/// Persist a workflow record
pub async fn put(pool: &SqlitePool, workflow: &Workflow) -> Result<(), sqlx::Error> {
    let props =
        serde_json::to_string(&workflow.props).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

    sqlx::query(
        r#"
        INSERT INTO workflows (id, name, description, props, created_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(workflow.id.to_string())
    .bind(&workflow.name)
    .bind(&workflow.description)
    .bind(props)
    .bind(workflow.created_at.timestamp_millis())
    .execute(pool)
    .await?;

    Ok(())
}

/// Find a workflow by ID
pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Workflow>, sqlx::Error> {
    let row = sqlx::query_as::<_, WorkflowRow>(
        r#"
        SELECT id, name, description, props, created_at
        FROM workflows
        WHERE id = $1
        "#,
    )
    .bind(id.to_string())
    .fetch_optional(pool)
    .await?;

    Ok(row.map(Workflow::from))
}

/// List all workflow records, oldest first
pub async fn list_all(pool: &SqlitePool) -> Result<Vec<Workflow>, sqlx::Error> {
    let rows = sqlx::query_as::<_, WorkflowRow>(
        r#"
        SELECT id, name, description, props, created_at
        FROM workflows
        ORDER BY created_at ASC, rowid ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(Workflow::from).collect())
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct WorkflowRow {
    id: String,
    name: Option<String>,
    description: Option<String>,
    props: String,
    created_at: i64,
}

impl From<WorkflowRow> for Workflow {
    fn from(row: WorkflowRow) -> Self {
        Workflow {
            id: Uuid::parse_str(&row.id).unwrap_or_default(),
            name: row.name,
            description: row.description,
            props: serde_json::from_str(&row.props).unwrap_or_default(),
            created_at: chrono::DateTime::from_timestamp_millis(row.created_at)
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;

    #[tokio::test]
    async fn round_trips_a_workflow() {
        let pool = memory_pool().await;
        let mut workflow = Workflow::new(Some("calibration".into()), None);
        workflow
            .props
            .insert("instrument".into(), serde_json::json!("beamline-7"));
        put(&pool, &workflow).await.unwrap();

        let found = find_by_id(&pool, workflow.id).await.unwrap().unwrap();
        assert_eq!(found.name.as_deref(), Some("calibration"));
        assert_eq!(found.props["instrument"], serde_json::json!("beamline-7"));
    }

    #[tokio::test]
    async fn listing_is_oldest_first() {
        let pool = memory_pool().await;
        let first = Workflow::new(Some("a".into()), None);
        let second = Workflow::new(Some("b".into()), None);
        put(&pool, &first).await.unwrap();
        put(&pool, &second).await.unwrap();

        let all = list_all(&pool).await.unwrap();
        let ids: Vec<_> = all.iter().map(|w| w.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }
}
