//! Handler Store
//!
//! Persisted trigger rules. Rows outlive firing: a one-shot handler is
//! marked fired rather than deleted, so a restarted engine neither loses
//! pending rules nor re-fires spent ones.

use gantry_core::domain::event::{
    EventFilter, EventSelector, FiringMode, JobEventHandler, TriggerAction,
};
use sqlx::SqlitePool;
use uuid::Uuid;

/// Persist a newly registered handler
pub async fn put(pool: &SqlitePool, handler: &JobEventHandler) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO handlers (id, selector, filter, action, mode, fired, registered_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(handler.id.to_string())
    .bind(to_json(&handler.selector)?)
    .bind(to_json(&handler.filter)?)
    .bind(to_json(&handler.action)?)
    .bind(mode_to_string(handler.mode))
    .bind(handler.fired)
    .bind(handler.registered_at.timestamp_millis())
    .execute(pool)
    .await?;

    Ok(())
}

/// All handlers that have not fired, in registration order
pub async fn list_unfired(pool: &SqlitePool) -> Result<Vec<JobEventHandler>, sqlx::Error> {
    let rows = sqlx::query_as::<_, HandlerRow>(
        r#"
        SELECT id, selector, filter, action, mode, fired, registered_at
        FROM handlers
        WHERE fired = 0
        ORDER BY registered_at ASC, rowid ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(JobEventHandler::try_from).collect()
}

/// Mark a handler as fired
pub async fn mark_fired(pool: &SqlitePool, id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE handlers SET fired = 1 WHERE id = $1 AND fired = 0")
        .bind(id.to_string())
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Delete a handler by ID
pub async fn delete(pool: &SqlitePool, id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM handlers WHERE id = $1")
        .bind(id.to_string())
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
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

fn mode_to_string(mode: FiringMode) -> &'static str {
    match mode {
        FiringMode::OneShot => "OneShot",
        FiringMode::Recurring => "Recurring",
    }
}

fn string_to_mode(s: &str) -> FiringMode {
    match s {
        "Recurring" => FiringMode::Recurring,
        _ => FiringMode::OneShot,
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct HandlerRow {
    id: String,
    selector: String,
    filter: String,
    action: String,
    mode: String,
    fired: bool,
    registered_at: i64,
}

impl TryFrom<HandlerRow> for JobEventHandler {
    type Error = sqlx::Error;

    fn try_from(row: HandlerRow) -> Result<Self, Self::Error> {
        let selector: EventSelector = from_json(&row.selector)?;
        let filter: EventFilter = from_json(&row.filter)?;
        let action: TriggerAction = from_json(&row.action)?;

        Ok(JobEventHandler {
            id: Uuid::parse_str(&row.id).unwrap_or_default(),
            selector,
            filter,
            action,
            mode: string_to_mode(&row.mode),
            fired: row.fired,
            registered_at: chrono::DateTime::from_timestamp_millis(row.registered_at)
                .unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use gantry_core::domain::job::JobDefn;
    use gantry_core::domain::status::JobStatus;

    fn handler(mode: FiringMode) -> JobEventHandler {
        JobEventHandler::new(
            EventSelector::Job(Uuid::new_v4()),
            EventFilter::Status(JobStatus::Complete),
            TriggerAction::new(JobDefn::new("echo next"), "local"),
            mode,
        )
    }

    #[tokio::test]
    async fn unfired_listing_is_in_registration_order() {
        let pool = memory_pool().await;
        let first = handler(FiringMode::OneShot);
        let second = handler(FiringMode::Recurring);
        put(&pool, &first).await.unwrap();
        put(&pool, &second).await.unwrap();

        let listed = list_unfired(&pool).await.unwrap();
        let ids: Vec<_> = listed.iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
        assert_eq!(listed[0].mode, FiringMode::OneShot);
        assert_eq!(listed[1].mode, FiringMode::Recurring);
    }

    #[tokio::test]
    async fn fired_handlers_drop_out_of_the_listing() {
        let pool = memory_pool().await;
        let h = handler(FiringMode::OneShot);
        put(&pool, &h).await.unwrap();

        assert!(mark_fired(&pool, h.id).await.unwrap());
        // already fired, nothing left to mark
        assert!(!mark_fired(&pool, h.id).await.unwrap());
        assert!(list_unfired(&pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn round_trip_preserves_the_action() {
        let pool = memory_pool().await;
        let h = handler(FiringMode::OneShot);
        put(&pool, &h).await.unwrap();

        let listed = list_unfired(&pool).await.unwrap();
        assert_eq!(listed[0].action.defn.entry_point, "echo next");
        assert_eq!(listed[0].action.site_name, "local");
        assert_eq!(listed[0].selector, h.selector);
    }

    #[tokio::test]
    async fn delete_removes_the_row() {
        let pool = memory_pool().await;
        let h = handler(FiringMode::OneShot);
        put(&pool, &h).await.unwrap();

        assert!(delete(&pool, h.id).await.unwrap());
        assert!(!delete(&pool, h.id).await.unwrap());
        assert!(list_unfired(&pool).await.unwrap().is_empty());
    }
}
