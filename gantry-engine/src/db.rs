use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    // a single connection keeps `sqlite::memory:` databases whole and
    // matches SQLite's one-writer locking
    SqlitePoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    // Create jobs table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            job_id TEXT PRIMARY KEY,
            parent_job_id TEXT,
            origin_job_id TEXT NOT NULL,
            workflow_id TEXT NOT NULL,
            site_name TEXT NOT NULL,
            native_id TEXT,
            context TEXT NOT NULL,
            defn TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create statuses table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS statuses (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT NOT NULL,
            status TEXT NOT NULL,
            emit_time INTEGER NOT NULL,
            event TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create handlers table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS handlers (
            id TEXT PRIMARY KEY,
            selector TEXT NOT NULL,
            filter TEXT NOT NULL,
            action TEXT NOT NULL,
            mode TEXT NOT NULL,
            fired INTEGER NOT NULL DEFAULT 0,
            registered_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create data lineage table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS data_lineage (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT NOT NULL,
            op TEXT NOT NULL,
            local_ref TEXT NOT NULL,
            site_ref TEXT NOT NULL,
            site_name TEXT NOT NULL,
            recorded_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create workflows table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS workflows (
            id TEXT PRIMARY KEY,
            name TEXT,
            description TEXT,
            props TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes for better query performance
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_statuses_job ON statuses(job_id, id)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_statuses_emit ON statuses(emit_time)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_workflow ON jobs(workflow_id)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_origin ON jobs(origin_job_id)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_handlers_fired ON handlers(fired)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_data_job ON data_lineage(job_id)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_data_site_ref ON data_lineage(site_ref)")
        .execute(pool)
        .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}

#[cfg(test)]
pub(crate) async fn memory_pool() -> SqlitePool {
    let pool = create_pool("sqlite::memory:").await.unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}
