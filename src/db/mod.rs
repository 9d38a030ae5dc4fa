use anyhow::Result;
use std::path::Path;
use std::time::Duration;
use tokio_rusqlite::Connection;

pub mod queue;

pub use queue::SqliteQueueStore;

/// How long a writer waits for another worker's transaction to finish.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn init(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let conn = Connection::open(path).await?;
    migrate(&conn).await?;
    Ok(conn)
}

pub async fn init_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory().await?;
    migrate(&conn).await?;
    Ok(conn)
}

async fn migrate(conn: &Connection) -> Result<()> {
    conn.call(|conn| {
        conn.busy_timeout(BUSY_TIMEOUT)?;

        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;

        Ok::<(), tokio_rusqlite::rusqlite::Error>(())
    })
    .await?;

    Ok(())
}
