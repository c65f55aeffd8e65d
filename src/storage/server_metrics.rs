use crate::storage::{map_sqlx_error, StorageError, MAX_ROW_LIMIT};
use futures::TryFutureExt;
use sqlx::{Execute, FromRow, SqliteConnection};

#[derive(Clone, Debug, Default, FromRow)]
pub struct ServerMetrics {
    pub id: i64,
    pub cpu_usage: i64,
    pub memory_usage: i64,
    pub disk_usage: i64,
    pub network_in: i64,
    pub network_out: i64,
    pub active_connections: i64,
    pub recorded: String,
}

/// Insert a new metrics sample; the id is assigned by the database and returned to the caller.
pub async fn insert(
    conn: &mut SqliteConnection,
    metrics: &ServerMetrics,
) -> Result<i64, StorageError> {
    let query = sqlx::query(
        "INSERT INTO server_metrics (cpu_usage, memory_usage, disk_usage, network_in, \
        network_out, active_connections, recorded) VALUES (?, ?, ?, ?, ?, ?, ?);",
    )
    .bind(metrics.cpu_usage)
    .bind(metrics.memory_usage)
    .bind(metrics.disk_usage)
    .bind(metrics.network_in)
    .bind(metrics.network_out)
    .bind(metrics.active_connections)
    .bind(&metrics.recorded);

    let sql = query.sql();

    let result = query
        .execute(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await?;

    Ok(result.last_insert_rowid())
}

/// Return samples newest first; limited to 200 rows in any one response.
pub async fn list(
    conn: &mut SqliteConnection,
    limit: i64,
) -> Result<Vec<ServerMetrics>, StorageError> {
    let mut limit = limit;

    if limit == 0 || limit > MAX_ROW_LIMIT {
        limit = MAX_ROW_LIMIT;
    }

    let query = sqlx::query_as::<_, ServerMetrics>(
        "SELECT id, cpu_usage, memory_usage, disk_usage, network_in, network_out, \
        active_connections, recorded FROM server_metrics ORDER BY id DESC LIMIT ?;",
    )
    .bind(limit);

    let sql = query.sql();

    query
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn get_latest(conn: &mut SqliteConnection) -> Result<ServerMetrics, StorageError> {
    let query = sqlx::query_as::<_, ServerMetrics>(
        "SELECT id, cpu_usage, memory_usage, disk_usage, network_in, network_out, \
        active_connections, recorded FROM server_metrics ORDER BY id DESC LIMIT 1;",
    );

    let sql = query.sql();

    query
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}
