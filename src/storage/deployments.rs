use crate::storage::{map_sqlx_error, StorageError};
use futures::TryFutureExt;
use sqlx::{Execute, FromRow, QueryBuilder, Sqlite, SqliteConnection};

#[derive(Clone, Debug, Default, FromRow)]
pub struct Deployment {
    pub id: i64,
    pub name: String,
    pub kind: String,
    pub config: String,
    pub status: String,
    pub progress: i64,
    pub status_reason: String,
    pub created: String,
    pub modified: String,
}

#[derive(Clone, Debug, Default)]
pub struct UpdatableFields {
    pub status: Option<String>,
    pub progress: Option<i64>,
    pub status_reason: Option<String>,
    pub modified: Option<String>,
}

/// Insert a new deployment; the id is assigned by the database and returned to the caller.
pub async fn insert(
    conn: &mut SqliteConnection,
    deployment: &Deployment,
) -> Result<i64, StorageError> {
    let query = sqlx::query(
        "INSERT INTO deployments (name, kind, config, status, progress, status_reason, created, \
        modified) VALUES (?, ?, ?, ?, ?, ?, ?, ?);",
    )
    .bind(&deployment.name)
    .bind(&deployment.kind)
    .bind(&deployment.config)
    .bind(&deployment.status)
    .bind(deployment.progress)
    .bind(&deployment.status_reason)
    .bind(&deployment.created)
    .bind(&deployment.modified);

    let sql = query.sql();

    let result = query
        .execute(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await?;

    Ok(result.last_insert_rowid())
}

pub async fn list(conn: &mut SqliteConnection) -> Result<Vec<Deployment>, StorageError> {
    let query = sqlx::query_as::<_, Deployment>(
        "SELECT id, name, kind, config, status, progress, status_reason, created, modified \
        FROM deployments;",
    );

    let sql = query.sql();

    query
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn get(conn: &mut SqliteConnection, id: i64) -> Result<Deployment, StorageError> {
    let query = sqlx::query_as::<_, Deployment>(
        "SELECT id, name, kind, config, status, progress, status_reason, created, modified \
        FROM deployments WHERE id = ?;",
    )
    .bind(id);

    let sql = query.sql();

    query
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn update(
    conn: &mut SqliteConnection,
    id: i64,
    fields: UpdatableFields,
) -> Result<(), StorageError> {
    let mut update_query: QueryBuilder<Sqlite> = QueryBuilder::new(r#"UPDATE deployments SET "#);
    let mut updated_fields_total = 0;

    if let Some(value) = &fields.status {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("status = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = fields.progress {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("progress = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.status_reason {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("status_reason = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.modified {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("modified = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    // If no fields were updated, return an error
    if updated_fields_total == 0 {
        return Err(StorageError::NoFieldsUpdated);
    }

    update_query.push(" WHERE id = ");
    update_query.push_bind(id);
    update_query.push(";");

    let update_query = update_query.build();

    let sql = update_query.sql();

    let result = update_query
        .execute(conn)
        .await
        .map_err(|e| map_sqlx_error(e, sql))?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }

    Ok(())
}

pub async fn delete(conn: &mut SqliteConnection, id: i64) -> Result<(), StorageError> {
    let query = sqlx::query("DELETE FROM deployments WHERE id = ?;").bind(id);

    let sql = query.sql();

    let result = query
        .execute(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::TestHarness;
    use sqlx::{pool::PoolConnection, Sqlite};

    async fn setup() -> Result<(TestHarness, PoolConnection<Sqlite>), Box<dyn std::error::Error>> {
        let harness = TestHarness::new().await;
        let mut conn = harness.write_conn().await.unwrap();

        let deployment = Deployment {
            id: 0,
            name: "forward site alpha".to_string(),
            kind: "local".to_string(),
            config: "{}".to_string(),
            status: "pending".to_string(),
            progress: 0,
            status_reason: "null".to_string(),
            created: "1712000000000".to_string(),
            modified: "1712000000000".to_string(),
        };

        insert(&mut conn, &deployment).await?;

        Ok((harness, conn))
    }

    #[tokio::test]
    async fn test_insert_assigns_ids() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let deployment = Deployment {
            name: "forward site bravo".to_string(),
            kind: "cloud".to_string(),
            config: "{}".to_string(),
            status: "pending".to_string(),
            status_reason: "null".to_string(),
            created: "1712000000001".to_string(),
            modified: "1712000000001".to_string(),
            ..Default::default()
        };

        let id = insert(&mut conn, &deployment)
            .await
            .expect("Failed to insert deployment");

        assert_eq!(id, 2, "second insert should get the next rowid");
    }

    #[tokio::test]
    async fn test_list_deployments() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let deployments = list(&mut conn).await.expect("Failed to list deployments");

        assert!(!deployments.is_empty(), "No deployments returned");

        let some_deployment = deployments
            .iter()
            .find(|d| d.id == 1)
            .expect("Deployment not found");
        assert_eq!(some_deployment.name, "forward site alpha");
        assert_eq!(some_deployment.status, "pending");
        assert_eq!(some_deployment.progress, 0);
    }

    #[tokio::test]
    async fn test_get_deployment() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let deployment = get(&mut conn, 1).await.expect("Failed to get deployment");

        assert_eq!(deployment.kind, "local");
        assert_eq!(deployment.status, "pending");

        assert_eq!(
            get(&mut conn, 99).await.unwrap_err(),
            StorageError::NotFound
        );
    }

    #[tokio::test]
    async fn test_update_deployment() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let fields_to_update = UpdatableFields {
            status: Some("in_progress".to_string()),
            progress: Some(42),
            modified: Some("1712000000500".to_string()),
            ..Default::default()
        };

        update(&mut conn, 1, fields_to_update)
            .await
            .expect("Failed to update deployment");

        let updated_deployment = get(&mut conn, 1)
            .await
            .expect("Failed to retrieve updated deployment");

        assert_eq!(updated_deployment.status, "in_progress");
        assert_eq!(updated_deployment.progress, 42);
        assert_eq!(updated_deployment.modified, "1712000000500");
    }

    #[tokio::test]
    async fn test_update_missing_deployment() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let result = update(
            &mut conn,
            99,
            UpdatableFields {
                status: Some("failed".to_string()),
                ..Default::default()
            },
        )
        .await;

        assert_eq!(result.unwrap_err(), StorageError::NotFound);
    }

    #[tokio::test]
    async fn test_update_no_fields() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let result = update(&mut conn, 1, UpdatableFields::default()).await;

        assert_eq!(result.unwrap_err(), StorageError::NoFieldsUpdated);
    }

    #[tokio::test]
    async fn test_delete_deployment() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        delete(&mut conn, 1).await.expect("Failed to delete deployment");

        assert!(
            get(&mut conn, 1).await.is_err(),
            "Deployment was not deleted"
        );

        assert_eq!(
            delete(&mut conn, 1).await.unwrap_err(),
            StorageError::NotFound
        );
    }
}
