use crate::storage::{map_sqlx_error, StorageError};
use futures::TryFutureExt;
use sqlx::{Execute, FromRow, QueryBuilder, Sqlite, SqliteConnection};

#[derive(Clone, Debug, Default, FromRow)]
pub struct PointOfInterest {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub category: String,
    pub latitude: String,
    pub longitude: String,
    pub annotations: String,
    pub created: String,
    pub modified: String,
}

#[derive(Clone, Debug, Default)]
pub struct UpdatableFields {
    pub name: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub annotations: Option<String>,
    pub modified: Option<String>,
}

/// Insert a new point of interest; the id is assigned by the database and returned to the caller.
pub async fn insert(
    conn: &mut SqliteConnection,
    poi: &PointOfInterest,
) -> Result<i64, StorageError> {
    let query = sqlx::query(
        "INSERT INTO pois (name, description, category, latitude, longitude, annotations, \
        created, modified) VALUES (?, ?, ?, ?, ?, ?, ?, ?);",
    )
    .bind(&poi.name)
    .bind(&poi.description)
    .bind(&poi.category)
    .bind(&poi.latitude)
    .bind(&poi.longitude)
    .bind(&poi.annotations)
    .bind(&poi.created)
    .bind(&poi.modified);

    let sql = query.sql();

    let result = query
        .execute(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await?;

    Ok(result.last_insert_rowid())
}

pub async fn list(conn: &mut SqliteConnection) -> Result<Vec<PointOfInterest>, StorageError> {
    let query = sqlx::query_as::<_, PointOfInterest>(
        "SELECT id, name, description, category, latitude, longitude, annotations, created, \
        modified FROM pois;",
    );

    let sql = query.sql();

    query
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn get(conn: &mut SqliteConnection, id: i64) -> Result<PointOfInterest, StorageError> {
    let query = sqlx::query_as::<_, PointOfInterest>(
        "SELECT id, name, description, category, latitude, longitude, annotations, created, \
        modified FROM pois WHERE id = ?;",
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
    let mut update_query: QueryBuilder<Sqlite> = QueryBuilder::new(r#"UPDATE pois SET "#);
    let mut updated_fields_total = 0;

    if let Some(value) = &fields.name {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("name = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.description {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("description = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.category {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("category = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.latitude {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("latitude = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.longitude {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("longitude = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.annotations {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("annotations = ");
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
    let query = sqlx::query("DELETE FROM pois WHERE id = ?;").bind(id);

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

        let poi = PointOfInterest {
            id: 0,
            name: "water point".to_string(),
            description: "filtered spring, checked weekly".to_string(),
            category: "logistics".to_string(),
            latitude: "35.6544".to_string(),
            longitude: "-83.5070".to_string(),
            annotations: "{}".to_string(),
            created: "1712000000000".to_string(),
            modified: "1712000000000".to_string(),
        };

        insert(&mut conn, &poi).await?;

        Ok((harness, conn))
    }

    #[tokio::test]
    async fn test_list_pois() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let pois = list(&mut conn).await.expect("Failed to list pois");

        assert!(!pois.is_empty(), "No points of interest returned");

        let some_poi = pois.iter().find(|p| p.id == 1).expect("Poi not found");
        assert_eq!(some_poi.name, "water point");
        assert_eq!(some_poi.category, "logistics");
    }

    #[tokio::test]
    async fn test_get_poi() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let poi = get(&mut conn, 1).await.expect("Failed to get poi");

        assert_eq!(poi.latitude, "35.6544");

        assert_eq!(
            get(&mut conn, 99).await.unwrap_err(),
            StorageError::NotFound
        );
    }

    #[tokio::test]
    async fn test_update_poi() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let fields_to_update = UpdatableFields {
            description: Some("contaminated; use south spring instead".to_string()),
            category: Some("hazard".to_string()),
            modified: Some("1712000000900".to_string()),
            ..Default::default()
        };

        update(&mut conn, 1, fields_to_update)
            .await
            .expect("Failed to update poi");

        let updated_poi = get(&mut conn, 1)
            .await
            .expect("Failed to retrieve updated poi");

        assert_eq!(updated_poi.category, "hazard");
        assert_eq!(updated_poi.name, "water point");
    }

    #[tokio::test]
    async fn test_delete_poi() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        delete(&mut conn, 1).await.expect("Failed to delete poi");

        assert!(get(&mut conn, 1).await.is_err(), "Poi was not deleted");
    }
}
