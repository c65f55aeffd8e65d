use crate::storage::{map_sqlx_error, StorageError};
use futures::TryFutureExt;
use sqlx::{Execute, FromRow, QueryBuilder, Sqlite, SqliteConnection};

#[derive(Clone, Debug, Default, FromRow)]
pub struct Note {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub author: String,
    pub shared: bool,
    pub created: String,
    pub modified: String,
}

#[derive(Clone, Debug, Default)]
pub struct UpdatableFields {
    pub title: Option<String>,
    pub content: Option<String>,
    pub author: Option<String>,
    pub shared: Option<bool>,
    pub modified: Option<String>,
}

/// Insert a new note; the id is assigned by the database and returned to the caller.
pub async fn insert(conn: &mut SqliteConnection, note: &Note) -> Result<i64, StorageError> {
    let query = sqlx::query(
        "INSERT INTO notes (title, content, author, shared, created, modified) \
        VALUES (?, ?, ?, ?, ?, ?);",
    )
    .bind(&note.title)
    .bind(&note.content)
    .bind(&note.author)
    .bind(note.shared)
    .bind(&note.created)
    .bind(&note.modified);

    let sql = query.sql();

    let result = query
        .execute(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await?;

    Ok(result.last_insert_rowid())
}

pub async fn list(conn: &mut SqliteConnection) -> Result<Vec<Note>, StorageError> {
    let query = sqlx::query_as::<_, Note>(
        "SELECT id, title, content, author, shared, created, modified FROM notes;",
    );

    let sql = query.sql();

    query
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn get(conn: &mut SqliteConnection, id: i64) -> Result<Note, StorageError> {
    let query = sqlx::query_as::<_, Note>(
        "SELECT id, title, content, author, shared, created, modified FROM notes WHERE id = ?;",
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
    let mut update_query: QueryBuilder<Sqlite> = QueryBuilder::new(r#"UPDATE notes SET "#);
    let mut updated_fields_total = 0;

    if let Some(value) = &fields.title {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("title = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.content {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("content = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.author {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("author = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = fields.shared {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("shared = ");
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
    let query = sqlx::query("DELETE FROM notes WHERE id = ?;").bind(id);

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

        let note = Note {
            id: 0,
            title: "resupply schedule".to_string(),
            content: "water drop moved to 0600".to_string(),
            author: "quartermaster".to_string(),
            shared: true,
            created: "1712000000000".to_string(),
            modified: "1712000000000".to_string(),
        };

        insert(&mut conn, &note).await?;

        Ok((harness, conn))
    }

    #[tokio::test]
    async fn test_list_notes() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let notes = list(&mut conn).await.expect("Failed to list notes");

        assert!(!notes.is_empty(), "No notes returned");

        let some_note = notes.iter().find(|n| n.id == 1).expect("Note not found");
        assert_eq!(some_note.title, "resupply schedule");
        assert!(some_note.shared);
    }

    #[tokio::test]
    async fn test_get_note() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let note = get(&mut conn, 1).await.expect("Failed to get note");

        assert_eq!(note.author, "quartermaster");

        assert_eq!(
            get(&mut conn, 99).await.unwrap_err(),
            StorageError::NotFound
        );
    }

    #[tokio::test]
    async fn test_update_note() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let fields_to_update = UpdatableFields {
            content: Some("water drop moved to 0700".to_string()),
            shared: Some(false),
            modified: Some("1712000000900".to_string()),
            ..Default::default()
        };

        update(&mut conn, 1, fields_to_update)
            .await
            .expect("Failed to update note");

        let updated_note = get(&mut conn, 1)
            .await
            .expect("Failed to retrieve updated note");

        assert_eq!(updated_note.content, "water drop moved to 0700");
        assert!(!updated_note.shared);
        assert_eq!(updated_note.title, "resupply schedule");
    }

    #[tokio::test]
    async fn test_delete_note() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        delete(&mut conn, 1).await.expect("Failed to delete note");

        assert!(get(&mut conn, 1).await.is_err(), "Note was not deleted");
    }
}
