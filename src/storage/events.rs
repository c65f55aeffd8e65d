use crate::storage::{map_sqlx_error, StorageError, MAX_ROW_LIMIT};
use futures::TryFutureExt;
use sqlx::{Execute, FromRow, SqliteConnection};

#[derive(Clone, Debug, Default, FromRow)]
pub struct Event {
    pub id: String,
    pub kind: String,
    pub emitted: String,
}

pub async fn insert(conn: &mut SqliteConnection, event: &Event) -> Result<(), StorageError> {
    let query = sqlx::query("INSERT INTO events (id, kind, emitted) VALUES (?, ?, ?);")
        .bind(&event.id)
        .bind(&event.kind)
        .bind(&event.emitted);

    let sql = query.sql();

    query
        .execute(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await?;

    Ok(())
}

/// Return all events; limited to 200 rows in any one response.
/// The reverse parameter sorts events in reverse chronological order (newest event first).
pub async fn list(
    conn: &mut SqliteConnection,
    offset: i64,
    limit: i64,
    reverse: bool,
) -> Result<Vec<Event>, StorageError> {
    let mut limit = limit;

    if limit == 0 || limit > MAX_ROW_LIMIT {
        limit = MAX_ROW_LIMIT;
    }

    let query_str = "SELECT id, kind, emitted FROM events ORDER BY id ASC LIMIT ? OFFSET ?;";

    let query_str = if reverse {
        query_str.replacen("ASC", "DESC", 1)
    } else {
        query_str.to_string()
    };

    let query = sqlx::query_as::<_, Event>(&query_str).bind(limit).bind(offset);

    let sql = query.sql();

    query
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn get(conn: &mut SqliteConnection, id: &str) -> Result<Event, StorageError> {
    let query =
        sqlx::query_as::<_, Event>("SELECT id, kind, emitted FROM events WHERE id = ?;").bind(id);

    let sql = query.sql();

    query
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn delete(conn: &mut SqliteConnection, id: &str) -> Result<(), StorageError> {
    let query = sqlx::query("DELETE FROM events WHERE id = ?;").bind(id);

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

    fn new_event(id: &str, emitted: &str) -> Event {
        Event {
            id: id.to_string(),
            kind: r#"{"created_note":{"note_id":1}}"#.to_string(),
            emitted: emitted.to_string(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_get_event() {
        let harness = TestHarness::new().await;
        let mut conn = harness.write_conn().await.unwrap();

        let event = new_event("018f3b1c-0000-7000-8000-000000000001", "1712000000000");
        insert(&mut conn, &event).await.unwrap();

        let stored = get(&mut conn, &event.id).await.expect("Failed to get event");
        assert_eq!(stored.kind, event.kind);

        assert_eq!(
            insert(&mut conn, &event).await.unwrap_err(),
            StorageError::Exists
        );
    }

    #[tokio::test]
    async fn test_list_events_ordering() {
        let harness = TestHarness::new().await;
        let mut conn = harness.write_conn().await.unwrap();

        // Uuidv7 ids sort lexicographically by creation time.
        let first = new_event("018f3b1c-0000-7000-8000-000000000001", "1712000000000");
        let second = new_event("018f3b1c-0000-7000-8000-000000000002", "1712000000005");

        insert(&mut conn, &first).await.unwrap();
        insert(&mut conn, &second).await.unwrap();

        let events = list(&mut conn, 0, 0, false).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, first.id);

        let events = list(&mut conn, 0, 0, true).await.unwrap();
        assert_eq!(events[0].id, second.id);
    }

    #[tokio::test]
    async fn test_delete_event() {
        let harness = TestHarness::new().await;
        let mut conn = harness.write_conn().await.unwrap();

        let event = new_event("018f3b1c-0000-7000-8000-000000000001", "1712000000000");
        insert(&mut conn, &event).await.unwrap();

        delete(&mut conn, &event.id).await.expect("Failed to delete");

        assert_eq!(
            delete(&mut conn, &event.id).await.unwrap_err(),
            StorageError::NotFound
        );
    }
}
