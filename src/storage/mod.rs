pub mod deployments;
pub mod events;
pub mod notes;
pub mod pois;
pub mod server_metrics;


use sqlx::{
    migrate,
    pool::PoolConnection,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Pool, Sqlite,
};
use std::{fs::File, io, path::Path, str::FromStr, time::Duration};

/// The maximum amount of rows that can be returned by any single query.
const MAX_ROW_LIMIT: i64 = 200;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum StorageError {
    #[error("could not establish connection to database; {0}")]
    Connection(String),

    #[error("requested entity not found")]
    NotFound,

    #[error("entity already exists")]
    Exists,

    #[error("no fields were set to be updated")]
    NoFieldsUpdated,

    #[error("could not parse value '{value}' for column '{column}' from database; {err}")]
    Parse {
        value: String,
        column: String,
        err: String,
    },

    #[error("unexpected storage error occurred; code: {code:?}; message: {message}; query: {query}")]
    GenericDBError {
        code: Option<String>,
        message: String,
        query: String,
    },
}

/// Sqlite errors are surfaced by database error code. We map the codes relevant to waypost back
/// into the storage error set so callers can match on them.
/// See the codes here: https://www.sqlite.org/rescode.html
pub fn map_sqlx_error(e: sqlx::Error, query: &str) -> StorageError {
    match e {
        sqlx::Error::RowNotFound => StorageError::NotFound,
        sqlx::Error::Database(database_err) => {
            let code = database_err.code().map(|code| code.to_string());

            // 1555 is the primary key constraint code; 2067 the unique constraint code.
            if let Some(code) = &code {
                if code == "1555" || code == "2067" {
                    return StorageError::Exists;
                }
            }

            StorageError::GenericDBError {
                code,
                message: database_err.message().to_string(),
                query: query.into(),
            }
        }
        _ => StorageError::GenericDBError {
            code: None,
            message: e.to_string(),
            query: query.into(),
        },
    }
}

#[derive(Debug, Clone)]
pub struct Db {
    write_pool: Pool<Sqlite>,
    read_pool: Pool<Sqlite>,
}

// Create file if not exists.
fn touch_file(path: &Path) -> io::Result<()> {
    if !path.exists() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        File::create(path)?;
    }

    Ok(())
}

impl Db {
    pub async fn new(path: &str) -> Result<Self, StorageError> {
        touch_file(Path::new(path)).map_err(|e| StorageError::Connection(e.to_string()))?;

        let connect_options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(|e| StorageError::Connection(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        // Sqlite supports a single writer at a time; funneling every write through one
        // connection avoids SQLITE_BUSY errors when several provisioners report progress
        // concurrently.
        let write_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options.clone())
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let read_pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect_with(connect_options)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        migrate!("src/storage/migrations")
            .run(&write_pool)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        Ok(Db {
            write_pool,
            read_pool,
        })
    }

    pub async fn write_conn(&self) -> Result<PoolConnection<Sqlite>, StorageError> {
        self.write_pool
            .acquire()
            .await
            .map_err(|e| StorageError::Connection(format!("{:?}", e)))
    }

    pub async fn read_conn(&self) -> Result<PoolConnection<Sqlite>, StorageError> {
        self.read_pool
            .acquire()
            .await
            .map_err(|e| StorageError::Connection(format!("{:?}", e)))
    }
}
