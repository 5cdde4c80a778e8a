// Database module

pub mod migrations;
pub mod schema;

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use crate::error::{Result, SiftError};

/// Open or create a database at the given path
pub fn open_db(db_path: &Path) -> anyhow::Result<Connection> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(db_path)?;

    // Enable foreign keys (must be done per connection)
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;

    // Enable WAL mode for better concurrency
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    migrations::run_migrations(&conn)?;
    schema::seed_defaults(&conn)?;

    Ok(conn)
}

/// Open a migrated in-memory database (tests, dry runs)
pub fn open_in_memory() -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    migrations::run_migrations(&conn)?;
    schema::seed_defaults(&conn)?;
    Ok(conn)
}

/// Shared handle to the primary database.
///
/// All writers go through one connection, so every `with` call is serialized.
/// That serialization is the per-item logical lock for PhaseState and the
/// isolation boundary for duplicate-group merges.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(db_path: &Path) -> Result<Self> {
        Ok(Self::from_connection(open_db(db_path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_connection(open_in_memory()?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run `f` with exclusive access to the connection.
    pub fn with<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| SiftError::Other("database mutex poisoned".to_string()))?;
        f(&mut guard)
    }
}
