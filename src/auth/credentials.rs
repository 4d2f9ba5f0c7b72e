// Credential persistence backed by SQLite

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Mutex;

use super::types::Credentials;

const SESSION_KEY: &str = "leave-portal:session";

/// Durable home for the session between process runs
pub trait CredentialPersistence: Send + Sync {
    /// Load the last saved session, if any
    fn load(&self) -> Result<Option<Credentials>>;

    /// Save the given session, replacing the previous one
    fn save(&self, creds: &Credentials) -> Result<()>;
}

/// Stores the session as JSON in a key/value table
pub struct SqliteCredentials {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteCredentials {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create directory: {}", parent.display())
                })?;
            }
        }

        let conn = rusqlite::Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        Self::with_connection(conn)
    }

    /// In-memory database, mostly for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()
            .context("Failed to open in-memory SQLite database")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: rusqlite::Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )
        .context("Failed to create auth_kv table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, rusqlite::Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl CredentialPersistence for SqliteCredentials {
    fn load(&self) -> Result<Option<Credentials>> {
        let conn = self.conn();
        let value: Option<String> = match conn.query_row(
            "SELECT value FROM auth_kv WHERE key = ?",
            [SESSION_KEY],
            |row| row.get(0),
        ) {
            Ok(v) => Some(v),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e).context("Failed to load session from SQLite"),
        };

        value
            .map(|json| {
                serde_json::from_str::<Credentials>(&json)
                    .context("Failed to parse session data from SQLite")
            })
            .transpose()
    }

    fn save(&self, creds: &Credentials) -> Result<()> {
        let json = serde_json::to_string(creds).context("Failed to serialize session")?;
        self.conn()
            .execute(
                "INSERT INTO auth_kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                [SESSION_KEY, json.as_str()],
            )
            .context("Failed to save session to SQLite")?;
        Ok(())
    }
}
