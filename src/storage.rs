use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredSession {
    pub access_token: String,
    pub email: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone)]
pub struct Options {
    pub path: Option<PathBuf>,
}

impl Store {
    pub fn open(opts: Options) -> Result<Self> {
        let path = if let Some(path) = opts.path {
            path
        } else {
            default_path().context("storage: resolve default path")?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("storage: create directory {}", parent.display()))?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("storage: open database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("storage: set WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .context("storage: set busy timeout")?;
        migrate(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn close(self) -> Result<()> {
        let conn = Arc::try_unwrap(self.conn)
            .map_err(|_| anyhow!("storage: connection still in use"))?
            .into_inner();
        conn.close()
            .map_err(|(_, err)| err)
            .context("storage: close connection")
    }

    pub fn save_session(&self, session: &StoredSession) -> Result<()> {
        if session.access_token.trim().is_empty() {
            bail!("storage: access token required");
        }
        let conn = self.conn.lock();
        conn.execute(
            r#"
INSERT INTO sessions (id, access_token, email, expires_at, created_at)
VALUES (1, ?1, ?2, ?3, ?4)
ON CONFLICT(id) DO UPDATE SET
  access_token = excluded.access_token,
  email = excluded.email,
  expires_at = excluded.expires_at,
  created_at = excluded.created_at
"#,
            params![
                session.access_token,
                session.email,
                session.expires_at.map(|at| at.timestamp()),
                session.created_at.timestamp(),
            ],
        )
        .context("storage: save session")?;
        Ok(())
    }

    pub fn load_session(&self) -> Result<Option<StoredSession>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT access_token, email, expires_at, created_at FROM sessions WHERE id = 1",
            [],
            session_from_row,
        )
        .optional()
        .context("storage: load session")
    }

    pub fn clear_session(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM sessions", [])
            .context("storage: clear session")?;
        Ok(())
    }
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<StoredSession> {
    let expires_at: Option<i64> = row.get(2)?;
    let created_at: i64 = row.get(3)?;
    Ok(StoredSession {
        access_token: row.get(0)?,
        email: row.get(1)?,
        expires_at: expires_at.and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
        created_at: Utc
            .timestamp_opt(created_at, 0)
            .single()
            .unwrap_or_else(Utc::now),
    })
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at INTEGER NOT NULL
)
"#,
        [],
    )?;

    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    for (idx, sql) in migrations().iter().enumerate() {
        let version = (idx + 1) as i64;
        if version <= current {
            continue;
        }
        conn.execute_batch(sql)
            .with_context(|| format!("storage: apply migration {}", version))?;
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![version, Utc::now().timestamp()],
        )?;
    }
    Ok(())
}

fn migrations() -> Vec<&'static str> {
    vec![r#"
CREATE TABLE IF NOT EXISTS sessions (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  access_token TEXT NOT NULL,
  email TEXT NOT NULL DEFAULT '',
  expires_at INTEGER,
  created_at INTEGER NOT NULL
);
"#]
}

pub fn default_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("postdeck").join("postdeck.db"))
}
