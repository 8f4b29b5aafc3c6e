use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};

const AGENT_SCHEMA_SQL: &str = include_str!("../schema/agent.sql");
const APP_SCHEMA_SQL: &str = include_str!("../schema/app.sql");

/// SQLite handle shared by the stores built on top of it. One `Db` per
/// agent (workspace + conversations + state snapshot) plus one process-wide
/// `Db` for the application database.
pub struct Db {
    conn: Mutex<Connection>,
}

// ── Auxiliary types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, serde::Serialize)]
pub struct UserRow {
    pub id: String,
    pub email: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AppRow {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub description: String,
    pub project_name: String,
    pub template_name: String,
    pub screenshot_url: Option<String>,
    pub preview_url: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Timestamp helpers ─────────────────────────────────────────────────────

fn parse_ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|ndt| ndt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

fn now_str() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

// ── Row mappers ───────────────────────────────────────────────────────────

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    let created_at_str: String = row.get(3)?;
    Ok(UserRow {
        id: row.get(0)?,
        email: row.get(1)?,
        name: row.get(2)?,
        created_at: parse_ts(&created_at_str),
    })
}

fn row_to_app(row: &rusqlite::Row<'_>) -> rusqlite::Result<AppRow> {
    let created_at_str: String = row.get(9)?;
    let updated_at_str: String = row.get(10)?;
    Ok(AppRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        project_name: row.get(4)?,
        template_name: row.get(5)?,
        screenshot_url: row.get(6)?,
        preview_url: row.get(7)?,
        status: row.get(8)?,
        created_at: parse_ts(&created_at_str),
        updated_at: parse_ts(&updated_at_str),
    })
}

// ── Db impl ───────────────────────────────────────────────────────────────

impl Db {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open SQLite database at {path:?}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("failed to set PRAGMAs")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn migrate_agent(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(AGENT_SCHEMA_SQL)
            .context("failed to apply agent schema")?;
        Ok(())
    }

    pub fn migrate_app(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(APP_SCHEMA_SQL)
            .context("failed to apply app schema")?;
        Ok(())
    }

    /// Run `f` against the locked connection. Poisoned locks are recovered
    /// (the connection stays usable after a panicked holder).
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        f(&conn)
    }

    // ── Conversations (raw JSON columns; see conversation.rs) ────────────

    pub fn get_conversation_json(&self, table: &str, id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let sql = format!("SELECT messages FROM {table} WHERE id = ?1");
        let result = conn
            .query_row(&sql, params![id], |row| row.get::<_, String>(0))
            .optional()
            .with_context(|| format!("get_conversation_json {table}"))?;
        Ok(result)
    }

    pub fn set_conversation_json(&self, table: &str, id: &str, messages: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let sql = format!(
            "INSERT INTO {table} (id, messages) VALUES (?1, ?2) \
             ON CONFLICT(id) DO UPDATE SET messages = excluded.messages"
        );
        conn.execute(&sql, params![id, messages])
            .with_context(|| format!("set_conversation_json {table}"))?;
        Ok(())
    }

    // ── Workspace objects / refs / index ─────────────────────────────────

    pub fn put_object(&self, oid: &str, kind: &str, data: &[u8]) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT OR IGNORE INTO workspace_objects (oid, kind, data) VALUES (?1, ?2, ?3)",
            params![oid, kind, data],
        )
        .context("put_object")?;
        Ok(())
    }

    pub fn get_object(&self, oid: &str) -> Result<Option<(String, Vec<u8>)>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                "SELECT kind, data FROM workspace_objects WHERE oid = ?1",
                params![oid],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)),
            )
            .optional()
            .context("get_object")?;
        Ok(result)
    }

    pub fn list_objects(&self) -> Result<Vec<(String, String, Vec<u8>)>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare("SELECT oid, kind, data FROM workspace_objects ORDER BY oid")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_objects")?;
        Ok(rows)
    }

    pub fn set_ref(&self, name: &str, oid: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO workspace_refs (name, oid) VALUES (?1, ?2) \
             ON CONFLICT(name) DO UPDATE SET oid = excluded.oid",
            params![name, oid],
        )
        .context("set_ref")?;
        Ok(())
    }

    pub fn get_ref(&self, name: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                "SELECT oid FROM workspace_refs WHERE name = ?1",
                params![name],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("get_ref")?;
        Ok(result)
    }

    pub fn list_refs(&self) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare("SELECT name, oid FROM workspace_refs ORDER BY name")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_refs")?;
        Ok(rows)
    }

    pub fn set_index_entry(&self, path: &str, oid: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO workspace_index (path, oid) VALUES (?1, ?2) \
             ON CONFLICT(path) DO UPDATE SET oid = excluded.oid",
            params![path, oid],
        )
        .context("set_index_entry")?;
        Ok(())
    }

    pub fn remove_index_entry(&self, path: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("DELETE FROM workspace_index WHERE path = ?1", params![path])
            .context("remove_index_entry")?;
        Ok(())
    }

    pub fn clear_index(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("DELETE FROM workspace_index", [])
            .context("clear_index")?;
        Ok(())
    }

    pub fn list_index(&self) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare("SELECT path, oid FROM workspace_index ORDER BY path")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_index")?;
        Ok(rows)
    }

    // ── Agent state snapshot ─────────────────────────────────────────────

    pub fn save_agent_state(&self, id: &str, state_json: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO agent_state (id, state, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(id) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at",
            params![id, state_json, now_str()],
        )
        .context("save_agent_state")?;
        Ok(())
    }

    pub fn load_agent_state(&self, id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                "SELECT state FROM agent_state WHERE id = ?1",
                params![id],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("load_agent_state")?;
        Ok(result)
    }
}

// ── AppService facade ─────────────────────────────────────────────────────

/// The only gateway to the application database (users, apps, deployments).
#[derive(Clone)]
pub struct AppService {
    db: Arc<Db>,
}

impl AppService {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    pub fn upsert_user(&self, id: &str, email: &str, name: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, email, name, created_at) VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(id) DO UPDATE SET email = excluded.email, name = excluded.name",
                params![id, email, name, now_str()],
            )
            .context("upsert_user")?;
            Ok(())
        })
    }

    pub fn get_user(&self, id: &str) -> Result<Option<UserRow>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, email, name, created_at FROM users WHERE id = ?1",
                params![id],
                row_to_user,
            )
            .optional()
            .context("get_user")
        })
    }

    pub fn create_app(
        &self,
        id: &str,
        user_id: &str,
        title: &str,
        description: &str,
        project_name: &str,
        template_name: &str,
    ) -> Result<()> {
        self.db.with_conn(|conn| {
            let now = now_str();
            conn.execute(
                "INSERT INTO apps (id, user_id, title, description, project_name, template_name, \
                 status, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'generating', ?7, ?7)",
                params![id, user_id, title, description, project_name, template_name, now],
            )
            .context("create_app")?;
            Ok(())
        })
    }

    pub fn get_app(&self, id: &str) -> Result<Option<AppRow>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, user_id, title, description, project_name, template_name, \
                 screenshot_url, preview_url, status, created_at, updated_at \
                 FROM apps WHERE id = ?1",
                params![id],
                row_to_app,
            )
            .optional()
            .context("get_app")
        })
    }

    pub fn list_apps_for_user(&self, user_id: &str) -> Result<Vec<AppRow>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, title, description, project_name, template_name, \
                 screenshot_url, preview_url, status, created_at, updated_at \
                 FROM apps WHERE user_id = ?1 ORDER BY created_at DESC",
            )?;
            let apps = stmt
                .query_map(params![user_id], row_to_app)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("list_apps_for_user")?;
            Ok(apps)
        })
    }

    pub fn update_app_screenshot(&self, id: &str, screenshot_url: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE apps SET screenshot_url = ?1, updated_at = ?2 WHERE id = ?3",
                params![screenshot_url, now_str(), id],
            )
            .context("update_app_screenshot")?;
            Ok(())
        })
    }

    pub fn update_app_preview(&self, id: &str, preview_url: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE apps SET preview_url = ?1, updated_at = ?2 WHERE id = ?3",
                params![preview_url, now_str(), id],
            )
            .context("update_app_preview")?;
            Ok(())
        })
    }

    pub fn update_app_status(&self, id: &str, status: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE apps SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status, now_str(), id],
            )
            .context("update_app_status")?;
            Ok(())
        })
    }

    pub fn update_project_name(&self, id: &str, project_name: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE apps SET project_name = ?1, updated_at = ?2 WHERE id = ?3",
                params![project_name, now_str(), id],
            )
            .context("update_project_name")?;
            Ok(())
        })
    }

    /// Ownership check used by the owner-only auth tier.
    pub fn is_owner(&self, app_id: &str, user_id: &str) -> Result<bool> {
        Ok(self
            .get_app(app_id)?
            .map(|app| app.user_id == user_id)
            .unwrap_or(false))
    }

    pub fn record_deployment(&self, id: &str, app_id: &str, url: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO deployments (id, app_id, url, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id, app_id, url, now_str()],
            )
            .context("record_deployment")?;
            Ok(())
        })
    }
}
