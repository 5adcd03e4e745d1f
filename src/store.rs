use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::env::Env;
use crate::error::{AgentError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Stopped,
    Paused,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Running => "running",
            RunState::Stopped => "stopped",
            RunState::Paused => "paused",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "running" => RunState::Running,
            "paused" => RunState::Paused,
            _ => RunState::Stopped,
        }
    }
}

/// Fact store for apps and their runtime settings.
pub struct AppStore {
    conn: Mutex<Connection>,
}

impl AppStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AgentError::Other("App store lock poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS apps (
                name TEXT PRIMARY KEY,
                run_state TEXT NOT NULL DEFAULT 'stopped',
                port INTEGER NOT NULL DEFAULT 0,
                hostname TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS env_vars (
                app TEXT NOT NULL REFERENCES apps(name) ON DELETE CASCADE,
                name TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (app, name)
            );

            CREATE INDEX IF NOT EXISTS idx_env_vars_app ON env_vars(app);
        ",
        )?;
        Ok(())
    }

    /// Insert the app row if missing.
    pub fn ensure_app(&self, app: &str) -> Result<()> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT OR IGNORE INTO apps (name, created_at, updated_at) VALUES (?1, ?2, ?2)",
            params![app, now],
        )?;
        Ok(())
    }

    pub fn list_apps(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT name FROM apps ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names)
    }

    /// Stopped when the app has never been recorded.
    pub fn run_state(&self, app: &str) -> Result<RunState> {
        let conn = self.conn()?;
        let state: Option<String> = conn
            .query_row("SELECT run_state FROM apps WHERE name = ?1", params![app], |row| row.get(0))
            .optional()?;
        Ok(state.map(|s| RunState::parse(&s)).unwrap_or(RunState::Stopped))
    }

    pub fn set_run_state(&self, app: &str, state: RunState) -> Result<()> {
        self.ensure_app(app)?;
        let conn = self.conn()?;
        conn.execute(
            "UPDATE apps SET run_state = ?1, updated_at = ?2 WHERE name = ?3",
            params![state.as_str(), Utc::now().to_rfc3339(), app],
        )?;
        Ok(())
    }

    pub fn port(&self, app: &str) -> Result<Option<u16>> {
        let conn = self.conn()?;
        let port: Option<i64> = conn
            .query_row("SELECT port FROM apps WHERE name = ?1", params![app], |row| row.get(0))
            .optional()?;
        Ok(port.filter(|p| *p > 0).and_then(|p| u16::try_from(p).ok()))
    }

    pub fn set_port(&self, app: &str, port: u16) -> Result<()> {
        self.ensure_app(app)?;
        let conn = self.conn()?;
        conn.execute(
            "UPDATE apps SET port = ?1, updated_at = ?2 WHERE name = ?3",
            params![port as i64, Utc::now().to_rfc3339(), app],
        )?;
        Ok(())
    }

    pub fn set_hostname(&self, app: &str, hostname: &str) -> Result<()> {
        self.ensure_app(app)?;
        let conn = self.conn()?;
        conn.execute(
            "UPDATE apps SET hostname = ?1, updated_at = ?2 WHERE name = ?3",
            params![hostname, Utc::now().to_rfc3339(), app],
        )?;
        Ok(())
    }

    /// Persisted runtime settings, in insertion order.
    pub fn runtime_env(&self, app: &str) -> Result<Env> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT name, value FROM env_vars WHERE app = ?1 ORDER BY rowid")?;
        let rows = stmt
            .query_map(params![app], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Env::from_pairs(rows))
    }

    /// Replace every runtime setting of `app` with `env`.
    pub fn set_runtime_env(&self, app: &str, env: &Env) -> Result<()> {
        self.ensure_app(app)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM env_vars WHERE app = ?1", params![app])?;
        for (name, value) in env.iter() {
            tx.execute(
                "INSERT INTO env_vars (app, name, value) VALUES (?1, ?2, ?3)",
                params![app, name, value],
            )?;
        }
        tx.execute(
            "UPDATE apps SET updated_at = ?1 WHERE name = ?2",
            params![Utc::now().to_rfc3339(), app],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn delete_app(&self, app: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM env_vars WHERE app = ?1", params![app])?;
        conn.execute("DELETE FROM apps WHERE name = ?1", params![app])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_app_is_stopped() {
        let store = AppStore::open_in_memory().unwrap();
        assert_eq!(store.run_state("ghost").unwrap(), RunState::Stopped);
        assert!(store.runtime_env("ghost").unwrap().is_empty());
        assert_eq!(store.port("ghost").unwrap(), None);
    }

    #[test]
    fn run_state_round_trips() {
        let store = AppStore::open_in_memory().unwrap();
        store.set_run_state("blog", RunState::Running).unwrap();
        assert_eq!(store.run_state("blog").unwrap(), RunState::Running);
        store.set_run_state("blog", RunState::Paused).unwrap();
        assert_eq!(store.run_state("blog").unwrap(), RunState::Paused);
        assert_eq!(store.list_apps().unwrap(), vec!["blog"]);
    }

    #[test]
    fn runtime_env_is_replaced_wholesale() {
        let store = AppStore::open_in_memory().unwrap();
        store
            .set_runtime_env("blog", &Env::from_pairs([("A", "1"), ("B", "2")]))
            .unwrap();
        store.set_runtime_env("blog", &Env::from_pairs([("B", "3")])).unwrap();

        let env = store.runtime_env("blog").unwrap();
        assert_eq!(env.len(), 1);
        assert_eq!(env.get("B"), Some("3"));
    }

    #[test]
    fn delete_removes_settings() {
        let store = AppStore::open_in_memory().unwrap();
        store.set_runtime_env("blog", &Env::from_pairs([("A", "1")])).unwrap();
        store.set_port("blog", 8123).unwrap();
        assert_eq!(store.port("blog").unwrap(), Some(8123));

        store.delete_app("blog").unwrap();
        assert!(store.list_apps().unwrap().is_empty());
        assert!(store.runtime_env("blog").unwrap().is_empty());
    }
}
