pub mod functions;
pub mod users;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::info;

use crate::model::{Chat, RunningFunction, User};
pub use users::{PendingStatus, PendingUser};

/// Persistence contract consumed by the manager and by function handlers
#[async_trait]
pub trait Store: Send + Sync {
    async fn list_users(&self) -> Result<Vec<User>>;
    async fn insert_user(&self, user: &User) -> Result<()>;
    async fn list_chats(&self) -> Result<Vec<Chat>>;
    async fn insert_chat(&self, chat: &Chat) -> Result<()>;

    async fn list_pending_users(&self, app: &str) -> Result<Vec<PendingUser>>;
    async fn insert_pending_user(&self, pending: &PendingUser) -> Result<()>;
    async fn set_pending_status(&self, user_id: i64, app: &str, status: PendingStatus)
        -> Result<bool>;
    /// Registers user and chat and approves the pending request atomically
    async fn approve_pending_user(&self, user: &User, chat: &Chat, app: &str) -> Result<()>;

    async fn list_running_functions(&self, chat_id: i64) -> Result<Vec<RunningFunction>>;
    /// (chat id, function id) pairs currently stored
    async fn running_function_keys(&self) -> Result<HashSet<(i64, u32)>>;
    async fn insert_running_function(&self, function: &RunningFunction) -> Result<()>;
    async fn update_running_function(&self, function: &RunningFunction) -> Result<()>;
    async fn delete_running_function(&self, chat_id: i64, id: u32) -> Result<bool>;
    async fn delete_stale_running_functions(&self, max_age: Duration) -> Result<usize>;
}

/// Thread-safe SQLite store for users, chats and running functions
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // journal_mode PRAGMA always returns the resulting mode, so use query_row
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        // Run migrations on the raw connection before wrapping in Mutex.
        Self::run_migrations(&conn)?;

        info!("Store initialized at: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                name TEXT,
                username TEXT,
                is_admin INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS chats (
                id INTEGER PRIMARY KEY,
                kind TEXT NOT NULL,
                title TEXT,
                username TEXT,
                first_name TEXT,
                last_name TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS pending_users (
                user_id INTEGER NOT NULL,
                app TEXT NOT NULL,
                name TEXT,
                username TEXT,
                approved INTEGER NOT NULL DEFAULT 0,
                banned INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (user_id, app)
            );

            CREATE TABLE IF NOT EXISTS running_functions (
                chat_id INTEGER NOT NULL,
                id INTEGER NOT NULL,
                name TEXT NOT NULL,
                state INTEGER NOT NULL,
                previous_state INTEGER NOT NULL,
                open_for_messages INTEGER NOT NULL,
                callback_message_id INTEGER,
                settings TEXT NOT NULL,
                update_id INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (chat_id, id)
            );

            CREATE INDEX IF NOT EXISTS idx_running_functions_updated
                ON running_functions(updated_at);
            ",
        )
        .context("Failed to run migrations")?;
        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn list_users(&self) -> Result<Vec<User>> {
        let conn = self.conn.lock().await;
        users::list_users(&conn)
    }

    async fn insert_user(&self, user: &User) -> Result<()> {
        let conn = self.conn.lock().await;
        users::insert_user(&conn, user)
    }

    async fn list_chats(&self) -> Result<Vec<Chat>> {
        let conn = self.conn.lock().await;
        users::list_chats(&conn)
    }

    async fn insert_chat(&self, chat: &Chat) -> Result<()> {
        let conn = self.conn.lock().await;
        users::insert_chat(&conn, chat)
    }

    async fn list_pending_users(&self, app: &str) -> Result<Vec<PendingUser>> {
        let conn = self.conn.lock().await;
        users::list_pending_users(&conn, app)
    }

    async fn insert_pending_user(&self, pending: &PendingUser) -> Result<()> {
        let conn = self.conn.lock().await;
        users::insert_pending_user(&conn, pending)
    }

    async fn set_pending_status(
        &self,
        user_id: i64,
        app: &str,
        status: PendingStatus,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        users::set_pending_status(&conn, user_id, app, status)
    }

    async fn approve_pending_user(&self, user: &User, chat: &Chat, app: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().context("Failed to begin approval")?;
        users::insert_user(&tx, user)?;
        users::insert_chat(&tx, chat)?;
        users::set_pending_status(&tx, user.id, app, PendingStatus::Approved)?;
        tx.commit().context("Failed to commit approval")?;
        Ok(())
    }

    async fn list_running_functions(&self, chat_id: i64) -> Result<Vec<RunningFunction>> {
        let conn = self.conn.lock().await;
        functions::list_running_functions(&conn, chat_id)
    }

    async fn running_function_keys(&self) -> Result<HashSet<(i64, u32)>> {
        let conn = self.conn.lock().await;
        functions::running_function_keys(&conn)
    }

    async fn insert_running_function(&self, function: &RunningFunction) -> Result<()> {
        let conn = self.conn.lock().await;
        functions::insert_running_function(&conn, function)
    }

    async fn update_running_function(&self, function: &RunningFunction) -> Result<()> {
        let conn = self.conn.lock().await;
        functions::update_running_function(&conn, function)
    }

    async fn delete_running_function(&self, chat_id: i64, id: u32) -> Result<bool> {
        let conn = self.conn.lock().await;
        functions::delete_running_function(&conn, chat_id, id)
    }

    async fn delete_stale_running_functions(&self, max_age: Duration) -> Result<usize> {
        let conn = self.conn.lock().await;
        functions::delete_stale_running_functions(&conn, max_age)
    }
}
