use anyhow::{Context, Result};
use rusqlite::Connection;

use crate::model::{Chat, ChatKind, User};

/// An onboarding request waiting for an admin decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUser {
    pub user_id: i64,
    pub app: String,
    pub name: Option<String>,
    pub username: Option<String>,
    pub approved: bool,
    pub banned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingStatus {
    Approved,
    Banned,
}

pub(crate) fn list_users(conn: &Connection) -> Result<Vec<User>> {
    let mut stmt =
        conn.prepare("SELECT id, name, username, is_admin FROM users ORDER BY id ASC")?;
    let users = stmt
        .query_map([], |row| {
            Ok(User {
                id: row.get(0)?,
                name: row.get(1)?,
                username: row.get(2)?,
                is_admin: row.get(3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to load users")?;
    Ok(users)
}

/// Insert a user, or refresh the names of an existing one.
/// An existing admin flag is never revoked here.
pub(crate) fn insert_user(conn: &Connection, user: &User) -> Result<()> {
    conn.execute(
        "INSERT INTO users (id, name, username, is_admin) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET
            name = coalesce(excluded.name, users.name),
            username = coalesce(excluded.username, users.username),
            is_admin = users.is_admin OR excluded.is_admin",
        rusqlite::params![user.id, user.name, user.username, user.is_admin],
    )
    .with_context(|| format!("Failed to store user {}", user.id))?;
    Ok(())
}

pub(crate) fn list_chats(conn: &Connection) -> Result<Vec<Chat>> {
    let mut stmt = conn.prepare(
        "SELECT id, kind, title, username, first_name, last_name FROM chats ORDER BY id ASC",
    )?;
    let chats = stmt
        .query_map([], |row| {
            let kind: String = row.get(1)?;
            Ok(Chat {
                id: row.get(0)?,
                kind: ChatKind::parse(&kind),
                title: row.get(2)?,
                username: row.get(3)?,
                first_name: row.get(4)?,
                last_name: row.get(5)?,
                ..Default::default()
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to load chats")?;
    Ok(chats)
}

pub(crate) fn insert_chat(conn: &Connection, chat: &Chat) -> Result<()> {
    conn.execute(
        "INSERT INTO chats (id, kind, title, username, first_name, last_name)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO NOTHING",
        rusqlite::params![
            chat.id,
            chat.kind.as_str(),
            chat.title,
            chat.username,
            chat.first_name,
            chat.last_name,
        ],
    )
    .with_context(|| format!("Failed to store chat {}", chat.id))?;
    Ok(())
}

pub(crate) fn list_pending_users(conn: &Connection, app: &str) -> Result<Vec<PendingUser>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, app, name, username, approved, banned
         FROM pending_users WHERE app = ?1 ORDER BY created_at ASC",
    )?;
    let pending = stmt
        .query_map(rusqlite::params![app], |row| {
            Ok(PendingUser {
                user_id: row.get(0)?,
                app: row.get(1)?,
                name: row.get(2)?,
                username: row.get(3)?,
                approved: row.get(4)?,
                banned: row.get(5)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to load pending users")?;
    Ok(pending)
}

pub(crate) fn insert_pending_user(conn: &Connection, pending: &PendingUser) -> Result<()> {
    conn.execute(
        "INSERT INTO pending_users (user_id, app, name, username, approved, banned)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            pending.user_id,
            pending.app,
            pending.name,
            pending.username,
            pending.approved,
            pending.banned,
        ],
    )
    .context("Failed to insert pending user")?;
    Ok(())
}

pub(crate) fn set_pending_status(
    conn: &Connection,
    user_id: i64,
    app: &str,
    status: PendingStatus,
) -> Result<bool> {
    let (approved, banned) = match status {
        PendingStatus::Approved => (true, false),
        PendingStatus::Banned => (false, true),
    };
    let rows = conn
        .execute(
            "UPDATE pending_users SET approved = ?3, banned = ?4
             WHERE user_id = ?1 AND app = ?2",
            rusqlite::params![user_id, app, approved, banned],
        )
        .context("Failed to update pending user")?;
    Ok(rows > 0)
}
