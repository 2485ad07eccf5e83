use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::model::{RunningFunction, Settings};

const COLUMNS: &str = "chat_id, id, name, state, previous_state, open_for_messages,
                       callback_message_id, settings, update_id, created_at, updated_at";

pub(crate) fn list_running_functions(
    conn: &Connection,
    chat_id: i64,
) -> Result<Vec<RunningFunction>> {
    let sql = format!(
        "SELECT {} FROM running_functions WHERE chat_id = ?1 ORDER BY id ASC",
        COLUMNS
    );
    let mut stmt = conn.prepare(&sql).context("Failed to prepare query")?;
    let functions = stmt
        .query_map(rusqlite::params![chat_id], parse_function_row)
        .context("Failed to map rows")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to load running functions")?;
    Ok(functions)
}

pub(crate) fn running_function_keys(conn: &Connection) -> Result<HashSet<(i64, u32)>> {
    let mut stmt = conn.prepare("SELECT chat_id, id FROM running_functions")?;
    let keys = stmt
        .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, u32>(1)?)))?
        .collect::<rusqlite::Result<HashSet<_>>>()
        .context("Failed to list running function ids")?;
    Ok(keys)
}

pub(crate) fn insert_running_function(conn: &Connection, function: &RunningFunction) -> Result<()> {
    let settings = serde_json::to_string(&function.settings)?;
    let sql = format!(
        "INSERT INTO running_functions ({}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
        COLUMNS
    );
    conn.execute(
        &sql,
        rusqlite::params![
            function.chat_id,
            function.id,
            function.name,
            function.state,
            function.previous_state,
            function.open_for_messages,
            function.callback_message_id,
            settings,
            function.update_id,
            function.created_at,
            function.updated_at,
        ],
    )
    .with_context(|| {
        format!(
            "Failed to insert running function {} in chat {}",
            function.id, function.chat_id
        )
    })?;
    Ok(())
}

pub(crate) fn update_running_function(conn: &Connection, function: &RunningFunction) -> Result<()> {
    let settings = serde_json::to_string(&function.settings)?;
    let rows = conn
        .execute(
            "UPDATE running_functions
             SET name = ?3, state = ?4, previous_state = ?5, open_for_messages = ?6,
                 callback_message_id = ?7, settings = ?8, update_id = ?9, updated_at = ?10
             WHERE chat_id = ?1 AND id = ?2",
            rusqlite::params![
                function.chat_id,
                function.id,
                function.name,
                function.state,
                function.previous_state,
                function.open_for_messages,
                function.callback_message_id,
                settings,
                function.update_id,
                function.updated_at,
            ],
        )
        .context("Failed to update running function")?;

    if rows == 0 {
        anyhow::bail!(
            "Running function {} in chat {} is not stored",
            function.id,
            function.chat_id
        );
    }
    Ok(())
}

pub(crate) fn delete_running_function(conn: &Connection, chat_id: i64, id: u32) -> Result<bool> {
    let rows = conn
        .execute(
            "DELETE FROM running_functions WHERE chat_id = ?1 AND id = ?2",
            rusqlite::params![chat_id, id],
        )
        .context("Failed to delete running function")?;
    Ok(rows > 0)
}

pub(crate) fn delete_stale_running_functions(conn: &Connection, max_age: Duration) -> Result<usize> {
    let max_age = chrono::Duration::from_std(max_age).context("Stale threshold out of range")?;
    let cutoff: DateTime<Utc> = Utc::now() - max_age;
    let rows = conn
        .execute(
            "DELETE FROM running_functions WHERE updated_at < ?1",
            rusqlite::params![cutoff],
        )
        .context("Failed to delete stale running functions")?;
    Ok(rows)
}

fn parse_function_row(row: &rusqlite::Row) -> rusqlite::Result<RunningFunction> {
    let settings_json: String = row.get(7)?;
    let settings: Settings = serde_json::from_str(&settings_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(RunningFunction {
        chat_id: row.get(0)?,
        id: row.get(1)?,
        name: row.get(2)?,
        state: row.get(3)?,
        previous_state: row.get(4)?,
        open_for_messages: row.get(5)?,
        callback_message_id: row.get(6)?,
        settings,
        update_id: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}
