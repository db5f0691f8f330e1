//! Audit event persistence.
//!
//! Events are append-only rows recording every observable change to an
//! issue. They are written only from inside a mutation transaction (the
//! store batches them through its mutation context); this module owns the
//! SQL and the read surface.

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::error::Result;
use crate::model::{Event, EventType};

/// Append one event row. The row id is assigned by the database.
///
/// # Errors
///
/// Propagates database failures.
pub fn insert_event(conn: &Connection, event: &Event) -> Result<i64> {
    conn.execute(
        "INSERT INTO events (issue_id, event_type, actor, old_value, new_value, comment, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            event.issue_id,
            event.event_type.as_str(),
            event.actor,
            event.old_value,
            event.new_value,
            event.comment,
            event.created_at.to_rfc3339(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Events for one issue, newest first, up to `limit` (0 = unlimited).
///
/// # Errors
///
/// Propagates database failures.
pub fn events_for_issue(conn: &Connection, issue_id: &str, limit: usize) -> Result<Vec<Event>> {
    let mut sql = String::from(
        "SELECT id, issue_id, event_type, actor, old_value, new_value, comment, created_at
         FROM events WHERE issue_id = ? ORDER BY created_at DESC, id DESC",
    );
    if limit > 0 {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    let mut stmt = conn.prepare(&sql)?;
    let events = stmt
        .query_map([issue_id], event_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(events)
}

/// Events across all issues created strictly after `since`, oldest first,
/// up to `limit` (0 = unlimited). This is the feed consumers poll to tail
/// the audit log.
///
/// # Errors
///
/// Propagates database failures.
pub fn events_since(conn: &Connection, since: DateTime<Utc>, limit: usize) -> Result<Vec<Event>> {
    let mut sql = String::from(
        "SELECT id, issue_id, event_type, actor, old_value, new_value, comment, created_at
         FROM events WHERE created_at > ? ORDER BY created_at ASC, id ASC",
    );
    if limit > 0 {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    let mut stmt = conn.prepare(&sql)?;
    let events = stmt
        .query_map([since.to_rfc3339()], event_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(events)
}

/// Number of events recorded for an issue.
///
/// # Errors
///
/// Propagates database failures.
pub fn count_events(conn: &Connection, issue_id: &str) -> Result<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM events WHERE issue_id = ?",
        [issue_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

fn event_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let event_type: String = row.get(2)?;
    let created_at: String = row.get(7)?;
    Ok(Event {
        id: row.get(0)?,
        issue_id: row.get(1)?,
        event_type: EventType::from(event_type.as_str()),
        actor: row.get(3)?,
        old_value: row.get(4)?,
        new_value: row.get(5)?,
        comment: row.get(6)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_default(),
    })
}
