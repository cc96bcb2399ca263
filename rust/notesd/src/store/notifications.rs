use rusqlite::Connection;
use serde::Serialize;

use super::new_id;
use crate::db::now_ts;
use crate::error::ServiceResult;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub title: String,
    pub message: String,
    pub kind: String,
    pub priority: String,
    pub is_read: bool,
    pub created_at: String,
}

pub fn create(
    conn: &Connection,
    title: &str,
    message: &str,
    kind: &str,
    priority: &str,
) -> ServiceResult<String> {
    let id = new_id();
    conn.execute(
        "INSERT INTO system_notifications(id, title, message, kind, priority, is_read, created_at)
         VALUES(?, ?, ?, ?, ?, 0, ?)",
        (&id, title, message, kind, priority, now_ts()),
    )?;
    Ok(id)
}

pub fn recent(conn: &Connection, limit: i64) -> ServiceResult<Vec<Notification>> {
    let mut stmt = conn.prepare(
        "SELECT id, title, message, kind, priority, is_read, created_at
         FROM system_notifications
         ORDER BY created_at DESC
         LIMIT ?",
    )?;
    let rows = stmt
        .query_map([limit], |r| {
            Ok(Notification {
                id: r.get(0)?,
                title: r.get(1)?,
                message: r.get(2)?,
                kind: r.get(3)?,
                priority: r.get(4)?,
                is_read: r.get::<_, i64>(5)? != 0,
                created_at: r.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn unread_count(conn: &Connection) -> ServiceResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM system_notifications WHERE is_read = 0",
        [],
        |r| r.get(0),
    )?)
}

pub fn mark_read(conn: &Connection, id: &str) -> ServiceResult<bool> {
    let n = conn.execute(
        "UPDATE system_notifications SET is_read = 1 WHERE id = ?",
        [id],
    )?;
    Ok(n > 0)
}

pub fn mark_all_read(conn: &Connection) -> ServiceResult<usize> {
    Ok(conn.execute(
        "UPDATE system_notifications SET is_read = 1 WHERE is_read = 0",
        [],
    )?)
}
