use rusqlite::Connection;
use serde::Serialize;

use super::new_id;
use crate::db::{now_ts, today_prefix};
use crate::error::ServiceResult;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLog {
    pub id: String,
    pub user_id: String,
    pub user_email: Option<String>,
    pub user_name: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub login_at: String,
    pub logout_at: Option<String>,
}

pub fn open_log(
    conn: &Connection,
    user_id: &str,
    ip: Option<&str>,
    user_agent: Option<&str>,
) -> ServiceResult<String> {
    let id = new_id();
    conn.execute(
        "INSERT INTO session_logs(id, user_id, ip_address, user_agent, login_at) VALUES(?, ?, ?, ?, ?)",
        (&id, user_id, ip, user_agent, now_ts()),
    )?;
    Ok(id)
}

pub fn close_log(conn: &Connection, id: &str) -> ServiceResult<bool> {
    let n = conn.execute(
        "UPDATE session_logs SET logout_at = ? WHERE id = ? AND logout_at IS NULL",
        (now_ts(), id),
    )?;
    Ok(n > 0)
}

/// Sessions live in process memory; logs left open by an earlier process
/// can never be closed by a logout.
pub fn close_dangling(conn: &Connection) -> ServiceResult<usize> {
    Ok(conn.execute(
        "UPDATE session_logs SET logout_at = ? WHERE logout_at IS NULL",
        [now_ts()],
    )?)
}

pub fn list(conn: &Connection, limit: i64) -> ServiceResult<Vec<SessionLog>> {
    let mut stmt = conn.prepare(
        "SELECT l.id, l.user_id, u.email,
                CASE WHEN u.id IS NULL THEN NULL ELSE trim(u.first_name || ' ' || u.last_name) END,
                l.ip_address, l.user_agent, l.login_at, l.logout_at
         FROM session_logs l
         LEFT JOIN users u ON u.id = l.user_id
         ORDER BY l.login_at DESC
         LIMIT ?",
    )?;
    let rows = stmt
        .query_map([limit], |r| {
            Ok(SessionLog {
                id: r.get(0)?,
                user_id: r.get(1)?,
                user_email: r.get(2)?,
                user_name: r.get(3)?,
                ip_address: r.get(4)?,
                user_agent: r.get(5)?,
                login_at: r.get(6)?,
                logout_at: r.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub total: i64,
    pub today: i64,
    pub unique_users_today: i64,
    pub open: i64,
}

pub fn stats(conn: &Connection) -> ServiceResult<SessionStats> {
    let today = format!("{}%", today_prefix());
    Ok(conn.query_row(
        "SELECT
           COUNT(*),
           COALESCE(SUM(login_at LIKE ?1), 0),
           COUNT(DISTINCT CASE WHEN login_at LIKE ?1 THEN user_id END),
           COALESCE(SUM(logout_at IS NULL), 0)
         FROM session_logs",
        [today],
        |r| {
            Ok(SessionStats {
                total: r.get(0)?,
                today: r.get(1)?,
                unique_users_today: r.get(2)?,
                open: r.get(3)?,
            })
        },
    )?)
}
