use rusqlite::Connection;
use serde::Serialize;

use super::{new_id, parse_column, AuditAction};
use crate::db::now_ts;
use crate::error::ServiceResult;

pub const DEFAULT_PAGE_SIZE: i64 = 25;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: String,
    pub admin_id: String,
    pub admin_email: Option<String>,
    pub user_id: String,
    pub user_email: Option<String>,
    pub action: AuditAction,
    pub details: Option<String>,
    pub created_at: String,
}

pub fn record(
    conn: &Connection,
    admin_id: &str,
    user_id: &str,
    action: AuditAction,
    details: Option<&str>,
) -> ServiceResult<()> {
    conn.execute(
        "INSERT INTO user_audit_logs(id, admin_id, user_id, action, details, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (new_id(), admin_id, user_id, action.as_str(), details, now_ts()),
    )?;
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Inclusive lower bound (date or timestamp).
    pub start: Option<String>,
    /// Inclusive upper bound; a bare date covers the whole day.
    pub end: Option<String>,
    pub action: Option<AuditAction>,
    pub admin_id: Option<String>,
    /// Substring of details, admin/user email or action.
    pub text: Option<String>,
    pub offset: i64,
    pub limit: i64,
}

const AUDIT_FROM_WHERE: &str = "FROM user_audit_logs l
     LEFT JOIN users a ON a.id = l.admin_id
     LEFT JOIN users u ON u.id = l.user_id
     WHERE (?1 IS NULL OR l.created_at >= ?1)
       AND (?2 IS NULL OR substr(l.created_at, 1, length(?2)) <= ?2)
       AND (?3 IS NULL OR l.action = ?3)
       AND (?4 IS NULL OR l.admin_id = ?4)
       AND (?5 IS NULL
            OR l.details LIKE ?5 OR a.email LIKE ?5 OR u.email LIKE ?5 OR l.action LIKE ?5)";

/// One page of entries, newest first, plus the total matching count.
pub fn list(conn: &Connection, filter: &AuditFilter) -> ServiceResult<(Vec<AuditEntry>, i64)> {
    let like = filter.text.as_ref().map(|t| format!("%{}%", t));
    let args = (
        filter.start.as_deref(),
        filter.end.as_deref(),
        filter.action.map(AuditAction::as_str),
        filter.admin_id.as_deref(),
        like.as_deref(),
    );

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) {}", AUDIT_FROM_WHERE),
        args,
        |r| r.get(0),
    )?;

    let limit = if filter.limit > 0 {
        filter.limit
    } else {
        DEFAULT_PAGE_SIZE
    };
    let sql = format!(
        "SELECT l.id, l.admin_id, a.email, l.user_id, u.email, l.action, l.details, l.created_at
         {}
         ORDER BY l.created_at DESC
         LIMIT ?6 OFFSET ?7",
        AUDIT_FROM_WHERE
    );
    let mut stmt = conn.prepare(&sql)?;
    let entries = stmt
        .query_map(
            (args.0, args.1, args.2, args.3, args.4, limit, filter.offset.max(0)),
            row_to_entry,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok((entries, total))
}

pub fn recent(conn: &Connection, limit: i64) -> ServiceResult<Vec<AuditEntry>> {
    let (entries, _) = list(
        conn,
        &AuditFilter {
            limit,
            ..AuditFilter::default()
        },
    )?;
    Ok(entries)
}

fn row_to_entry(r: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    Ok(AuditEntry {
        id: r.get(0)?,
        admin_id: r.get(1)?,
        admin_email: r.get(2)?,
        user_id: r.get(3)?,
        user_email: r.get(4)?,
        action: parse_column(5, r.get(5)?, AuditAction::parse)?,
        details: r.get(6)?,
        created_at: r.get(7)?,
    })
}
