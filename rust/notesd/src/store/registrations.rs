use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{new_id, parse_column, RequestStatus};
use crate::db::now_ts;
use crate::error::{ServiceError, ServiceResult};

const REQUEST_COLUMNS: &str =
    "id, name, email, phone, school_name, student_count, status, requested_at, decided_at";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    pub id: String,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub school_name: Option<String>,
    pub student_count: Option<i64>,
    pub status: RequestStatus,
    pub requested_at: String,
    pub decided_at: Option<String>,
}

fn row_to_request(r: &Row<'_>) -> rusqlite::Result<RegistrationRequest> {
    Ok(RegistrationRequest {
        id: r.get(0)?,
        name: r.get(1)?,
        email: r.get(2)?,
        phone: r.get(3)?,
        school_name: r.get(4)?,
        student_count: r.get(5)?,
        status: parse_column(6, r.get(6)?, RequestStatus::parse)?,
        requested_at: r.get(7)?,
        decided_at: r.get(8)?,
    })
}

#[derive(Debug, Clone)]
pub struct NewRequest<'a> {
    pub name: &'a str,
    pub email: &'a str,
    pub phone: &'a str,
    pub school_name: Option<&'a str>,
    pub student_count: Option<i64>,
}

pub fn insert(conn: &Connection, new: &NewRequest<'_>) -> ServiceResult<RegistrationRequest> {
    let id = new_id();
    conn.execute(
        "INSERT INTO registration_requests(id, name, email, phone, school_name, student_count, status, requested_at)
         VALUES(?, ?, ?, ?, ?, ?, 'pendiente', ?)",
        rusqlite::params![
            id,
            new.name,
            new.email,
            new.phone,
            new.school_name,
            new.student_count,
            now_ts(),
        ],
    )?;
    find_by_id(conn, &id)?
        .ok_or_else(|| ServiceError::Internal("inserted request vanished".into()))
}

pub fn find_by_id(conn: &Connection, id: &str) -> ServiceResult<Option<RegistrationRequest>> {
    let sql = format!("SELECT {} FROM registration_requests WHERE id = ?", REQUEST_COLUMNS);
    Ok(conn.query_row(&sql, [id], row_to_request).optional()?)
}

pub fn pending_for_email(
    conn: &Connection,
    email: &str,
) -> ServiceResult<Option<RegistrationRequest>> {
    let sql = format!(
        "SELECT {} FROM registration_requests WHERE email = ? AND status = 'pendiente'",
        REQUEST_COLUMNS
    );
    Ok(conn.query_row(&sql, [email], row_to_request).optional()?)
}

/// Newest first; `None` lists every status.
pub fn list(
    conn: &Connection,
    status: Option<RequestStatus>,
) -> ServiceResult<Vec<RegistrationRequest>> {
    let sql = format!(
        "SELECT {} FROM registration_requests
         WHERE (?1 IS NULL OR status = ?1)
         ORDER BY requested_at DESC",
        REQUEST_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([status.map(RequestStatus::as_str)], row_to_request)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn set_status(conn: &Connection, id: &str, status: RequestStatus) -> ServiceResult<bool> {
    let n = conn.execute(
        "UPDATE registration_requests SET status = ?, decided_at = ? WHERE id = ?",
        (status.as_str(), now_ts(), id),
    )?;
    Ok(n > 0)
}

pub fn delete(conn: &Connection, id: &str) -> ServiceResult<bool> {
    let n = conn.execute("DELETE FROM registration_requests WHERE id = ?", [id])?;
    Ok(n > 0)
}

pub fn pending_count(conn: &Connection) -> ServiceResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM registration_requests WHERE status = 'pendiente'",
        [],
        |r| r.get(0),
    )?)
}
