use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{new_id, parse_column, ObservationKind};
use crate::db::now_ts;
use crate::error::{ServiceError, ServiceResult};

pub(crate) const OBSERVATION_COLUMNS: &str = "o.id, o.title, o.description, o.kind,
       o.teacher_id, trim(t.first_name || ' ' || t.last_name),
       o.student_id, trim(s.first_name || ' ' || s.last_name),
       o.guardian_id, o.created_at, o.updated_at,
       (SELECT COUNT(*) FROM media m WHERE m.observation_id = o.id)";

pub(crate) const OBSERVATION_FROM: &str = "FROM observations o
     JOIN users t ON t.id = o.teacher_id
     JOIN students s ON s.id = o.student_id";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub id: String,
    pub title: String,
    pub description: String,
    pub kind: ObservationKind,
    pub teacher_id: String,
    pub teacher_name: String,
    pub student_id: String,
    pub student_name: String,
    pub guardian_id: Option<String>,
    pub created_at: String,
    pub updated_at: Option<String>,
    pub media_count: i64,
}

/// Maps the twelve leading `OBSERVATION_COLUMNS`.
pub(crate) fn row_to_observation(r: &Row<'_>) -> rusqlite::Result<Observation> {
    Ok(Observation {
        id: r.get(0)?,
        title: r.get(1)?,
        description: r.get(2)?,
        kind: parse_column(3, r.get(3)?, ObservationKind::parse)?,
        teacher_id: r.get(4)?,
        teacher_name: r.get(5)?,
        student_id: r.get(6)?,
        student_name: r.get(7)?,
        guardian_id: r.get(8)?,
        created_at: r.get(9)?,
        updated_at: r.get(10)?,
        media_count: r.get(11)?,
    })
}

#[derive(Debug, Clone)]
pub struct NewObservation<'a> {
    pub title: &'a str,
    pub description: &'a str,
    pub kind: ObservationKind,
    pub teacher_id: &'a str,
    pub student_id: &'a str,
    pub guardian_id: Option<&'a str>,
}

pub fn insert(conn: &Connection, new: &NewObservation<'_>) -> ServiceResult<Observation> {
    let id = new_id();
    conn.execute(
        "INSERT INTO observations(id, title, description, kind, teacher_id, student_id, guardian_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            id,
            new.title,
            new.description,
            new.kind.as_str(),
            new.teacher_id,
            new.student_id,
            new.guardian_id,
            now_ts(),
        ],
    )?;
    find_by_id(conn, &id)?
        .ok_or_else(|| ServiceError::Internal("inserted observation vanished".into()))
}

pub fn find_by_id(conn: &Connection, id: &str) -> ServiceResult<Option<Observation>> {
    let sql = format!(
        "SELECT {} {} WHERE o.id = ?",
        OBSERVATION_COLUMNS, OBSERVATION_FROM
    );
    Ok(conn.query_row(&sql, [id], row_to_observation).optional()?)
}

/// Newest first. Both filters are optional.
pub fn list(
    conn: &Connection,
    teacher_id: Option<&str>,
    student_id: Option<&str>,
) -> ServiceResult<Vec<Observation>> {
    let sql = format!(
        "SELECT {} {}
         WHERE (?1 IS NULL OR o.teacher_id = ?1) AND (?2 IS NULL OR o.student_id = ?2)
         ORDER BY o.created_at DESC",
        OBSERVATION_COLUMNS, OBSERVATION_FROM
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map((teacher_id, student_id), row_to_observation)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn update(
    conn: &Connection,
    id: &str,
    title: &str,
    description: &str,
    kind: ObservationKind,
) -> ServiceResult<bool> {
    let n = conn.execute(
        "UPDATE observations SET title = ?, description = ?, kind = ?, updated_at = ? WHERE id = ?",
        (title, description, kind.as_str(), now_ts(), id),
    )?;
    Ok(n > 0)
}

/// Deletes the observation with its receipts and media rows; returns the
/// media paths for file removal after commit. Callers wrap this in a
/// transaction.
pub fn delete(conn: &Connection, id: &str) -> ServiceResult<Option<Vec<String>>> {
    let mut stmt = conn.prepare("SELECT stored_path FROM media WHERE observation_id = ?")?;
    let paths = stmt
        .query_map([id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    conn.execute("DELETE FROM observation_receipts WHERE observation_id = ?", [id])?;
    conn.execute("DELETE FROM media WHERE observation_id = ?", [id])?;
    let n = conn.execute("DELETE FROM observations WHERE id = ?", [id])?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(paths))
}

pub fn count(conn: &Connection) -> ServiceResult<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM observations", [], |r| r.get(0))?)
}
