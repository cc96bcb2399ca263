use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{new_id, parse_column, MediaKind};
use crate::db::now_ts;
use crate::error::ServiceResult;

const MEDIA_SELECT: &str = "SELECT m.id, m.observation_id, m.file_name, m.kind, m.stored_path,
            m.size_bytes, m.sha256, m.uploaded_by, m.uploaded_at
     FROM media m";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Media {
    pub id: String,
    pub observation_id: String,
    pub file_name: String,
    pub kind: MediaKind,
    /// Relative to the workspace root.
    pub stored_path: String,
    pub size_bytes: i64,
    pub sha256: String,
    pub uploaded_by: Option<String>,
    pub uploaded_at: String,
}

fn row_to_media(r: &Row<'_>) -> rusqlite::Result<Media> {
    Ok(Media {
        id: r.get(0)?,
        observation_id: r.get(1)?,
        file_name: r.get(2)?,
        kind: parse_column(3, r.get(3)?, MediaKind::parse)?,
        stored_path: r.get(4)?,
        size_bytes: r.get(5)?,
        sha256: r.get(6)?,
        uploaded_by: r.get(7)?,
        uploaded_at: r.get(8)?,
    })
}

#[derive(Debug, Clone)]
pub struct NewMedia<'a> {
    pub observation_id: &'a str,
    pub file_name: &'a str,
    pub kind: MediaKind,
    pub stored_path: &'a str,
    pub size_bytes: i64,
    pub sha256: &'a str,
    pub uploaded_by: Option<&'a str>,
}

pub fn insert(conn: &Connection, new: &NewMedia<'_>) -> ServiceResult<Media> {
    let id = new_id();
    let uploaded_at = now_ts();
    conn.execute(
        "INSERT INTO media(id, observation_id, file_name, kind, stored_path, size_bytes, sha256, uploaded_by, uploaded_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            id,
            new.observation_id,
            new.file_name,
            new.kind.as_str(),
            new.stored_path,
            new.size_bytes,
            new.sha256,
            new.uploaded_by,
            uploaded_at,
        ],
    )?;
    Ok(Media {
        id,
        observation_id: new.observation_id.to_string(),
        file_name: new.file_name.to_string(),
        kind: new.kind,
        stored_path: new.stored_path.to_string(),
        size_bytes: new.size_bytes,
        sha256: new.sha256.to_string(),
        uploaded_by: new.uploaded_by.map(str::to_string),
        uploaded_at,
    })
}

pub fn find_by_id(conn: &Connection, id: &str) -> ServiceResult<Option<Media>> {
    let sql = format!("{} WHERE m.id = ?", MEDIA_SELECT);
    Ok(conn.query_row(&sql, [id], row_to_media).optional()?)
}

pub fn list_for_observation(conn: &Connection, observation_id: &str) -> ServiceResult<Vec<Media>> {
    let sql = format!(
        "{} WHERE m.observation_id = ? ORDER BY m.uploaded_at, m.id",
        MEDIA_SELECT
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([observation_id], row_to_media)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Media attached to any observation about the student, newest first.
pub fn list_for_student(conn: &Connection, student_id: &str) -> ServiceResult<Vec<Media>> {
    let sql = format!(
        "{} JOIN observations o ON o.id = m.observation_id
         WHERE o.student_id = ?
         ORDER BY m.uploaded_at DESC, m.id",
        MEDIA_SELECT
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([student_id], row_to_media)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn delete(conn: &Connection, id: &str) -> ServiceResult<bool> {
    let n = conn.execute("DELETE FROM media WHERE id = ?", [id])?;
    Ok(n > 0)
}

/// (count, total bytes)
pub fn totals(conn: &Connection) -> ServiceResult<(i64, i64)> {
    Ok(conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM media",
        [],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?)
}
