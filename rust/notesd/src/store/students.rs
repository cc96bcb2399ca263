use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;

use super::new_id;
use crate::db::now_ts;
use crate::error::{ServiceError, ServiceResult};

const STUDENT_SELECT: &str = "SELECT
       s.id, s.first_name, s.last_name, s.grade, s.birth_date, s.teacher_id,
       CASE WHEN t.id IS NULL THEN NULL ELSE trim(t.first_name || ' ' || t.last_name) END,
       s.enrolled_at, s.health_provider, s.special_conditions, s.active,
       s.created_at, s.updated_at
     FROM students s
     LEFT JOIN users t ON t.id = s.teacher_id";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub grade: String,
    pub birth_date: Option<String>,
    pub teacher_id: Option<String>,
    pub teacher_name: Option<String>,
    pub enrolled_at: Option<String>,
    pub health_provider: Option<String>,
    pub special_conditions: Option<String>,
    pub active: bool,
    pub created_at: String,
    pub updated_at: Option<String>,
}

/// Editable student fields, used for both create and update.
#[derive(Debug, Clone, Default)]
pub struct StudentFields {
    pub first_name: String,
    pub last_name: String,
    pub grade: String,
    pub birth_date: Option<String>,
    pub teacher_id: Option<String>,
    pub enrolled_at: Option<String>,
    pub health_provider: Option<String>,
    pub special_conditions: Option<String>,
    pub active: bool,
}

fn row_to_student(r: &Row<'_>) -> rusqlite::Result<Student> {
    Ok(Student {
        id: r.get(0)?,
        first_name: r.get(1)?,
        last_name: r.get(2)?,
        grade: r.get(3)?,
        birth_date: r.get(4)?,
        teacher_id: r.get(5)?,
        teacher_name: r.get(6)?,
        enrolled_at: r.get(7)?,
        health_provider: r.get(8)?,
        special_conditions: r.get(9)?,
        active: r.get::<_, i64>(10)? != 0,
        created_at: r.get(11)?,
        updated_at: r.get(12)?,
    })
}

pub fn find_by_id(conn: &Connection, id: &str) -> ServiceResult<Option<Student>> {
    let sql = format!("{} WHERE s.id = ?", STUDENT_SELECT);
    Ok(conn.query_row(&sql, [id], row_to_student).optional()?)
}

pub fn exists(conn: &Connection, id: &str) -> ServiceResult<bool> {
    let hit: Option<i64> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [id], |r| r.get(0))
        .optional()?;
    Ok(hit.is_some())
}

/// All students, or only those assigned to `teacher_id`.
pub fn list(conn: &Connection, teacher_id: Option<&str>) -> ServiceResult<Vec<Student>> {
    let sql = format!(
        "{} WHERE (?1 IS NULL OR s.teacher_id = ?1)
         ORDER BY s.last_name, s.first_name",
        STUDENT_SELECT
    );
    let mut stmt = conn.prepare(&sql)?;
    let students = stmt
        .query_map([teacher_id], row_to_student)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(students)
}

pub fn insert(conn: &Connection, fields: &StudentFields) -> ServiceResult<Student> {
    let id = new_id();
    conn.execute(
        "INSERT INTO students(id, first_name, last_name, grade, birth_date, teacher_id,
                              enrolled_at, health_provider, special_conditions, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            id,
            fields.first_name,
            fields.last_name,
            fields.grade,
            fields.birth_date,
            fields.teacher_id,
            fields.enrolled_at,
            fields.health_provider,
            fields.special_conditions,
            fields.active as i64,
            now_ts(),
        ],
    )?;
    find_by_id(conn, &id)?
        .ok_or_else(|| ServiceError::Internal("inserted student vanished".into()))
}

pub fn update(conn: &Connection, id: &str, fields: &StudentFields) -> ServiceResult<bool> {
    let n = conn.execute(
        "UPDATE students SET
           first_name = ?, last_name = ?, grade = ?, birth_date = ?, teacher_id = ?,
           enrolled_at = ?, health_provider = ?, special_conditions = ?, active = ?,
           updated_at = ?
         WHERE id = ?",
        rusqlite::params![
            fields.first_name,
            fields.last_name,
            fields.grade,
            fields.birth_date,
            fields.teacher_id,
            fields.enrolled_at,
            fields.health_provider,
            fields.special_conditions,
            fields.active as i64,
            now_ts(),
            id,
        ],
    )?;
    Ok(n > 0)
}

pub fn set_teacher(conn: &Connection, id: &str, teacher_id: Option<&str>) -> ServiceResult<bool> {
    let n = conn.execute(
        "UPDATE students SET teacher_id = ?, updated_at = ? WHERE id = ?",
        (teacher_id, now_ts(), id),
    )?;
    Ok(n > 0)
}

pub fn is_assigned_to_teacher(
    conn: &Connection,
    student_id: &str,
    teacher_id: &str,
) -> ServiceResult<bool> {
    let hit: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM students WHERE id = ? AND teacher_id = ?",
            (student_id, teacher_id),
            |r| r.get(0),
        )
        .optional()?;
    Ok(hit.is_some())
}

/// Removes the student and everything hanging off it. Returns the stored
/// paths of the deleted media so the caller can remove the files after the
/// transaction commits. Callers wrap this in a transaction.
pub fn delete(conn: &Connection, id: &str) -> ServiceResult<Option<Vec<String>>> {
    if !exists(conn, id)? {
        return Ok(None);
    }

    let mut stmt = conn.prepare(
        "SELECT m.stored_path
         FROM media m
         JOIN observations o ON o.id = m.observation_id
         WHERE o.student_id = ?",
    )?;
    let paths = stmt
        .query_map([id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    // Explicit dependency order (no ON DELETE CASCADE).
    conn.execute(
        "DELETE FROM observation_receipts
         WHERE observation_id IN (SELECT id FROM observations WHERE student_id = ?)",
        [id],
    )?;
    conn.execute(
        "DELETE FROM media
         WHERE observation_id IN (SELECT id FROM observations WHERE student_id = ?)",
        [id],
    )?;
    conn.execute("DELETE FROM observations WHERE student_id = ?", [id])?;
    conn.execute("DELETE FROM student_guardians WHERE student_id = ?", [id])?;
    conn.execute("DELETE FROM students WHERE id = ?", [id])?;
    Ok(Some(paths))
}

pub fn count(conn: &Connection) -> ServiceResult<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM students", [], |r| r.get(0))?)
}
