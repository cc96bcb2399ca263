use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{new_id, parse_column, RelationType, Role};
use crate::db::now_ts;
use crate::error::ServiceResult;

const LINK_SELECT: &str = "SELECT
       sg.id, sg.student_id, sg.guardian_id,
       trim(u.first_name || ' ' || u.last_name), u.email,
       sg.relation_type, sg.active, sg.assigned_at, sg.removed_at
     FROM student_guardians sg
     JOIN users u ON u.id = sg.guardian_id";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardianLink {
    pub id: String,
    pub student_id: String,
    pub guardian_id: String,
    pub guardian_name: String,
    pub guardian_email: String,
    pub relation_type: RelationType,
    pub active: bool,
    pub assigned_at: String,
    pub removed_at: Option<String>,
}

fn row_to_link(r: &Row<'_>) -> rusqlite::Result<GuardianLink> {
    Ok(GuardianLink {
        id: r.get(0)?,
        student_id: r.get(1)?,
        guardian_id: r.get(2)?,
        guardian_name: r.get(3)?,
        guardian_email: r.get(4)?,
        relation_type: parse_column(5, r.get(5)?, RelationType::parse)?,
        active: r.get::<_, i64>(6)? != 0,
        assigned_at: r.get(7)?,
        removed_at: r.get(8)?,
    })
}

/// Active guardians of a student, principal first, then by assignment time.
pub fn active_links_for_student(
    conn: &Connection,
    student_id: &str,
) -> ServiceResult<Vec<GuardianLink>> {
    let sql = format!(
        "{} WHERE sg.student_id = ? AND sg.active = 1
         ORDER BY CASE sg.relation_type WHEN 'principal' THEN 0 ELSE 1 END, sg.assigned_at",
        LINK_SELECT
    );
    let mut stmt = conn.prepare(&sql)?;
    let links = stmt
        .query_map([student_id], row_to_link)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(links)
}

/// Every link the student ever had, removed ones included.
pub fn history_for_student(
    conn: &Connection,
    student_id: &str,
) -> ServiceResult<Vec<GuardianLink>> {
    let sql = format!(
        "{} WHERE sg.student_id = ? ORDER BY sg.assigned_at, sg.id",
        LINK_SELECT
    );
    let mut stmt = conn.prepare(&sql)?;
    let links = stmt
        .query_map([student_id], row_to_link)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(links)
}

pub fn active_link(
    conn: &Connection,
    student_id: &str,
    guardian_id: &str,
) -> ServiceResult<Option<GuardianLink>> {
    let sql = format!(
        "{} WHERE sg.student_id = ? AND sg.guardian_id = ? AND sg.active = 1",
        LINK_SELECT
    );
    Ok(conn
        .query_row(&sql, (student_id, guardian_id), row_to_link)
        .optional()?)
}

pub fn active_count(conn: &Connection, student_id: &str) -> ServiceResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM student_guardians WHERE student_id = ? AND active = 1",
        [student_id],
        |r| r.get(0),
    )?)
}

pub fn active_count_for_guardian(conn: &Connection, guardian_id: &str) -> ServiceResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM student_guardians WHERE guardian_id = ? AND active = 1",
        [guardian_id],
        |r| r.get(0),
    )?)
}

pub fn is_linked(conn: &Connection, student_id: &str, guardian_id: &str) -> ServiceResult<bool> {
    Ok(active_link(conn, student_id, guardian_id)?.is_some())
}

pub fn insert_link(
    conn: &Connection,
    student_id: &str,
    guardian_id: &str,
    relation: RelationType,
) -> ServiceResult<String> {
    let id = new_id();
    conn.execute(
        "INSERT INTO student_guardians(id, student_id, guardian_id, relation_type, active, assigned_at)
         VALUES(?, ?, ?, ?, 1, ?)",
        (&id, student_id, guardian_id, relation.as_str(), now_ts()),
    )?;
    Ok(id)
}

/// Soft delete; the row stays as history.
pub fn deactivate(conn: &Connection, student_id: &str, guardian_id: &str) -> ServiceResult<usize> {
    Ok(conn.execute(
        "UPDATE student_guardians SET active = 0, removed_at = ?
         WHERE student_id = ? AND guardian_id = ? AND active = 1",
        (now_ts(), student_id, guardian_id),
    )?)
}

pub fn set_relation(
    conn: &Connection,
    student_id: &str,
    guardian_id: &str,
    relation: RelationType,
) -> ServiceResult<usize> {
    Ok(conn.execute(
        "UPDATE student_guardians SET relation_type = ?
         WHERE student_id = ? AND guardian_id = ? AND active = 1",
        (relation.as_str(), student_id, guardian_id),
    )?)
}

/// Turns the student's active principal (if any) into a secondary guardian.
pub fn demote_principal(conn: &Connection, student_id: &str) -> ServiceResult<usize> {
    Ok(conn.execute(
        "UPDATE student_guardians SET relation_type = 'secundario'
         WHERE student_id = ? AND active = 1 AND relation_type = 'principal'",
        [student_id],
    )?)
}

/// Guardian an observation about this student is addressed to: the active
/// principal, otherwise the only active guardian.
pub fn addressed_guardian(conn: &Connection, student_id: &str) -> ServiceResult<Option<String>> {
    let links = active_links_for_student(conn, student_id)?;
    if let Some(p) = links
        .iter()
        .find(|l| l.relation_type == RelationType::Principal)
    {
        return Ok(Some(p.guardian_id.clone()));
    }
    if links.len() == 1 {
        return Ok(Some(links[0].guardian_id.clone()));
    }
    Ok(None)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardianStudent {
    pub student_id: String,
    pub first_name: String,
    pub last_name: String,
    pub grade: String,
    pub teacher_name: Option<String>,
    pub relation_type: RelationType,
    pub assigned_at: String,
}

pub fn students_for_guardian(
    conn: &Connection,
    guardian_id: &str,
) -> ServiceResult<Vec<GuardianStudent>> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.first_name, s.last_name, s.grade,
                CASE WHEN t.id IS NULL THEN NULL ELSE trim(t.first_name || ' ' || t.last_name) END,
                sg.relation_type, sg.assigned_at
         FROM student_guardians sg
         JOIN students s ON s.id = sg.student_id
         LEFT JOIN users t ON t.id = s.teacher_id
         WHERE sg.guardian_id = ? AND sg.active = 1
         ORDER BY s.last_name, s.first_name",
    )?;
    let rows = stmt
        .query_map([guardian_id], |r| {
            Ok(GuardianStudent {
                student_id: r.get(0)?,
                first_name: r.get(1)?,
                last_name: r.get(2)?,
                grade: r.get(3)?,
                teacher_name: r.get(4)?,
                relation_type: parse_column(5, r.get(5)?, RelationType::parse)?,
                assigned_at: r.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardianCandidate {
    pub id: String,
    pub name: String,
    pub email: String,
    pub active_students: i64,
}

/// Active guardian accounts, minus those already actively linked to
/// `student_id` when given.
pub fn available_guardians(
    conn: &Connection,
    student_id: Option<&str>,
) -> ServiceResult<Vec<GuardianCandidate>> {
    let mut stmt = conn.prepare(
        "SELECT u.id, trim(u.first_name || ' ' || u.last_name), u.email,
                (SELECT COUNT(*) FROM student_guardians x
                 WHERE x.guardian_id = u.id AND x.active = 1)
         FROM users u
         WHERE u.role_id = ?1 AND u.active = 1
           AND (?2 IS NULL OR NOT EXISTS (
             SELECT 1 FROM student_guardians sg
             WHERE sg.guardian_id = u.id AND sg.student_id = ?2 AND sg.active = 1
           ))
         ORDER BY u.last_name, u.first_name",
    )?;
    let rows = stmt
        .query_map((Role::Guardian.id(), student_id), |r| {
            Ok(GuardianCandidate {
                id: r.get(0)?,
                name: r.get(1)?,
                email: r.get(2)?,
                active_students: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
