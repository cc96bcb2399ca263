use rusqlite::Connection;
use serde::Serialize;
use std::path::Path;

use super::uploads::remove_stored_file;
use crate::error::{ServiceError, ServiceResult};
use crate::store::guardians::{self, GuardianLink};
use crate::store::students::{self, Student, StudentFields};
use crate::store::{users, Role};

/// Student plus its active guardians, as listed for administrators.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentOverview {
    #[serde(flatten)]
    pub student: Student,
    pub guardians: Vec<GuardianLink>,
    pub guardian_count: usize,
}

pub fn overview(conn: &Connection, teacher_id: Option<&str>) -> ServiceResult<Vec<StudentOverview>> {
    students::list(conn, teacher_id)?
        .into_iter()
        .map(|student| {
            let guardians = guardians::active_links_for_student(conn, &student.id)?;
            Ok(StudentOverview {
                guardian_count: guardians.len(),
                student,
                guardians,
            })
        })
        .collect()
}

fn check_date(label: &str, value: Option<&str>) -> ServiceResult<()> {
    if let Some(v) = value {
        chrono::NaiveDate::parse_from_str(v, "%Y-%m-%d")
            .map_err(|_| ServiceError::invalid(format!("{} must be YYYY-MM-DD: {}", label, v)))?;
    }
    Ok(())
}

fn check_teacher(conn: &Connection, teacher_id: Option<&str>) -> ServiceResult<()> {
    let Some(id) = teacher_id else {
        return Ok(());
    };
    match users::find_by_id(conn, id)? {
        Some(u) if u.role == Role::Teacher && u.active => Ok(()),
        _ => Err(ServiceError::invalid("teacher not found or inactive")),
    }
}

fn validate(conn: &Connection, fields: &StudentFields) -> ServiceResult<()> {
    if fields.first_name.trim().is_empty() || fields.last_name.trim().is_empty() {
        return Err(ServiceError::invalid("student first and last name are required"));
    }
    if fields.grade.trim().is_empty() {
        return Err(ServiceError::invalid("grade is required"));
    }
    check_date("birthDate", fields.birth_date.as_deref())?;
    check_date("enrolledAt", fields.enrolled_at.as_deref())?;
    check_teacher(conn, fields.teacher_id.as_deref())
}

pub fn create(conn: &Connection, fields: &StudentFields) -> ServiceResult<Student> {
    validate(conn, fields)?;
    let student = students::insert(conn, fields)?;
    log::info!("student created: {} {}", student.first_name, student.last_name);
    Ok(student)
}

pub fn update(conn: &Connection, id: &str, fields: &StudentFields) -> ServiceResult<Student> {
    validate(conn, fields)?;
    if !students::update(conn, id, fields)? {
        return Err(ServiceError::not_found("student not found"));
    }
    students::find_by_id(conn, id)?.ok_or_else(|| ServiceError::not_found("student not found"))
}

pub fn set_teacher(conn: &Connection, id: &str, teacher_id: Option<&str>) -> ServiceResult<Student> {
    check_teacher(conn, teacher_id)?;
    if !students::set_teacher(conn, id, teacher_id)? {
        return Err(ServiceError::not_found("student not found"));
    }
    students::find_by_id(conn, id)?.ok_or_else(|| ServiceError::not_found("student not found"))
}

/// Removes the student with its links, observations, receipts and media in
/// one transaction; stored files go afterwards, best-effort.
pub fn delete(conn: &Connection, workspace: &Path, id: &str) -> ServiceResult<usize> {
    let tx = conn.unchecked_transaction()?;
    let Some(paths) = students::delete(&tx, id)? else {
        return Err(ServiceError::not_found("student not found"));
    };
    tx.commit()?;
    for p in &paths {
        remove_stored_file(workspace, p);
    }
    log::info!("student {} deleted with {} media files", id, paths.len());
    Ok(paths.len())
}
