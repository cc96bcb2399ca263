use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{new_id, Role};
use crate::db::now_ts;
use crate::error::ServiceResult;

const USER_COLUMNS: &str = "id, email, password_hash, role_id, first_name, last_name,
     national_id, permit_number, active, created_at, updated_at";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(skip)]
    pub password_hash: String,
    pub role: Role,
    pub first_name: String,
    pub last_name: String,
    pub national_id: Option<String>,
    pub permit_number: Option<String>,
    pub active: bool,
    pub created_at: String,
    pub updated_at: Option<String>,
}

impl User {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut v = serde_json::to_value(self).unwrap_or_default();
        v["roleId"] = self.role.id().into();
        v["roleName"] = self.role.display_name().into();
        v["fullName"] = self.full_name().into();
        v
    }
}

/// Identity document; a user carries at most one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Document {
    NationalId(String),
    Permit(String),
}

impl Document {
    fn columns(doc: Option<&Document>) -> (Option<&str>, Option<&str>) {
        match doc {
            Some(Document::NationalId(v)) => (Some(v.as_str()), None),
            Some(Document::Permit(v)) => (None, Some(v.as_str())),
            None => (None, None),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    pub first_name: String,
    pub last_name: String,
    pub document: Option<Document>,
    pub active: bool,
}

/// Full replacement of the editable fields; `password_hash: None` keeps the
/// current password and `document: None` clears both documents.
#[derive(Debug, Clone)]
pub struct UserPatch {
    pub email: String,
    pub role: Role,
    pub first_name: String,
    pub last_name: String,
    pub document: Option<Document>,
    pub password_hash: Option<String>,
}

fn row_to_user(r: &Row<'_>) -> rusqlite::Result<User> {
    let role_id: i64 = r.get(3)?;
    let role = Role::from_id(role_id).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Integer,
            format!("unknown role id {}", role_id).into(),
        )
    })?;
    Ok(User {
        id: r.get(0)?,
        email: r.get(1)?,
        password_hash: r.get(2)?,
        role,
        first_name: r.get(4)?,
        last_name: r.get(5)?,
        national_id: r.get(6)?,
        permit_number: r.get(7)?,
        active: r.get::<_, i64>(8)? != 0,
        created_at: r.get(9)?,
        updated_at: r.get(10)?,
    })
}

fn find_by(conn: &Connection, column: &str, value: &str) -> ServiceResult<Option<User>> {
    let sql = format!("SELECT {} FROM users WHERE {} = ?", USER_COLUMNS, column);
    Ok(conn.query_row(&sql, [value], row_to_user).optional()?)
}

pub fn find_by_id(conn: &Connection, id: &str) -> ServiceResult<Option<User>> {
    find_by(conn, "id", id)
}

pub fn find_by_email(conn: &Connection, email: &str) -> ServiceResult<Option<User>> {
    find_by(conn, "email", email.trim())
}

pub fn find_by_national_id(conn: &Connection, national_id: &str) -> ServiceResult<Option<User>> {
    find_by(conn, "national_id", national_id)
}

pub fn find_by_permit(conn: &Connection, permit: &str) -> ServiceResult<Option<User>> {
    find_by(conn, "permit_number", permit)
}

pub fn list(conn: &Connection, role: Option<Role>) -> ServiceResult<Vec<User>> {
    let sql = format!(
        "SELECT {} FROM users
         WHERE (?1 IS NULL OR role_id = ?1)
         ORDER BY role_id, last_name, first_name",
        USER_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let users = stmt
        .query_map([role.map(Role::id)], row_to_user)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(users)
}

/// True when another user (not `except`) already has this email.
pub fn email_taken(conn: &Connection, email: &str, except: Option<&str>) -> ServiceResult<bool> {
    let hit: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM users WHERE email = ?1 AND (?2 IS NULL OR id <> ?2)",
            (email.trim(), except),
            |r| r.get(0),
        )
        .optional()?;
    Ok(hit.is_some())
}

pub fn document_taken(
    conn: &Connection,
    doc: &Document,
    except: Option<&str>,
) -> ServiceResult<bool> {
    let (national_id, permit) = Document::columns(Some(doc));
    let hit: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM users
             WHERE ((?1 IS NOT NULL AND national_id = ?1) OR (?2 IS NOT NULL AND permit_number = ?2))
               AND (?3 IS NULL OR id <> ?3)",
            (national_id, permit, except),
            |r| r.get(0),
        )
        .optional()?;
    Ok(hit.is_some())
}

pub fn insert(conn: &Connection, new: &NewUser) -> ServiceResult<User> {
    let id = new_id();
    let (national_id, permit) = Document::columns(new.document.as_ref());
    conn.execute(
        "INSERT INTO users(id, email, password_hash, role_id, first_name, last_name,
                           national_id, permit_number, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            id,
            new.email.trim(),
            new.password_hash,
            new.role.id(),
            new.first_name,
            new.last_name,
            national_id,
            permit,
            new.active as i64,
            now_ts(),
        ],
    )?;
    let user = find_by_id(conn, &id)?;
    user.ok_or_else(|| crate::error::ServiceError::Internal("inserted user vanished".into()))
}

/// Returns false when no such user exists.
pub fn update(conn: &Connection, id: &str, patch: &UserPatch) -> ServiceResult<bool> {
    let (national_id, permit) = Document::columns(patch.document.as_ref());
    let n = conn.execute(
        "UPDATE users SET
           email = ?, role_id = ?, first_name = ?, last_name = ?,
           national_id = ?, permit_number = ?,
           password_hash = COALESCE(?, password_hash),
           updated_at = ?
         WHERE id = ?",
        rusqlite::params![
            patch.email.trim(),
            patch.role.id(),
            patch.first_name,
            patch.last_name,
            national_id,
            permit,
            patch.password_hash,
            now_ts(),
            id,
        ],
    )?;
    Ok(n > 0)
}

pub fn set_password(conn: &Connection, id: &str, password_hash: &str) -> ServiceResult<bool> {
    let n = conn.execute(
        "UPDATE users SET password_hash = ?, updated_at = ? WHERE id = ?",
        (password_hash, now_ts(), id),
    )?;
    Ok(n > 0)
}

pub fn set_active(conn: &Connection, id: &str, active: bool) -> ServiceResult<bool> {
    let n = conn.execute(
        "UPDATE users SET active = ?, updated_at = ? WHERE id = ?",
        (active as i64, now_ts(), id),
    )?;
    Ok(n > 0)
}

pub fn authored_observation_count(conn: &Connection, id: &str) -> ServiceResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM observations WHERE teacher_id = ?",
        [id],
        |r| r.get(0),
    )?)
}

/// Deletes the user and the rows that only make sense with it. Callers run
/// this inside a transaction and refuse authors of observations first.
pub fn delete(conn: &Connection, id: &str) -> ServiceResult<bool> {
    // Explicit dependency order (no ON DELETE CASCADE).
    conn.execute("DELETE FROM observation_receipts WHERE guardian_id = ?", [id])?;
    conn.execute(
        "UPDATE observations SET guardian_id = NULL WHERE guardian_id = ?",
        [id],
    )?;
    conn.execute("DELETE FROM student_guardians WHERE guardian_id = ?", [id])?;
    conn.execute(
        "UPDATE students SET teacher_id = NULL WHERE teacher_id = ?",
        [id],
    )?;
    conn.execute("UPDATE media SET uploaded_by = NULL WHERE uploaded_by = ?", [id])?;
    let n = conn.execute("DELETE FROM users WHERE id = ?", [id])?;
    Ok(n > 0)
}

pub fn admin_count(conn: &Connection) -> ServiceResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM users WHERE role_id = ?",
        [Role::Admin.id()],
        |r| r.get(0),
    )?)
}

pub fn admin_exists(conn: &Connection) -> ServiceResult<bool> {
    Ok(admin_count(conn)? > 0)
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCounts {
    pub total: i64,
    pub active: i64,
    pub admins: i64,
    pub teachers: i64,
    pub guardians: i64,
}

pub fn counts(conn: &Connection) -> ServiceResult<UserCounts> {
    Ok(conn.query_row(
        "SELECT
           COUNT(*),
           COALESCE(SUM(active), 0),
           COALESCE(SUM(role_id = 1), 0),
           COALESCE(SUM(role_id = 2), 0),
           COALESCE(SUM(role_id = 4), 0)
         FROM users",
        [],
        |r| {
            Ok(UserCounts {
                total: r.get(0)?,
                active: r.get(1)?,
                admins: r.get(2)?,
                teachers: r.get(3)?,
                guardians: r.get(4)?,
            })
        },
    )?)
}
