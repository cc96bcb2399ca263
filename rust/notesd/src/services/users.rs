//! Account management rules shared by the admin and auth handlers. Every
//! admin mutation writes its audit row in the same transaction.

use rusqlite::Connection;

use super::auth::{parse_document, validate_email};
use super::passwords::{check_new_password, hash_password, temporary_password, verify_password};
use crate::error::{ServiceError, ServiceResult};
use crate::store::users::{self, NewUser, User, UserPatch};
use crate::store::{audit, guardians, AuditAction, Role};

pub const RESET_PASSWORD_LEN: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct UserInput {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role_id: i64,
    pub national_id: Option<String>,
    pub permit: Option<String>,
    /// Required on create; on update `None` keeps the current password.
    pub password: Option<String>,
    pub active: bool,
}

fn validated(input: &UserInput) -> ServiceResult<(Role, Option<users::Document>)> {
    validate_email(&input.email)?;
    if input.first_name.trim().is_empty() {
        return Err(ServiceError::invalid("first name must not be empty"));
    }
    let role = Role::from_id(input.role_id)
        .ok_or_else(|| ServiceError::invalid(format!("unknown role id {}", input.role_id)))?;
    let document = parse_document(input.national_id.as_deref(), input.permit.as_deref())?;
    Ok((role, document))
}

fn ensure_unique(
    conn: &Connection,
    email: &str,
    document: Option<&users::Document>,
    except: Option<&str>,
) -> ServiceResult<()> {
    if users::email_taken(conn, email, except)? {
        return Err(ServiceError::conflict("email is already registered"));
    }
    if let Some(doc) = document {
        if users::document_taken(conn, doc, except)? {
            return Err(ServiceError::conflict("document is already registered"));
        }
    }
    Ok(())
}

pub fn new_user_from(input: &UserInput) -> ServiceResult<NewUser> {
    let (role, document) = validated(input)?;
    let password = input
        .password
        .as_deref()
        .ok_or_else(|| ServiceError::invalid("missing password"))?;
    check_new_password(password)?;
    Ok(NewUser {
        email: input.email.trim().to_string(),
        password_hash: hash_password(password)?,
        role,
        first_name: input.first_name.trim().to_string(),
        last_name: input.last_name.trim().to_string(),
        document,
        active: input.active,
    })
}

pub fn create_user(conn: &Connection, admin_id: &str, input: &UserInput) -> ServiceResult<User> {
    let new = new_user_from(input)?;
    let tx = conn.unchecked_transaction()?;
    ensure_unique(&tx, &new.email, new.document.as_ref(), None)?;
    let user = users::insert(&tx, &new)?;
    audit::record(
        &tx,
        admin_id,
        &user.id,
        AuditAction::Crear,
        Some(&format!("created {} ({})", user.email, user.role.display_name())),
    )?;
    tx.commit()?;
    log::info!("admin {} created user {}", admin_id, user.id);
    Ok(user)
}

/// A role change must not strand the workspace without an administrator or
/// leave guardian links held by a non-guardian.
fn check_role_change(conn: &Connection, admin_id: &str, current: &User) -> ServiceResult<()> {
    if current.id == admin_id {
        return Err(ServiceError::forbidden("you cannot change your own role"));
    }
    if current.role == Role::Admin && users::admin_count(conn)? <= 1 {
        return Err(ServiceError::conflict("the last administrator cannot change role"));
    }
    if current.role == Role::Guardian {
        let links = guardians::active_count_for_guardian(conn, &current.id)?;
        if links > 0 {
            return Err(ServiceError::conflict(format!(
                "guardian has {} active student links; remove them first",
                links
            )));
        }
    }
    Ok(())
}

pub fn update_user(
    conn: &Connection,
    admin_id: &str,
    user_id: &str,
    input: &UserInput,
) -> ServiceResult<User> {
    let (role, document) = validated(input)?;
    let password_hash = match input.password.as_deref().filter(|p| !p.is_empty()) {
        Some(p) => {
            check_new_password(p)?;
            Some(hash_password(p)?)
        }
        None => None,
    };
    let email = input.email.trim().to_string();

    let tx = conn.unchecked_transaction()?;
    let current = users::find_by_id(&tx, user_id)?
        .ok_or_else(|| ServiceError::not_found("user not found"))?;
    if current.role != role {
        check_role_change(&tx, admin_id, &current)?;
    }
    ensure_unique(&tx, &email, document.as_ref(), Some(user_id))?;
    let patch = UserPatch {
        email,
        role,
        first_name: input.first_name.trim().to_string(),
        last_name: input.last_name.trim().to_string(),
        document,
        password_hash,
    };
    if !users::update(&tx, user_id, &patch)? {
        return Err(ServiceError::not_found("user not found"));
    }
    let details = if patch.password_hash.is_some() {
        format!("updated {} (password changed)", patch.email)
    } else {
        format!("updated {}", patch.email)
    };
    audit::record(&tx, admin_id, user_id, AuditAction::Editar, Some(&details))?;
    let user = users::find_by_id(&tx, user_id)?
        .ok_or_else(|| ServiceError::not_found("user not found"))?;
    tx.commit()?;
    Ok(user)
}

/// Flips the active flag and returns the new state.
pub fn toggle_active(conn: &Connection, admin_id: &str, user_id: &str) -> ServiceResult<bool> {
    if admin_id == user_id {
        return Err(ServiceError::forbidden("you cannot deactivate your own account"));
    }
    let tx = conn.unchecked_transaction()?;
    let user = users::find_by_id(&tx, user_id)?
        .ok_or_else(|| ServiceError::not_found("user not found"))?;
    let active = !user.active;
    users::set_active(&tx, user_id, active)?;
    let details = format!(
        "{} {}",
        if active { "activated" } else { "deactivated" },
        user.email
    );
    audit::record(&tx, admin_id, user_id, AuditAction::Editar, Some(&details))?;
    tx.commit()?;
    log::info!("admin {} set user {} active={}", admin_id, user_id, active);
    Ok(active)
}

pub fn delete_user(conn: &Connection, admin_id: &str, user_id: &str) -> ServiceResult<()> {
    if admin_id == user_id {
        return Err(ServiceError::forbidden("you cannot delete your own account"));
    }
    let tx = conn.unchecked_transaction()?;
    let user = users::find_by_id(&tx, user_id)?
        .ok_or_else(|| ServiceError::not_found("user not found"))?;
    let authored = users::authored_observation_count(&tx, user_id)?;
    if authored > 0 {
        return Err(ServiceError::conflict(format!(
            "user authored {} observations; deactivate the account instead",
            authored
        )));
    }
    users::delete(&tx, user_id)?;
    audit::record(
        &tx,
        admin_id,
        user_id,
        AuditAction::Eliminar,
        Some(&format!("deleted {}", user.email)),
    )?;
    tx.commit()?;
    log::info!("admin {} deleted user {}", admin_id, user_id);
    Ok(())
}

/// Sets a random password and returns it; it is shown once and never stored
/// in clear.
pub fn reset_password(conn: &Connection, admin_id: &str, user_id: &str) -> ServiceResult<String> {
    let password = temporary_password(RESET_PASSWORD_LEN);
    let hash = hash_password(&password)?;
    let tx = conn.unchecked_transaction()?;
    if !users::set_password(&tx, user_id, &hash)? {
        return Err(ServiceError::not_found("user not found"));
    }
    audit::record(
        &tx,
        admin_id,
        user_id,
        AuditAction::Restablecer,
        Some("password reset"),
    )?;
    tx.commit()?;
    Ok(password)
}

pub fn change_password(
    conn: &Connection,
    user_id: &str,
    current: &str,
    new_password: &str,
) -> ServiceResult<()> {
    let user = users::find_by_id(conn, user_id)?
        .ok_or_else(|| ServiceError::not_found("user not found"))?;
    if !verify_password(current, &user.password_hash) {
        return Err(ServiceError::forbidden("current password is incorrect"));
    }
    check_new_password(new_password)?;
    users::set_password(conn, user_id, &hash_password(new_password)?)?;
    Ok(())
}

/// First administrator of an empty workspace.
pub fn bootstrap_admin(conn: &Connection, input: &UserInput) -> ServiceResult<User> {
    let input = UserInput {
        role_id: Role::Admin.id(),
        active: true,
        ..input.clone()
    };
    let new = new_user_from(&input)?;
    let tx = conn.unchecked_transaction()?;
    if users::admin_exists(&tx)? {
        return Err(ServiceError::conflict("an administrator already exists"));
    }
    ensure_unique(&tx, &new.email, new.document.as_ref(), None)?;
    let user = users::insert(&tx, &new)?;
    tx.commit()?;
    log::info!("bootstrap administrator {} created", user.id);
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;

    fn input(email: &str, role_id: i64) -> UserInput {
        UserInput {
            email: email.into(),
            first_name: "Nombre".into(),
            last_name: "Apellido".into(),
            role_id,
            password: Some("clave123".into()),
            active: true,
            ..UserInput::default()
        }
    }

    fn audit_actions(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT action FROM user_audit_logs ORDER BY created_at, rowid")
            .expect("prepare");
        stmt.query_map([], |r| r.get(0))
            .expect("query")
            .collect::<Result<Vec<String>, _>>()
            .expect("rows")
    }

    #[test]
    fn admin_lifecycle_is_audited() {
        let conn = open_in_memory().expect("open");
        let admin = bootstrap_admin(&conn, &input("admin@example.org", 2)).expect("bootstrap");
        assert_eq!(admin.role, Role::Admin);
        assert!(bootstrap_admin(&conn, &input("other@example.org", 1)).is_err());

        let teacher = create_user(&conn, &admin.id, &input("profe@example.org", 2)).expect("create");
        let dup = create_user(&conn, &admin.id, &input("PROFE@example.org", 2)).unwrap_err();
        assert!(matches!(dup, ServiceError::Conflict(_)));

        let mut edit = input("profe2@example.org", 2);
        edit.password = None;
        edit.national_id = Some("1020304050".into());
        let updated = update_user(&conn, &admin.id, &teacher.id, &edit).expect("update");
        assert_eq!(updated.national_id.as_deref(), Some("1020304050"));

        edit.national_id = None;
        let cleared = update_user(&conn, &admin.id, &teacher.id, &edit).expect("clear doc");
        assert!(cleared.national_id.is_none() && cleared.permit_number.is_none());

        assert!(!toggle_active(&conn, &admin.id, &teacher.id).expect("toggle"));
        let temp = reset_password(&conn, &admin.id, &teacher.id).expect("reset");
        assert_eq!(temp.len(), RESET_PASSWORD_LEN);
        delete_user(&conn, &admin.id, &teacher.id).expect("delete");

        assert_eq!(
            audit_actions(&conn),
            vec!["crear", "editar", "editar", "editar", "restablecer", "eliminar"]
        );
    }

    #[test]
    fn admins_cannot_remove_themselves() {
        let conn = open_in_memory().expect("open");
        let admin = bootstrap_admin(&conn, &input("admin@example.org", 1)).expect("bootstrap");
        assert!(matches!(
            toggle_active(&conn, &admin.id, &admin.id),
            Err(ServiceError::Forbidden(_))
        ));
        assert!(matches!(
            delete_user(&conn, &admin.id, &admin.id),
            Err(ServiceError::Forbidden(_))
        ));
    }

    #[test]
    fn role_changes_keep_an_administrator() {
        let conn = open_in_memory().expect("open");
        let admin = bootstrap_admin(&conn, &input("admin@example.org", 1)).expect("bootstrap");
        let mut demote = input("admin@example.org", 2);
        demote.password = None;
        assert!(matches!(
            update_user(&conn, &admin.id, &admin.id, &demote),
            Err(ServiceError::Forbidden(_))
        ));
        assert!(users::admin_exists(&conn).expect("exists"));
        assert!(bootstrap_admin(&conn, &input("intruder@example.org", 1)).is_err());

        // A second admin may be demoted by the first, but then the first is
        // the last one left.
        let other = create_user(&conn, &admin.id, &input("admin2@example.org", 1)).expect("create");
        let mut edit = input("admin2@example.org", 2);
        edit.password = None;
        let demoted = update_user(&conn, &admin.id, &other.id, &edit).expect("demote");
        assert_eq!(demoted.role, Role::Teacher);
        assert_eq!(users::admin_count(&conn).expect("count"), 1);

        // Renaming without touching the role stays allowed on oneself.
        let mut rename = input("admin@example.org", 1);
        rename.password = None;
        rename.first_name = "Rectora".into();
        let renamed = update_user(&conn, &admin.id, &admin.id, &rename).expect("rename");
        assert_eq!(renamed.first_name, "Rectora");
    }

    #[test]
    fn linked_guardian_keeps_role() {
        let conn = open_in_memory().expect("open");
        let admin = bootstrap_admin(&conn, &input("admin@example.org", 1)).expect("bootstrap");
        let guardian = create_user(&conn, &admin.id, &input("g1@example.org", 4)).expect("create");
        conn.execute(
            "INSERT INTO students(id, first_name, last_name, grade, created_at)
             VALUES('s1', 'Ana', 'Diaz', '3', '2024-01-01T00:00:00Z')",
            [],
        )
        .expect("student");
        guardians::insert_link(&conn, "s1", &guardian.id, crate::store::RelationType::Principal)
            .expect("link");

        let mut edit = input("g1@example.org", 2);
        edit.password = None;
        assert!(matches!(
            update_user(&conn, &admin.id, &guardian.id, &edit),
            Err(ServiceError::Conflict(_))
        ));
        let unchanged = users::find_by_id(&conn, &guardian.id).expect("find").expect("user");
        assert_eq!(unchanged.role, Role::Guardian);

        guardians::deactivate(&conn, "s1", &guardian.id).expect("unlink");
        let moved = update_user(&conn, &admin.id, &guardian.id, &edit).expect("update");
        assert_eq!(moved.role, Role::Teacher);
    }

    #[test]
    fn change_password_checks_current() {
        let conn = open_in_memory().expect("open");
        let admin = bootstrap_admin(&conn, &input("admin@example.org", 1)).expect("bootstrap");
        assert!(change_password(&conn, &admin.id, "wrong", "nueva123").is_err());
        change_password(&conn, &admin.id, "clave123", "nueva123").expect("change");
        let user = users::find_by_id(&conn, &admin.id).expect("find").expect("user");
        assert!(verify_password("nueva123", &user.password_hash));
    }
}
