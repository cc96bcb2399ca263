//! Guardian assignment commands.
//!
//! Each command runs its checks and writes inside one `BEGIN IMMEDIATE`
//! transaction, so two daemons on the same workspace cannot both pass the
//! two-guardian check. The partial unique indexes and the limit trigger in
//! the schema back the same rules at the database level.

use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::Serialize;

use crate::error::{ServiceError, ServiceResult};
use crate::store::guardians as links;
use crate::store::users::{self, NewUser, User};
use crate::store::{students, RelationType, Role};

pub const MAX_GUARDIANS_PER_STUDENT: i64 = 2;

#[derive(Debug, Clone)]
pub enum GuardianCommand<'a> {
    Assign {
        student_id: &'a str,
        guardian_id: &'a str,
        relation: Option<RelationType>,
    },
    Remove {
        student_id: &'a str,
        guardian_id: &'a str,
    },
    ChangeType {
        student_id: &'a str,
        guardian_id: &'a str,
        relation: RelationType,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardianOutcome {
    pub message: String,
    pub relation_type: Option<RelationType>,
    /// Guardian that lost the principal tag as part of this command.
    pub demoted_guardian_id: Option<String>,
    pub link_id: Option<String>,
}

/// Relation for a new link when the caller did not pick a valid one: the
/// first guardian is principal, a second one is secondary unless nobody
/// holds the principal tag yet.
pub fn resolve_relation(
    requested: Option<RelationType>,
    existing: &[RelationType],
) -> RelationType {
    if let Some(r) = requested {
        return r;
    }
    if existing.contains(&RelationType::Principal) {
        RelationType::Secundario
    } else {
        RelationType::Principal
    }
}

pub fn execute(conn: &Connection, cmd: &GuardianCommand<'_>) -> ServiceResult<GuardianOutcome> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let outcome = apply(&tx, cmd)?;
    tx.commit()?;
    log::info!("{}: {:?}", outcome.message, cmd);
    Ok(outcome)
}

fn apply(conn: &Connection, cmd: &GuardianCommand<'_>) -> ServiceResult<GuardianOutcome> {
    match *cmd {
        GuardianCommand::Assign {
            student_id,
            guardian_id,
            relation,
        } => assign(conn, student_id, guardian_id, relation),
        GuardianCommand::Remove {
            student_id,
            guardian_id,
        } => {
            if links::deactivate(conn, student_id, guardian_id)? == 0 {
                return Err(ServiceError::not_found(
                    "guardian is not assigned to this student",
                ));
            }
            Ok(GuardianOutcome {
                message: "guardian removed".into(),
                relation_type: None,
                demoted_guardian_id: None,
                link_id: None,
            })
        }
        GuardianCommand::ChangeType {
            student_id,
            guardian_id,
            relation,
        } => change_type(conn, student_id, guardian_id, relation),
    }
}

fn assign(
    conn: &Connection,
    student_id: &str,
    guardian_id: &str,
    requested: Option<RelationType>,
) -> ServiceResult<GuardianOutcome> {
    if !students::exists(conn, student_id)? {
        return Err(ServiceError::not_found("student not found"));
    }
    match users::find_by_id(conn, guardian_id)? {
        Some(u) if u.role == Role::Guardian && u.active => {}
        _ => return Err(ServiceError::not_found("guardian not found or inactive")),
    }

    let current = links::active_links_for_student(conn, student_id)?;
    if current.len() as i64 >= MAX_GUARDIANS_PER_STUDENT {
        return Err(ServiceError::GuardianLimit);
    }
    if current.iter().any(|l| l.guardian_id == guardian_id) {
        return Err(ServiceError::conflict(
            "guardian is already assigned to this student",
        ));
    }

    let existing: Vec<RelationType> = current.iter().map(|l| l.relation_type).collect();
    let relation = resolve_relation(requested, &existing);

    let mut demoted = None;
    if relation == RelationType::Principal {
        demoted = current
            .iter()
            .find(|l| l.relation_type == RelationType::Principal)
            .map(|l| l.guardian_id.clone());
        if demoted.is_some() {
            links::demote_principal(conn, student_id)?;
        }
    }

    let link_id =
        links::insert_link(conn, student_id, guardian_id, relation).map_err(map_link_error)?;
    Ok(GuardianOutcome {
        message: format!("guardian assigned as {}", relation.as_str()),
        relation_type: Some(relation),
        demoted_guardian_id: demoted,
        link_id: Some(link_id),
    })
}

fn change_type(
    conn: &Connection,
    student_id: &str,
    guardian_id: &str,
    relation: RelationType,
) -> ServiceResult<GuardianOutcome> {
    let Some(link) = links::active_link(conn, student_id, guardian_id)? else {
        return Err(ServiceError::not_found(
            "guardian is not assigned to this student",
        ));
    };

    let mut demoted = None;
    if relation == RelationType::Principal && link.relation_type != RelationType::Principal {
        demoted = links::active_links_for_student(conn, student_id)?
            .into_iter()
            .find(|l| l.relation_type == RelationType::Principal)
            .map(|l| l.guardian_id);
        links::demote_principal(conn, student_id)?;
    }
    links::set_relation(conn, student_id, guardian_id, relation).map_err(map_link_error)?;

    Ok(GuardianOutcome {
        message: format!("relation changed to {}", relation.as_str()),
        relation_type: Some(relation),
        demoted_guardian_id: demoted,
        link_id: Some(link.id),
    })
}

/// Creates a guardian account and links it to the student in one unit.
pub fn create_and_assign(
    conn: &Connection,
    new_guardian: &NewUser,
    student_id: &str,
    relation: Option<RelationType>,
) -> ServiceResult<(User, GuardianOutcome)> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    if users::email_taken(&tx, &new_guardian.email, None)? {
        return Err(ServiceError::conflict("email is already registered"));
    }
    if let Some(doc) = new_guardian.document.as_ref() {
        if users::document_taken(&tx, doc, None)? {
            return Err(ServiceError::conflict("document is already registered"));
        }
    }
    let user = users::insert(&tx, new_guardian)?;
    let outcome = assign(&tx, student_id, &user.id, relation)?;
    tx.commit()?;
    log::info!(
        "guardian {} created and {} for student {}",
        user.id,
        outcome.message,
        student_id
    );
    Ok((user, outcome))
}

/// The schema guards surface as constraint errors; give them their domain
/// meaning.
fn map_link_error(e: ServiceError) -> ServiceError {
    match e {
        ServiceError::Db(ref db) => {
            let text = db.to_string();
            if text.contains("guardian_limit") {
                ServiceError::GuardianLimit
            } else if text.contains("UNIQUE constraint failed") {
                ServiceError::conflict("conflicting guardian link")
            } else {
                e
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;

    fn seed(conn: &Connection) {
        conn.execute_batch(
            "INSERT INTO students(id, first_name, last_name, grade, created_at)
               VALUES('s1', 'Ana', 'Diaz', '3', '2024-01-01T00:00:00Z');
             INSERT INTO users(id, email, password_hash, role_id, first_name, created_at)
               VALUES('g1', 'g1@example.org', 'x', 4, 'G1', '2024-01-01T00:00:00Z');
             INSERT INTO users(id, email, password_hash, role_id, first_name, created_at)
               VALUES('g2', 'g2@example.org', 'x', 4, 'G2', '2024-01-01T00:00:00Z');
             INSERT INTO users(id, email, password_hash, role_id, first_name, created_at)
               VALUES('g3', 'g3@example.org', 'x', 4, 'G3', '2024-01-01T00:00:00Z');
             INSERT INTO users(id, email, password_hash, role_id, first_name, active, created_at)
               VALUES('off', 'off@example.org', 'x', 4, 'Off', 0, '2024-01-01T00:00:00Z');
             INSERT INTO users(id, email, password_hash, role_id, first_name, created_at)
               VALUES('t1', 't1@example.org', 'x', 2, 'T1', '2024-01-01T00:00:00Z');",
        )
        .expect("seed");
    }

    fn assign_cmd<'a>(guardian_id: &'a str, relation: Option<RelationType>) -> GuardianCommand<'a> {
        GuardianCommand::Assign {
            student_id: "s1",
            guardian_id,
            relation,
        }
    }

    fn relation_of(conn: &Connection, guardian_id: &str) -> RelationType {
        links::active_link(conn, "s1", guardian_id)
            .expect("query")
            .expect("link")
            .relation_type
    }

    #[test]
    fn resolve_relation_policy() {
        use RelationType::*;
        assert_eq!(resolve_relation(None, &[]), Principal);
        assert_eq!(resolve_relation(None, &[Principal]), Secundario);
        assert_eq!(resolve_relation(None, &[Secundario]), Principal);
        assert_eq!(resolve_relation(Some(Secundario), &[]), Secundario);
    }

    #[test]
    fn example_scenario() {
        let conn = open_in_memory().expect("open");
        seed(&conn);

        let o1 = execute(&conn, &assign_cmd("g1", None)).expect("g1");
        assert_eq!(o1.relation_type, Some(RelationType::Principal));
        let o2 = execute(&conn, &assign_cmd("g2", None)).expect("g2");
        assert_eq!(o2.relation_type, Some(RelationType::Secundario));

        let e = execute(&conn, &assign_cmd("g3", None)).unwrap_err();
        assert!(matches!(e, ServiceError::GuardianLimit), "{e:?}");
        assert_eq!(e.to_string(), "student already has the maximum of 2 guardians");
        assert_eq!(links::active_count(&conn, "s1").expect("count"), 2);

        let change = execute(
            &conn,
            &GuardianCommand::ChangeType {
                student_id: "s1",
                guardian_id: "g2",
                relation: RelationType::Principal,
            },
        )
        .expect("change");
        assert_eq!(change.demoted_guardian_id.as_deref(), Some("g1"));
        assert_eq!(relation_of(&conn, "g1"), RelationType::Secundario);
        assert_eq!(relation_of(&conn, "g2"), RelationType::Principal);
    }

    #[test]
    fn explicit_principal_demotes_existing_one() {
        let conn = open_in_memory().expect("open");
        seed(&conn);
        execute(&conn, &assign_cmd("g1", None)).expect("g1");
        let o = execute(&conn, &assign_cmd("g2", Some(RelationType::Principal))).expect("g2");
        assert_eq!(o.demoted_guardian_id.as_deref(), Some("g1"));
        assert_eq!(relation_of(&conn, "g1"), RelationType::Secundario);
        assert_eq!(relation_of(&conn, "g2"), RelationType::Principal);
    }

    #[test]
    fn rejects_duplicates_unknown_and_inactive() {
        let conn = open_in_memory().expect("open");
        seed(&conn);
        execute(&conn, &assign_cmd("g1", None)).expect("g1");

        let dup = execute(&conn, &assign_cmd("g1", None)).unwrap_err();
        assert!(matches!(dup, ServiceError::Conflict(_)));
        let off = execute(&conn, &assign_cmd("off", None)).unwrap_err();
        assert!(matches!(off, ServiceError::NotFound(_)));
        let teacher = execute(&conn, &assign_cmd("t1", None)).unwrap_err();
        assert!(matches!(teacher, ServiceError::NotFound(_)));
        let no_student = execute(
            &conn,
            &GuardianCommand::Assign {
                student_id: "nope",
                guardian_id: "g2",
                relation: None,
            },
        )
        .unwrap_err();
        assert_eq!(no_student.to_string(), "student not found");
        assert_eq!(links::active_count(&conn, "s1").expect("count"), 1);
    }

    #[test]
    fn removal_is_soft_and_reassignment_adds_history() {
        let conn = open_in_memory().expect("open");
        seed(&conn);
        execute(&conn, &assign_cmd("g1", None)).expect("g1");
        execute(
            &conn,
            &GuardianCommand::Remove {
                student_id: "s1",
                guardian_id: "g1",
            },
        )
        .expect("remove");

        assert!(links::active_links_for_student(&conn, "s1")
            .expect("active")
            .is_empty());
        let again = execute(
            &conn,
            &GuardianCommand::Remove {
                student_id: "s1",
                guardian_id: "g1",
            },
        )
        .unwrap_err();
        assert!(matches!(again, ServiceError::NotFound(_)));

        execute(&conn, &assign_cmd("g1", None)).expect("reassign");
        let history = links::history_for_student(&conn, "s1").expect("history");
        assert_eq!(history.len(), 2);
        assert!(!history[0].active);
        assert!(history[0].removed_at.is_some());
        assert!(history[1].active);
    }

    #[test]
    fn schema_guard_stops_a_third_active_link() {
        let conn = open_in_memory().expect("open");
        seed(&conn);
        execute(&conn, &assign_cmd("g1", None)).expect("g1");
        execute(&conn, &assign_cmd("g2", None)).expect("g2");
        let e = links::insert_link(&conn, "s1", "g3", RelationType::Secundario)
            .map_err(map_link_error)
            .unwrap_err();
        assert!(matches!(e, ServiceError::GuardianLimit), "{e:?}");
    }
}
