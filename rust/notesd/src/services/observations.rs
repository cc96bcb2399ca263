use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;

use super::uploads::{classify, remove_stored_file, save_upload, UploadPolicy};
use crate::error::{ServiceError, ServiceResult};
use crate::store::guardians;
use crate::store::media::Media;
use crate::store::observations::{self, NewObservation, Observation};
use crate::store::students;
use crate::store::users::User;
use crate::store::{ObservationKind, Role};

/// Title, description and kind as written by the teacher.
#[derive(Debug, Clone)]
pub struct ObservationText {
    pub title: String,
    pub description: String,
    pub kind: ObservationKind,
}

impl ObservationText {
    fn check(&self) -> ServiceResult<()> {
        if self.title.trim().is_empty() {
            return Err(ServiceError::invalid("title must not be empty"));
        }
        if self.description.trim().is_empty() {
            return Err(ServiceError::invalid("description must not be empty"));
        }
        Ok(())
    }
}

pub struct UploadFile {
    pub file_name: String,
    pub content: Vec<u8>,
}

fn load(conn: &Connection, id: &str) -> ServiceResult<Observation> {
    observations::find_by_id(conn, id)?
        .ok_or_else(|| ServiceError::not_found("observation not found"))
}

/// Who may see an observation and its media: administrators, the author,
/// the student's current teacher and actively linked guardians.
pub fn can_view(conn: &Connection, user: &User, obs: &Observation) -> ServiceResult<bool> {
    Ok(match user.role {
        Role::Admin => true,
        Role::Teacher => {
            obs.teacher_id == user.id
                || students::is_assigned_to_teacher(conn, &obs.student_id, &user.id)?
        }
        Role::Guardian => guardians::is_linked(conn, &obs.student_id, &user.id)?,
    })
}

fn ensure_author(user: &User, obs: &Observation) -> ServiceResult<()> {
    if user.role == Role::Admin || obs.teacher_id == user.id {
        Ok(())
    } else {
        Err(ServiceError::forbidden(
            "only the authoring teacher or an administrator may change this observation",
        ))
    }
}

pub fn get_for(conn: &Connection, user: &User, id: &str) -> ServiceResult<Observation> {
    let obs = load(conn, id)?;
    if !can_view(conn, user, &obs)? {
        return Err(ServiceError::forbidden("you do not have access to this observation"));
    }
    Ok(obs)
}

/// The observation is addressed to the student's principal guardian (or
/// the only one) as linked at this moment.
pub fn create(
    conn: &Connection,
    teacher: &User,
    student_id: &str,
    text: &ObservationText,
) -> ServiceResult<Observation> {
    text.check()?;
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    if !students::exists(&tx, student_id)? {
        return Err(ServiceError::not_found("student not found"));
    }
    if !students::is_assigned_to_teacher(&tx, student_id, &teacher.id)? {
        return Err(ServiceError::forbidden("student is not assigned to you"));
    }
    let guardian_id = guardians::addressed_guardian(&tx, student_id)?;
    let obs = observations::insert(
        &tx,
        &NewObservation {
            title: text.title.trim(),
            description: text.description.trim(),
            kind: text.kind,
            teacher_id: &teacher.id,
            student_id,
            guardian_id: guardian_id.as_deref(),
        },
    )?;
    tx.commit()?;
    log::info!(
        "observation {} ({}) recorded for student {}",
        obs.id,
        obs.kind.as_str(),
        student_id
    );
    Ok(obs)
}

pub fn update(
    conn: &Connection,
    user: &User,
    id: &str,
    text: &ObservationText,
) -> ServiceResult<Observation> {
    text.check()?;
    let obs = load(conn, id)?;
    ensure_author(user, &obs)?;
    observations::update(conn, id, text.title.trim(), text.description.trim(), text.kind)?;
    load(conn, id)
}

/// Returns how many media files were removed with it.
pub fn delete(conn: &Connection, workspace: &Path, user: &User, id: &str) -> ServiceResult<usize> {
    let obs = load(conn, id)?;
    ensure_author(user, &obs)?;
    let tx = conn.unchecked_transaction()?;
    let paths = observations::delete(&tx, id)?
        .ok_or_else(|| ServiceError::not_found("observation not found"))?;
    tx.commit()?;
    for p in &paths {
        remove_stored_file(workspace, p);
    }
    Ok(paths.len())
}

/// All files are checked before any is written; the rows go in together
/// and files already written are removed if a later one fails.
pub fn upload(
    conn: &Connection,
    workspace: &Path,
    policy: &UploadPolicy,
    user: &User,
    observation_id: &str,
    files: &[UploadFile],
) -> ServiceResult<Vec<Media>> {
    let obs = load(conn, observation_id)?;
    ensure_author(user, &obs)?;
    policy.check_batch(files.len())?;
    for f in files {
        classify(&f.file_name)?;
        policy.check_size(f.content.len() as u64)?;
    }

    let tx = conn.unchecked_transaction()?;
    let mut saved: Vec<Media> = Vec::with_capacity(files.len());
    for f in files {
        match save_upload(&tx, workspace, policy, observation_id, &user.id, &f.file_name, &f.content) {
            Ok(m) => saved.push(m),
            Err(e) => {
                for m in &saved {
                    remove_stored_file(workspace, &m.stored_path);
                }
                return Err(e);
            }
        }
    }
    if let Err(e) = tx.commit() {
        for m in &saved {
            remove_stored_file(workspace, &m.stored_path);
        }
        return Err(e.into());
    }
    Ok(saved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use crate::store::students::StudentFields;
    use crate::store::users::{self, NewUser};
    use crate::store::RelationType;

    fn user(conn: &Connection, email: &str, role: Role) -> User {
        users::insert(
            conn,
            &NewUser {
                email: email.into(),
                password_hash: "x".into(),
                role,
                first_name: "N".into(),
                last_name: "M".into(),
                document: None,
                active: true,
            },
        )
        .expect("user")
    }

    fn text(title: &str) -> ObservationText {
        ObservationText {
            title: title.into(),
            description: "participó en clase".into(),
            kind: ObservationKind::Positiva,
        }
    }

    fn temp_workspace() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("notesd-obs-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    #[test]
    fn observation_is_addressed_to_principal_guardian() {
        let conn = open_in_memory().expect("db");
        let teacher = user(&conn, "t@x.co", Role::Teacher);
        let g1 = user(&conn, "g1@x.co", Role::Guardian);
        let g2 = user(&conn, "g2@x.co", Role::Guardian);
        let s = students::insert(
            &conn,
            &StudentFields {
                first_name: "Ana".into(),
                last_name: "Rojas".into(),
                grade: "3".into(),
                teacher_id: Some(teacher.id.clone()),
                active: true,
                ..Default::default()
            },
        )
        .expect("student");

        let none = create(&conn, &teacher, &s.id, &text("sin acudiente")).expect("create");
        assert!(none.guardian_id.is_none());

        guardians::insert_link(&conn, &s.id, &g1.id, RelationType::Secundario).expect("link g1");
        guardians::insert_link(&conn, &s.id, &g2.id, RelationType::Principal).expect("link g2");
        let obs = create(&conn, &teacher, &s.id, &text("con acudiente")).expect("create");
        assert_eq!(obs.guardian_id.as_deref(), Some(g2.id.as_str()));

        assert!(can_view(&conn, &g1, &obs).expect("g1"));
        let other = user(&conn, "t2@x.co", Role::Teacher);
        assert!(!can_view(&conn, &other, &obs).expect("other teacher"));
        assert!(matches!(
            create(&conn, &other, &s.id, &text("ajeno")),
            Err(ServiceError::Forbidden(_))
        ));
        assert!(matches!(
            update(&conn, &other, &obs.id, &text("cambio")),
            Err(ServiceError::Forbidden(_))
        ));
    }

    #[test]
    fn failed_batch_leaves_no_files_behind() {
        let conn = open_in_memory().expect("db");
        let ws = temp_workspace();
        let teacher = user(&conn, "t@x.co", Role::Teacher);
        let s = students::insert(
            &conn,
            &StudentFields {
                first_name: "Luis".into(),
                last_name: "Paz".into(),
                grade: "4".into(),
                teacher_id: Some(teacher.id.clone()),
                active: true,
                ..Default::default()
            },
        )
        .expect("student");
        let obs = create(&conn, &teacher, &s.id, &text("fotos")).expect("obs");
        let policy = UploadPolicy {
            max_bytes: 1024,
            max_files: 3,
        };

        let files = vec![
            UploadFile {
                file_name: "a.png".into(),
                content: vec![1; 10],
            },
            UploadFile {
                file_name: "b.exe".into(),
                content: vec![1; 10],
            },
        ];
        let e = upload(&conn, &ws, &policy, &teacher, &obs.id, &files).expect_err("exe refused");
        assert!(matches!(e, ServiceError::UnsupportedMedia(_)));
        assert!(!ws.join("uploads").exists());

        let saved = upload(&conn, &ws, &policy, &teacher, &obs.id, &files[..1]).expect("png ok");
        assert_eq!(saved.len(), 1);
        assert!(ws.join(&saved[0].stored_path).is_file());

        let removed = delete(&conn, &ws, &teacher, &obs.id).expect("delete");
        assert_eq!(removed, 1);
        assert!(!ws.join(&saved[0].stored_path).exists());
    }
}
