use rusqlite::Connection;

use super::auth::validate_email;
use super::mail::{send_logged, Mailer};
use super::passwords::{hash_password, temporary_password};
use crate::error::{ServiceError, ServiceResult};
use crate::store::registrations::{self, NewRequest, RegistrationRequest};
use crate::store::users::{self, NewUser, User};
use crate::store::{notifications, RequestStatus, Role};

pub const APPROVAL_PASSWORD_LEN: usize = 12;
const MIN_PHONE_DIGITS: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct RegistrationInput {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub school_name: Option<String>,
    pub student_count: Option<i64>,
}

/// Records a public registration request, then notifies the requester and
/// the administrator. Mail failures never fail the request.
pub fn submit(
    conn: &Connection,
    mailer: &dyn Mailer,
    admin_email: Option<&str>,
    input: &RegistrationInput,
) -> ServiceResult<RegistrationRequest> {
    let name = input.name.trim();
    let email = input.email.trim();
    if name.is_empty() {
        return Err(ServiceError::invalid("name must not be empty"));
    }
    validate_email(email)?;
    let digits = input.phone.chars().filter(|c| c.is_ascii_digit()).count();
    if digits < MIN_PHONE_DIGITS {
        return Err(ServiceError::invalid(format!(
            "phone must have at least {} digits",
            MIN_PHONE_DIGITS
        )));
    }
    if let Some(n) = input.student_count {
        if n < 0 {
            return Err(ServiceError::invalid("student count must not be negative"));
        }
    }

    let tx = conn.unchecked_transaction()?;
    if users::email_taken(&tx, email, None)? {
        return Err(ServiceError::conflict("email is already registered"));
    }
    if registrations::pending_for_email(&tx, email)?.is_some() {
        return Err(ServiceError::conflict(
            "a registration request for this email is already pending",
        ));
    }
    let request = registrations::insert(
        &tx,
        &NewRequest {
            name,
            email,
            phone: input.phone.trim(),
            school_name: input.school_name.as_deref().map(str::trim),
            student_count: input.student_count,
        },
    )?;
    notifications::create(
        &tx,
        "New registration request",
        &format!("{} <{}> asked for an account", request.name, request.email),
        "registration",
        "high",
    )?;
    tx.commit()?;
    log::info!("registration request {} from {}", request.id, request.email);

    send_logged(
        mailer,
        &request.email,
        "Teaching Notes: registration received",
        &format!(
            "Hello {},\n\nWe received your registration request. An administrator will review it and contact you.\n",
            request.name
        ),
    );
    if let Some(admin) = admin_email {
        send_logged(
            mailer,
            admin,
            "Teaching Notes: new registration request",
            &format!(
                "Name: {}\nEmail: {}\nPhone: {}\nSchool: {}\nStudents: {}\n",
                request.name,
                request.email,
                request.phone,
                request.school_name.as_deref().unwrap_or("-"),
                request
                    .student_count
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "-".into()),
            ),
        );
    }
    Ok(request)
}

fn split_name(full: &str) -> (String, String) {
    let full = full.trim();
    match full.split_once(char::is_whitespace) {
        Some((first, rest)) => (first.to_string(), rest.trim().to_string()),
        None => (full.to_string(), String::new()),
    }
}

/// Creates the account for a pending request and returns it with the
/// temporary password. An email that got registered meanwhile rejects the
/// request and reports a conflict.
pub fn approve(
    conn: &Connection,
    request_id: &str,
    role: Role,
) -> ServiceResult<(User, String)> {
    let request = registrations::find_by_id(conn, request_id)?
        .ok_or_else(|| ServiceError::not_found("registration request not found"))?;
    if request.status != RequestStatus::Pendiente {
        return Err(ServiceError::conflict("registration request is not pending"));
    }
    if users::email_taken(conn, &request.email, None)? {
        registrations::set_status(conn, request_id, RequestStatus::Rechazada)?;
        log::warn!(
            "registration {} rejected: {} already has an account",
            request_id,
            request.email
        );
        return Err(ServiceError::conflict(
            "email is already registered; the request was rejected",
        ));
    }

    let password = temporary_password(APPROVAL_PASSWORD_LEN);
    let (first_name, last_name) = split_name(&request.name);
    let new = NewUser {
        email: request.email.clone(),
        password_hash: hash_password(&password)?,
        role,
        first_name,
        last_name,
        document: None,
        active: true,
    };

    let tx = conn.unchecked_transaction()?;
    let user = users::insert(&tx, &new)?;
    registrations::set_status(&tx, request_id, RequestStatus::Aprobada)?;
    tx.commit()?;
    log::info!("registration {} approved as user {}", request_id, user.id);
    Ok((user, password))
}

pub fn reject(conn: &Connection, request_id: &str) -> ServiceResult<()> {
    let request = registrations::find_by_id(conn, request_id)?
        .ok_or_else(|| ServiceError::not_found("registration request not found"))?;
    if request.status != RequestStatus::Pendiente {
        return Err(ServiceError::conflict("registration request is not pending"));
    }
    registrations::set_status(conn, request_id, RequestStatus::Rechazada)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use std::cell::RefCell;

    #[derive(Default)]
    struct RecordingMailer {
        sent: RefCell<Vec<String>>,
    }

    impl Mailer for RecordingMailer {
        fn send(&self, to: &str, _subject: &str, _body: &str) -> anyhow::Result<()> {
            self.sent.borrow_mut().push(to.to_string());
            Ok(())
        }
    }

    fn input(email: &str) -> RegistrationInput {
        RegistrationInput {
            name: "Marta Lucia Gomez".into(),
            email: email.into(),
            phone: "300 123 4567".into(),
            school_name: Some("Colegio Central".into()),
            student_count: Some(120),
        }
    }

    #[test]
    fn submit_notifies_and_refuses_duplicates() {
        let conn = open_in_memory().expect("open");
        let mailer = RecordingMailer::default();
        submit(&conn, &mailer, Some("admin@example.org"), &input("marta@example.org"))
            .expect("submit");
        assert_eq!(
            *mailer.sent.borrow(),
            vec!["marta@example.org".to_string(), "admin@example.org".to_string()]
        );
        assert_eq!(notifications::unread_count(&conn).expect("count"), 1);

        let again = submit(&conn, &mailer, None, &input("marta@example.org")).unwrap_err();
        assert!(matches!(again, ServiceError::Conflict(_)));

        let mut short = input("otra@example.org");
        short.phone = "12345".into();
        assert!(matches!(
            submit(&conn, &mailer, None, &short),
            Err(ServiceError::Invalid(_))
        ));
    }

    #[test]
    fn approve_creates_user_and_rejects_taken_email() {
        let conn = open_in_memory().expect("open");
        let mailer = RecordingMailer::default();
        let req = submit(&conn, &mailer, None, &input("marta@example.org")).expect("submit");
        let (user, password) = approve(&conn, &req.id, Role::Teacher).expect("approve");
        assert_eq!(password.len(), APPROVAL_PASSWORD_LEN);
        assert_eq!(user.first_name, "Marta");
        assert_eq!(user.last_name, "Lucia Gomez");
        assert!(approve(&conn, &req.id, Role::Teacher).is_err());

        // A second request slips in before the first user existed.
        conn.execute(
            "INSERT INTO registration_requests(id, name, email, phone, status, requested_at)
             VALUES('r2', 'Otra', 'marta@example.org', '3001234567', 'pendiente', '2024-01-01T00:00:00Z')",
            [],
        )
        .expect("raw request");
        let e = approve(&conn, "r2", Role::Teacher).unwrap_err();
        assert!(matches!(e, ServiceError::Conflict(_)));
        let r2 = registrations::find_by_id(&conn, "r2").expect("find").expect("row");
        assert_eq!(r2.status, RequestStatus::Rechazada);
    }
}
