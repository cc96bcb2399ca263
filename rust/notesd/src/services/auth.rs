use regex::Regex;
use rusqlite::Connection;
use std::sync::LazyLock;

use super::passwords::verify_password;
use crate::error::{ServiceError, ServiceResult};
use crate::store::users::{self, Document, User};

static EMAIL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("EMAIL_REGEX: invalid regex pattern")
});

// Colombian citizenship card: 6 to 10 digits.
static NATIONAL_ID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9]{6,10}$").expect("NATIONAL_ID_REGEX: invalid regex pattern")
});

// Temporary protection permit: "PPT" followed by 9 to 12 digits.
static PERMIT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^PPT[0-9]{9,12}$").expect("PERMIT_REGEX: invalid regex pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginMethod {
    Email,
    NationalId,
    Permit,
}

impl LoginMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "correo" | "email" => Some(LoginMethod::Email),
            "cedula" | "nationalId" => Some(LoginMethod::NationalId),
            "ppt" | "permit" => Some(LoginMethod::Permit),
            _ => None,
        }
    }

    /// Canonical form used for lookup.
    pub fn normalize(self, identifier: &str) -> String {
        let t = identifier.trim();
        match self {
            LoginMethod::Permit => t.to_ascii_uppercase(),
            _ => t.to_string(),
        }
    }

    fn format_hint(self) -> &'static str {
        match self {
            LoginMethod::Email => "invalid email address",
            LoginMethod::NationalId => "national id must have 6 to 10 digits",
            LoginMethod::Permit => "permit must be PPT followed by 9 to 12 digits",
        }
    }
}

/// Checks an already-normalized identifier.
pub fn validate_identifier_format(method: LoginMethod, identifier: &str) -> ServiceResult<()> {
    let ok = match method {
        LoginMethod::Email => EMAIL_REGEX.is_match(identifier),
        LoginMethod::NationalId => NATIONAL_ID_REGEX.is_match(identifier),
        LoginMethod::Permit => PERMIT_REGEX.is_match(identifier),
    };
    if ok {
        Ok(())
    } else {
        Err(ServiceError::invalid(method.format_hint()))
    }
}

pub fn validate_email(email: &str) -> ServiceResult<()> {
    validate_identifier_format(LoginMethod::Email, email.trim())
}

/// Builds the identity document from the two optional inputs; supplying
/// both is refused, supplying neither means no document.
pub fn parse_document(
    national_id: Option<&str>,
    permit: Option<&str>,
) -> ServiceResult<Option<Document>> {
    let national_id = national_id.map(str::trim).filter(|s| !s.is_empty());
    let permit = permit.map(str::trim).filter(|s| !s.is_empty());
    match (national_id, permit) {
        (Some(_), Some(_)) => Err(ServiceError::invalid(
            "provide either a national id or a permit, not both",
        )),
        (Some(n), None) => {
            validate_identifier_format(LoginMethod::NationalId, n)?;
            Ok(Some(Document::NationalId(n.to_string())))
        }
        (None, Some(p)) => {
            let p = LoginMethod::Permit.normalize(p);
            validate_identifier_format(LoginMethod::Permit, &p)?;
            Ok(Some(Document::Permit(p)))
        }
        (None, None) => Ok(None),
    }
}

/// Finds the user by the chosen identifier and checks the password.
///
/// The active flag is NOT checked here; the login path refuses inactive
/// accounts before creating a session.
pub fn authenticate(
    conn: &Connection,
    method: LoginMethod,
    identifier: &str,
    password: &str,
) -> ServiceResult<Option<User>> {
    let identifier = method.normalize(identifier);
    let user = match method {
        LoginMethod::Email => users::find_by_email(conn, &identifier)?,
        LoginMethod::NationalId => users::find_by_national_id(conn, &identifier)?,
        LoginMethod::Permit => users::find_by_permit(conn, &identifier)?,
    };
    Ok(user.filter(|u| verify_password(password, &u.password_hash)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use crate::services::passwords::hash_password;
    use crate::store::users::NewUser;
    use crate::store::Role;

    #[test]
    fn identifier_formats() {
        assert!(validate_identifier_format(LoginMethod::Email, "ana@colegio.edu.co").is_ok());
        assert!(validate_identifier_format(LoginMethod::Email, "ana@colegio").is_err());
        assert!(validate_identifier_format(LoginMethod::NationalId, "1020304050").is_ok());
        assert!(validate_identifier_format(LoginMethod::NationalId, "12345").is_err());
        assert!(validate_identifier_format(LoginMethod::NationalId, "12345678901").is_err());
        let ppt = LoginMethod::Permit.normalize(" ppt123456789 ");
        assert_eq!(ppt, "PPT123456789");
        assert!(validate_identifier_format(LoginMethod::Permit, &ppt).is_ok());
        assert!(validate_identifier_format(LoginMethod::Permit, "PPT12345").is_err());
    }

    #[test]
    fn both_documents_are_refused() {
        assert!(parse_document(Some("1020304050"), Some("PPT123456789")).is_err());
        assert_eq!(parse_document(Some(" "), None).expect("empty"), None);
        assert_eq!(
            parse_document(None, Some("ppt123456789")).expect("permit"),
            Some(Document::Permit("PPT123456789".into()))
        );
    }

    #[test]
    fn authenticate_ignores_active_flag() {
        let conn = open_in_memory().expect("open");
        users::insert(
            &conn,
            &NewUser {
                email: "profe@colegio.edu.co".into(),
                password_hash: hash_password("clave123").expect("hash"),
                role: Role::Teacher,
                first_name: "Laura".into(),
                last_name: "Ruiz".into(),
                document: Some(Document::NationalId("1020304050".into())),
                active: false,
            },
        )
        .expect("insert");

        let by_email = authenticate(&conn, LoginMethod::Email, "profe@colegio.edu.co", "clave123")
            .expect("auth");
        assert!(by_email.as_ref().map(|u| !u.active).unwrap_or(false));

        let by_id = authenticate(&conn, LoginMethod::NationalId, "1020304050", "clave123")
            .expect("auth");
        assert!(by_id.is_some());

        let wrong = authenticate(&conn, LoginMethod::Email, "profe@colegio.edu.co", "nope")
            .expect("auth");
        assert!(wrong.is_none());
    }
}
