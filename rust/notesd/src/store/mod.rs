//! Data access: one module per table, plain functions over a borrowed
//! `Connection`. Missing rows are `Ok(None)` or an empty vec, never an error.

pub mod audit;
pub mod guardians;
pub mod media;
pub mod notifications;
pub mod observations;
pub mod receipts;
pub mod registrations;
pub mod sessions;
pub mod students;
pub mod users;

use serde::Serialize;

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Teacher,
    Guardian,
}

impl Role {
    pub fn id(self) -> i64 {
        match self {
            Role::Admin => 1,
            Role::Teacher => 2,
            Role::Guardian => 4,
        }
    }

    pub fn from_id(id: i64) -> Option<Role> {
        match id {
            1 => Some(Role::Admin),
            2 => Some(Role::Teacher),
            4 => Some(Role::Guardian),
            _ => None,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Role::Admin => "Administrador",
            Role::Teacher => "Profesor",
            Role::Guardian => "Acudiente",
        }
    }

    /// Section a client should land on after login.
    pub fn home(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Teacher => "teacher",
            Role::Guardian => "guardian",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationType {
    Principal,
    Secundario,
}

impl RelationType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "principal" => Some(RelationType::Principal),
            "secundario" => Some(RelationType::Secundario),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RelationType::Principal => "principal",
            RelationType::Secundario => "secundario",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ObservationKind {
    Positiva,
    Mejora,
    Neutral,
}

impl ObservationKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "Positiva" => Some(ObservationKind::Positiva),
            "Mejora" => Some(ObservationKind::Mejora),
            "Neutral" => Some(ObservationKind::Neutral),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ObservationKind::Positiva => "Positiva",
            ObservationKind::Mejora => "Mejora",
            ObservationKind::Neutral => "Neutral",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "image" => Some(MediaKind::Image),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Crear,
    Editar,
    Eliminar,
    Restablecer,
}

impl AuditAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "crear" => Some(AuditAction::Crear),
            "editar" => Some(AuditAction::Editar),
            "eliminar" => Some(AuditAction::Eliminar),
            "restablecer" => Some(AuditAction::Restablecer),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::Crear => "crear",
            AuditAction::Editar => "editar",
            AuditAction::Eliminar => "eliminar",
            AuditAction::Restablecer => "restablecer",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pendiente,
    Aprobada,
    Rechazada,
}

impl RequestStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pendiente" => Some(RequestStatus::Pendiente),
            "aprobada" => Some(RequestStatus::Aprobada),
            "rechazada" => Some(RequestStatus::Rechazada),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pendiente => "pendiente",
            RequestStatus::Aprobada => "aprobada",
            RequestStatus::Rechazada => "rechazada",
        }
    }
}

/// Text column holding one of the enums above. Unknown values surface as a
/// conversion error instead of being silently mapped.
pub(crate) fn parse_column<T>(
    idx: usize,
    raw: String,
    parse: impl Fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unexpected value {:?}", raw).into(),
        )
    })
}
