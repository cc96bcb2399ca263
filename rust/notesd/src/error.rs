/// Failure kinds shared by the store and service layers.
///
/// "Nothing found" is never an error at the store level (`Ok(None)` /
/// empty vec); these variants only describe things that actually failed or
/// were refused.
#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Invalid(String),
    #[error("{0}")]
    Conflict(String),
    #[error("student already has the maximum of 2 guardians")]
    GuardianLimit,
    #[error("{0}")]
    Forbidden(String),
    #[error("file is too large (max {max_mb} MB)")]
    PayloadTooLarge { max_mb: u64 },
    #[error("file type not allowed: {0}")]
    UnsupportedMedia(String),
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Internal(String),
}

impl ServiceError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        ServiceError::NotFound(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        ServiceError::Invalid(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        ServiceError::Conflict(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        ServiceError::Forbidden(msg.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::NotFound(_) => "not_found",
            ServiceError::Invalid(_) => "bad_params",
            ServiceError::Conflict(_) => "conflict",
            ServiceError::GuardianLimit => "guardian_limit",
            ServiceError::Forbidden(_) => "forbidden",
            ServiceError::PayloadTooLarge { .. } => "payload_too_large",
            ServiceError::UnsupportedMedia(_) => "unsupported_media",
            ServiceError::Db(_) => "db_query_failed",
            ServiceError::Io(_) => "io_failed",
            ServiceError::Internal(_) => "internal",
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
