//! Errors returned by the repository layer, pre-mapped to the error kinds
//! the rest of the system dispatches on (see `kms_core::error::ErrorKind`).

use std::fmt;

#[derive(Debug)]
pub enum RepositoryError {
    NotFound { entity: &'static str, id: String },
    AlreadyExists { entity: &'static str, id: String },
    InvalidArgument(String),
    Internal(String),
}

impl fmt::Display for RepositoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            Self::AlreadyExists { entity, id } => write!(f, "{entity} already exists: {id}"),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::Internal(msg) => write!(f, "internal repository error: {msg}"),
        }
    }
}

impl std::error::Error for RepositoryError {}

impl From<sqlx::Error> for RepositoryError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Self::NotFound {
                entity: "record",
                id: "<unknown>".to_string(),
            },
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => Self::AlreadyExists {
                entity: "record",
                id: "<unknown>".to_string(),
            },
            other => Self::Internal(other.to_string()),
        }
    }
}
