use thiserror::Error;

/// Classified database failure kinds.
///
/// The classification matters to callers in two places: the orchestrator
/// treats `UniqueViolation` on transaction creation as a concurrent start,
/// and retry logic only re-attempts kinds marked retryable.
#[derive(Debug, Clone)]
pub enum DatabaseErrorKind {
    /// Connection could not be established or was lost mid-query
    Connection { message: String },
    /// A unique constraint was violated
    UniqueViolation { constraint: Option<String> },
    /// The query referenced a row that does not exist
    NotFound,
    /// Query timed out
    Timeout,
    /// Anything else
    Unknown { message: String },
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DatabaseError {
    pub kind: DatabaseErrorKind,
    message: String,
}

impl DatabaseError {
    pub fn new(kind: DatabaseErrorKind) -> Self {
        let message = match &kind {
            DatabaseErrorKind::Connection { message } => {
                format!("database connection error: {}", message)
            }
            DatabaseErrorKind::UniqueViolation { constraint } => match constraint {
                Some(c) => format!("unique constraint violated: {}", c),
                None => "unique constraint violated".to_string(),
            },
            DatabaseErrorKind::NotFound => "row not found".to_string(),
            DatabaseErrorKind::Timeout => "database query timed out".to_string(),
            DatabaseErrorKind::Unknown { message } => format!("database error: {}", message),
        };
        Self { kind, message }
    }

    pub fn from_sqlx(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::new(DatabaseErrorKind::NotFound),
            sqlx::Error::PoolTimedOut => Self::new(DatabaseErrorKind::Timeout),
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
                Self::new(DatabaseErrorKind::Connection {
                    message: err.to_string(),
                })
            }
            sqlx::Error::Database(db_err) => {
                // 23505 = postgres unique_violation
                if db_err.code().as_deref() == Some("23505") {
                    Self::new(DatabaseErrorKind::UniqueViolation {
                        constraint: db_err.constraint().map(|c| c.to_string()),
                    })
                } else {
                    Self::new(DatabaseErrorKind::Unknown {
                        message: err.to_string(),
                    })
                }
            }
            _ => Self::new(DatabaseErrorKind::Unknown {
                message: err.to_string(),
            }),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            DatabaseErrorKind::Connection { .. } | DatabaseErrorKind::Timeout
        )
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::UniqueViolation { .. })
    }
}

impl From<DatabaseError> for crate::error::AppError {
    fn from(err: DatabaseError) -> Self {
        use crate::error::{AppError, AppErrorKind, InfrastructureError};

        let retryable = err.is_retryable();
        AppError::new(AppErrorKind::Infrastructure(InfrastructureError::Database {
            message: err.to_string(),
            is_retryable: retryable,
        }))
    }
}
