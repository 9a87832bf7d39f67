//! Error type shared by the domain modules and the web layer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    /// The requested status change is not an edge of the declared graph, or
    /// the item has already left its initial state.
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    /// The acting user's role does not grant the operation.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The edge exists and the role is allowed, but an approval gate is closed.
    #[error("Prerequisite not met: {0}")]
    PrerequisiteNotMet(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("{0}")]
    Internal(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Whether the message is safe and useful to show on a form.
    pub fn is_user_facing(&self) -> bool {
        !matches!(self, AppError::Database(_) | AppError::Internal(_))
    }
}

/// Read a text column into one of the stored enums. Unknown values fail the
/// row with a conversion error rather than falling back to a default.
pub(crate) fn parse_column<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = AppError>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: AppError| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Map a foreign-key RESTRICT violation to a readable validation error,
/// passing every other database error through.
pub(crate) fn restrict_violation(err: rusqlite::Error, message: &str) -> AppError {
    match &err {
        rusqlite::Error::SqliteFailure(code, _)
            if code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY =>
        {
            AppError::Validation(message.to_string())
        }
        _ => AppError::Database(err),
    }
}

/// Map a UNIQUE violation to a readable validation error.
pub(crate) fn unique_violation(err: rusqlite::Error, message: &str) -> AppError {
    match &err {
        rusqlite::Error::SqliteFailure(code, _)
            if code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            AppError::Validation(message.to_string())
        }
        _ => AppError::Database(err),
    }
}
