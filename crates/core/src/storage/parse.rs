//! Database value parsing utilities
//!
//! Provides error-safe parsing of stored values.

use rusqlite::types::Type;
use rusqlite::Error as SqlError;

use crate::models::Session;

/// Parse a course document from its JSON body column
pub fn parse_session(column: usize, body: &str) -> Result<Session, SqlError> {
    serde_json::from_str(body)
        .map_err(|e| SqlError::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

/// Extension trait for converting rusqlite Results to Option
pub trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>, SqlError>;
}

impl<T> OptionalExt<T> for Result<T, SqlError> {
    fn optional(self) -> Result<Option<T>, SqlError> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(SqlError::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Whether the error is a primary key or unique violation
pub fn is_constraint_violation(err: &SqlError) -> bool {
    matches!(
        err,
        SqlError::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
