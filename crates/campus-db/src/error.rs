use std::collections::BTreeMap;

use thiserror::Error;

/// Field name -> human readable messages.
pub type FieldErrors = BTreeMap<String, Vec<String>>;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("validation failed")]
    Validation(FieldErrors),

    #[error("forbidden")]
    Forbidden,

    /// Also returned for records owned by another tenant.
    #[error("not found")]
    NotFound,

    #[error("reaction already exists")]
    DuplicateReaction,

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("missing tenant context")]
    MissingTenantContext,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl DomainError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        let mut errors = FieldErrors::new();
        errors.insert(field.to_string(), vec![message.into()]);
        DomainError::Validation(errors)
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        DomainError::InvariantViolation(message.into())
    }
}

/// Is this a UNIQUE/PRIMARY KEY constraint failure?
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}
