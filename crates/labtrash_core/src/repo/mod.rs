//! Repository layer abstractions and SQLite implementations.
//!
//! # Responsibility
//! - Define use-case oriented data access contracts for the entity store,
//!   the relationship graph and the deletion ledger.
//! - Isolate SQLite query details from service orchestration.
//!
//! # Invariants
//! - Repositories never open transactions themselves; mutating calls are
//!   issued by services inside an immediate transaction.
//! - Repository APIs return semantic errors (`EntityNotFound`,
//!   `DeletionNotFound`) in addition to DB transport errors.

use crate::db::DbError;
use crate::model::deletion::DeletionId;
use crate::model::entity::PermId;
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

pub mod deletion_repo;
pub mod entity_repo;
pub mod graph_repo;

pub type RepoResult<T> = Result<T, RepoError>;

/// Generic repository error for persistence and query operations.
#[derive(Debug)]
pub enum RepoError {
    Db(DbError),
    /// Entity does not exist in the requested visibility.
    EntityNotFound(PermId),
    /// Deletion does not exist or is already reverted.
    DeletionNotFound(DeletionId),
    /// Write rejected before reaching storage.
    Validation(String),
    /// Persisted data cannot be converted to a valid read model.
    InvalidData(String),
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::EntityNotFound(id) => write!(f, "entity not found: {id}"),
            Self::DeletionNotFound(id) => write!(f, "deletion not found: {id}"),
            Self::Validation(message) => write!(f, "{message}"),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

pub(crate) fn parse_uuid(value: &str, column: &'static str) -> RepoResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|_| RepoError::InvalidData(format!("invalid uuid `{value}` in {column}")))
}

pub(crate) fn parse_flag(value: i64, column: &'static str) -> RepoResult<bool> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(RepoError::InvalidData(format!(
            "invalid flag value `{other}` in {column}"
        ))),
    }
}

pub(crate) fn bool_to_int(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}
