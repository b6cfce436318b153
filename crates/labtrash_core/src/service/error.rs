//! Service-boundary error taxonomy.
//!
//! # Invariants
//! - Every service call fails with exactly one of `NotFound`,
//!   `Authorization`, `Validation` or `Repo`.
//! - A failed call has rolled back every write it made.

use crate::auth::session::AccessDenied;
use crate::model::deletion::DeletionId;
use crate::model::entity::{EntityValidationError, PermId};
use crate::repo::RepoError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type TrashResult<T> = Result<T, TrashError>;

/// What could not be found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundTarget {
    Entity(PermId),
    /// Unknown, already reverted, or invisible to the caller.
    Deletion(DeletionId),
}

/// Errors surfaced by entity and deletion services.
#[derive(Debug)]
pub enum TrashError {
    NotFound(NotFoundTarget),
    Authorization(AccessDenied),
    Validation(String),
    Repo(RepoError),
}

impl TrashError {
    /// Stable code used in log events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Authorization(_) => "authorization",
            Self::Validation(_) => "validation",
            Self::Repo(_) => "storage",
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

impl Display for TrashError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(NotFoundTarget::Entity(id)) => write!(
                f,
                "Entity with ID {id} does not exist. Maybe someone has just deleted it."
            ),
            Self::NotFound(NotFoundTarget::Deletion(id)) => {
                write!(f, "Deletion {id} does not exist or was already reverted.")
            }
            Self::Authorization(err) => write!(f, "{err}"),
            Self::Validation(message) => write!(f, "{message}"),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for TrashError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Authorization(err) => Some(err),
            Self::Repo(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RepoError> for TrashError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::EntityNotFound(id) => Self::NotFound(NotFoundTarget::Entity(id)),
            RepoError::DeletionNotFound(id) => Self::NotFound(NotFoundTarget::Deletion(id)),
            RepoError::Validation(message) => Self::Validation(message),
            other => Self::Repo(other),
        }
    }
}

impl From<rusqlite::Error> for TrashError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Repo(value.into())
    }
}

impl From<AccessDenied> for TrashError {
    fn from(value: AccessDenied) -> Self {
        Self::Authorization(value)
    }
}

impl From<EntityValidationError> for TrashError {
    fn from(value: EntityValidationError) -> Self {
        Self::Validation(value.to_string())
    }
}
