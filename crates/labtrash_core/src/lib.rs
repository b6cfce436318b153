//! Soft deletion and reversal for laboratory entities.
//! Entities move to a trash with their dependents and come back exactly as
//! they were when the deletion is reverted.

pub mod auth;
pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;

pub use auth::session::{AccessDenied, Permission, Role, Session};
pub use config::{load_config, load_config_or_default, Config, ConfigError};
pub use db::{open_db, open_db_in_memory, open_db_with_busy_timeout, DbError};
pub use logging::{default_log_level, init_from_config, init_logging, logging_status};
pub use model::deletion::{DeletionId, DeletionTransaction};
pub use model::edge::{EdgeKind, RelationshipEdge};
pub use model::entity::{Entity, EntityKind, EntityRef, EntityState, PermId, Properties};
pub use repo::deletion_repo::DeletionListQuery;
pub use repo::entity_repo::EntityListQuery;
pub use service::deletion_service::DeletionService;
pub use service::entity_service::{EntityService, NewEntity};
pub use service::error::{NotFoundTarget, TrashError, TrashResult};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
