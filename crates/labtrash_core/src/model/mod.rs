//! Domain model for laboratory entities and their deletions.
//!
//! # Responsibility
//! - Define canonical data structures used by core business logic.
//!
//! # Invariants
//! - Every entity is identified by a stable `PermId`.
//! - Deletion is represented by tombstones owned by a deletion transaction,
//!   not hard delete.

pub mod deletion;
pub mod edge;
pub mod entity;
