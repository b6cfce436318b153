//! Use-case services over the entity store, relationship graph and deletion
//! ledger.
//!
//! # Responsibility
//! - Enforce session authorization at the service boundary.
//! - Run every mutation inside one immediate SQLite transaction.
//! - Emit one `status=ok|error` log event per call.
//!
//! # See also
//! - `cascade` for closure expansion and ordering.
//! - `error` for the service error taxonomy.

pub mod cascade;
pub mod deletion_service;
pub mod entity_service;
pub mod error;

use error::{TrashError, TrashResult};
use log::{error, info, warn};
use std::time::Instant;

/// Logs the outcome of one service call.
///
/// `detail` carries extra `key=value` metadata for the success line. Storage
/// failures log at error level; caller mistakes at warn.
pub(crate) fn log_outcome<T>(
    event: &str,
    started_at: Instant,
    result: &TrashResult<T>,
    detail: impl FnOnce(&T) -> String,
) {
    let duration_ms = started_at.elapsed().as_millis();
    match result {
        Ok(value) => {
            let detail = detail(value);
            if detail.is_empty() {
                info!("event={event} module=service status=ok duration_ms={duration_ms}");
            } else {
                info!("event={event} module=service status=ok {detail} duration_ms={duration_ms}");
            }
        }
        Err(err @ TrashError::Repo(_)) => error!(
            "event={event} module=service status=error error_code={} duration_ms={duration_ms} error={err}",
            err.code()
        ),
        Err(err) => warn!(
            "event={event} module=service status=error error_code={} duration_ms={duration_ms}",
            err.code()
        ),
    }
}
