//! Deletion transaction model.

use crate::model::entity::EntityRef;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::num::ParseIntError;
use std::str::FromStr;

/// Opaque deletion handle. Issued once, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeletionId(i64);

impl DeletionId {
    /// Wraps a raw ledger key. Callers normally receive ids from the ledger.
    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    pub fn as_raw(self) -> i64 {
        self.0
    }
}

impl Display for DeletionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeletionId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(Self)
    }
}

/// One recorded deletion.
///
/// Immutable except for the revert fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionTransaction {
    pub deletion_id: DeletionId,
    /// Entities as requested by the caller, before cascade expansion.
    pub original_entities: Vec<EntityRef>,
    /// Entities this deletion tombstoned, parents before children.
    pub cascaded_entities: Vec<EntityRef>,
    pub reason: String,
    pub actor: String,
    /// Epoch ms.
    pub deleted_at: i64,
    pub reverted: bool,
    pub reverted_at: Option<i64>,
    pub reverted_by: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::DeletionId;

    #[test]
    fn deletion_id_parses_and_displays() {
        let id: DeletionId = " 42 ".parse().expect("numeric id should parse");
        assert_eq!(id.as_raw(), 42);
        assert_eq!(id.to_string(), "42");
        assert!("abc".parse::<DeletionId>().is_err());
    }
}
