//! Ownership edges between entities.
//!
//! An edge has no lifecycle of its own: it is visible exactly when its child
//! is active.

use crate::model::entity::{EntityKind, TechId};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Relationship category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Sample or data set owned by an experiment, data set owned by a sample.
    BelongsTo,
    /// Sample inside a container sample, data set inside a container data set.
    ComponentOf,
}

impl EdgeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BelongsTo => "belongs_to",
            Self::ComponentOf => "component_of",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "belongs_to" => Some(Self::BelongsTo),
            "component_of" => Some(Self::ComponentOf),
            _ => None,
        }
    }

    /// Returns whether `child_kind -> parent_kind` is a legal edge of this kind.
    pub fn allows(self, child_kind: EntityKind, parent_kind: EntityKind) -> bool {
        use EntityKind::{DataSet, Experiment, Sample};
        match self {
            Self::BelongsTo => matches!(
                (child_kind, parent_kind),
                (Sample, Experiment) | (DataSet, Experiment) | (DataSet, Sample)
            ),
            Self::ComponentOf => matches!(
                (child_kind, parent_kind),
                (Sample, Sample) | (DataSet, DataSet)
            ),
        }
    }
}

impl Display for EdgeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Directed link from a child entity to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelationshipEdge {
    pub child: TechId,
    pub parent: TechId,
    pub kind: EdgeKind,
}

#[cfg(test)]
mod tests {
    use super::EdgeKind;
    use crate::model::entity::EntityKind;

    #[test]
    fn belongs_to_allows_ownership_pairs_only() {
        assert!(EdgeKind::BelongsTo.allows(EntityKind::Sample, EntityKind::Experiment));
        assert!(EdgeKind::BelongsTo.allows(EntityKind::DataSet, EntityKind::Sample));
        assert!(!EdgeKind::BelongsTo.allows(EntityKind::Experiment, EntityKind::Sample));
        assert!(!EdgeKind::BelongsTo.allows(EntityKind::Material, EntityKind::Experiment));
    }

    #[test]
    fn component_of_requires_same_kind_containers() {
        assert!(EdgeKind::ComponentOf.allows(EntityKind::Sample, EntityKind::Sample));
        assert!(EdgeKind::ComponentOf.allows(EntityKind::DataSet, EntityKind::DataSet));
        assert!(!EdgeKind::ComponentOf.allows(EntityKind::DataSet, EntityKind::Sample));
    }
}
