//! Laboratory entity domain model.
//!
//! # Responsibility
//! - Define the canonical record for spaces, experiments, samples, data sets
//!   and materials.
//! - Provide lifecycle helpers for tombstone state.
//!
//! # Invariants
//! - `perm_id` is stable and never reused for another entity.
//! - `state == Deleted` iff `deletion_id` names the owning deletion.
//! - Materials are instance-level (`space == None`); every other kind is
//!   scoped to exactly one space, and a space is scoped to itself.

use crate::model::deletion::DeletionId;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

static CODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_\-.]+$").expect("valid entity code regex"));

/// Stable global identifier that survives renames.
pub type PermId = Uuid;

/// Numeric storage identifier, ascending in creation order.
pub type TechId = i64;

/// Opaque key/value property bag.
pub type Properties = BTreeMap<String, String>;

/// Entity category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Space,
    Experiment,
    Sample,
    #[serde(rename = "dataset")]
    DataSet,
    Material,
}

impl EntityKind {
    /// Stable storage/wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Space => "space",
            Self::Experiment => "experiment",
            Self::Sample => "sample",
            Self::DataSet => "dataset",
            Self::Material => "material",
        }
    }

    /// Parses the storage/wire name.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "space" => Some(Self::Space),
            "experiment" => Some(Self::Experiment),
            "sample" => Some(Self::Sample),
            "dataset" => Some(Self::DataSet),
            "material" => Some(Self::Material),
            _ => None,
        }
    }

    /// Human-readable name used in error messages.
    pub fn label(self) -> &'static str {
        match self {
            Self::DataSet => "data set",
            other => other.as_str(),
        }
    }

    /// Whether entities of this kind live inside a space.
    pub fn is_space_scoped(self) -> bool {
        !matches!(self, Self::Material)
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tombstone lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    Active,
    Deleted,
}

/// Validation errors for entity drafts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityValidationError {
    /// Code is blank after trim.
    EmptyCode,
    /// Code contains characters outside `[A-Za-z0-9_-.]`.
    InvalidCode(String),
    /// Space-scoped kind created without a space, or material with one.
    InvalidScope {
        kind: EntityKind,
        space: Option<String>,
    },
    /// Space entity whose scope is not its own code.
    SpaceScopeMismatch { code: String, space: String },
    /// Property key is blank after trim.
    EmptyPropertyKey,
}

impl Display for EntityValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyCode => write!(f, "entity code must not be blank"),
            Self::InvalidCode(code) => write!(
                f,
                "entity code `{code}` contains characters other than letters, digits, '_', '-' and '.'"
            ),
            Self::InvalidScope { kind, space: None } => {
                write!(f, "a {} must belong to a space", kind.label())
            }
            Self::InvalidScope {
                kind,
                space: Some(space),
            } => write!(
                f,
                "a {} cannot belong to a space (got `{space}`)",
                kind.label()
            ),
            Self::SpaceScopeMismatch { code, space } => write!(
                f,
                "space `{code}` must be scoped to itself, got `{space}`"
            ),
            Self::EmptyPropertyKey => write!(f, "property keys must not be blank"),
        }
    }
}

impl Error for EntityValidationError {}

/// Canonical stored entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub tech_id: TechId,
    pub perm_id: PermId,
    pub kind: EntityKind,
    /// Upper-cased code, unique per `(kind, space)`.
    pub code: String,
    /// Owning space code. `None` only for materials.
    pub space: Option<String>,
    pub state: EntityState,
    pub properties: Properties,
    /// Owning deletion while tombstoned.
    pub deletion_id: Option<DeletionId>,
    /// Epoch ms.
    pub created_at: i64,
    /// Epoch ms.
    pub updated_at: i64,
}

impl Entity {
    /// Returns whether this entity should be considered visible.
    pub fn is_active(&self) -> bool {
        self.state == EntityState::Active
    }

    /// Renders the user-facing identifier (`/SPACE`, `/SPACE/CODE`, `CODE`).
    pub fn identifier(&self) -> String {
        render_identifier(self.kind, self.space.as_deref(), &self.code)
    }

    /// Lightweight reference used by the ledger and error messages.
    pub fn to_ref(&self) -> EntityRef {
        EntityRef {
            tech_id: self.tech_id,
            perm_id: self.perm_id,
            kind: self.kind,
            space: self.space.clone(),
            identifier: self.identifier(),
        }
    }
}

/// Reference to a stored entity, independent of its current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub tech_id: TechId,
    pub perm_id: PermId,
    pub kind: EntityKind,
    pub space: Option<String>,
    pub identifier: String,
}

impl EntityRef {
    /// Builds a reference from stored columns.
    pub fn new(
        tech_id: TechId,
        perm_id: PermId,
        kind: EntityKind,
        space: Option<String>,
        code: &str,
    ) -> Self {
        let identifier = render_identifier(kind, space.as_deref(), code);
        Self {
            tech_id,
            perm_id,
            kind,
            space,
            identifier,
        }
    }
}

impl Display for EntityRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} ({})",
            self.kind.label(),
            self.identifier,
            self.perm_id
        )
    }
}

/// Validated input for persisting a new entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDraft {
    pub perm_id: PermId,
    pub kind: EntityKind,
    pub code: String,
    pub space: Option<String>,
    pub properties: Properties,
}

impl EntityDraft {
    /// Normalizes and validates raw creation input.
    ///
    /// Codes are trimmed and upper-cased; a space draft without an explicit
    /// scope is scoped to its own code.
    pub fn new(
        kind: EntityKind,
        code: &str,
        space: Option<&str>,
        properties: Properties,
    ) -> Result<Self, EntityValidationError> {
        let code = normalize_code(code)?;
        let space = space.map(normalize_code).transpose()?;

        let space = match (kind, space) {
            (EntityKind::Space, None) => Some(code.clone()),
            (EntityKind::Space, Some(space)) if space != code => {
                return Err(EntityValidationError::SpaceScopeMismatch { code, space });
            }
            (EntityKind::Material, Some(space)) => {
                return Err(EntityValidationError::InvalidScope {
                    kind,
                    space: Some(space),
                });
            }
            (kind, None) if kind.is_space_scoped() => {
                return Err(EntityValidationError::InvalidScope { kind, space: None });
            }
            (_, space) => space,
        };

        if properties.keys().any(|key| key.trim().is_empty()) {
            return Err(EntityValidationError::EmptyPropertyKey);
        }

        Ok(Self {
            perm_id: Uuid::new_v4(),
            kind,
            code,
            space,
            properties,
        })
    }

    pub fn identifier(&self) -> String {
        render_identifier(self.kind, self.space.as_deref(), &self.code)
    }
}

/// Trims, validates and upper-cases an entity or space code.
pub fn normalize_code(value: &str) -> Result<String, EntityValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EntityValidationError::EmptyCode);
    }
    if !CODE_RE.is_match(trimmed) {
        return Err(EntityValidationError::InvalidCode(trimmed.to_string()));
    }
    Ok(trimmed.to_ascii_uppercase())
}

fn render_identifier(kind: EntityKind, space: Option<&str>, code: &str) -> String {
    match (kind, space) {
        (EntityKind::Space, _) => format!("/{code}"),
        (_, Some(space)) => format!("/{space}/{code}"),
        (_, None) => code.to_string(),
    }
}
