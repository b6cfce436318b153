//! Caller session and role-based access checks.
//!
//! # Responsibility
//! - Carry the caller identity and granted roles as an explicit per-call value.
//! - Decide whether one caller may read, write, delete or revert one entity.
//!
//! # Invariants
//! - An instance-level role applies to every space and to materials.
//! - Space roles apply only to entities scoped to that space.
//! - Space entities themselves need `Admin` for every mutation.

use crate::model::entity::{normalize_code, Entity, EntityKind, EntityRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Granted role, ordered by strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Observer,
    User,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Observer => "observer",
            Self::User => "user",
            Self::Admin => "admin",
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "observer" => Ok(Self::Observer),
            "user" => Ok(Self::User),
            "admin" => Ok(Self::Admin),
            other => Err(format!(
                "unsupported role `{other}`; expected observer|user|admin"
            )),
        }
    }
}

/// Operation being authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    Write,
    Delete,
    Revert,
}

impl Permission {
    /// Verb used in messages ("delete", "revert the deletion of", ...).
    pub fn verb(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "modify",
            Self::Delete => "delete",
            Self::Revert => "restore",
        }
    }

    /// Minimum role needed for this permission on an entity of `kind`.
    pub fn required_role(self, kind: EntityKind) -> Role {
        match (self, kind) {
            (Self::Read, _) => Role::Observer,
            (_, EntityKind::Space) => Role::Admin,
            _ => Role::User,
        }
    }
}

/// Access check failure naming the offending entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDenied {
    pub actor: String,
    pub permission: Permission,
    pub required: Role,
    pub entity: EntityRef,
    /// Caller-supplied description of what it was doing.
    pub context: Option<String>,
}

impl Display for AccessDenied {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "authorization failure: user `{}` needs role `{}` to {} the {}",
            self.actor,
            self.required,
            self.permission.verb(),
            self.entity
        )?;
        if let Some(context) = &self.context {
            write!(f, " ({context})")?;
        }
        Ok(())
    }
}

impl Error for AccessDenied {}

/// Caller context passed explicitly into every service call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    actor: String,
    instance_role: Option<Role>,
    space_roles: BTreeMap<String, Role>,
    context: Option<String>,
}

impl Session {
    /// Creates a session without any granted role.
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            instance_role: None,
            space_roles: BTreeMap::new(),
            context: None,
        }
    }

    /// Convenience constructor for an instance administrator.
    pub fn instance_admin(actor: impl Into<String>) -> Self {
        Self::new(actor).with_instance_role(Role::Admin)
    }

    pub fn with_instance_role(mut self, role: Role) -> Self {
        self.instance_role = Some(role);
        self
    }

    /// Grants `role` on one space. Space codes are normalized like entity codes;
    /// an invalid code grants nothing.
    pub fn with_space_role(mut self, space: &str, role: Role) -> Self {
        if let Ok(space) = normalize_code(space) {
            self.space_roles.insert(space, role);
        }
        self
    }

    /// Attaches a description appended to authorization errors.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let context = context.into();
        let trimmed = context.trim();
        self.context = if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        };
        self
    }

    pub fn actor(&self) -> &str {
        self.actor.as_str()
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn is_instance_admin(&self) -> bool {
        self.instance_role == Some(Role::Admin)
    }

    /// Effective role within `space` (`None` = instance scope).
    pub fn role_in(&self, space: Option<&str>) -> Option<Role> {
        let space_role = space.and_then(|code| self.space_roles.get(code).copied());
        match (self.instance_role, space_role) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// Returns whether this session holds `permission` on an entity of
    /// `kind` in `space`.
    pub fn can(&self, permission: Permission, kind: EntityKind, space: Option<&str>) -> bool {
        self.role_in(space)
            .is_some_and(|role| role >= permission.required_role(kind))
    }

    /// Checks `permission` on one entity reference.
    pub fn check(&self, permission: Permission, entity: &EntityRef) -> Result<(), AccessDenied> {
        if self.can(permission, entity.kind, entity.space.as_deref()) {
            return Ok(());
        }
        Err(AccessDenied {
            actor: self.actor.clone(),
            permission,
            required: permission.required_role(entity.kind),
            entity: entity.clone(),
            context: self.context.clone(),
        })
    }

    /// Checks `permission` on one stored entity.
    pub fn check_entity(&self, permission: Permission, entity: &Entity) -> Result<(), AccessDenied> {
        if self.can(permission, entity.kind, entity.space.as_deref()) {
            return Ok(());
        }
        self.check(permission, &entity.to_ref())
    }

    /// Returns whether the session may see `entity` at all.
    pub fn can_read(&self, entity: &Entity) -> bool {
        self.can(Permission::Read, entity.kind, entity.space.as_deref())
    }
}
