use core::fmt;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::entity::{Entity, FieldValue};
use crate::ids::{EntityRef, MutationId};

/// The change a mutation makes to each of its target entities.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum MutationChange {
    /// Overwrite the named fields.
    SetFields(BTreeMap<String, FieldValue>),
    /// Create the entity; its id may be a provisional client-side id.
    Create(Entity),
    Delete,
}

impl MutationChange {
    #[must_use]
    pub fn set(field: &str, value: impl Into<FieldValue>) -> Self {
        let mut fields = BTreeMap::new();
        let _prev = fields.insert(field.to_owned(), value.into());
        Self::SetFields(fields)
    }

    /// Computes the patched snapshot of one target.
    ///
    /// Setting fields on an entity that is not resident is a no-op locally;
    /// the authority's reply fills it in on commit.
    #[must_use]
    pub fn apply(&self, before: Option<&Entity>) -> Option<Entity> {
        match self {
            Self::SetFields(fields) => before.map(|entity| {
                let mut patched = entity.clone();
                for (name, value) in fields {
                    patched.set(name, value.clone());
                }
                patched
            }),
            Self::Create(entity) => Some(entity.clone()),
            Self::Delete => None,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SetFields(_) => "set_fields",
            Self::Create(_) => "create",
            Self::Delete => "delete",
        }
    }
}

/// What the remote authority is asked to execute for one mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationDescriptor {
    pub mutation_id: MutationId,
    pub targets: Vec<EntityRef>,
    pub change: MutationChange,
}

/// Why the authority refused a mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    /// The request never reached a decision; safe to retry.
    Network,
    /// The authority rejected the change outright.
    Validation,
    /// The entity changed on the authority since the optimistic base.
    Conflict,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Network => "network",
            Self::Validation => "validation",
            Self::Conflict => "conflict",
        })
    }
}

/// Result of `submit(mutation)`: either the authority's copy of the entity
/// (absent for deletes) or a typed refusal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Settlement {
    Committed { entity: Option<Entity> },
    Rejected { error_kind: FailureKind, message: String },
}

impl Settlement {
    #[must_use]
    pub const fn committed(entity: Option<Entity>) -> Self {
        Self::Committed { entity }
    }

    #[must_use]
    pub fn rejected(error_kind: FailureKind, message: &str) -> Self {
        Self::Rejected {
            error_kind,
            message: message.to_owned(),
        }
    }

    #[must_use]
    pub const fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }
}
