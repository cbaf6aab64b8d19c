//! Predicates and orderings over entities.
//!
//! A [`Filter`] decides membership of list views and what scalar views count;
//! a [`SortSpec`] decides where an id sits inside a list view. Filters have a
//! stable [`Fingerprint`] so that two list views built from equal filters
//! share an identity regardless of clause order.

use core::cmp::Ordering;
use core::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::entity::{Entity, FieldValue};
use crate::ids::EntityKind;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum Condition {
    Eq(FieldValue),
    Ne(FieldValue),
    AnyOf(Vec<FieldValue>),
    Present,
    Absent,
}

impl Condition {
    #[must_use]
    pub fn holds(&self, value: &FieldValue) -> bool {
        match self {
            Self::Eq(expected) => value == expected,
            Self::Ne(expected) => value != expected,
            Self::AnyOf(options) => options.contains(value),
            Self::Present => !value.is_null(),
            Self::Absent => value.is_null(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Clause {
    pub field: String,
    pub condition: Condition,
}

/// Conjunction of clauses over entities of one kind.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Filter {
    pub kind: EntityKind,
    #[serde(default)]
    pub clauses: Vec<Clause>,
}

impl Filter {
    #[must_use]
    pub const fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            clauses: Vec::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, field: &str, condition: Condition) -> Self {
        self.clauses.push(Clause {
            field: field.to_owned(),
            condition,
        });
        self
    }

    #[must_use]
    pub fn eq(self, field: &str, value: impl Into<FieldValue>) -> Self {
        self.with(field, Condition::Eq(value.into()))
    }

    #[must_use]
    pub fn ne(self, field: &str, value: impl Into<FieldValue>) -> Self {
        self.with(field, Condition::Ne(value.into()))
    }

    #[must_use]
    pub fn matches(&self, entity: &Entity) -> bool {
        entity.kind == self.kind
            && self
                .clauses
                .iter()
                .all(|clause| clause.condition.holds(entity.get(&clause.field)))
    }

    /// Same as [`Filter::matches`] but treats an absent entity as not
    /// matching, which is the shape store changes come in.
    #[must_use]
    pub fn matches_opt(&self, entity: Option<&Entity>) -> bool {
        entity.is_some_and(|entity| self.matches(entity))
    }

    /// Stable identity of this filter, independent of clause order.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint_with(&[])
    }

    /// Fingerprint of this filter together with `extra`, for identities that
    /// depend on more than which entities match.
    #[must_use]
    pub fn fingerprint_with(&self, extra: &[u8]) -> Fingerprint {
        let mut clauses = self.clauses.clone();
        clauses.sort();

        let mut hasher = Sha256::new();
        hasher.update(self.kind.as_str().as_bytes());
        for clause in &clauses {
            hasher.update([0]);
            hasher.update(clause.field.as_bytes());
            hasher.update([0]);
            // serializing plain data into a Vec cannot fail
            hasher.update(serde_json::to_vec(&clause.condition).unwrap_or_default());
        }
        if !extra.is_empty() {
            hasher.update([1]);
            hasher.update(extra);
        }

        let digest = hasher.finalize();
        Fingerprint(hex::encode(&digest[..8]))
    }
}

/// Short hex digest identifying a [`Filter`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ascending,
    Descending,
}

/// Ordering of a list view by one field, ties broken by id in the same
/// direction.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    pub direction: Direction,
}

impl SortSpec {
    #[must_use]
    pub fn ascending(field: &str) -> Self {
        Self {
            field: field.to_owned(),
            direction: Direction::Ascending,
        }
    }

    #[must_use]
    pub fn descending(field: &str) -> Self {
        Self {
            field: field.to_owned(),
            direction: Direction::Descending,
        }
    }

    #[must_use]
    pub fn compare(&self, a: &Entity, b: &Entity) -> Ordering {
        let natural = a
            .get(&self.field)
            .cmp(b.get(&self.field))
            .then_with(|| a.id.cmp(&b.id));

        match self.direction {
            Direction::Ascending => natural,
            Direction::Descending => natural.reverse(),
        }
    }

    /// Whether the sort key differs between two states of one entity.
    #[must_use]
    pub fn key_changed(&self, before: &Entity, after: &Entity) -> bool {
        before.get(&self.field) != after.get(&self.field)
    }
}
