use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::{EntityId, EntityKind, EntityRef};

/// A single scalar field value.
///
/// Variants are ordered so that values of the same type compare naturally,
/// which is what list views sort by.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl FieldValue {
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<EntityId> for FieldValue {
    fn from(value: EntityId) -> Self {
        Self::Int(i64::try_from(value.get()).unwrap_or(i64::MAX))
    }
}

/// A field value together with the optional monotonic version it was
/// written at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub value: FieldValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl Field {
    #[must_use]
    pub const fn new(value: FieldValue) -> Self {
        Self {
            value,
            version: None,
        }
    }

    #[must_use]
    pub const fn versioned(value: FieldValue, version: u64) -> Self {
        Self {
            value,
            version: Some(version),
        }
    }

    /// Whether `incoming` may replace `self`.
    ///
    /// Only a strictly lower version loses; unversioned writes always win.
    #[must_use]
    pub fn accepts(&self, incoming: &Self) -> bool {
        match (self.version, incoming.version) {
            (Some(current), Some(next)) => next >= current,
            _ => true,
        }
    }
}

/// Outcome of merging one entity snapshot into another.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FieldMerge {
    pub accepted: usize,
    pub rejected: usize,
    pub changed: bool,
}

/// An addressable domain object with a versioned field set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub kind: EntityKind,
    pub id: EntityId,
    #[serde(default)]
    pub fields: BTreeMap<String, Field>,
}

impl Entity {
    #[must_use]
    pub const fn new(entity_ref: EntityRef) -> Self {
        Self {
            kind: entity_ref.kind,
            id: entity_ref.id,
            fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.kind, self.id)
    }

    #[must_use]
    pub fn with(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.set(name, value);
        self
    }

    #[must_use]
    pub fn with_versioned(mut self, name: &str, value: impl Into<FieldValue>, version: u64) -> Self {
        let _prev = self
            .fields
            .insert(name.to_owned(), Field::versioned(value.into(), version));
        self
    }

    /// Sets a field, keeping whatever version it was last written at.
    pub fn set(&mut self, name: &str, value: impl Into<FieldValue>) {
        let value = value.into();
        match self.fields.get_mut(name) {
            Some(field) => field.value = value,
            None => {
                let _prev = self.fields.insert(name.to_owned(), Field::new(value));
            }
        }
    }

    /// Reads a field; a missing field reads as `Null`.
    #[must_use]
    pub fn get(&self, name: &str) -> &FieldValue {
        const NULL: &FieldValue = &FieldValue::Null;

        self.fields.get(name).map_or(NULL, |field| &field.value)
    }

    /// Highest field version seen on this entity.
    #[must_use]
    pub fn version(&self) -> Option<u64> {
        self.fields.values().filter_map(|field| field.version).max()
    }

    /// Merges `incoming` field by field: last writer wins, except that a
    /// versioned field never goes backwards. Fields missing from `incoming`
    /// are kept.
    pub fn merge(&mut self, incoming: Self) -> FieldMerge {
        let mut merge = FieldMerge::default();

        for (name, field) in incoming.fields {
            match self.fields.get_mut(&name) {
                Some(current) if !current.accepts(&field) => merge.rejected += 1,
                Some(current) => {
                    merge.accepted += 1;
                    if *current != field {
                        merge.changed = true;
                        *current = field;
                    }
                }
                None => {
                    merge.accepted += 1;
                    merge.changed = true;
                    let _prev = self.fields.insert(name, field);
                }
            }
        }

        merge
    }
}
