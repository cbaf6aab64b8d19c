//! Push channel payloads.
//!
//! The transport hands over [`RawPushEvent`]s named `"<kind>.<changeType>"`
//! (for example `"ticket.updated"`) with a JSON body. [`PushEvent::decode`]
//! turns them into a tagged [`Change`] so the reconciler can match
//! exhaustively on the change type.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::entity::{Entity, Field};
use crate::ids::{EntityId, EntityKind, EntityRef, MutationId};

/// One notification exactly as the push transport delivered it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawPushEvent {
    pub name: String,
    pub data: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
    Merged,
}

impl ChangeType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::Merged => "merged",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "updated" => Some(Self::Updated),
            "deleted" => Some(Self::Deleted),
            "merged" => Some(Self::Merged),
            _ => None,
        }
    }
}

/// What happened to the entity named by a [`PushEvent`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Change {
    /// A new entity with its full field set.
    Created(Entity),
    /// A partial field set to merge into the existing entity.
    Updated(Entity),
    Deleted,
    /// The event's entity absorbed `losers`; `survivor` carries any fields
    /// that changed on the surviving entity.
    Merged {
        losers: Vec<EntityId>,
        survivor: Option<Entity>,
    },
}

impl Change {
    #[must_use]
    pub const fn change_type(&self) -> ChangeType {
        match self {
            Self::Created(_) => ChangeType::Created,
            Self::Updated(_) => ChangeType::Updated,
            Self::Deleted => ChangeType::Deleted,
            Self::Merged { .. } => ChangeType::Merged,
        }
    }
}

/// A decoded change notification originated by some actor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PushEvent {
    pub event_id: String,
    pub entity: EntityRef,
    pub origin_mutation_id: Option<MutationId>,
    pub change: Change,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DecodeError {
    #[error("unrecognized event name: {0}")]
    UnknownEvent(String),

    #[error("malformed `{name}` event: {source}")]
    Malformed {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    event_id: String,
    entity_id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    origin_mutation_id: Option<MutationId>,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct FieldsPayload {
    #[serde(default)]
    fields: BTreeMap<String, Field>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct MergedPayload {
    losers: Vec<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fields: Option<BTreeMap<String, Field>>,
}

impl PushEvent {
    pub fn decode(raw: RawPushEvent) -> Result<Self, DecodeError> {
        let Some((kind, change_type)) = raw.name.split_once('.').and_then(|(kind, change)| {
            Some((kind.parse::<EntityKind>().ok()?, ChangeType::parse(change)?))
        }) else {
            return Err(DecodeError::UnknownEvent(raw.name));
        };

        let malformed = |source| DecodeError::Malformed {
            name: raw.name.clone(),
            source,
        };

        let envelope: Envelope = serde_json::from_value(raw.data.clone()).map_err(malformed)?;
        let entity = EntityRef::new(kind, envelope.entity_id);

        let with_fields = |fields: BTreeMap<String, Field>| {
            let mut snapshot = Entity::new(entity);
            snapshot.fields = fields;
            snapshot
        };

        let change = match change_type {
            ChangeType::Created | ChangeType::Updated => {
                let payload: FieldsPayload =
                    serde_json::from_value(envelope.payload).map_err(malformed)?;
                let snapshot = with_fields(payload.fields);
                if change_type == ChangeType::Created {
                    Change::Created(snapshot)
                } else {
                    Change::Updated(snapshot)
                }
            }
            ChangeType::Deleted => Change::Deleted,
            ChangeType::Merged => {
                let payload: MergedPayload =
                    serde_json::from_value(envelope.payload).map_err(malformed)?;
                Change::Merged {
                    losers: payload.losers,
                    survivor: payload.fields.map(with_fields),
                }
            }
        };

        Ok(Self {
            event_id: envelope.event_id,
            entity,
            origin_mutation_id: envelope.origin_mutation_id,
            change,
        })
    }

    /// Inverse of [`PushEvent::decode`], used by authorities that publish
    /// events.
    #[must_use]
    pub fn encode(&self) -> RawPushEvent {
        let payload = match &self.change {
            Change::Created(entity) | Change::Updated(entity) => to_value(&FieldsPayload {
                fields: entity.fields.clone(),
            }),
            Change::Deleted => Value::Null,
            Change::Merged { losers, survivor } => to_value(&MergedPayload {
                losers: losers.clone(),
                fields: survivor.as_ref().map(|entity| entity.fields.clone()),
            }),
        };

        let envelope = Envelope {
            event_id: self.event_id.clone(),
            entity_id: self.entity.id,
            origin_mutation_id: self.origin_mutation_id.clone(),
            payload,
        };

        RawPushEvent {
            name: format!("{}.{}", self.entity.kind, self.change.change_type().as_str()),
            data: to_value(&envelope),
        }
    }

    /// Every entity this event touches: the named entity plus, for merges,
    /// each losing entity.
    #[must_use]
    pub fn entity_refs(&self) -> Vec<EntityRef> {
        let mut refs = vec![self.entity];
        if let Change::Merged { losers, .. } = &self.change {
            refs.extend(
                losers
                    .iter()
                    .map(|loser| EntityRef::new(self.entity.kind, *loser)),
            );
        }
        refs
    }
}

fn to_value<T: Serialize>(payload: &T) -> Value {
    // plain data structs with string keys always serialize
    serde_json::to_value(payload).unwrap_or(Value::Null)
}
