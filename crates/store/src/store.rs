use std::collections::HashMap;

use docket_primitives::entity::Entity;
use docket_primitives::ids::{EntityKind, EntityRef};
use tokio::time::{Duration, Instant};
use tracing::debug;

/// Change notification emitted by every store write.
///
/// `before`/`after` are the full entity states around the write; views use
/// the pair to decide membership moves and scalar deltas.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreChange {
    pub entity_ref: EntityRef,
    pub before: Option<Entity>,
    pub after: Option<Entity>,
    /// Fields dropped because they carried a lower version than stored.
    pub rejected_fields: usize,
}

impl StoreChange {
    /// True when the write left the entity exactly as it was.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.before == self.after
    }
}

#[derive(Debug, Clone)]
struct Slot {
    entity: Entity,
    loaded_at: Instant,
    stale: bool,
}

/// Single source of truth for entity snapshots, at most one per `(kind, id)`.
#[derive(Debug, Default)]
pub struct EntityStore {
    slots: HashMap<EntityRef, Slot>,
}

impl EntityStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, entity_ref: &EntityRef) -> Option<&Entity> {
        self.slots.get(entity_ref).map(|slot| &slot.entity)
    }

    #[must_use]
    pub fn contains(&self, entity_ref: &EntityRef) -> bool {
        self.slots.contains_key(entity_ref)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Merges `entity` into the stored snapshot field by field.
    ///
    /// Fields with a lower version than the stored one are rejected; every
    /// other field overwrites. A write refreshes the entry's freshness.
    pub fn put(&mut self, entity: Entity) -> StoreChange {
        let entity_ref = entity.entity_ref();

        let Some(slot) = self.slots.get_mut(&entity_ref) else {
            let _prev = self.slots.insert(
                entity_ref,
                Slot {
                    entity: entity.clone(),
                    loaded_at: Instant::now(),
                    stale: false,
                },
            );

            return StoreChange {
                entity_ref,
                before: None,
                after: Some(entity),
                rejected_fields: 0,
            };
        };

        let before = slot.entity.clone();
        let merge = slot.entity.merge(entity);

        if merge.rejected > 0 {
            debug!(
                entity = %entity_ref,
                rejected = merge.rejected,
                stored_version = ?before.version(),
                "Rejected stale field versions"
            );
        }

        if merge.accepted > 0 {
            slot.loaded_at = Instant::now();
            slot.stale = false;
        }

        StoreChange {
            entity_ref,
            after: Some(slot.entity.clone()),
            before: Some(before),
            rejected_fields: merge.rejected,
        }
    }

    pub fn remove(&mut self, entity_ref: &EntityRef) -> StoreChange {
        StoreChange {
            entity_ref: *entity_ref,
            before: self.slots.remove(entity_ref).map(|slot| slot.entity),
            after: None,
            rejected_fields: 0,
        }
    }

    /// Replaces the stored snapshot wholesale, bypassing version checks.
    ///
    /// Used for optimistic writes and for restoring a pre-mutation snapshot
    /// on rollback.
    pub fn restore(&mut self, entity_ref: EntityRef, snapshot: Option<Entity>) -> StoreChange {
        let before = match snapshot.clone() {
            Some(entity) => {
                let previous = self.slots.get(&entity_ref).cloned();
                let (loaded_at, stale) = previous
                    .as_ref()
                    .map_or((Instant::now(), false), |slot| (slot.loaded_at, slot.stale));

                let _prev = self.slots.insert(
                    entity_ref,
                    Slot {
                        entity,
                        loaded_at,
                        stale,
                    },
                );
                previous.map(|slot| slot.entity)
            }
            None => self.slots.remove(&entity_ref).map(|slot| slot.entity),
        };

        StoreChange {
            entity_ref,
            before,
            after: snapshot,
            rejected_fields: 0,
        }
    }

    pub fn mark_stale(&mut self, entity_ref: &EntityRef) {
        if let Some(slot) = self.slots.get_mut(entity_ref) {
            slot.stale = true;
        }
    }

    /// Resident, not marked stale, and loaded within `max_age`.
    #[must_use]
    pub fn is_fresh(&self, entity_ref: &EntityRef, max_age: Duration) -> bool {
        self.slots
            .get(entity_ref)
            .is_some_and(|slot| !slot.stale && slot.loaded_at.elapsed() <= max_age)
    }

    pub fn iter_kind(&self, kind: EntityKind) -> impl Iterator<Item = &Entity> + '_ {
        self.slots
            .iter()
            .filter(move |(entity_ref, _)| entity_ref.kind == kind)
            .map(|(_, slot)| &slot.entity)
    }
}
