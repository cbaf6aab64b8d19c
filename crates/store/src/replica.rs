use docket_primitives::entity::Entity;
use docket_primitives::ids::EntityRef;
use docket_primitives::view::ViewKey;

use crate::store::{EntityStore, StoreChange};
use crate::views::{ChangeEffects, ViewRegistry, WriteKind};

/// Entity store plus the views derived from it.
///
/// Every write goes through here so views never miss a store change.
#[derive(Debug, Default)]
pub struct Replica {
    store: EntityStore,
    views: ViewRegistry,
}

impl Replica {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn store(&self) -> &EntityStore {
        &self.store
    }

    #[must_use]
    pub const fn views(&self) -> &ViewRegistry {
        &self.views
    }

    pub fn views_mut(&mut self) -> &mut ViewRegistry {
        &mut self.views
    }

    /// Split borrow for callers that need to read the store while editing
    /// views.
    pub fn parts_mut(&mut self) -> (&EntityStore, &mut ViewRegistry) {
        (&self.store, &mut self.views)
    }

    /// Version-checked merge of a change made by some actor.
    pub fn put(&mut self, entity: Entity) -> ChangeEffects {
        let change = self.store.put(entity);
        self.route(&change, WriteKind::Change)
    }

    /// Version-checked merge of data fetched from the authority.
    pub fn load(&mut self, entity: Entity) -> ChangeEffects {
        let change = self.store.put(entity);
        self.route(&change, WriteKind::Load)
    }

    pub fn remove(&mut self, entity_ref: &EntityRef) -> ChangeEffects {
        let change = self.store.remove(entity_ref);
        self.route(&change, WriteKind::Change)
    }

    /// Unconditional write of a whole snapshot, as an optimistic mutation
    /// does it.
    pub fn write(&mut self, entity_ref: EntityRef, snapshot: Option<Entity>) -> ChangeEffects {
        let change = self.store.restore(entity_ref, snapshot);
        self.route(&change, WriteKind::Change)
    }

    /// Puts a snapshot back without touching list membership or counters.
    ///
    /// Rollback restores those from their own captured state, so only the
    /// detail view is republished here.
    pub fn revert(&mut self, entity_ref: EntityRef, snapshot: Option<Entity>) -> StoreChange {
        let change = self.store.restore(entity_ref, snapshot);
        self.views.touch(&ViewKey::detail(entity_ref));
        change
    }

    pub fn mark_stale(&mut self, entity_ref: &EntityRef) {
        self.store.mark_stale(entity_ref);
        let _known = self.views.mark_stale(&ViewKey::detail(*entity_ref));
    }

    /// Publishes all views changed since the last flush.
    pub fn flush(&mut self) {
        self.views.flush(&self.store);
    }

    fn route(&mut self, change: &StoreChange, kind: WriteKind) -> ChangeEffects {
        self.views.on_store_change(change, &self.store, kind)
    }
}
