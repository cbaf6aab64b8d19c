use std::collections::{BTreeMap, BTreeSet, HashMap};

use docket_primitives::ids::{EntityId, EntityKind, EntityRef};
use docket_primitives::view::{ListViewDef, ScalarViewDef, ViewKey};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::list::{ListView, Presence};
use crate::store::{EntityStore, StoreChange};
use crate::subscription::{
    DetailSnapshot, ListSnapshot, ScalarSnapshot, ViewSnapshot, ViewSubscription,
};

/// Explicit structural operations on a view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StructuralOp {
    /// Insert at head; an id already present only moves when `promote`.
    InsertAtHead { id: EntityId, promote: bool },
    RemoveAll(EntityId),
    AppendPage {
        ids: Vec<EntityId>,
        next_cursor: Option<String>,
    },
    /// Drop every loaded page and start over from these; clears staleness.
    ReplacePages {
        pages: Vec<Vec<EntityId>>,
        next_cursor: Option<String>,
    },
    MarkStale,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("view {0} is not registered")]
pub struct UnknownView(pub ViewKey);

/// Why the store was written, which decides whether views treat the write
/// as a domain change or as the cache learning about existing state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteKind {
    /// Created, updated or deleted by some actor.
    Change,
    /// Loaded from the authority; never moves counters.
    Load,
}

/// What one store change did to the views.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeEffects {
    /// Signed scalar adjustments made, in registry order.
    pub scalar_deltas: Vec<(ViewKey, i64)>,
    /// List views whose membership or order changed.
    pub lists: Vec<ViewKey>,
}

#[derive(Debug)]
struct ScalarView {
    def: ScalarViewDef,
    value: i64,
    loaded: bool,
    stale_since: Option<Instant>,
}

#[derive(Debug)]
struct DetailView {
    stale_since: Option<Instant>,
}

/// Named, parameterized read views over the entity store.
///
/// Views hold ids and view-local metadata only; entity data is always read
/// from the [`EntityStore`] at publish time.
#[derive(Debug, Default)]
pub struct ViewRegistry {
    lists: BTreeMap<ViewKey, ListView>,
    scalars: BTreeMap<ViewKey, ScalarView>,
    details: BTreeMap<EntityRef, DetailView>,
    channels: HashMap<ViewKey, watch::Sender<ViewSnapshot>>,
    dirty: BTreeSet<ViewKey>,
}

impl ViewRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a list view; registering an equal definition again is a
    /// no-op.
    pub fn register_list(&mut self, def: ListViewDef) -> ViewKey {
        let key = def.key();
        let _view = self
            .lists
            .entry(key.clone())
            .or_insert_with(|| ListView::new(def));
        key
    }

    pub fn register_scalar(&mut self, def: ScalarViewDef) -> ViewKey {
        let key = def.key();
        let _view = self.scalars.entry(key.clone()).or_insert(ScalarView {
            def,
            value: 0,
            loaded: false,
            stale_since: None,
        });
        key
    }

    #[must_use]
    pub fn list_def(&self, key: &ViewKey) -> Option<&ListViewDef> {
        self.lists.get(key).map(|list| &list.def)
    }

    #[must_use]
    pub fn scalar_def(&self, key: &ViewKey) -> Option<&ScalarViewDef> {
        self.scalars.get(key).map(|scalar| &scalar.def)
    }

    pub fn list_keys(&self) -> impl Iterator<Item = &ViewKey> + '_ {
        self.lists.keys()
    }

    pub fn scalar_keys(&self) -> impl Iterator<Item = &ViewKey> + '_ {
        self.scalars.keys()
    }

    /// Scalar views counting entities of `kind`.
    #[must_use]
    pub fn scalar_keys_for(&self, kind: EntityKind) -> Vec<ViewKey> {
        self.scalars
            .iter()
            .filter(|(_, scalar)| scalar.def.filter.kind == kind)
            .map(|(key, _)| key.clone())
            .collect()
    }

    #[must_use]
    pub fn is_loaded(&self, key: &ViewKey) -> bool {
        match key {
            ViewKey::List { .. } => self.lists.get(key).is_some_and(|list| list.loaded),
            ViewKey::Scalar { .. } => self.scalars.get(key).is_some_and(|scalar| scalar.loaded),
            ViewKey::Detail { entity } => self.details.contains_key(entity),
        }
    }

    /// Cursor of the next unloaded page of a list view.
    #[must_use]
    pub fn next_cursor(&self, key: &ViewKey) -> Option<&str> {
        self.lists
            .get(key)
            .and_then(|list| list.next_cursor.as_deref())
    }

    #[must_use]
    pub fn contains(&self, key: &ViewKey) -> bool {
        match key {
            ViewKey::List { .. } => self.lists.contains_key(key),
            ViewKey::Scalar { .. } => self.scalars.contains_key(key),
            ViewKey::Detail { entity } => self.details.contains_key(entity),
        }
    }

    /// Subscribes to a view. Detail views are created on first use; list and
    /// scalar views must be registered first.
    pub fn subscribe(
        &mut self,
        key: &ViewKey,
        store: &EntityStore,
    ) -> Result<ViewSubscription, UnknownView> {
        if let ViewKey::Detail { entity } = key {
            let _view = self
                .details
                .entry(*entity)
                .or_insert(DetailView { stale_since: None });
        }

        let snapshot = self
            .snapshot(key, store)
            .ok_or_else(|| UnknownView(key.clone()))?;

        let rx = match self.channels.get(key) {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = watch::channel(snapshot);
                let _prev = self.channels.insert(key.clone(), tx);
                rx
            }
        };

        Ok(ViewSubscription::new(key.clone(), rx))
    }

    /// Views with at least one live subscription, lists and details before
    /// scalars.
    #[must_use]
    pub fn subscribed(&self) -> Vec<ViewKey> {
        let mut keys: Vec<ViewKey> = self
            .channels
            .iter()
            .filter(|(_, tx)| tx.receiver_count() > 0)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort_by_key(|key| (key.is_scalar(), key.clone()));
        keys
    }

    #[must_use]
    pub fn is_subscribed(&self, key: &ViewKey) -> bool {
        self.channels
            .get(key)
            .is_some_and(|tx| tx.receiver_count() > 0)
    }

    #[must_use]
    pub fn snapshot(&self, key: &ViewKey, store: &EntityStore) -> Option<ViewSnapshot> {
        match key {
            ViewKey::List { .. } => self.lists.get(key).map(|list| {
                ViewSnapshot::List(ListSnapshot {
                    pages: list.pages().to_vec(),
                    loaded: list.loaded,
                    has_more: list.next_cursor.is_some(),
                    stale: list.stale_since.is_some(),
                })
            }),
            ViewKey::Scalar { .. } => self.scalars.get(key).map(|scalar| {
                ViewSnapshot::Scalar(ScalarSnapshot {
                    value: scalar.value,
                    loaded: scalar.loaded,
                    stale: scalar.stale_since.is_some(),
                })
            }),
            ViewKey::Detail { entity } => self.details.get(entity).map(|detail| {
                ViewSnapshot::Detail(DetailSnapshot {
                    entity: store.get(entity).cloned(),
                    stale: detail.stale_since.is_some(),
                })
            }),
        }
    }

    /// Whether a consumer asking for fresh data should trigger a fetch.
    #[must_use]
    pub fn needs_revalidation(&self, key: &ViewKey, store: &EntityStore) -> bool {
        match key {
            ViewKey::List { .. } => self
                .lists
                .get(key)
                .is_some_and(|list| !list.loaded || list.stale_since.is_some()),
            ViewKey::Scalar { .. } => self
                .scalars
                .get(key)
                .is_some_and(|scalar| !scalar.loaded || scalar.stale_since.is_some()),
            ViewKey::Detail { entity } => {
                !store.contains(entity)
                    || self
                        .details
                        .get(entity)
                        .is_some_and(|detail| detail.stale_since.is_some())
            }
        }
    }

    /// When the view was first marked stale, if it still is.
    #[must_use]
    pub fn stale_since(&self, key: &ViewKey) -> Option<Instant> {
        match key {
            ViewKey::List { .. } => self.lists.get(key).and_then(|list| list.stale_since),
            ViewKey::Scalar { .. } => self.scalars.get(key).and_then(|scalar| scalar.stale_since),
            ViewKey::Detail { entity } => {
                self.details.get(entity).and_then(|detail| detail.stale_since)
            }
        }
    }

    pub fn apply_structural(&mut self, key: &ViewKey, op: StructuralOp) -> Result<bool, UnknownView> {
        if op == StructuralOp::MarkStale {
            return self.mark_stale(key).then_some(true).ok_or_else(|| UnknownView(key.clone()));
        }

        let list = self
            .lists
            .get_mut(key)
            .ok_or_else(|| UnknownView(key.clone()))?;

        let changed = match op {
            StructuralOp::InsertAtHead { id, promote } => list.insert_head(id, promote),
            StructuralOp::RemoveAll(id) => list.remove(id),
            StructuralOp::AppendPage { ids, next_cursor } => {
                let _appended = list.append_page(ids);
                list.next_cursor = next_cursor;
                true
            }
            StructuralOp::ReplacePages { pages, next_cursor } => {
                list.replace_pages(pages);
                list.next_cursor = next_cursor;
                list.stale_since = None;
                true
            }
            StructuralOp::MarkStale => false,
        };

        if changed {
            let _new = self.dirty.insert(key.clone());
        }
        Ok(changed)
    }

    /// Routes one store change to every view it affects.
    pub fn on_store_change(
        &mut self,
        change: &StoreChange,
        store: &EntityStore,
        kind: WriteKind,
    ) -> ChangeEffects {
        let mut effects = ChangeEffects::default();
        if change.is_noop() {
            return effects;
        }

        let entity_ref = change.entity_ref;
        if self.details.contains_key(&entity_ref) {
            let _new = self.dirty.insert(ViewKey::detail(entity_ref));
        }

        if kind == WriteKind::Change {
            for (key, scalar) in &mut self.scalars {
                let filter = &scalar.def.filter;
                if filter.kind != entity_ref.kind {
                    continue;
                }
                let delta = i64::from(filter.matches_opt(change.after.as_ref()))
                    - i64::from(filter.matches_opt(change.before.as_ref()));
                if delta != 0 {
                    scalar.value += delta;
                    let _new = self.dirty.insert(key.clone());
                    effects.scalar_deltas.push((key.clone(), delta));
                }
            }
        }

        for (key, list) in &mut self.lists {
            if list.def.filter.kind != entity_ref.kind {
                continue;
            }

            let present = list.contains(entity_ref.id);
            let moved = match &change.after {
                None => list.remove(entity_ref.id),
                Some(after) => {
                    let matches_now = list.def.filter.matches(after);
                    let matched_before = list.def.filter.matches_opt(change.before.as_ref());
                    let sort_changed = list.def.sort.as_ref().is_some_and(|sort| {
                        change
                            .before
                            .as_ref()
                            .is_some_and(|before| sort.key_changed(before, after))
                    });

                    if present && !matches_now {
                        list.remove(entity_ref.id)
                    } else if present {
                        sort_changed && list.reposition(after, store)
                    } else if matches_now && !matched_before && change.before.is_some() {
                        list.place(after, store)
                    } else if matches_now && change.before.is_none() && kind == WriteKind::Change {
                        list.place(after, store)
                    } else {
                        false
                    }
                }
            };

            if moved {
                let _new = self.dirty.insert(key.clone());
                effects.lists.push(key.clone());
            }
        }

        effects
    }

    /// Where `entity` sits in every list view of its kind.
    #[must_use]
    pub fn list_presence(&self, entity: &EntityRef) -> Vec<(ViewKey, Presence)> {
        self.lists
            .iter()
            .filter(|(_, list)| list.def.filter.kind == entity.kind)
            .map(|(key, list)| (key.clone(), list.presence(entity.id)))
            .collect()
    }

    pub fn restore_presence(&mut self, key: &ViewKey, id: EntityId, presence: &Presence) -> bool {
        let restored = self
            .lists
            .get_mut(key)
            .is_some_and(|list| list.restore(id, presence));
        if restored {
            let _new = self.dirty.insert(key.clone());
        }
        restored
    }

    /// Adds `delta` to a scalar view. Used to undo optimistic adjustments.
    pub fn adjust_scalar(&mut self, key: &ViewKey, delta: i64) {
        if let Some(scalar) = self.scalars.get_mut(key) {
            scalar.value += delta;
            let _new = self.dirty.insert(key.clone());
        }
    }

    /// Overwrites a scalar with a recomputed value and clears staleness.
    pub fn set_scalar(&mut self, key: &ViewKey, value: i64) {
        if let Some(scalar) = self.scalars.get_mut(key) {
            if scalar.value != value {
                debug!(view = %key, incremental = scalar.value, recomputed = value, "Scalar view corrected");
            }
            scalar.value = value;
            scalar.loaded = true;
            scalar.stale_since = None;
            let _new = self.dirty.insert(key.clone());
        }
    }

    #[must_use]
    pub fn scalar_value(&self, key: &ViewKey) -> Option<i64> {
        self.scalars.get(key).map(|scalar| scalar.value)
    }

    /// Counts matching resident entities from scratch.
    #[must_use]
    pub fn recompute_scalar_local(&self, key: &ViewKey, store: &EntityStore) -> Option<i64> {
        let scalar = self.scalars.get(key)?;
        let count = store
            .iter_kind(scalar.def.filter.kind)
            .filter(|entity| scalar.def.filter.matches(entity))
            .count();
        Some(i64::try_from(count).unwrap_or(i64::MAX))
    }

    /// Marks a view stale. Staleness is advisory: nothing is refetched here.
    pub fn mark_stale(&mut self, key: &ViewKey) -> bool {
        let now = Instant::now();
        let slot = match key {
            ViewKey::List { .. } => self.lists.get_mut(key).map(|list| &mut list.stale_since),
            ViewKey::Scalar { .. } => self
                .scalars
                .get_mut(key)
                .map(|scalar| &mut scalar.stale_since),
            ViewKey::Detail { entity } => self
                .details
                .get_mut(entity)
                .map(|detail| &mut detail.stale_since),
        };

        let Some(stale_since) = slot else {
            return false;
        };
        if stale_since.is_none() {
            *stale_since = Some(now);
            let _new = self.dirty.insert(key.clone());
        }
        true
    }

    /// Clears staleness of a detail view after its entity was refetched.
    pub fn mark_detail_fresh(&mut self, entity: &EntityRef) {
        if let Some(detail) = self.details.get_mut(entity) {
            if detail.stale_since.take().is_some() {
                let _new = self.dirty.insert(ViewKey::detail(*entity));
            }
        }
    }

    /// List views containing `entity` plus its detail view, if any.
    #[must_use]
    pub fn views_containing(&self, entity: &EntityRef) -> Vec<ViewKey> {
        let mut keys: Vec<ViewKey> = self
            .lists
            .iter()
            .filter(|(_, list)| list.def.filter.kind == entity.kind && list.contains(entity.id))
            .map(|(key, _)| key.clone())
            .collect();
        if self.details.contains_key(entity) {
            keys.push(ViewKey::detail(*entity));
        }
        keys
    }

    /// Brings one list's membership of `entity` in line with the store's
    /// current state. Used after replacing pages with authority data while
    /// optimistic writes are still pending.
    pub fn reconcile_membership(
        &mut self,
        key: &ViewKey,
        entity: &EntityRef,
        store: &EntityStore,
    ) -> bool {
        let Some(list) = self.lists.get_mut(key) else {
            return false;
        };
        if list.def.filter.kind != entity.kind {
            return false;
        }

        let changed = match store.get(entity) {
            Some(current) if list.def.filter.matches(current) => list.place(current, store),
            _ => list.remove(entity.id),
        };
        if changed {
            let _new = self.dirty.insert(key.clone());
        }
        changed
    }

    /// Replaces a provisional id with the authority's id everywhere.
    pub fn rekey(&mut self, old: &EntityRef, new: &EntityRef) {
        for (key, list) in &mut self.lists {
            if list.def.filter.kind == old.kind && list.rekey(old.id, new.id) {
                let _new = self.dirty.insert(key.clone());
            }
        }
        if self.details.contains_key(old) {
            let _new = self.dirty.insert(ViewKey::detail(*old));
        }
    }

    /// Entities currently on screen: the first page of each subscribed list
    /// and each subscribed detail record.
    #[must_use]
    pub fn visible_entities(&self) -> Vec<EntityRef> {
        let mut visible = Vec::new();
        for key in self.subscribed() {
            match &key {
                ViewKey::List { .. } => {
                    if let Some(list) = self.lists.get(&key) {
                        let kind = list.def.filter.kind;
                        if let Some(first) = list.pages().first() {
                            visible.extend(first.iter().map(|id| EntityRef::new(kind, *id)));
                        }
                    }
                }
                ViewKey::Detail { entity } => visible.push(*entity),
                ViewKey::Scalar { .. } => {}
            }
        }
        visible.sort_unstable();
        visible.dedup();
        visible
    }

    /// Queues a view for republishing on the next flush.
    pub fn touch(&mut self, key: &ViewKey) {
        if self.contains(key) {
            let _new = self.dirty.insert(key.clone());
        }
    }

    /// Publishes every view changed since the last flush.
    pub fn flush(&mut self, store: &EntityStore) {
        for key in core::mem::take(&mut self.dirty) {
            let Some(tx) = self.channels.get(&key) else {
                continue;
            };
            if let Some(snapshot) = self.snapshot(&key, store) {
                let _prev = tx.send_replace(snapshot);
            }
        }
    }
}
