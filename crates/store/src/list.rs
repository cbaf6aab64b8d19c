use core::cmp::Ordering;
use std::collections::HashSet;

use docket_primitives::entity::Entity;
use docket_primitives::ids::{EntityId, EntityRef};
use docket_primitives::view::ListViewDef;
use tokio::time::Instant;

use crate::store::EntityStore;

/// Where an id sat in a list view, captured so it can be put back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Presence {
    Absent,
    At {
        /// Flat index across all pages.
        index: usize,
        /// The id immediately before it, if any; preferred over `index` when
        /// restoring because other ids may have moved meanwhile.
        after: Option<EntityId>,
    },
}

/// One list view instance: ordered pages of ids plus view-local metadata.
///
/// Every id appears at most once across all pages.
#[derive(Debug)]
pub(crate) struct ListView {
    pub(crate) def: ListViewDef,
    pages: Vec<Vec<EntityId>>,
    members: HashSet<EntityId>,
    pub(crate) next_cursor: Option<String>,
    pub(crate) loaded: bool,
    pub(crate) stale_since: Option<Instant>,
}

impl ListView {
    pub(crate) fn new(def: ListViewDef) -> Self {
        Self {
            def,
            pages: Vec::new(),
            members: HashSet::new(),
            next_cursor: None,
            loaded: false,
            stale_since: None,
        }
    }

    pub(crate) fn pages(&self) -> &[Vec<EntityId>] {
        &self.pages
    }

    pub(crate) fn contains(&self, id: EntityId) -> bool {
        self.members.contains(&id)
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.pages.iter().flatten().copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.members.len()
    }

    /// No more pages exist beyond the loaded ones.
    pub(crate) const fn exhausted(&self) -> bool {
        self.loaded && self.next_cursor.is_none()
    }

    pub(crate) fn position(&self, id: EntityId) -> Option<usize> {
        if !self.contains(id) {
            return None;
        }
        self.ids().position(|candidate| candidate == id)
    }

    pub(crate) fn presence(&self, id: EntityId) -> Presence {
        match self.position(id) {
            None => Presence::Absent,
            Some(index) => Presence::At {
                index,
                after: index
                    .checked_sub(1)
                    .and_then(|prev| self.ids().nth(prev)),
            },
        }
    }

    pub(crate) fn remove(&mut self, id: EntityId) -> bool {
        if !self.members.remove(&id) {
            return false;
        }
        for page in &mut self.pages {
            if let Some(index) = page.iter().position(|candidate| *candidate == id) {
                let _removed = page.remove(index);
                break;
            }
        }
        true
    }

    /// Inserts at a flat index, clamped to the end. Existing ids are left
    /// where they are.
    pub(crate) fn insert_at(&mut self, index: usize, id: EntityId) -> bool {
        if !self.members.insert(id) {
            return false;
        }

        if self.pages.is_empty() {
            self.pages.push(Vec::new());
        }

        let mut offset = 0;
        let last = self.pages.len() - 1;
        for (page_index, page) in self.pages.iter_mut().enumerate() {
            if index <= offset + page.len() || page_index == last {
                let at = index.saturating_sub(offset).min(page.len());
                page.insert(at, id);
                return true;
            }
            offset += page.len();
        }

        true
    }

    /// `insertAtHead`: an id already present stays put unless `promote`.
    pub(crate) fn insert_head(&mut self, id: EntityId, promote: bool) -> bool {
        if self.contains(id) {
            if !promote || self.position(id) == Some(0) {
                return false;
            }
            let _removed = self.remove(id);
        }
        self.insert_at(0, id)
    }

    /// Appends a page, skipping ids already present anywhere in the view.
    pub(crate) fn append_page(&mut self, ids: Vec<EntityId>) -> usize {
        let mut page = Vec::with_capacity(ids.len());
        for id in ids {
            if self.members.insert(id) {
                page.push(id);
            }
        }
        let appended = page.len();
        self.pages.push(page);
        self.loaded = true;
        appended
    }

    pub(crate) fn replace_pages(&mut self, pages: Vec<Vec<EntityId>>) {
        self.pages.clear();
        self.members.clear();
        for page in pages {
            let _appended = self.append_page(page);
        }
        self.loaded = true;
    }

    /// Puts a newly matching entity where it belongs.
    ///
    /// Without a sort spec it goes to the head. With one it goes to its
    /// sorted position, unless that position lies past the loaded window of
    /// a view that still has unloaded pages.
    pub(crate) fn place(&mut self, entity: &Entity, store: &EntityStore) -> bool {
        if !self.loaded || self.contains(entity.id) {
            return false;
        }

        let Some(sort) = &self.def.sort else {
            return self.insert_at(0, entity.id);
        };

        let kind = entity.kind;
        let index = self
            .ids()
            .position(|id| {
                store
                    .get(&EntityRef::new(kind, id))
                    .is_some_and(|other| sort.compare(entity, other) == Ordering::Less)
            })
            .unwrap_or_else(|| self.len());

        if index == self.len() && !self.exhausted() && self.len() > 0 {
            return false;
        }

        self.insert_at(index, entity.id)
    }

    /// Moves a single id to its sorted position after its sort key changed.
    pub(crate) fn reposition(&mut self, entity: &Entity, store: &EntityStore) -> bool {
        if self.def.sort.is_none() || !self.contains(entity.id) {
            return false;
        }

        let before = self.position(entity.id);
        let _removed = self.remove(entity.id);
        if !self.place(entity, store) {
            // keep it visible rather than dropping it off the loaded window
            let _inserted = self.insert_at(self.len(), entity.id);
        }
        self.position(entity.id) != before
    }

    /// Puts `id` back where `presence` says it was.
    pub(crate) fn restore(&mut self, id: EntityId, presence: &Presence) -> bool {
        match presence {
            Presence::Absent => self.remove(id),
            Presence::At { index, after } => {
                if self.position(id) == Some(*index) {
                    return false;
                }
                let _removed = self.remove(id);
                let target = after
                    .and_then(|anchor| self.position(anchor))
                    .map_or(*index, |anchor| anchor + 1);
                self.insert_at(target, id)
            }
        }
    }

    /// Replaces `old` with `new` in place; if `new` is already present the
    /// `old` entry is simply dropped.
    pub(crate) fn rekey(&mut self, old: EntityId, new: EntityId) -> bool {
        if !self.contains(old) {
            return false;
        }
        if self.contains(new) {
            return self.remove(old);
        }
        let _removed = self.members.remove(&old);
        let _inserted = self.members.insert(new);
        for id in self.pages.iter_mut().flatten() {
            if *id == old {
                *id = new;
            }
        }
        true
    }
}
