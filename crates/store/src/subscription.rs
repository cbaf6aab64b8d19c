use docket_primitives::entity::Entity;
use docket_primitives::ids::EntityId;
use docket_primitives::view::ViewKey;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListSnapshot {
    pub pages: Vec<Vec<EntityId>>,
    /// At least one page has been loaded.
    pub loaded: bool,
    /// More pages exist beyond the loaded ones.
    pub has_more: bool,
    pub stale: bool,
}

impl ListSnapshot {
    /// All ids across pages, in order.
    #[must_use]
    pub fn ids(&self) -> Vec<EntityId> {
        self.pages.iter().flatten().copied().collect()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScalarSnapshot {
    pub value: i64,
    pub loaded: bool,
    pub stale: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DetailSnapshot {
    pub entity: Option<Entity>,
    pub stale: bool,
}

/// What a consumer reads from a view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ViewSnapshot {
    List(ListSnapshot),
    Scalar(ScalarSnapshot),
    Detail(DetailSnapshot),
}

impl ViewSnapshot {
    #[must_use]
    pub const fn is_stale(&self) -> bool {
        match self {
            Self::List(list) => list.stale,
            Self::Scalar(scalar) => scalar.stale,
            Self::Detail(detail) => detail.stale,
        }
    }

    #[must_use]
    pub const fn as_list(&self) -> Option<&ListSnapshot> {
        match self {
            Self::List(list) => Some(list),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_scalar(&self) -> Option<&ScalarSnapshot> {
        match self {
            Self::Scalar(scalar) => Some(scalar),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_detail(&self) -> Option<&DetailSnapshot> {
        match self {
            Self::Detail(detail) => Some(detail),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("view was dropped from the registry")]
pub struct SubscriptionClosed;

/// Handle returned by `subscribe`: the current value plus a change stream.
///
/// Dropping the handle unsubscribes; the registry only counts live handles
/// when deciding which views are currently observed.
#[derive(Debug)]
pub struct ViewSubscription {
    key: ViewKey,
    rx: watch::Receiver<ViewSnapshot>,
}

impl ViewSubscription {
    pub(crate) const fn new(key: ViewKey, rx: watch::Receiver<ViewSnapshot>) -> Self {
        Self { key, rx }
    }

    #[must_use]
    pub const fn key(&self) -> &ViewKey {
        &self.key
    }

    /// Latest published snapshot.
    #[must_use]
    pub fn current(&self) -> ViewSnapshot {
        self.rx.borrow().clone()
    }

    /// Waits for the next published snapshot.
    pub async fn changed(&mut self) -> Result<ViewSnapshot, SubscriptionClosed> {
        self.rx.changed().await.map_err(|_| SubscriptionClosed)?;
        Ok(self.rx.borrow_and_update().clone())
    }

    /// Whether a snapshot was published since the last [`Self::changed`] or
    /// [`Self::mark_seen`].
    #[must_use]
    pub fn has_changed(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }

    pub fn mark_seen(&mut self) {
        self.rx.mark_unchanged();
    }
}
