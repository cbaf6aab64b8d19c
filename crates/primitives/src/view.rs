use core::fmt;

use serde::{Deserialize, Serialize};

use crate::filter::{Filter, Fingerprint, SortSpec};
use crate::ids::EntityRef;

/// Default number of ids per list page.
pub const DEFAULT_PAGE_SIZE: usize = 25;

/// Identity of a read view.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "lowercase")]
pub enum ViewKey {
    /// Ordered, paginated list identified by `(viewKind, filterFingerprint)`.
    List { name: String, fingerprint: Fingerprint },
    /// Single derived value identified by `(viewKind, scopeKey)`.
    Scalar { name: String, scope: String },
    /// One entity's detail record.
    Detail { entity: EntityRef },
}

impl ViewKey {
    #[must_use]
    pub const fn detail(entity: EntityRef) -> Self {
        Self::Detail { entity }
    }

    #[must_use]
    pub const fn is_scalar(&self) -> bool {
        matches!(self, Self::Scalar { .. })
    }
}

impl fmt::Display for ViewKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::List { name, fingerprint } => write!(f, "list:{name}/{fingerprint}"),
            Self::Scalar { name, scope } => write!(f, "scalar:{name}/{scope}"),
            Self::Detail { entity } => write!(f, "detail:{entity}"),
        }
    }
}

/// Definition of a list view: which entities belong and in what order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListViewDef {
    pub name: String,
    pub filter: Filter,
    #[serde(default)]
    pub sort: Option<SortSpec>,
    pub page_size: usize,
}

impl ListViewDef {
    #[must_use]
    pub fn new(name: &str, filter: Filter) -> Self {
        Self {
            name: name.to_owned(),
            filter,
            sort: None,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    #[must_use]
    pub fn sorted_by(mut self, sort: SortSpec) -> Self {
        self.sort = Some(sort);
        self
    }

    #[must_use]
    pub const fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Identity of the view. Ordering and page size are part of it, so two
    /// lists differing only in sort never share pages.
    #[must_use]
    pub fn key(&self) -> ViewKey {
        let layout = serde_json::to_vec(&(&self.sort, self.page_size)).unwrap_or_default();
        ViewKey::List {
            name: self.name.clone(),
            fingerprint: self.filter.fingerprint_with(&layout),
        }
    }
}

/// Definition of a scalar view counting the entities matching a filter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalarViewDef {
    pub name: String,
    pub scope: String,
    pub filter: Filter,
}

impl ScalarViewDef {
    #[must_use]
    pub fn count(name: &str, scope: &str, filter: Filter) -> Self {
        Self {
            name: name.to_owned(),
            scope: scope.to_owned(),
            filter,
        }
    }

    #[must_use]
    pub fn key(&self) -> ViewKey {
        ViewKey::Scalar {
            name: self.name.clone(),
            scope: self.scope.clone(),
        }
    }
}
