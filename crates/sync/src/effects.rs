//! The narrow interfaces to everything outside the engine: the remote
//! authority that executes mutations and answers queries, and the push
//! transport.

use async_trait::async_trait;
use docket_primitives::entity::Entity;
use docket_primitives::event::RawPushEvent;
use docket_primitives::ids::EntityRef;
use docket_primitives::mutation::{MutationDescriptor, Settlement};
use docket_primitives::view::{ListViewDef, ScalarViewDef};
use futures_util::stream::BoxStream;

use crate::error::{FetchError, TransportError};

/// Executes mutations on the remote authority.
#[async_trait]
pub trait MutationExecutor: Send + Sync {
    async fn submit(&self, mutation: MutationDescriptor) -> Settlement;

    /// Submits several mutations in one round trip, answering in order.
    ///
    /// The default submits them one after another.
    async fn submit_bulk(&self, mutations: Vec<MutationDescriptor>) -> Vec<Settlement> {
        let mut settlements = Vec::with_capacity(mutations.len());
        for mutation in mutations {
            settlements.push(self.submit(mutation).await);
        }
        settlements
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Query {
    Entity(EntityRef),
    /// One page of a list view; `cursor` is `None` for the first page.
    ListPage {
        view: ListViewDef,
        cursor: Option<String>,
    },
    /// Authoritative value of a counting scalar view.
    Count(ScalarViewDef),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Snapshot {
    Entity(Option<Entity>),
    Page {
        entities: Vec<Entity>,
        next_cursor: Option<String>,
    },
    Count(i64),
}

/// Answers read queries against the remote authority.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn fetch(&self, query: Query) -> Result<Snapshot, FetchError>;
}

/// Stream of raw push events; its end means the connection dropped.
pub type PushStream = BoxStream<'static, RawPushEvent>;

/// Opens push subscriptions.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn subscribe(&self, scope: &str) -> Result<PushStream, TransportError>;
}
