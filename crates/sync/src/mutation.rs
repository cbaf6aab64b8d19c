use core::sync::atomic::{AtomicU64, Ordering};

use docket_primitives::ids::{ClientId, EntityRef, MutationId};
use docket_primitives::mutation::{MutationChange, MutationDescriptor};

/// One optimistic change to one or more target entities.
///
/// The inverse is not written by hand: the coordinator captures each target's
/// pre-mutation state when the mutation is applied and restores it on
/// rollback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mutation {
    pub id: MutationId,
    pub targets: Vec<EntityRef>,
    pub change: MutationChange,
}

impl Mutation {
    #[must_use]
    pub const fn new(id: MutationId, targets: Vec<EntityRef>, change: MutationChange) -> Self {
        Self {
            id,
            targets,
            change,
        }
    }

    #[must_use]
    pub fn descriptor(&self) -> MutationDescriptor {
        MutationDescriptor {
            mutation_id: self.id.clone(),
            targets: self.targets.clone(),
            change: self.change.clone(),
        }
    }

    /// The target the authority reports back on commit.
    #[must_use]
    pub fn primary(&self) -> Option<EntityRef> {
        self.targets.first().copied()
    }
}

/// Hands out mutation ids unique to this client.
#[derive(Debug)]
pub struct MutationIds {
    client: ClientId,
    next: AtomicU64,
}

impl MutationIds {
    #[must_use]
    pub const fn new(client: ClientId) -> Self {
        Self {
            client,
            next: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub const fn client(&self) -> ClientId {
        self.client
    }

    pub fn next(&self) -> MutationId {
        MutationId::new(self.client, self.next.fetch_add(1, Ordering::Relaxed))
    }
}
