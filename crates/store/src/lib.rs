//! In-memory entity store and the read views built on top of it.
//!
//! ## Core Concepts
//!
//! - **EntityStore**: canonical entity-by-id snapshots, merged per field
//! - **ViewRegistry**: list, scalar and detail views holding ids only
//! - **Replica**: the pair of both, routing every store change to the views
//!
//! Nothing in this crate awaits. Callers batch a synchronous step of writes
//! and then [`Replica::flush`] publishes the resulting view snapshots, so no
//! subscriber ever sees a half-applied step.

mod list;
mod replica;
mod store;
mod subscription;
mod views;

pub use list::Presence;
pub use replica::Replica;
pub use store::{EntityStore, StoreChange};
pub use subscription::{
    DetailSnapshot, ListSnapshot, ScalarSnapshot, SubscriptionClosed, ViewSnapshot,
    ViewSubscription,
};
pub use views::{ChangeEffects, StructuralOp, UnknownView, ViewRegistry, WriteKind};

#[cfg(test)]
mod tests;
