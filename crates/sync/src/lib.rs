//! Client-side synchronization engine for docket views.
//!
//! ## Core Concepts
//!
//! - **Coordinator**: applies mutations optimistically and commits or rolls
//!   them back when the authority settles them
//! - **Reconciler**: folds push events from other actors into the replica
//! - **PrefetchQueue**: bounded, prioritized background entity loading
//! - **SessionController**: push channel lifecycle with reconnect backoff
//! - **SyncClient**: the handle applications hold, owning all of the above
//!
//! All state changes happen in synchronous steps under one lock; network I/O
//! runs between steps through the traits in [`effects`].

pub mod client;
pub mod coordinator;
pub mod effects;
pub mod error;
pub mod mutation;
pub mod prefetch;
pub mod reconciler;
pub mod session;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::{ClientStats, SyncClient};
pub use coordinator::MutationResult;
pub use effects::{MutationExecutor, PushStream, PushTransport, Query, QueryExecutor, Snapshot};
pub use error::{BulkItemFailure, FetchError, MutationError, TransportError};
pub use prefetch::{EnqueueOutcome, Priority};
pub use reconciler::Disposition;
pub use session::SessionState;

#[cfg(test)]
mod tests;
