//! Shared vocabulary for the docket synchronization engine.
//!
//! Everything here is plain data: identifiers, entity snapshots, view
//! definitions, push event payloads and the settlement shape returned by the
//! remote authority. Behavior lives in `docket-store` and `docket-sync`.

pub mod entity;
pub mod event;
pub mod filter;
pub mod ids;
pub mod mutation;
pub mod view;
