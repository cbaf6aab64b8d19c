//! Applies push events from other actors to the replica.
//!
//! Never fails: undecodable events are logged and dropped, echoes of local
//! mutations are discarded, and events touching locally dirty entities are
//! handed to the coordinator to replay after settlement.

use docket_primitives::event::{Change, PushEvent, RawPushEvent};
use docket_primitives::ids::EntityRef;
use docket_store::Replica;
use tracing::{debug, warn};

use crate::coordinator::Coordinator;
use crate::prefetch::PrefetchQueue;

/// What happened to one push event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    Applied,
    /// Originated from a local mutation already reflected in the replica.
    Echo,
    /// Parked behind a pending mutation.
    Deferred,
    /// Malformed or of an unknown type.
    Dropped,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub received: u64,
    pub applied: u64,
    pub echoes: u64,
    pub deferred: u64,
    pub replayed: u64,
    pub dropped: u64,
}

/// Borrowed pieces of client state a reconciliation step writes to.
#[derive(Debug)]
pub struct ReconcileCtx<'a> {
    pub replica: &'a mut Replica,
    pub coordinator: &'a mut Coordinator,
    pub prefetch: &'a mut PrefetchQueue,
}

#[derive(Debug, Default)]
pub struct Reconciler {
    stats: ReconcileStats,
}

impl Reconciler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn stats(&self) -> ReconcileStats {
        self.stats
    }

    /// Decodes and handles one event as delivered by the transport.
    pub fn on_raw(&mut self, raw: RawPushEvent, ctx: ReconcileCtx<'_>) -> Disposition {
        self.stats.received += 1;

        let name = raw.name.clone();
        match PushEvent::decode(raw) {
            Ok(event) => self.handle(event, ctx),
            Err(err) => {
                self.stats.dropped += 1;
                warn!(event = %name, %err, "Dropping undecodable push event");
                Disposition::Dropped
            }
        }
    }

    /// Handles one decoded event.
    pub fn on_event(&mut self, event: PushEvent, ctx: ReconcileCtx<'_>) -> Disposition {
        self.stats.received += 1;
        self.handle(event, ctx)
    }

    /// Applies events released by a settled mutation. Their echo and dirty
    /// checks already happened when they first arrived.
    pub fn replay(&mut self, events: Vec<PushEvent>, ctx: ReconcileCtx<'_>) {
        let ReconcileCtx {
            replica, prefetch, ..
        } = ctx;

        for event in events {
            debug!(event_id = %event.event_id, entity = %event.entity, "Replaying deferred event");
            self.stats.replayed += 1;
            apply(event, replica, prefetch);
        }
    }

    fn handle(&mut self, event: PushEvent, ctx: ReconcileCtx<'_>) -> Disposition {
        let ReconcileCtx {
            replica,
            coordinator,
            prefetch,
        } = ctx;

        if let Some(origin) = &event.origin_mutation_id {
            if coordinator.is_echo(origin) {
                debug!(
                    event_id = %event.event_id,
                    mutation_id = %origin,
                    "Suppressed echo of local mutation"
                );
                self.stats.echoes += 1;
                return Disposition::Echo;
            }
        }

        if event
            .entity_refs()
            .iter()
            .any(|entity| coordinator.is_dirty(entity))
        {
            self.stats.deferred += 1;
            coordinator.defer(event);
            return Disposition::Deferred;
        }

        self.stats.applied += 1;
        apply(event, replica, prefetch);
        Disposition::Applied
    }
}

fn apply(event: PushEvent, replica: &mut Replica, prefetch: &mut PrefetchQueue) {
    let entity = event.entity;

    match event.change {
        Change::Created(created) => {
            let _effects = replica.put(created);
            let _demoted = prefetch.demote(&entity);
        }
        Change::Updated(patch) => {
            if !replica.store().contains(&entity) {
                // Unknown prior state: counters of this kind can no longer
                // be trusted until recomputed.
                debug!(%entity, "Update for non-resident entity, marking counters stale");
                mark_counters_stale(replica, &entity);
                return;
            }
            let _effects = replica.put(patch);
            let _demoted = prefetch.demote(&entity);
        }
        Change::Deleted => {
            remove(replica, prefetch, &entity);
        }
        Change::Merged { losers, survivor } => {
            for loser in losers {
                remove(replica, prefetch, &EntityRef::new(entity.kind, loser));
            }
            if let Some(survivor) = survivor {
                if replica.store().contains(&entity) {
                    let _effects = replica.put(survivor);
                }
            }
        }
    }
}

fn remove(replica: &mut Replica, prefetch: &mut PrefetchQueue, entity: &EntityRef) {
    let _cancelled = prefetch.cancel(entity);
    if replica.store().contains(entity) {
        let _effects = replica.remove(entity);
    } else {
        mark_counters_stale(replica, entity);
    }
}

fn mark_counters_stale(replica: &mut Replica, entity: &EntityRef) {
    for key in replica.views().scalar_keys_for(entity.kind) {
        let _known = replica.views_mut().mark_stale(&key);
    }
}
