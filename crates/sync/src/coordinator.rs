//! Optimistic mutation coordinator.
//!
//! A mutation is applied to the replica synchronously on activation, before
//! anything is sent to the authority. Its targets stay "locally dirty" until
//! it settles; remote events touching a dirty entity are parked and replayed
//! once every entity they reference is free again.

use std::collections::{HashMap, HashSet, VecDeque};

use docket_primitives::entity::Entity;
use docket_primitives::event::PushEvent;
use docket_primitives::ids::{EntityRef, MutationId};
use docket_primitives::mutation::{FailureKind, MutationChange, Settlement};
use docket_primitives::view::ViewKey;
use docket_store::{Presence, Replica};
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::MutationError;
use crate::mutation::Mutation;


/// Result handed back to the caller of a mutation.
pub type MutationResult = Result<Option<Entity>, MutationError>;

/// Where one target stood before a mutation touched it.
#[derive(Clone, Debug)]
struct TargetSnapshot {
    entity_ref: EntityRef,
    before: Option<Entity>,
    lists: Vec<(ViewKey, Presence)>,
}

/// Everything needed to undo one applied mutation.
#[derive(Clone, Debug, Default)]
struct MutationSnapshot {
    targets: Vec<TargetSnapshot>,
    /// Net scalar adjustments made by the optimistic write.
    scalar_deltas: Vec<(ViewKey, i64)>,
}

#[derive(Debug)]
struct Pending {
    mutation: Mutation,
    snapshot: MutationSnapshot,
    /// Scalars set from an authority count while this mutation was pending.
    /// The count may already include it, so they are counted again on commit.
    rebased: HashSet<ViewKey>,
}

#[derive(Debug)]
struct Waiting {
    mutation: Mutation,
    ready: oneshot::Sender<()>,
}

#[derive(Debug)]
pub enum BeginOutcome {
    /// Applied to the replica; submit it now.
    Applied,
    /// Another pending mutation owns one of the targets. The receiver fires
    /// once this mutation has been applied in its turn.
    Waiting(oneshot::Receiver<()>),
}

/// What settling one mutation produced.
#[derive(Debug)]
pub struct SettleReport {
    pub mutation_id: MutationId,
    pub result: MutationResult,
    /// Parked remote events that can now be applied, in arrival order.
    pub replay: Vec<PushEvent>,
    /// Entities to refetch once, after a conflict rollback.
    pub refetch: Vec<EntityRef>,
    /// Scalars to recompute from the authority after a commit.
    pub recompute: Vec<ViewKey>,
}

/// Bounded memory of recently settled mutation ids.
#[derive(Debug)]
struct RecentMutations {
    order: VecDeque<(MutationId, Instant)>,
    ids: HashSet<MutationId>,
    capacity: usize,
    ttl: Duration,
}

impl RecentMutations {
    fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            capacity,
            ttl,
        }
    }

    fn insert(&mut self, id: MutationId, now: Instant) {
        self.prune(now);
        while self.order.len() >= self.capacity {
            let Some((evicted, _)) = self.order.pop_front() else {
                break;
            };
            let _removed = self.ids.remove(&evicted);
        }
        if self.ids.insert(id.clone()) {
            self.order.push_back((id, now));
        }
    }

    fn contains(&mut self, id: &MutationId, now: Instant) -> bool {
        self.prune(now);
        self.ids.contains(id)
    }

    fn prune(&mut self, now: Instant) {
        while let Some((id, settled_at)) = self.order.front() {
            if now.duration_since(*settled_at) <= self.ttl {
                break;
            }
            let _removed = self.ids.remove(id);
            let _evicted = self.order.pop_front();
        }
    }
}

#[derive(Debug)]
pub struct Coordinator {
    pending: HashMap<MutationId, Pending>,
    owners: HashMap<EntityRef, MutationId>,
    waiting: VecDeque<Waiting>,
    deferred: Vec<PushEvent>,
    recent: RecentMutations,
    /// Per scalar, how many committed mutations have adjusted it.
    scalar_epochs: HashMap<ViewKey, u64>,
}

impl Coordinator {
    #[must_use]
    pub fn new(echo_window: usize, echo_ttl: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            owners: HashMap::new(),
            waiting: VecDeque::new(),
            deferred: Vec::new(),
            recent: RecentMutations::new(echo_window.max(1), echo_ttl),
            scalar_epochs: HashMap::new(),
        }
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    #[must_use]
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    #[must_use]
    pub fn is_pending(&self, id: &MutationId) -> bool {
        self.pending.contains_key(id)
    }

    /// Whether a pending mutation currently owns `entity`.
    #[must_use]
    pub fn is_dirty(&self, entity: &EntityRef) -> bool {
        self.owners.contains_key(entity)
    }

    #[must_use]
    pub fn dirty_entities(&self) -> Vec<EntityRef> {
        let mut dirty: Vec<_> = self.owners.keys().copied().collect();
        dirty.sort_unstable();
        dirty
    }

    /// Whether `origin` names a mutation whose change is already reflected
    /// locally: still pending, or settled within the echo window.
    pub fn is_echo(&mut self, origin: &MutationId) -> bool {
        self.pending.contains_key(origin) || self.recent.contains(origin, Instant::now())
    }

    /// Parks a remote event until none of its entities is dirty.
    pub fn defer(&mut self, event: PushEvent) {
        debug!(
            event_id = %event.event_id,
            entity = %event.entity,
            parked = self.deferred.len() + 1,
            "Deferred remote event behind pending mutation"
        );
        self.deferred.push(event);
    }

    /// Sum of the optimistic scalar adjustments of every pending mutation.
    #[must_use]
    pub fn pending_scalar_delta(&self, key: &ViewKey) -> i64 {
        self.pending
            .values()
            .flat_map(|pending| pending.snapshot.scalar_deltas.iter())
            .filter(|(scalar, _)| scalar == key)
            .map(|(_, delta)| delta)
            .sum()
    }

    /// Like [`Self::pending_scalar_delta`], for a scalar about to be set
    /// from an authority count. Every contributing mutation remembers it and
    /// asks for another count when it commits.
    pub fn rebase_scalar(&mut self, key: &ViewKey) -> i64 {
        self.pending
            .values_mut()
            .filter_map(|pending| {
                let adjustments: Vec<i64> = pending
                    .snapshot
                    .scalar_deltas
                    .iter()
                    .filter(|(scalar, _)| scalar == key)
                    .map(|(_, delta)| *delta)
                    .collect();
                if adjustments.is_empty() {
                    return None;
                }
                let _new = pending.rebased.insert(key.clone());
                Some(adjustments.into_iter().sum::<i64>())
            })
            .sum()
    }

    /// Changes whenever a mutation that adjusted `key` commits. A count
    /// fetched across such a change may or may not include it.
    #[must_use]
    pub fn scalar_epoch(&self, key: &ViewKey) -> u64 {
        self.scalar_epochs.get(key).copied().unwrap_or(0)
    }

    /// Starts a mutation: applies it now, or queues it behind the pending
    /// mutation that owns one of its targets.
    ///
    /// The caller must flush the replica afterwards.
    pub fn begin(&mut self, mutation: Mutation, replica: &mut Replica) -> BeginOutcome {
        let blocked = mutation.targets.iter().any(|target| {
            self.owners.contains_key(target)
                || self
                    .waiting
                    .iter()
                    .any(|waiting| waiting.mutation.targets.contains(target))
        });

        if blocked {
            debug!(
                mutation_id = %mutation.id,
                queue = self.waiting.len() + 1,
                "Mutation waiting for a pending mutation on the same entity"
            );
            let (ready, rx) = oneshot::channel();
            self.waiting.push_back(Waiting { mutation, ready });
            return BeginOutcome::Waiting(rx);
        }

        self.activate(mutation, replica);
        BeginOutcome::Applied
    }

    /// Applies waiting mutations whose targets are all free, in FIFO order.
    ///
    /// A waiting mutation never overtakes an earlier one that shares a
    /// target with it.
    pub fn activate_ready(&mut self, replica: &mut Replica) -> Vec<MutationId> {
        let mut activated = Vec::new();
        let mut blocked: HashSet<EntityRef> = HashSet::new();
        let mut still_waiting = VecDeque::with_capacity(self.waiting.len());

        while let Some(waiting) = self.waiting.pop_front() {
            if waiting.ready.is_closed() {
                debug!(mutation_id = %waiting.mutation.id, "Dropping abandoned waiting mutation");
                continue;
            }

            let free = waiting
                .mutation
                .targets
                .iter()
                .all(|target| !self.owners.contains_key(target) && !blocked.contains(target));

            if !free {
                blocked.extend(waiting.mutation.targets.iter().copied());
                still_waiting.push_back(waiting);
                continue;
            }

            let id = waiting.mutation.id.clone();
            self.activate(waiting.mutation, replica);
            if waiting.ready.send(()).is_err() {
                warn!(mutation_id = %id, "Waiter vanished after activation, rolling back");
                if let Some(pending) = self.release(&id) {
                    self.rollback(&pending, replica);
                }
                continue;
            }
            activated.push(id);
        }

        self.waiting = still_waiting;
        activated
    }

    /// Drops every waiting mutation; their callers observe
    /// [`MutationError::Abandoned`].
    pub fn abandon_waiting(&mut self) -> usize {
        let abandoned = self.waiting.len();
        self.waiting.clear();
        abandoned
    }

    fn activate(&mut self, mutation: Mutation, replica: &mut Replica) {
        let targets: Vec<TargetSnapshot> = mutation
            .targets
            .iter()
            .map(|target| TargetSnapshot {
                entity_ref: *target,
                before: replica.store().get(target).cloned(),
                lists: replica.views().list_presence(target),
            })
            .collect();

        let mut scalar_deltas = Vec::new();
        for target in &targets {
            let after = mutation.change.apply(target.before.as_ref());
            let effects = replica.write(target.entity_ref, after);
            scalar_deltas.extend(effects.scalar_deltas);
        }

        for target in &mutation.targets {
            let _prev = self.owners.insert(*target, mutation.id.clone());
        }

        debug!(
            mutation_id = %mutation.id,
            change = mutation.change.name(),
            targets = mutation.targets.len(),
            "Applied optimistic mutation"
        );

        let _prev = self.pending.insert(
            mutation.id.clone(),
            Pending {
                mutation,
                snapshot: MutationSnapshot {
                    targets,
                    scalar_deltas,
                },
                rebased: HashSet::new(),
            },
        );
    }

    /// Settles a pending mutation with the authority's answer.
    ///
    /// The caller must replay [`SettleReport::replay`], then call
    /// [`Self::activate_ready`], then flush, all in the same step.
    pub fn settle(
        &mut self,
        id: &MutationId,
        settlement: Settlement,
        replica: &mut Replica,
    ) -> Result<SettleReport, MutationError> {
        let pending = self.release(id).ok_or(MutationError::UnknownMutation)?;

        let mut refetch = Vec::new();
        let mut recompute = Vec::new();
        let result = match settlement {
            Settlement::Committed { entity } => {
                Self::commit(&pending, entity.clone(), replica);
                for (key, _) in &pending.snapshot.scalar_deltas {
                    *self.scalar_epochs.entry(key.clone()).or_default() += 1;
                    if pending.rebased.contains(key) && !recompute.contains(key) {
                        recompute.push(key.clone());
                    }
                }
                Ok(entity)
            }
            Settlement::Rejected {
                error_kind,
                message,
            } => {
                self.rollback(&pending, replica);

                let primary = pending.mutation.primary();
                if error_kind == FailureKind::Conflict {
                    refetch.extend(primary);
                }
                info!(
                    mutation_id = %id,
                    %error_kind,
                    %message,
                    "Mutation rejected, rolled back"
                );
                match primary {
                    Some(entity) => Err(MutationError::from_rejection(error_kind, entity, message)),
                    None => Err(MutationError::ValidationRejected { message }),
                }
            }
        };

        self.recent.insert(id.clone(), Instant::now());

        Ok(SettleReport {
            mutation_id: id.clone(),
            result,
            replay: self.take_replayable(),
            refetch,
            recompute,
        })
    }

    fn release(&mut self, id: &MutationId) -> Option<Pending> {
        let pending = self.pending.remove(id)?;
        for target in &pending.mutation.targets {
            if self.owners.get(target) == Some(id) {
                let _owner = self.owners.remove(target);
            }
        }
        Some(pending)
    }

    fn commit(pending: &Pending, authoritative: Option<Entity>, replica: &mut Replica) {
        let mutation = &pending.mutation;

        if let Some(entity) = authoritative {
            let committed = entity.entity_ref();
            let provisional = match &mutation.change {
                MutationChange::Create(created) => Some(created.entity_ref()),
                MutationChange::SetFields(_) | MutationChange::Delete => None,
            };

            if let Some(provisional) = provisional.filter(|provisional| *provisional != committed) {
                rekey(replica, provisional, committed);
                info!(%provisional, %committed, "Re-keyed optimistic create");
            }

            let _effects = replica.put(entity);
        }

        for target in &mutation.targets {
            let _known = replica.views_mut().mark_stale(&ViewKey::detail(*target));
        }
        for target in &pending.snapshot.targets {
            for (key, _) in &target.lists {
                let _known = replica.views_mut().mark_stale(key);
            }
        }
        for (key, _) in &pending.snapshot.scalar_deltas {
            let _known = replica.views_mut().mark_stale(key);
        }

        debug!(mutation_id = %mutation.id, "Committed mutation");
    }

    /// Undoes an applied mutation: scalars first, then list positions, then
    /// the entity snapshots themselves.
    fn rollback(&self, pending: &Pending, replica: &mut Replica) {
        let snapshot = &pending.snapshot;

        for (key, delta) in snapshot.scalar_deltas.iter().rev() {
            replica.views_mut().adjust_scalar(key, -delta);
        }

        for target in snapshot.targets.iter().rev() {
            for (key, presence) in &target.lists {
                let _restored =
                    replica
                        .views_mut()
                        .restore_presence(key, target.entity_ref.id, presence);
            }
        }

        for target in snapshot.targets.iter().rev() {
            let _change = replica.revert(target.entity_ref, target.before.clone());
        }

        debug!(
            mutation_id = %pending.mutation.id,
            waiting = self.waiting.len(),
            "Rolled back mutation"
        );
    }

    fn take_replayable(&mut self) -> Vec<PushEvent> {
        let (ready, parked): (Vec<_>, Vec<_>) = core::mem::take(&mut self.deferred)
            .into_iter()
            .partition(|event| {
                event
                    .entity_refs()
                    .iter()
                    .all(|entity| !self.owners.contains_key(entity))
            });
        self.deferred = parked;
        ready
    }
}

/// Moves an optimistically created entity from its provisional id to the id
/// the authority assigned, keeping every list position.
fn rekey(replica: &mut Replica, provisional: EntityRef, committed: EntityRef) {
    let optimistic = replica.store().get(&provisional).cloned();
    replica.views_mut().rekey(&provisional, &committed);
    let _change = replica.revert(provisional, None);

    if let Some(mut entity) = optimistic {
        entity.id = committed.id;
        if !replica.store().contains(&committed) {
            let _change = replica.revert(committed, Some(entity));
        }
    }
}
