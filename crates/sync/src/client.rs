use core::fmt;
use core::future::pending;
use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use docket_config::SyncConfig;
use docket_primitives::entity::{Entity, FieldValue};
use docket_primitives::event::RawPushEvent;
use docket_primitives::ids::{ClientId, EntityId, EntityRef, MutationId};
use docket_primitives::mutation::{FailureKind, MutationChange, Settlement};
use docket_primitives::view::{ListViewDef, ScalarViewDef, ViewKey};
use docket_store::{Replica, StructuralOp, UnknownView, ViewSnapshot, ViewSubscription};
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordinator::{BeginOutcome, Coordinator, MutationResult, SettleReport};
use crate::effects::{MutationExecutor, PushTransport, Query, QueryExecutor, Snapshot};
use crate::error::{BulkItemFailure, FetchError, MutationError};
use crate::mutation::{Mutation, MutationIds};
use crate::prefetch::{EnqueueOutcome, NextTask, PrefetchQueue, PrefetchStats, PrefetchTask, Priority};
use crate::reconciler::{Disposition, ReconcileCtx, ReconcileStats, Reconciler};
use crate::session::{SessionController, SessionHooks, SessionState};

/// Counts of a scalar taken while mutations keep committing are retried
/// this many times before the last one is used.
const RECOUNT_ATTEMPTS: u32 = 3;

/// Point-in-time counters of a running client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientStats {
    pub pending_mutations: usize,
    pub waiting_mutations: usize,
    pub deferred_events: usize,
    pub reconcile: ReconcileStats,
    pub prefetch: PrefetchStats,
    pub resyncs: u64,
}

/// All mutable client state. Every step that touches it runs under one lock
/// acquisition and ends with a flush, so subscribers only ever see whole
/// steps.
#[derive(Debug)]
struct Core {
    replica: Replica,
    coordinator: Coordinator,
    reconciler: Reconciler,
    prefetch: PrefetchQueue,
}

impl Core {
    fn split(&mut self) -> (&mut Reconciler, ReconcileCtx<'_>) {
        (
            &mut self.reconciler,
            ReconcileCtx {
                replica: &mut self.replica,
                coordinator: &mut self.coordinator,
                prefetch: &mut self.prefetch,
            },
        )
    }

    /// Writes fetched entities, skipping those with a pending mutation.
    fn load_entities(&mut self, entities: Vec<Entity>) -> Vec<EntityId> {
        let mut ids = Vec::with_capacity(entities.len());
        for entity in entities {
            let entity_ref = entity.entity_ref();
            ids.push(entity_ref.id);
            if self.coordinator.is_dirty(&entity_ref) {
                continue;
            }
            let _effects = self.replica.load(entity);
            self.replica.views_mut().mark_detail_fresh(&entity_ref);
        }
        ids
    }

    /// Re-derives list membership of locally dirty entities from their
    /// optimistic state after authority pages replaced the list.
    fn reconcile_dirty(&mut self, key: &ViewKey) {
        for dirty in self.coordinator.dirty_entities() {
            let (store, views) = self.replica.parts_mut();
            let _changed = views.reconcile_membership(key, &dirty, store);
        }
    }
}

#[derive(Debug)]
struct Running {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    config: SyncConfig,
    ids: MutationIds,
    core: Mutex<Core>,
    executor: Arc<dyn MutationExecutor>,
    queries: Arc<dyn QueryExecutor>,
    session: SessionController,
    prefetch_wake: Notify,
    running: Mutex<Option<Running>>,
    resyncs: AtomicU64,
}

/// Handle to the synchronization engine. Cheap to clone.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<Inner>,
}

impl fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncClient")
            .field("client_id", &self.inner.ids.client())
            .field("session", &self.inner.session)
            .finish_non_exhaustive()
    }
}

impl SyncClient {
    #[must_use]
    pub fn new(
        config: SyncConfig,
        executor: Arc<dyn MutationExecutor>,
        queries: Arc<dyn QueryExecutor>,
        transport: Arc<dyn PushTransport>,
    ) -> Self {
        let core = Core {
            replica: Replica::new(),
            coordinator: Coordinator::new(config.echo.window, config.echo.ttl),
            reconciler: Reconciler::new(),
            prefetch: PrefetchQueue::new(config.prefetch),
        };

        Self {
            inner: Arc::new(Inner {
                ids: MutationIds::new(ClientId::generate()),
                core: Mutex::new(core),
                executor,
                queries,
                session: SessionController::new(config.reconnect, transport),
                prefetch_wake: Notify::new(),
                running: Mutex::new(None),
                resyncs: AtomicU64::new(0),
                config,
            }),
        }
    }

    #[must_use]
    pub fn client_id(&self) -> ClientId {
        self.inner.ids.client()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Connects the push channel for `scope` and starts the background
    /// prefetch driver and, if configured, the maintenance ticker.
    pub fn start(&self, scope: &str) {
        let mut running = self.inner.running.lock();
        if running.is_some() {
            debug!(%scope, "Sync client already running");
            return;
        }

        let cancel = CancellationToken::new();
        let mut tasks = Vec::with_capacity(3);

        tasks.push(tokio::spawn({
            let inner = Arc::clone(&self.inner);
            let cancel = cancel.clone();
            let scope = scope.to_owned();
            async move { inner.session.run(&scope, &*inner, cancel).await }
        }));

        tasks.push(tokio::spawn({
            let inner = Arc::clone(&self.inner);
            let cancel = cancel.clone();
            async move { inner.run_prefetch(cancel).await }
        }));

        if self.inner.config.maintenance.is_enabled() {
            tasks.push(tokio::spawn({
                let inner = Arc::clone(&self.inner);
                let cancel = cancel.clone();
                async move { inner.run_maintenance(cancel).await }
            }));
        }

        *running = Some(Running { cancel, tasks });
        info!(%scope, client_id = %self.client_id(), "Sync client started");
    }

    /// Stops background work. Mutations still waiting for their turn fail
    /// with [`MutationError::Abandoned`]; submitted ones still settle.
    pub async fn stop(&self) {
        let Some(running) = self.inner.running.lock().take() else {
            return;
        };

        running.cancel.cancel();
        for task in running.tasks {
            if let Err(err) = task.await {
                warn!(%err, "Background task ended abnormally");
            }
        }

        let abandoned = self.inner.core.lock().coordinator.abandon_waiting();
        info!(abandoned, "Sync client stopped");
    }

    #[must_use]
    pub fn session_state(&self) -> SessionState {
        self.inner.session.state()
    }

    #[must_use]
    pub fn watch_session(&self) -> watch::Receiver<SessionState> {
        self.inner.session.watch()
    }

    /// Refetches every subscribed view and recomputes every scalar view.
    pub async fn resync(&self) {
        self.inner.resync().await;
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    pub fn register_list(&self, def: ListViewDef) -> ViewKey {
        self.inner.core.lock().replica.views_mut().register_list(def)
    }

    pub fn register_scalar(&self, def: ScalarViewDef) -> ViewKey {
        self.inner.core.lock().replica.views_mut().register_scalar(def)
    }

    /// Subscribes to a view. A view that was never loaded or is marked
    /// stale is revalidated in the background; the subscription publishes
    /// the result.
    pub fn observe(&self, key: &ViewKey) -> Result<ViewSubscription, UnknownView> {
        let (subscription, revalidate) = {
            let mut core = self.inner.core.lock();
            let (store, views) = core.replica.parts_mut();
            let subscription = views.subscribe(key, store)?;
            (subscription, views.needs_revalidation(key, store))
        };

        if revalidate {
            let inner = Arc::clone(&self.inner);
            let key = key.clone();
            let _revalidation = tokio::spawn(async move {
                if let Err(err) = inner.revalidate(&key).await {
                    warn!(view = %key, %err, "Revalidation failed");
                }
            });
        }

        Ok(subscription)
    }

    /// Fetches a view from the authority now. Lists restart at page one.
    pub async fn refresh(&self, key: &ViewKey) -> Result<(), FetchError> {
        self.inner.revalidate(key).await
    }

    /// Appends the next page of a list view; returns whether more pages
    /// remain.
    pub async fn load_next_page(&self, key: &ViewKey) -> Result<bool, FetchError> {
        self.inner.load_next_page(key).await
    }

    #[must_use]
    pub fn snapshot(&self, key: &ViewKey) -> Option<ViewSnapshot> {
        let core = self.inner.core.lock();
        core.replica.views().snapshot(key, core.replica.store())
    }

    #[must_use]
    pub fn entity(&self, entity: &EntityRef) -> Option<Entity> {
        self.inner.core.lock().replica.store().get(entity).cloned()
    }

    // ------------------------------------------------------------------
    // Prefetch
    // ------------------------------------------------------------------

    pub fn preload(&self, entity: EntityRef, priority: Priority) -> EnqueueOutcome {
        let outcome = {
            let mut guard = self.inner.core.lock();
            let core = &mut *guard;
            let fresh = core
                .replica
                .store()
                .is_fresh(&entity, self.inner.config.prefetch.freshness);
            core.prefetch.enqueue(entity, priority, fresh)
        };

        if outcome == EnqueueOutcome::Queued || outcome == EnqueueOutcome::Promoted {
            self.inner.prefetch_wake.notify_one();
        }
        outcome
    }

    pub fn cancel_preload(&self, entity: &EntityRef) -> bool {
        self.inner.core.lock().prefetch.cancel(entity)
    }

    /// Queues low-priority prefetches for entities on screen that are not
    /// fresh. Returns how many were queued.
    pub fn warm_visible(&self) -> usize {
        let queued = {
            let mut guard = self.inner.core.lock();
            let core = &mut *guard;
            let freshness = self.inner.config.prefetch.freshness;

            core.replica
                .views()
                .visible_entities()
                .into_iter()
                .filter(|entity| {
                    let fresh = core.replica.store().is_fresh(entity, freshness);
                    core.prefetch.enqueue(*entity, Priority::Low, fresh) == EnqueueOutcome::Queued
                })
                .count()
        };

        if queued > 0 {
            self.inner.prefetch_wake.notify_one();
        }
        queued
    }

    // ------------------------------------------------------------------
    // Mutations and push events
    // ------------------------------------------------------------------

    /// Applies `change` to `targets` optimistically, submits it and waits
    /// for settlement. On failure every view is back where it was.
    pub async fn mutate(&self, targets: Vec<EntityRef>, change: MutationChange) -> MutationResult {
        let mutation = Mutation::new(self.inner.ids.next(), targets, change);
        let inner = Arc::clone(&self.inner);

        // A dropped caller must not leave the mutation half settled.
        tokio::spawn(async move { inner.run_mutation(mutation).await })
            .await
            .map_err(|_| MutationError::Abandoned)?
    }

    /// Convenience for a single-field update of one entity.
    pub async fn set_field(
        &self,
        entity: EntityRef,
        field: &str,
        value: impl Into<FieldValue>,
    ) -> MutationResult {
        self.mutate(vec![entity], MutationChange::set(field, value))
            .await
    }

    /// Optimistically creates `entity`, which may carry a provisional id.
    pub async fn create(&self, entity: Entity) -> MutationResult {
        self.mutate(vec![entity.entity_ref()], MutationChange::Create(entity))
            .await
    }

    /// Applies the same change to every target as independent mutations
    /// sharing one round trip. Returns the committed targets.
    ///
    /// A target named more than once is changed once.
    pub async fn mutate_bulk(
        &self,
        targets: Vec<EntityRef>,
        change: MutationChange,
    ) -> Result<Vec<EntityRef>, MutationError> {
        let mut seen = HashSet::with_capacity(targets.len());
        let mutations: Vec<Mutation> = targets
            .into_iter()
            .filter(|target| seen.insert(*target))
            .map(|target| Mutation::new(self.inner.ids.next(), vec![target], change.clone()))
            .collect();
        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move { inner.run_bulk(mutations).await })
            .await
            .map_err(|_| MutationError::Abandoned)?
    }

    /// Injects one push event as if the transport had delivered it.
    pub fn handle_push(&self, event: RawPushEvent) -> Disposition {
        self.inner.handle_push(event)
    }

    #[must_use]
    pub fn is_dirty(&self, entity: &EntityRef) -> bool {
        self.inner.core.lock().coordinator.is_dirty(entity)
    }

    #[must_use]
    pub fn stats(&self) -> ClientStats {
        let core = self.inner.core.lock();
        ClientStats {
            pending_mutations: core.coordinator.pending_len(),
            waiting_mutations: core.coordinator.waiting_len(),
            deferred_events: core.coordinator.deferred_len(),
            reconcile: core.reconciler.stats(),
            prefetch: core.prefetch.stats(),
            resyncs: self.inner.resyncs.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    fn handle_push(&self, event: RawPushEvent) -> Disposition {
        let mut guard = self.core.lock();
        let core = &mut *guard;
        let (reconciler, ctx) = core.split();
        let disposition = reconciler.on_raw(event, ctx);
        core.replica.flush();
        disposition
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    async fn run_mutation(&self, mutation: Mutation) -> MutationResult {
        let outcome = {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            let outcome = core.coordinator.begin(mutation.clone(), &mut core.replica);
            core.replica.flush();
            outcome
        };

        if let BeginOutcome::Waiting(ready) = outcome {
            ready.await.map_err(|_| MutationError::Abandoned)?;
        }

        let settlement = self.executor.submit(mutation.descriptor()).await;
        self.settle_all(vec![(mutation.id, settlement)])
            .await
            .pop()
            .unwrap_or(Err(MutationError::UnknownMutation))
    }

    async fn run_bulk(&self, mutations: Vec<Mutation>) -> Result<Vec<EntityRef>, MutationError> {
        let outcomes: Vec<BeginOutcome> = {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            let outcomes = mutations
                .iter()
                .map(|mutation| core.coordinator.begin(mutation.clone(), &mut core.replica))
                .collect();
            core.replica.flush();
            outcomes
        };

        let mut failed = Vec::new();
        let mut ready = Vec::with_capacity(mutations.len());
        for (mutation, outcome) in mutations.into_iter().zip(outcomes) {
            match outcome {
                BeginOutcome::Applied => ready.push(mutation),
                BeginOutcome::Waiting(turn) => match turn.await {
                    Ok(()) => ready.push(mutation),
                    Err(_) => failed.extend(mutation.primary().map(|entity| BulkItemFailure {
                        entity,
                        error: MutationError::Abandoned,
                    })),
                },
            }
        }

        if ready.is_empty() {
            return match failed.into_iter().next() {
                Some(failure) => Err(failure.error),
                None => Ok(Vec::new()),
            };
        }

        debug!(items = ready.len(), "Submitting bulk mutation");
        let mut settlements = self
            .executor
            .submit_bulk(ready.iter().map(Mutation::descriptor).collect())
            .await
            .into_iter();

        let items: Vec<(MutationId, Settlement)> = ready
            .iter()
            .map(|mutation| {
                let settlement = settlements.next().unwrap_or_else(|| {
                    Settlement::rejected(FailureKind::Network, "no settlement returned for bulk item")
                });
                (mutation.id.clone(), settlement)
            })
            .collect();

        let results = self.settle_all(items).await;

        let mut committed = Vec::new();
        for (mutation, result) in ready.iter().zip(results) {
            let Some(entity) = mutation.primary() else {
                continue;
            };
            match result {
                Ok(_) => committed.push(entity),
                Err(error) => failed.push(BulkItemFailure { entity, error }),
            }
        }

        if failed.is_empty() {
            Ok(committed)
        } else if committed.is_empty() {
            Err(failed.swap_remove(0).error)
        } else {
            info!(
                committed = committed.len(),
                failed = failed.len(),
                "Bulk mutation partially failed"
            );
            Err(MutationError::PartialBulkFailure { committed, failed })
        }
    }

    /// Settles mutations in one step: settlement, replay of released remote
    /// events, activation of waiting mutations, then a single flush. Conflict
    /// refetches run afterwards.
    async fn settle_all(&self, items: Vec<(MutationId, Settlement)>) -> Vec<MutationResult> {
        let mut refetch = Vec::new();
        let mut recount: Vec<ViewKey> = Vec::new();

        let results = {
            let mut guard = self.core.lock();
            let core = &mut *guard;

            let mut results = Vec::with_capacity(items.len());
            for (id, settlement) in items {
                match core.coordinator.settle(&id, settlement, &mut core.replica) {
                    Ok(SettleReport {
                        result,
                        replay,
                        refetch: conflicted,
                        recompute,
                        ..
                    }) => {
                        let (reconciler, ctx) = core.split();
                        reconciler.replay(replay, ctx);
                        refetch.extend(conflicted);
                        for key in recompute {
                            if !recount.contains(&key) {
                                recount.push(key);
                            }
                        }
                        results.push(result);
                    }
                    Err(err) => {
                        warn!(mutation_id = %id, %err, "Settlement for unknown mutation");
                        results.push(Err(err));
                    }
                }
            }

            let activated = core.coordinator.activate_ready(&mut core.replica);
            if !activated.is_empty() {
                debug!(activated = activated.len(), "Activated waiting mutations");
            }
            core.replica.flush();
            results
        };

        for entity in refetch {
            if let Err(err) = self.refresh_entity(entity).await {
                warn!(%entity, %err, "Refetch after conflict failed");
            }
        }
        for key in recount {
            debug!(view = %key, "Recounting scalar set while a committed mutation was pending");
            if let Err(err) = self.recompute_scalar(&key).await {
                warn!(view = %key, %err, "Recount after commit fell back to local count");
            }
        }

        results
    }

    // ------------------------------------------------------------------
    // Revalidation
    // ------------------------------------------------------------------

    async fn revalidate(&self, key: &ViewKey) -> Result<(), FetchError> {
        match key {
            ViewKey::List { .. } => self.refresh_list(key).await,
            ViewKey::Scalar { .. } => self.recompute_scalar(key).await,
            ViewKey::Detail { entity } => self.refresh_entity(*entity).await,
        }
    }

    async fn refresh_list(&self, key: &ViewKey) -> Result<(), FetchError> {
        let Some(def) = self.core.lock().replica.views().list_def(key).cloned() else {
            return Ok(());
        };

        let snapshot = self
            .queries
            .fetch(Query::ListPage {
                view: def,
                cursor: None,
            })
            .await?;
        let Snapshot::Page {
            entities,
            next_cursor,
        } = snapshot
        else {
            return Err(FetchError::UnexpectedShape);
        };

        let mut guard = self.core.lock();
        let core = &mut *guard;
        let ids = core.load_entities(entities);
        let loaded = ids.len();
        let _changed = core.replica.views_mut().apply_structural(
            key,
            StructuralOp::ReplacePages {
                pages: vec![ids],
                next_cursor,
            },
        );
        core.reconcile_dirty(key);
        core.replica.flush();

        debug!(view = %key, loaded, "Refreshed list view");
        Ok(())
    }

    async fn load_next_page(&self, key: &ViewKey) -> Result<bool, FetchError> {
        let (def, loaded, cursor) = {
            let core = self.core.lock();
            let views = core.replica.views();
            (
                views.list_def(key).cloned(),
                views.is_loaded(key),
                views.next_cursor(key).map(ToOwned::to_owned),
            )
        };

        let Some(def) = def else {
            return Ok(false);
        };
        if !loaded {
            self.refresh_list(key).await?;
            return Ok(self.core.lock().replica.views().next_cursor(key).is_some());
        }
        let Some(cursor) = cursor else {
            return Ok(false);
        };

        let snapshot = self
            .queries
            .fetch(Query::ListPage {
                view: def,
                cursor: Some(cursor.clone()),
            })
            .await?;
        let Snapshot::Page {
            entities,
            next_cursor,
        } = snapshot
        else {
            return Err(FetchError::UnexpectedShape);
        };

        let mut guard = self.core.lock();
        let core = &mut *guard;

        if core.replica.views().next_cursor(key) != Some(cursor.as_str()) {
            debug!(view = %key, "List changed while loading a page, dropping it");
            return Ok(core.replica.views().next_cursor(key).is_some());
        }

        let ids = core.load_entities(entities);
        let has_more = next_cursor.is_some();
        let _changed = core
            .replica
            .views_mut()
            .apply_structural(key, StructuralOp::AppendPage { ids, next_cursor });
        core.reconcile_dirty(key);
        core.replica.flush();

        Ok(has_more)
    }

    /// Sets a scalar view to the authority's count plus the optimistic
    /// adjustments still pending. Falls back to counting resident entities
    /// when the count query fails.
    ///
    /// A count taken while one of our mutations on the scalar committed is
    /// ambiguous, so it is taken again.
    async fn recompute_scalar(&self, key: &ViewKey) -> Result<(), FetchError> {
        let mut attempt = 1;

        loop {
            let (def, epoch) = {
                let core = self.core.lock();
                let Some(def) = core.replica.views().scalar_def(key).cloned() else {
                    return Ok(());
                };
                (def, core.coordinator.scalar_epoch(key))
            };

            let counted = match self.queries.fetch(Query::Count(def)).await {
                Ok(Snapshot::Count(value)) => Ok(value),
                Ok(_) => Err(FetchError::UnexpectedShape),
                Err(err) => Err(err),
            };

            let settled = {
                let mut guard = self.core.lock();
                let core = &mut *guard;

                let result = match counted {
                    Ok(_) if core.coordinator.scalar_epoch(key) != epoch
                        && attempt < RECOUNT_ATTEMPTS =>
                    {
                        None
                    }
                    Ok(value) => {
                        let pending = core.coordinator.rebase_scalar(key);
                        core.replica.views_mut().set_scalar(key, value + pending);
                        Some(Ok(()))
                    }
                    Err(err) => {
                        warn!(view = %key, %err, "Count query failed, counting resident entities");
                        let (store, views) = core.replica.parts_mut();
                        if let Some(local) = views.recompute_scalar_local(key, store) {
                            views.set_scalar(key, local);
                        }
                        Some(Err(err))
                    }
                };
                core.replica.flush();
                result
            };

            match settled {
                Some(result) => return result,
                None => {
                    debug!(view = %key, attempt, "Mutation committed during count, counting again");
                    attempt += 1;
                }
            }
        }
    }

    async fn refresh_entity(&self, entity: EntityRef) -> Result<(), FetchError> {
        let Snapshot::Entity(found) = self.queries.fetch(Query::Entity(entity)).await? else {
            return Err(FetchError::UnexpectedShape);
        };

        let mut guard = self.core.lock();
        let core = &mut *guard;
        if core.coordinator.is_dirty(&entity) {
            debug!(%entity, "Skipping refetched entity with a pending mutation");
            return Ok(());
        }

        match found {
            Some(fetched) => {
                let _effects = core.replica.load(fetched);
            }
            None if core.replica.store().contains(&entity) => {
                let _effects = core.replica.remove(&entity);
            }
            None => {}
        }
        core.replica.views_mut().mark_detail_fresh(&entity);
        core.replica.flush();

        Ok(())
    }

    async fn resync(&self) {
        info!("Resynchronizing views");

        let (views, scalars) = {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            core.prefetch.reset_failures();

            let registry = core.replica.views();
            let subscribed: Vec<ViewKey> = registry
                .subscribed()
                .into_iter()
                .filter(|key| !key.is_scalar())
                .collect();
            let lists: Vec<ViewKey> = registry.list_keys().cloned().collect();
            let scalars: Vec<ViewKey> = registry.scalar_keys().cloned().collect();

            for key in lists.iter().chain(&subscribed).chain(&scalars) {
                let _known = core.replica.views_mut().mark_stale(key);
            }
            core.replica.flush();

            (subscribed, scalars)
        };

        for key in &views {
            if let Err(err) = self.revalidate(key).await {
                warn!(view = %key, %err, "Resync refetch failed");
            }
        }
        for key in &scalars {
            if let Err(err) = self.recompute_scalar(key).await {
                warn!(view = %key, %err, "Resync recompute fell back to local count");
            }
        }

        let _previous = self.resyncs.fetch_add(1, Ordering::Relaxed);
        self.prefetch_wake.notify_one();
        info!(views = views.len(), scalars = scalars.len(), "Resynchronized");
    }

    // ------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------

    async fn run_prefetch(&self, cancel: CancellationToken) {
        let mut inflight = FuturesUnordered::new();
        let mut session = self.session.watch();

        loop {
            let mut wake_at = None;

            if *session.borrow_and_update() != SessionState::Offline {
                loop {
                    let next = self.core.lock().prefetch.poll_next(Instant::now());
                    match next {
                        NextTask::Start(task) => {
                            debug!(entity = %task.entity, priority = ?task.priority, attempt = task.attempt, "Prefetch started");
                            let queries = Arc::clone(&self.queries);
                            inflight.push(async move {
                                let result = queries.fetch(Query::Entity(task.entity)).await;
                                (task, result)
                            });
                        }
                        NextTask::WaitUntil(at) => {
                            wake_at = Some(at);
                            break;
                        }
                        NextTask::Idle | NextTask::Saturated => break,
                    }
                }
            }

            let timer = async move {
                match wake_at {
                    Some(at) => sleep_until(at).await,
                    None => pending::<()>().await,
                }
            };

            tokio::select! {
                () = cancel.cancelled() => break,
                Some((task, result)) = inflight.next(), if !inflight.is_empty() => {
                    self.finish_prefetch(task, result);
                }
                () = self.prefetch_wake.notified() => {}
                () = timer => {}
                Ok(()) = session.changed() => {}
            }
        }
    }

    fn finish_prefetch(&self, task: PrefetchTask, result: Result<Snapshot, FetchError>) {
        let entity = task.entity;
        let mut guard = self.core.lock();
        let core = &mut *guard;

        let ok = match result {
            Ok(Snapshot::Entity(Some(fetched))) => {
                if core.coordinator.is_dirty(&entity) {
                    debug!(%entity, "Prefetched entity has a pending mutation, not written");
                } else {
                    let _effects = core.replica.load(fetched);
                    core.replica.views_mut().mark_detail_fresh(&entity);
                }
                true
            }
            Ok(Snapshot::Entity(None)) => true,
            Ok(_) => false,
            Err(err) => {
                debug!(%entity, %err, "Prefetch failed");
                false
            }
        };

        let completion = core.prefetch.complete(&entity, ok, Instant::now());
        core.replica.flush();
        debug!(%entity, ?completion, "Prefetch finished");
    }

    async fn run_maintenance(&self, cancel: CancellationToken) {
        let maintenance = self.config.maintenance;
        let mut ticker = interval(maintenance.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_recompute = Instant::now();

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Some(max_staleness) = maintenance.max_staleness {
                let overdue: Vec<ViewKey> = {
                    let core = self.core.lock();
                    let views = core.replica.views();
                    views
                        .subscribed()
                        .into_iter()
                        .filter(|key| {
                            views
                                .stale_since(key)
                                .is_some_and(|since| since.elapsed() >= max_staleness)
                        })
                        .collect()
                };

                for key in overdue {
                    debug!(view = %key, "Revalidating view past its staleness bound");
                    if let Err(err) = self.revalidate(&key).await {
                        warn!(view = %key, %err, "Revalidation failed");
                    }
                }
            }

            if let Some(period) = maintenance.scalar_recompute_interval {
                if last_recompute.elapsed() >= period {
                    last_recompute = Instant::now();
                    let scalars: Vec<ViewKey> =
                        self.core.lock().replica.views().scalar_keys().cloned().collect();
                    for key in scalars {
                        if let Err(err) = self.recompute_scalar(&key).await {
                            warn!(view = %key, %err, "Periodic recompute fell back to local count");
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl SessionHooks for Inner {
    fn on_event(&self, event: RawPushEvent) {
        let _disposition = self.handle_push(event);
    }

    async fn on_connected(&self, reconnect: bool) {
        if reconnect {
            self.resync().await;
        }
    }
}
