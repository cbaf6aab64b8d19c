//! An in-memory authority implementing every effect trait, with knobs for
//! injecting failures. Used by the integration tests and the simulator.

use core::time::Duration;
use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use docket_primitives::entity::{Entity, Field, FieldValue};
use docket_primitives::event::{Change, PushEvent, RawPushEvent};
use docket_primitives::ids::{EntityId, EntityRef, MutationId};
use docket_primitives::mutation::{FailureKind, MutationChange, MutationDescriptor, Settlement};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::effects::{MutationExecutor, PushStream, PushTransport, Query, QueryExecutor, Snapshot};
use crate::error::{FetchError, TransportError};

/// Ids the authority hands out to created entities start here.
const FIRST_ASSIGNED_ID: u64 = 10_000;

#[derive(Debug)]
struct State {
    entities: BTreeMap<EntityRef, Entity>,
    clock: u64,
    next_id: u64,
    next_event: u64,
    subscribers: Vec<mpsc::UnboundedSender<RawPushEvent>>,
    rejections: HashMap<EntityRef, (FailureKind, String)>,
    submitted: Vec<MutationDescriptor>,
    refuse_connections: u32,
    connection_attempts: u32,
    failing_fetches: u32,
    fetch_delay: Duration,
    fetches: u64,
    inflight_fetches: usize,
    peak_inflight_fetches: usize,
}

impl State {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn publish(&mut self, entity: EntityRef, origin: Option<MutationId>, change: Change) {
        self.next_event += 1;
        let event = PushEvent {
            event_id: format!("ev-{}", self.next_event),
            entity,
            origin_mutation_id: origin,
            change,
        };
        self.broadcast(&event.encode());
    }

    fn broadcast(&mut self, raw: &RawPushEvent) {
        self.subscribers.retain(|tx| tx.send(raw.clone()).is_ok());
    }

    /// Writes `fields` at a fresh version; returns the partial entity
    /// holding just the written fields.
    fn write_fields(
        &mut self,
        target: EntityRef,
        fields: impl IntoIterator<Item = (String, FieldValue)>,
    ) -> Option<Entity> {
        let version = self.tick();
        let entity = self.entities.get_mut(&target)?;
        let mut written = Entity::new(target);
        for (name, value) in fields {
            let field = Field::versioned(value, version);
            let _prev = entity.fields.insert(name.clone(), field.clone());
            let _prev = written.fields.insert(name, field);
        }
        Some(written)
    }

    fn create(&mut self, draft: Entity) -> Entity {
        let version = self.tick();
        let id = EntityId::new(self.next_id);
        self.next_id += 1;

        let mut entity = Entity::new(EntityRef::new(draft.kind, id));
        for (name, field) in draft.fields {
            let _prev = entity
                .fields
                .insert(name, Field::versioned(field.value, version));
        }
        let _prev = self.entities.insert(entity.entity_ref(), entity.clone());
        entity
    }
}

/// A fake remote authority holding the canonical entity set.
#[derive(Debug)]
pub struct MemoryAuthority {
    state: Mutex<State>,
    gate: watch::Sender<bool>,
    replies: watch::Sender<bool>,
}

impl Default for MemoryAuthority {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAuthority {
    #[must_use]
    pub fn new() -> Self {
        let (gate, _rx) = watch::channel(true);
        let (replies, _rx) = watch::channel(true);
        Self {
            state: Mutex::new(State {
                entities: BTreeMap::new(),
                clock: 0,
                next_id: FIRST_ASSIGNED_ID,
                next_event: 0,
                subscribers: Vec::new(),
                rejections: HashMap::new(),
                submitted: Vec::new(),
                refuse_connections: 0,
                connection_attempts: 0,
                failing_fetches: 0,
                fetch_delay: Duration::ZERO,
                fetches: 0,
                inflight_fetches: 0,
                peak_inflight_fetches: 0,
            }),
            gate,
            replies,
        }
    }

    /// Stores entities without announcing them. Unversioned fields are
    /// stamped with a fresh version.
    pub fn seed(&self, entities: impl IntoIterator<Item = Entity>) {
        let mut state = self.state.lock();
        for mut entity in entities {
            let version = state.tick();
            for field in entity.fields.values_mut() {
                let _prev = field.version.get_or_insert(version);
            }
            state.clock = state.clock.max(entity.version().unwrap_or(0));
            let _prev = state.entities.insert(entity.entity_ref(), entity);
        }
    }

    #[must_use]
    pub fn entity(&self, entity: &EntityRef) -> Option<Entity> {
        self.state.lock().entities.get(entity).cloned()
    }

    /// Every mutation received so far, in arrival order.
    #[must_use]
    pub fn submitted(&self) -> Vec<MutationDescriptor> {
        self.state.lock().submitted.clone()
    }

    // ------------------------------------------------------------------
    // Other actors
    // ------------------------------------------------------------------

    /// Another actor sets one field and the change is announced.
    pub fn remote_update(&self, target: EntityRef, field: &str, value: impl Into<FieldValue>) {
        let mut state = self.state.lock();
        if let Some(written) = state.write_fields(target, [(field.to_owned(), value.into())]) {
            state.publish(target, None, Change::Updated(written));
        }
    }

    /// Another actor creates an entity; returns the assigned reference.
    pub fn remote_create(&self, draft: Entity) -> EntityRef {
        let mut state = self.state.lock();
        let entity = state.create(draft);
        let entity_ref = entity.entity_ref();
        state.publish(entity_ref, None, Change::Created(entity));
        entity_ref
    }

    pub fn remote_delete(&self, target: EntityRef) {
        let mut state = self.state.lock();
        if state.entities.remove(&target).is_some() {
            state.publish(target, None, Change::Deleted);
        }
    }

    /// Another actor merges `losers` into `survivor`.
    pub fn remote_merge(&self, survivor: EntityRef, losers: &[EntityId]) {
        let mut state = self.state.lock();
        for loser in losers {
            let _removed = state.entities.remove(&EntityRef::new(survivor.kind, *loser));
        }
        state.publish(
            survivor,
            None,
            Change::Merged {
                losers: losers.to_vec(),
                survivor: None,
            },
        );
    }

    /// Delivers an arbitrary event to every connected subscriber.
    pub fn push(&self, event: &PushEvent) {
        self.state.lock().broadcast(&event.encode());
    }

    pub fn push_raw(&self, raw: &RawPushEvent) {
        self.state.lock().broadcast(raw);
    }

    // ------------------------------------------------------------------
    // Failure injection
    // ------------------------------------------------------------------

    /// Rejects every mutation whose primary target is `target`.
    pub fn fail_mutations_for(&self, target: EntityRef, kind: FailureKind, message: &str) {
        let _prev = self
            .state
            .lock()
            .rejections
            .insert(target, (kind, message.to_owned()));
    }

    pub fn clear_failures(&self) {
        self.state.lock().rejections.clear();
    }

    /// Parks incoming mutations until [`Self::release_mutations`].
    pub fn hold_mutations(&self) {
        let _prev = self.gate.send_replace(false);
    }

    pub fn release_mutations(&self) {
        let _prev = self.gate.send_replace(true);
    }

    /// Applies incoming mutations right away but withholds their
    /// settlements until [`Self::release_settlements`].
    pub fn hold_settlements(&self) {
        let _prev = self.replies.send_replace(false);
    }

    pub fn release_settlements(&self) {
        let _prev = self.replies.send_replace(true);
    }

    pub fn fail_next_fetches(&self, count: u32) {
        self.state.lock().failing_fetches = count;
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        self.state.lock().fetch_delay = delay;
    }

    #[must_use]
    pub fn fetch_count(&self) -> u64 {
        self.state.lock().fetches
    }

    /// Highest number of queries that were in flight at once.
    #[must_use]
    pub fn peak_inflight_fetches(&self) -> usize {
        self.state.lock().peak_inflight_fetches
    }

    pub fn refuse_next_connections(&self, count: u32) {
        self.state.lock().refuse_connections = count;
    }

    /// Ends every open push stream.
    pub fn disconnect_all(&self) {
        self.state.lock().subscribers.clear();
    }

    #[must_use]
    pub fn connection_attempts(&self) -> u32 {
        self.state.lock().connection_attempts
    }

    #[must_use]
    pub fn connected(&self) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|tx| !tx.is_closed());
        state.subscribers.len()
    }

    fn execute(&self, mutation: MutationDescriptor) -> Settlement {
        let mut state = self.state.lock();
        state.submitted.push(mutation.clone());

        let Some(target) = mutation.targets.first().copied() else {
            return Settlement::rejected(FailureKind::Validation, "mutation has no target");
        };
        if let Some((kind, message)) = state.rejections.get(&target) {
            debug!(%target, %kind, "Rejecting mutation as instructed");
            return Settlement::rejected(*kind, message);
        }

        let origin = Some(mutation.mutation_id);
        match mutation.change {
            MutationChange::SetFields(fields) => {
                let Some(written) = state.write_fields(target, fields) else {
                    return Settlement::rejected(FailureKind::Validation, "no such entity");
                };
                let current = state.entities.get(&target).cloned();
                state.publish(target, origin, Change::Updated(written));
                Settlement::committed(current)
            }
            MutationChange::Create(draft) => {
                let entity = state.create(draft);
                state.publish(entity.entity_ref(), origin, Change::Created(entity.clone()));
                Settlement::committed(Some(entity))
            }
            MutationChange::Delete => {
                if state.entities.remove(&target).is_none() {
                    return Settlement::rejected(FailureKind::Validation, "no such entity");
                }
                state.publish(target, origin, Change::Deleted);
                Settlement::committed(None)
            }
        }
    }

    fn answer(state: &State, query: Query) -> Result<Snapshot, FetchError> {
        match query {
            Query::Entity(entity) => Ok(Snapshot::Entity(state.entities.get(&entity).cloned())),
            Query::ListPage { view, cursor } => {
                let start = match cursor {
                    Some(cursor) => cursor
                        .parse::<usize>()
                        .map_err(|_| FetchError::Failed(format!("bad cursor `{cursor}`")))?,
                    None => 0,
                };

                let mut matching: Vec<&Entity> = state
                    .entities
                    .values()
                    .filter(|entity| view.filter.matches(entity))
                    .collect();
                if let Some(sort) = &view.sort {
                    matching.sort_by(|a, b| sort.compare(a, b));
                }

                let entities: Vec<Entity> = matching
                    .iter()
                    .skip(start)
                    .take(view.page_size)
                    .map(|entity| (*entity).clone())
                    .collect();
                let end = start + entities.len();
                let next_cursor = (end < matching.len()).then(|| end.to_string());

                Ok(Snapshot::Page {
                    entities,
                    next_cursor,
                })
            }
            Query::Count(def) => {
                let count = state
                    .entities
                    .values()
                    .filter(|entity| def.filter.matches(entity))
                    .count();
                Ok(Snapshot::Count(i64::try_from(count).unwrap_or(i64::MAX)))
            }
        }
    }
}

/// Keeps the in-flight fetch count honest if a fetch is dropped midway.
struct InflightFetch<'a>(&'a Mutex<State>);

impl Drop for InflightFetch<'_> {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        state.inflight_fetches = state.inflight_fetches.saturating_sub(1);
    }
}

#[async_trait]
impl MutationExecutor for MemoryAuthority {
    async fn submit(&self, mutation: MutationDescriptor) -> Settlement {
        let mut gate = self.gate.subscribe();
        let _open = gate.wait_for(|open| *open).await.is_ok();

        let settlement = self.execute(mutation);

        let mut replies = self.replies.subscribe();
        let _open = replies.wait_for(|open| *open).await.is_ok();
        settlement
    }
}

#[async_trait]
impl QueryExecutor for MemoryAuthority {
    async fn fetch(&self, query: Query) -> Result<Snapshot, FetchError> {
        let delay = {
            let mut state = self.state.lock();
            state.fetches += 1;
            state.inflight_fetches += 1;
            state.peak_inflight_fetches = state.peak_inflight_fetches.max(state.inflight_fetches);
            state.fetch_delay
        };
        let inflight = InflightFetch(&self.state);

        if !delay.is_zero() {
            sleep(delay).await;
        }
        drop(inflight);

        let mut state = self.state.lock();
        if state.failing_fetches > 0 {
            state.failing_fetches -= 1;
            return Err(FetchError::Failed("injected failure".to_owned()));
        }
        Self::answer(&state, query)
    }
}

#[async_trait]
impl PushTransport for MemoryAuthority {
    async fn subscribe(&self, scope: &str) -> Result<PushStream, TransportError> {
        let mut state = self.state.lock();
        state.connection_attempts += 1;

        if state.refuse_connections > 0 {
            state.refuse_connections -= 1;
            return Err(TransportError::Refused("injected refusal".to_owned()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.push(tx);
        debug!(%scope, subscribers = state.subscribers.len(), "Push subscriber connected");

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}
