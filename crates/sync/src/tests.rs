use core::time::Duration;
use std::sync::Arc;

use docket_config::{MaintenanceConfig, ReconnectConfig, SyncConfig};
use docket_primitives::entity::{Entity, FieldValue};
use docket_primitives::event::{Change, PushEvent};
use docket_primitives::filter::{Filter, SortSpec};
use docket_primitives::ids::{EntityId, EntityKind, EntityRef};
use docket_primitives::mutation::{FailureKind, MutationChange};
use docket_primitives::view::{ListViewDef, ScalarViewDef, ViewKey};
use tokio::time::{sleep, timeout};

use crate::testing::MemoryAuthority;
use crate::{Disposition, EnqueueOutcome, MutationError, Priority, SessionState, SyncClient};

fn ticket(id: u64, status: &str, updated_at: i64) -> Entity {
    Entity::new(EntityRef::ticket(id))
        .with_versioned("status", status, 1)
        .with_versioned("title", format!("Ticket {id}"), 1)
        .with_versioned("updated_at", updated_at, 1)
}

fn open_filter() -> Filter {
    Filter::new(EntityKind::Ticket).eq("status", "open")
}

struct Harness {
    authority: Arc<MemoryAuthority>,
    client: SyncClient,
    open: ViewKey,
    count: ViewKey,
}

impl Harness {
    /// Seeds `tickets`, registers the open-ticket list and counter and loads
    /// both.
    async fn new(config: SyncConfig, tickets: Vec<Entity>) -> Self {
        let authority = Arc::new(MemoryAuthority::new());
        authority.seed(tickets);

        let client = SyncClient::new(
            config,
            authority.clone(),
            authority.clone(),
            authority.clone(),
        );
        let open = client.register_list(
            ListViewDef::new("open", open_filter()).sorted_by(SortSpec::descending("updated_at")),
        );
        let count = client.register_scalar(ScalarViewDef::count("open", "all", open_filter()));

        client.refresh(&open).await.expect("list loads");
        client.refresh(&count).await.expect("count loads");

        Self {
            authority,
            client,
            open,
            count,
        }
    }

    async fn started(config: SyncConfig, tickets: Vec<Entity>) -> Self {
        let harness = Self::new(config, tickets).await;
        harness.client.start("tickets");
        let _connected = harness
            .client
            .watch_session()
            .wait_for(|state| *state == SessionState::Connected)
            .await
            .is_ok();
        harness
    }

    fn open_ids(&self) -> Vec<u64> {
        self.client
            .snapshot(&self.open)
            .and_then(|snapshot| snapshot.as_list().map(|list| list.ids()))
            .expect("list registered")
            .into_iter()
            .map(EntityId::get)
            .collect()
    }

    fn count(&self) -> i64 {
        self.client
            .snapshot(&self.count)
            .and_then(|snapshot| snapshot.as_scalar().map(|scalar| scalar.value))
            .expect("counter registered")
    }

    fn field(&self, id: u64, name: &str) -> FieldValue {
        self.client
            .entity(&EntityRef::ticket(id))
            .map_or(FieldValue::Null, |entity| entity.get(name).clone())
    }
}

/// Polls `condition` until it holds, yielding to background tasks.
async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let waited = timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn test_rejected_close_is_undone() {
    let harness = Harness::new(
        SyncConfig::default(),
        (40..=44).map(|id| ticket(id, "open", i64::try_from(id).expect("small"))).collect(),
    )
    .await;
    assert_eq!(harness.count(), 5);
    assert_eq!(harness.open_ids(), vec![44, 43, 42, 41, 40]);

    harness
        .authority
        .fail_mutations_for(EntityRef::ticket(42), FailureKind::Validation, "ticket is locked");
    harness.authority.hold_mutations();
    let mut counter = harness.client.observe(&harness.count).expect("registered");

    let close = tokio::spawn({
        let client = harness.client.clone();
        async move {
            client
                .set_field(EntityRef::ticket(42), "status", "closed")
                .await
        }
    });

    let optimistic = counter.changed().await.expect("counter alive");
    assert_eq!(optimistic.as_scalar().map(|scalar| scalar.value), Some(4), "applied before the server answers");
    assert_eq!(harness.open_ids(), vec![44, 43, 41, 40]);

    harness.authority.release_mutations();
    let result = close.await.expect("mutation task");

    assert_eq!(
        result,
        Err(MutationError::ValidationRejected {
            message: "ticket is locked".to_owned()
        })
    );
    assert_eq!(harness.count(), 5, "counter restored");
    assert_eq!(harness.open_ids(), vec![44, 43, 42, 41, 40], "same slot as before");
    assert_eq!(harness.field(42, "status"), FieldValue::from("open"));
    assert_eq!(harness.client.stats().pending_mutations, 0);
}

#[tokio::test]
async fn test_out_of_order_updates_keep_the_newest() {
    let harness = Harness::new(
        SyncConfig::default(),
        (5..=9).map(|id| ticket(id, "open", i64::try_from(id).expect("small"))).collect(),
    )
    .await;

    let update = |event_id: &str, status: &str, version: u64| {
        PushEvent {
            event_id: event_id.to_owned(),
            entity: EntityRef::ticket(7),
            origin_mutation_id: None,
            change: Change::Updated(
                Entity::new(EntityRef::ticket(7)).with_versioned("status", status, version),
            ),
        }
        .encode()
    };

    assert_eq!(harness.client.handle_push(update("ev-3", "closed", 3)), Disposition::Applied);
    assert_eq!(harness.client.handle_push(update("ev-2", "open", 2)), Disposition::Applied);

    assert_eq!(harness.field(7, "status"), FieldValue::from("closed"), "v2 must not win");
    assert_eq!(harness.open_ids(), vec![9, 8, 6, 5]);
    assert_eq!(harness.count(), 4);
}

#[tokio::test]
async fn test_bulk_assign_with_one_failure_names_it() {
    let harness = Harness::new(
        SyncConfig::default(),
        (1..=5).map(|id| ticket(id, "open", 0)).collect(),
    )
    .await;
    harness
        .authority
        .fail_mutations_for(EntityRef::ticket(3), FailureKind::Validation, "agent not on team");

    let targets: Vec<EntityRef> = (1..=5).map(EntityRef::ticket).collect();
    let result = harness
        .client
        .mutate_bulk(targets, MutationChange::set("assignee", "alice"))
        .await;

    let (committed, failed) = match result {
        Err(MutationError::PartialBulkFailure { committed, failed }) => (committed, failed),
        other => panic!("expected a partial failure, got {other:?}"),
    };
    assert_eq!(committed, [1, 2, 4, 5].map(EntityRef::ticket).to_vec());
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].entity, EntityRef::ticket(3));
    assert!(matches!(failed[0].error, MutationError::ValidationRejected { .. }));

    assert_eq!(harness.field(3, "assignee"), FieldValue::Null, "failed item rolled back");
    for id in [1, 2, 4, 5] {
        assert_eq!(harness.field(id, "assignee"), FieldValue::from("alice"));
    }
}

#[tokio::test]
async fn test_bulk_where_everything_fails_returns_the_first_error() {
    let harness = Harness::new(SyncConfig::default(), vec![ticket(1, "open", 0)]).await;
    harness
        .authority
        .fail_mutations_for(EntityRef::ticket(1), FailureKind::Network, "unreachable");

    let result = harness
        .client
        .mutate_bulk(vec![EntityRef::ticket(1)], MutationChange::set("assignee", "bob"))
        .await;

    assert!(matches!(result, Err(MutationError::NetworkFailure { .. })));
    assert!(result.is_err_and(|err| err.is_retryable()), "network errors are retryable");
}

#[tokio::test]
async fn test_own_echo_is_ignored() {
    let harness = Harness::started(
        SyncConfig::default(),
        (40..=44).map(|id| ticket(id, "open", 0)).collect(),
    )
    .await;

    let committed = harness
        .client
        .set_field(EntityRef::ticket(42), "status", "closed")
        .await
        .expect("committed");
    assert!(committed.is_some(), "authority returns the entity");

    let client = harness.client.clone();
    eventually("the echo", move || client.stats().reconcile.echoes == 1).await;
    assert_eq!(harness.count(), 4, "decremented once");

    let echo = PushEvent {
        event_id: "ev-replayed".to_owned(),
        entity: EntityRef::ticket(42),
        origin_mutation_id: harness.authority.submitted().first().map(|m| m.mutation_id.clone()),
        change: Change::Updated(Entity::new(EntityRef::ticket(42)).with("status", "closed")),
    };
    assert_eq!(harness.client.handle_push(echo.encode()), Disposition::Echo);
    assert_eq!(harness.count(), 4, "redelivery changes nothing");

    harness.client.stop().await;
}

#[tokio::test]
async fn test_remote_event_waits_for_pending_mutation() {
    let harness = Harness::started(
        SyncConfig::default(),
        (40..=44).map(|id| ticket(id, "open", 0)).collect(),
    )
    .await;
    harness.authority.hold_mutations();

    let rename = tokio::spawn({
        let client = harness.client.clone();
        async move {
            client
                .set_field(EntityRef::ticket(42), "title", "Printer jam")
                .await
        }
    });
    let client = harness.client.clone();
    eventually("the optimistic write", move || client.is_dirty(&EntityRef::ticket(42))).await;

    harness
        .authority
        .remote_update(EntityRef::ticket(42), "status", "closed");
    let client = harness.client.clone();
    eventually("the deferral", move || client.stats().deferred_events == 1).await;
    assert_eq!(harness.count(), 5, "not applied while #42 is dirty");

    harness.authority.release_mutations();
    rename.await.expect("mutation task").expect("committed");

    assert_eq!(harness.client.stats().deferred_events, 0);
    assert_eq!(harness.count(), 4);
    assert!(!harness.open_ids().contains(&42), "closed ticket left the list");
    assert_eq!(harness.field(42, "title"), FieldValue::from("Printer jam"));
    assert_eq!(harness.field(42, "status"), FieldValue::from("closed"));

    harness.client.stop().await;
}

#[tokio::test]
async fn test_optimistic_create_takes_the_assigned_id() {
    let harness = Harness::new(SyncConfig::default(), vec![ticket(1, "open", 1)]).await;

    let draft = Entity::new(EntityRef::ticket(900_000))
        .with("status", "open")
        .with("title", "New monitor")
        .with("updated_at", 50_i64);
    let created = harness
        .client
        .create(draft)
        .await
        .expect("committed")
        .expect("authority returns the entity");

    let assigned = created.entity_ref();
    assert_ne!(assigned, EntityRef::ticket(900_000));
    assert_eq!(harness.open_ids(), vec![assigned.id.get(), 1]);
    assert_eq!(harness.count(), 2);
    assert!(harness.client.entity(&EntityRef::ticket(900_000)).is_none(), "provisional id gone");
}

#[tokio::test]
async fn test_conflict_refetches_the_entity() {
    let harness = Harness::new(SyncConfig::default(), vec![ticket(42, "open", 0)]).await;
    // Changed by someone else while nobody was listening.
    harness
        .authority
        .remote_update(EntityRef::ticket(42), "title", "Renamed elsewhere");
    harness
        .authority
        .fail_mutations_for(EntityRef::ticket(42), FailureKind::Conflict, "stale base");

    let result = harness
        .client
        .set_field(EntityRef::ticket(42), "title", "Mine")
        .await;

    assert!(matches!(
        result,
        Err(MutationError::ConflictStale { entity, .. }) if entity == EntityRef::ticket(42)
    ));
    assert_eq!(harness.field(42, "title"), FieldValue::from("Renamed elsewhere"));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_resyncs_missed_changes() {
    let harness = Harness::started(
        SyncConfig::default(),
        (40..=44).map(|id| ticket(id, "open", i64::try_from(id).expect("small"))).collect(),
    )
    .await;
    let _list = harness.client.observe(&harness.open).expect("registered");
    let _counter = harness.client.observe(&harness.count).expect("registered");

    harness.authority.disconnect_all();
    harness
        .authority
        .remote_update(EntityRef::ticket(41), "status", "closed");
    let created = harness.authority.remote_create(ticket(0, "open", 99));

    let client = harness.client.clone();
    eventually("the resync", move || client.stats().resyncs == 1).await;

    assert_eq!(harness.open_ids(), vec![created.id.get(), 44, 43, 42, 40]);
    assert_eq!(harness.count(), 5);
    assert_eq!(harness.client.session_state(), SessionState::Connected);
    assert_eq!(harness.authority.connection_attempts(), 2);

    harness.client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_max_attempts() {
    let mut config = SyncConfig::default();
    config.reconnect = ReconnectConfig {
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        max_attempts: 3,
    };
    let harness = Harness::new(config, vec![ticket(1, "open", 0)]).await;
    harness.authority.refuse_next_connections(u32::MAX);

    harness.client.start("tickets");
    let offline = harness
        .client
        .watch_session()
        .wait_for(|state| *state == SessionState::Offline)
        .await
        .is_ok();

    assert!(offline, "session went offline");
    assert_eq!(harness.authority.connection_attempts(), 3);

    let result = harness
        .client
        .set_field(EntityRef::ticket(1), "title", "Still works")
        .await;
    assert!(result.is_ok(), "mutations do not need the push channel");

    harness.client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_prefetch_respects_concurrency_bound() {
    let harness = Harness::started(
        SyncConfig::default(),
        (1..=10).map(|id| ticket(id, "closed", 0)).collect(),
    )
    .await;
    harness.authority.set_fetch_delay(Duration::from_millis(200));

    for id in 1..=10 {
        let outcome = harness.client.preload(EntityRef::ticket(id), Priority::Normal);
        assert_eq!(outcome, EnqueueOutcome::Queued);
    }
    assert_eq!(
        harness.client.preload(EntityRef::ticket(1), Priority::Normal),
        EnqueueOutcome::AlreadyQueued
    );

    let client = harness.client.clone();
    eventually("all prefetches", move || {
        (1..=10).all(|id| client.entity(&EntityRef::ticket(id)).is_some())
    })
    .await;

    let stats = harness.client.stats().prefetch;
    assert_eq!(stats.completed, 10);
    assert!(stats.peak_inflight <= 3, "peak {}", stats.peak_inflight);
    assert!(harness.authority.peak_inflight_fetches() <= 3, "authority saw too many");
    assert_eq!(
        harness.client.preload(EntityRef::ticket(1), Priority::Normal),
        EnqueueOutcome::AlreadyFresh
    );

    harness.client.stop().await;
}

#[tokio::test]
async fn test_observe_loads_an_unloaded_list_and_pages() {
    let authority = Arc::new(MemoryAuthority::new());
    authority.seed((1..=5).map(|id| ticket(id, "open", i64::try_from(id).expect("small"))));
    let client = SyncClient::new(
        SyncConfig::default(),
        authority.clone(),
        authority.clone(),
        authority,
    );
    let open = client.register_list(
        ListViewDef::new("open", open_filter())
            .sorted_by(SortSpec::descending("updated_at"))
            .with_page_size(2),
    );

    let mut list = client.observe(&open).expect("registered");
    let first = list.changed().await.expect("list alive");
    let first = first.as_list().expect("list snapshot");
    assert_eq!(first.ids(), [5, 4].map(EntityId::new).to_vec());
    assert!(first.has_more, "three more to go");

    assert!(client.load_next_page(&open).await.expect("page loads"), "one more page");
    assert!(!client.load_next_page(&open).await.expect("page loads"), "last page");
    assert!(!client.load_next_page(&open).await.expect("nothing to load"), "exhausted");

    let all = client.snapshot(&open).expect("registered");
    assert_eq!(
        all.as_list().map(|list| list.pages.len()),
        Some(3),
        "pages are kept apart"
    );
    assert_eq!(
        all.as_list().map(|list| list.ids()),
        Some([5, 4, 3, 2, 1].map(EntityId::new).to_vec())
    );
}

#[tokio::test]
async fn test_count_falls_back_to_local_scan() {
    let harness = Harness::new(
        SyncConfig::default(),
        (1..=3).map(|id| ticket(id, "open", 0)).collect(),
    )
    .await;
    harness.authority.remote_create(ticket(0, "open", 0));
    harness.authority.fail_next_fetches(1);

    let result = harness.client.refresh(&harness.count).await;

    assert!(result.is_err(), "count query failed");
    assert_eq!(harness.count(), 3, "counted from resident entities");
}

#[tokio::test(start_paused = true)]
async fn test_periodic_scalar_recompute_corrects_drift() {
    let mut config = SyncConfig::default();
    config.maintenance = MaintenanceConfig {
        tick: Duration::from_secs(1),
        max_staleness: None,
        scalar_recompute_interval: Some(Duration::from_secs(2)),
    };
    let harness = Harness::started(config, (1..=3).map(|id| ticket(id, "open", 0)).collect()).await;

    // Unannounced: only a recompute can notice.
    harness.authority.seed([ticket(4, "open", 0)]);
    sleep(Duration::from_secs(4)).await;

    assert_eq!(harness.count(), 4);
    harness.client.stop().await;
}

#[tokio::test]
async fn test_stop_abandons_waiting_mutations() {
    let harness = Harness::new(SyncConfig::default(), vec![ticket(1, "open", 0)]).await;
    harness.client.start("tickets");
    harness.authority.hold_mutations();

    let first = tokio::spawn({
        let client = harness.client.clone();
        async move { client.set_field(EntityRef::ticket(1), "title", "A").await }
    });
    let client = harness.client.clone();
    eventually("the first mutation", move || client.is_dirty(&EntityRef::ticket(1))).await;

    let second = tokio::spawn({
        let client = harness.client.clone();
        async move { client.set_field(EntityRef::ticket(1), "title", "B").await }
    });
    let client = harness.client.clone();
    eventually("the queued mutation", move || client.stats().waiting_mutations == 1).await;

    harness.client.stop().await;
    harness.authority.release_mutations();

    assert_eq!(second.await.expect("mutation task"), Err(MutationError::Abandoned));
    assert!(first.await.expect("mutation task").is_ok(), "submitted one still settles");
    assert_eq!(harness.field(1, "title"), FieldValue::from("A"));
}

#[tokio::test]
async fn test_bulk_with_a_repeated_target_changes_it_once() {
    let harness = Harness::new(
        SyncConfig::default(),
        (1..=2).map(|id| ticket(id, "open", 0)).collect(),
    )
    .await;

    let targets = [1, 2, 1].map(EntityRef::ticket).to_vec();
    let result = timeout(
        Duration::from_secs(2),
        harness
            .client
            .mutate_bulk(targets, MutationChange::set("assignee", "alice")),
    )
    .await
    .expect("bulk mutation finished");

    assert_eq!(result, Ok([1, 2].map(EntityRef::ticket).to_vec()));
    assert_eq!(harness.authority.submitted().len(), 2, "one submission per entity");
    assert_eq!(harness.field(1, "assignee"), FieldValue::from("alice"));
    assert_eq!(harness.client.stats().pending_mutations, 0);
}

#[tokio::test]
async fn test_resync_before_settlement_arrives_keeps_counter_exact() {
    let harness = Harness::new(
        SyncConfig::default(),
        (40..=44).map(|id| ticket(id, "open", i64::try_from(id).expect("small"))).collect(),
    )
    .await;
    // The authority applies the close at once but answers late.
    harness.authority.hold_settlements();

    let close = tokio::spawn({
        let client = harness.client.clone();
        async move {
            client
                .set_field(EntityRef::ticket(42), "status", "closed")
                .await
        }
    });
    let authority = Arc::clone(&harness.authority);
    eventually("the authority to apply the close", move || {
        authority.submitted().len() == 1
    })
    .await;
    assert_eq!(harness.count(), 4, "optimistic");

    harness.client.resync().await;

    harness.authority.release_settlements();
    close.await.expect("mutation task").expect("committed");

    assert_eq!(harness.count(), 4, "counter agrees with the authority");
    assert_eq!(harness.open_ids(), vec![44, 43, 41, 40]);
    assert_eq!(
        i64::try_from(harness.open_ids().len()).expect("small"),
        harness.count(),
        "counter agrees with the list"
    );
}

#[tokio::test(start_paused = true)]
async fn test_stale_subscribed_list_is_refetched_without_a_read() {
    let mut config = SyncConfig::default();
    config.maintenance = MaintenanceConfig {
        tick: Duration::from_secs(1),
        max_staleness: Some(Duration::from_secs(2)),
        scalar_recompute_interval: None,
    };
    let harness = Harness::started(
        config,
        (40..=44).map(|id| ticket(id, "open", i64::try_from(id).expect("small"))).collect(),
    )
    .await;
    let _list = harness.client.observe(&harness.open).expect("registered");
    let stale = |harness: &Harness| {
        harness
            .client
            .snapshot(&harness.open)
            .and_then(|snapshot| snapshot.as_list().map(|list| list.stale))
            .expect("list registered")
    };

    // A commit marks the lists holding the entity stale.
    let _committed = harness
        .client
        .set_field(EntityRef::ticket(40), "title", "Renamed")
        .await
        .expect("committed");
    assert!(stale(&harness), "stale after the commit");

    // Unannounced: only a refetch can bring it in.
    harness.authority.seed([ticket(45, "open", 99)]);
    let fetches = harness.authority.fetch_count();
    sleep(Duration::from_secs(4)).await;

    assert!(harness.authority.fetch_count() > fetches, "refetched in the background");
    assert!(!stale(&harness), "fresh again");
    assert_eq!(harness.open_ids(), vec![45, 44, 43, 42, 41, 40]);

    harness.client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_warm_visible_queues_only_stale_first_page_entities() {
    let authority = Arc::new(MemoryAuthority::new());
    authority.seed((1..=5).map(|id| ticket(id, "open", i64::try_from(id).expect("small"))));
    let client = SyncClient::new(
        SyncConfig::default(),
        authority.clone(),
        authority.clone(),
        authority,
    );
    let open = client.register_list(
        ListViewDef::new("open", open_filter())
            .sorted_by(SortSpec::descending("updated_at"))
            .with_page_size(2),
    );
    client.refresh(&open).await.expect("first page loads");
    let _list = client.observe(&open).expect("registered");

    // Past the freshness window of the first page.
    sleep(Duration::from_secs(31)).await;
    assert!(client.load_next_page(&open).await.expect("page loads"), "more pages");
    client
        .refresh(&ViewKey::detail(EntityRef::ticket(5)))
        .await
        .expect("detail loads");

    assert_eq!(client.warm_visible(), 1, "only #4 is on screen and stale");
    assert_eq!(
        client.preload(EntityRef::ticket(4), Priority::Low),
        EnqueueOutcome::AlreadyQueued
    );
    assert_eq!(
        client.preload(EntityRef::ticket(5), Priority::Low),
        EnqueueOutcome::AlreadyFresh
    );
    assert_eq!(
        client.preload(EntityRef::ticket(3), Priority::Low),
        EnqueueOutcome::AlreadyFresh,
        "second page was just loaded"
    );
    assert_eq!(client.warm_visible(), 0, "nothing new to queue");
}

#[tokio::test(start_paused = true)]
async fn test_prefetch_retries_once_then_gives_up() {
    let harness = Harness::started(
        SyncConfig::default(),
        vec![ticket(1, "open", 0), ticket(2, "closed", 0)],
    )
    .await;
    harness.authority.fail_next_fetches(2);

    assert_eq!(
        harness.client.preload(EntityRef::ticket(2), Priority::Normal),
        EnqueueOutcome::Queued
    );
    let client = harness.client.clone();
    eventually("the prefetch to give up", move || client.stats().prefetch.failed == 1).await;

    let stats = harness.client.stats().prefetch;
    assert_eq!(stats.started, 2, "one retry");
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.completed, 0);
    assert_eq!(
        harness.client.preload(EntityRef::ticket(2), Priority::High),
        EnqueueOutcome::GaveUp
    );
    assert!(harness.client.entity(&EntityRef::ticket(2)).is_none(), "never loaded");

    harness.client.stop().await;
}
