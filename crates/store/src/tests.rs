use docket_primitives::entity::Entity;
use docket_primitives::filter::{Filter, SortSpec};
use docket_primitives::ids::{EntityId, EntityKind, EntityRef};
use docket_primitives::view::{ListViewDef, ScalarViewDef, ViewKey};

use crate::list::Presence;
use crate::replica::Replica;
use crate::subscription::ViewSnapshot;
use crate::views::StructuralOp;

fn ticket(id: u64, status: &str) -> Entity {
    Entity::new(EntityRef::ticket(id)).with("status", status)
}

fn open_filter() -> Filter {
    Filter::new(EntityKind::Ticket).eq("status", "open")
}

fn ids(values: &[u64]) -> Vec<EntityId> {
    values.iter().copied().map(EntityId::new).collect()
}

fn list_ids(replica: &Replica, key: &ViewKey) -> Vec<u64> {
    let snapshot = replica
        .views()
        .snapshot(key, replica.store())
        .expect("view registered");
    snapshot
        .as_list()
        .expect("list view")
        .ids()
        .into_iter()
        .map(EntityId::get)
        .collect()
}

fn scalar(replica: &Replica, key: &ViewKey) -> i64 {
    replica.views().scalar_value(key).expect("scalar registered")
}

/// Replica with an "open" list holding 1..=n and a loaded open counter.
fn seeded(n: u64) -> (Replica, ViewKey, ViewKey) {
    let mut replica = Replica::new();
    let list = replica
        .views_mut()
        .register_list(ListViewDef::new("open", open_filter()));
    let count = replica
        .views_mut()
        .register_scalar(ScalarViewDef::count("open_count", "all", open_filter()));

    for id in 1..=n {
        let _effects = replica.load(ticket(id, "open"));
    }
    let _changed = replica
        .views_mut()
        .apply_structural(
            &list,
            StructuralOp::ReplacePages {
                pages: vec![(1..=n).map(EntityId::new).collect()],
                next_cursor: None,
            },
        )
        .expect("registered");
    replica.views_mut().set_scalar(&count, i64::try_from(n).expect("small"));
    replica.flush();

    (replica, list, count)
}

// ============================================================
// Structural operations
// ============================================================

#[test]
fn test_insert_at_head_never_duplicates() {
    let (mut replica, list, _) = seeded(3);

    let changed = replica
        .views_mut()
        .apply_structural(&list, StructuralOp::InsertAtHead { id: EntityId::new(2), promote: false })
        .expect("registered");
    assert!(!changed, "present id without promote stays put");
    assert_eq!(list_ids(&replica, &list), vec![1, 2, 3]);

    let changed = replica
        .views_mut()
        .apply_structural(&list, StructuralOp::InsertAtHead { id: EntityId::new(2), promote: true })
        .expect("registered");
    assert!(changed, "promote moves it");
    assert_eq!(list_ids(&replica, &list), vec![2, 1, 3]);
}

#[test]
fn test_append_page_skips_ids_already_present() {
    let (mut replica, list, _) = seeded(3);

    let _changed = replica
        .views_mut()
        .apply_structural(
            &list,
            StructuralOp::AppendPage {
                ids: ids(&[3, 4, 5]),
                next_cursor: Some("c2".to_owned()),
            },
        )
        .expect("registered");

    assert_eq!(list_ids(&replica, &list), vec![1, 2, 3, 4, 5]);
    let snapshot = replica
        .views()
        .snapshot(&list, replica.store())
        .expect("registered");
    assert!(snapshot.as_list().expect("list").has_more, "cursor kept");
}

#[test]
fn test_unknown_view_is_an_error() {
    let mut replica = Replica::new();
    let key = ListViewDef::new("nowhere", open_filter()).key();

    assert!(
        replica
            .views_mut()
            .apply_structural(&key, StructuralOp::RemoveAll(EntityId::new(1)))
            .is_err(),
        "list was never registered"
    );
}

// ============================================================
// Store changes routed to views
// ============================================================

#[test]
fn test_closing_a_ticket_moves_list_and_counter() {
    let (mut replica, list, count) = seeded(5);

    let effects = replica.put(ticket(4, "closed"));

    assert_eq!(list_ids(&replica, &list), vec![1, 2, 3, 5]);
    assert_eq!(scalar(&replica, &count), 4);
    assert_eq!(effects.scalar_deltas, vec![(count.clone(), -1)]);
    assert_eq!(effects.lists, vec![list]);
}

#[test]
fn test_loading_unknown_entities_does_not_count() {
    let (mut replica, list, count) = seeded(2);

    let effects = replica.load(ticket(9, "open"));

    assert!(effects.scalar_deltas.is_empty(), "a load is not a creation");
    assert_eq!(scalar(&replica, &count), 2);
    assert_eq!(list_ids(&replica, &list), vec![1, 2], "pages decide membership");
}

#[test]
fn test_created_entity_goes_to_head_of_unsorted_list() {
    let (mut replica, list, count) = seeded(2);

    let _effects = replica.put(ticket(9, "open"));

    assert_eq!(list_ids(&replica, &list), vec![9, 1, 2]);
    assert_eq!(scalar(&replica, &count), 3);
}

#[test]
fn test_sorted_placement_respects_loaded_window() {
    let mut replica = Replica::new();
    let def = ListViewDef::new("by_priority", open_filter()).sorted_by(SortSpec::ascending("priority"));
    let list = replica.views_mut().register_list(def);

    for (id, priority) in [(1, 10_i64), (2, 20), (3, 30)] {
        let _effects = replica.load(ticket(id, "open").with("priority", priority));
    }
    let _changed = replica
        .views_mut()
        .apply_structural(
            &list,
            StructuralOp::AppendPage {
                ids: ids(&[1, 2, 3]),
                next_cursor: Some("more".to_owned()),
            },
        )
        .expect("registered");

    let _effects = replica.put(ticket(4, "open").with("priority", 15_i64));
    assert_eq!(list_ids(&replica, &list), vec![1, 4, 2, 3], "sorted position");

    let _effects = replica.put(ticket(5, "open").with("priority", 99_i64));
    assert_eq!(
        list_ids(&replica, &list),
        vec![1, 4, 2, 3],
        "belongs to an unloaded page"
    );
}

#[test]
fn test_lower_version_update_changes_nothing() {
    let mut replica = Replica::new();
    let count = replica.views_mut().register_scalar(ScalarViewDef::count(
        "pending",
        "all",
        Filter::new(EntityKind::Ticket).eq("status", "pending"),
    ));
    replica.views_mut().set_scalar(&count, 0);

    let _effects = replica.put(Entity::new(EntityRef::ticket(7)).with_versioned("status", "pending", 3));
    let effects = replica.put(Entity::new(EntityRef::ticket(7)).with_versioned("status", "open", 2));

    assert_eq!(effects, Default::default(), "stale update is a no-op");
    assert_eq!(scalar(&replica, &count), 1);
    let stored = replica.store().get(&EntityRef::ticket(7)).expect("resident");
    assert_eq!(stored.version(), Some(3));
}

// ============================================================
// Presence capture and restore
// ============================================================

#[test]
fn test_presence_restores_after_neighbours_moved() {
    let (mut replica, list, _) = seeded(4);
    let entity = EntityRef::ticket(3);

    let captured = replica.views().list_presence(&entity);
    assert_eq!(
        captured,
        vec![(
            list.clone(),
            Presence::At {
                index: 2,
                after: Some(EntityId::new(2))
            }
        )]
    );

    let _effects = replica.put(ticket(3, "closed"));
    let _effects = replica.put(ticket(8, "open"));
    assert_eq!(list_ids(&replica, &list), vec![8, 1, 2, 4]);

    for (key, presence) in &captured {
        let _restored = replica
            .views_mut()
            .restore_presence(key, entity.id, presence);
    }
    assert_eq!(list_ids(&replica, &list), vec![8, 1, 2, 3, 4], "anchored after #2");
}

// ============================================================
// Subscriptions
// ============================================================

#[tokio::test]
async fn test_subscription_sees_one_snapshot_per_flush() {
    let (mut replica, list, count) = seeded(3);
    let (store, views) = replica.parts_mut();
    let mut sub = views.subscribe(&count, store).expect("registered");
    assert_eq!(
        sub.current().as_scalar().map(|scalar| scalar.value),
        Some(3)
    );

    let _effects = replica.put(ticket(1, "closed"));
    let _effects = replica.put(ticket(2, "closed"));
    assert!(!sub.has_changed(), "nothing published before flush");

    replica.flush();
    let snapshot = sub.changed().await.expect("open");
    assert_eq!(snapshot.as_scalar().map(|scalar| scalar.value), Some(1));
    assert!(!sub.has_changed(), "both writes arrive as one snapshot");

    assert_eq!(replica.views().subscribed(), vec![count.clone()]);
    drop(sub);
    assert!(replica.views().subscribed().is_empty(), "dropping unsubscribes");
    assert!(!replica.views().is_subscribed(&list), "never subscribed");
}

#[test]
fn test_detail_view_created_on_subscribe() {
    let (mut replica, _, _) = seeded(1);
    let key = ViewKey::detail(EntityRef::ticket(1));

    let (store, views) = replica.parts_mut();
    let sub = views.subscribe(&key, store).expect("details auto-register");

    let ViewSnapshot::Detail(detail) = sub.current() else {
        panic!("expected a detail snapshot");
    };
    assert_eq!(detail.entity, Some(ticket(1, "open")));
    assert_eq!(replica.views().visible_entities(), vec![EntityRef::ticket(1)]);
}

#[test]
fn test_local_recompute_counts_resident_matches() {
    let (mut replica, _, count) = seeded(3);
    replica.views_mut().adjust_scalar(&count, 10);

    let recomputed = replica
        .views()
        .recompute_scalar_local(&count, replica.store())
        .expect("registered");
    assert_eq!(recomputed, 3);
}
