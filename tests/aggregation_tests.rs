use chrono::Utc;
use std::sync::Arc;

use commons_server::events::{
    claim_created_event, comment_created_event, community_message_event, member_joined_event,
    member_left_event, message_received_event, new_resource_event, shoutout_event,
};
use commons_server::models::{NotificationKind, UpdatePreferencesRequest, User};
use commons_server::notify::{IngestOutcome, NotificationEngine, SuppressReason};
use commons_server::store::Store;

/// Helper to create a test user (with default preferences)
fn create_test_user(store: &Arc<Store>, username: &str) -> String {
    let mut user = User {
        id: String::new(),
        username: username.to_string(),
        email: format!("{}@test.com", username),
        password_hash: "hash".to_string(),
        display_name: username.to_string(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    store.create_user(&mut user).unwrap();
    user.id
}

fn setup() -> (Arc<Store>, NotificationEngine) {
    let store = Arc::new(Store::in_memory().unwrap());
    let engine = NotificationEngine::new(store.clone());
    (store, engine)
}

// ==================== Grouping ====================

#[test]
fn test_three_actors_aggregate_into_one_row() {
    let (store, engine) = setup();
    let alice = create_test_user(&store, "alice");

    for actor in ["bob", "carol", "dave"] {
        let comment_id = format!("c_{}", actor);
        let event = comment_created_event(actor, vec![alice.clone()], "res_1", &comment_id);
        engine.ingest(&event).unwrap();
    }

    let notifications = store
        .list_notifications(&alice, None, None, 50, 0)
        .unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].actor_count, 3);
    assert_eq!(notifications[0].actor_id, "dave");
    assert_eq!(notifications[0].group_key, "resource_comment:res_1");
    assert!(!notifications[0].is_read);
}

#[test]
fn test_group_window_resets_after_read() {
    let (store, engine) = setup();
    let alice = create_test_user(&store, "alice");

    for actor in ["bob", "carol", "dave"] {
        let event = comment_created_event(actor, vec![alice.clone()], "res_1", "c_x");
        engine.ingest(&event).unwrap();
    }
    let open = store
        .find_open_by_group_key(&alice, "resource_comment:res_1")
        .unwrap()
        .unwrap();
    store.mark_notification_read(&alice, &open.id).unwrap();

    // a fourth comment starts a fresh row instead of touching the old one
    let event = comment_created_event("eve", vec![alice.clone()], "res_1", "c_eve");
    engine.ingest(&event).unwrap();

    let notifications = store
        .list_notifications(&alice, None, None, 50, 0)
        .unwrap();
    assert_eq!(notifications.len(), 2);

    let fresh = store
        .find_open_by_group_key(&alice, "resource_comment:res_1")
        .unwrap()
        .unwrap();
    assert_ne!(fresh.id, open.id);
    assert_eq!(fresh.actor_count, 1);
    assert_eq!(fresh.actor_id, "eve");

    let closed = store.get_notification(&alice, &open.id).unwrap();
    assert!(closed.is_read);
    assert_eq!(closed.actor_count, 3);
}

#[test]
fn test_same_actor_repeating_does_not_double_count() {
    let (store, engine) = setup();
    let alice = create_test_user(&store, "alice");

    let first = comment_created_event("bob", vec![alice.clone()], "res_1", "c_1");
    let second = comment_created_event("bob", vec![alice.clone()], "res_1", "c_2");
    engine.ingest(&first).unwrap();
    engine.ingest(&second).unwrap();

    let open = store
        .find_open_by_group_key(&alice, "resource_comment:res_1")
        .unwrap()
        .unwrap();
    assert_eq!(open.actor_count, 1);
    assert_eq!(open.actor_id, "bob");
}

#[test]
fn test_reingesting_identical_event_is_safe() {
    // the event source delivers at-least-once
    let (store, engine) = setup();
    let alice = create_test_user(&store, "alice");

    let event = comment_created_event("bob", vec![alice.clone()], "res_1", "c_1");
    engine.ingest(&event).unwrap();
    engine.ingest(&event).unwrap();

    let notifications = store
        .list_notifications(&alice, None, None, 50, 0)
        .unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].actor_count, 1);
    assert_eq!(store.unread_notification_count(&alice).unwrap(), 1);
}

#[test]
fn test_claims_group_by_resource() {
    let (store, engine) = setup();
    let alice = create_test_user(&store, "alice");

    engine
        .ingest(&claim_created_event("bob", &alice, "res_1", "claim_1"))
        .unwrap();
    engine
        .ingest(&claim_created_event("carol", &alice, "res_1", "claim_2"))
        .unwrap();

    let open = store
        .find_open_by_group_key(&alice, "claim_created:res_1")
        .unwrap()
        .unwrap();
    assert_eq!(open.actor_count, 2);
    assert_eq!(open.kind, NotificationKind::ClaimCreated);
}

#[test]
fn test_new_resource_groups_per_community() {
    let (store, engine) = setup();
    let alice = create_test_user(&store, "alice");

    engine
        .ingest(&new_resource_event(
            "bob",
            vec![alice.clone()],
            "res_1",
            "comm_1",
        ))
        .unwrap();
    engine
        .ingest(&new_resource_event(
            "carol",
            vec![alice.clone()],
            "res_2",
            "comm_1",
        ))
        .unwrap();
    engine
        .ingest(&new_resource_event(
            "bob",
            vec![alice.clone()],
            "res_3",
            "comm_2",
        ))
        .unwrap();

    let notifications = store
        .list_notifications(&alice, None, None, 50, 0)
        .unwrap();
    assert_eq!(notifications.len(), 2);
    let comm_1 = store
        .find_open_by_group_key(&alice, "new_resource:comm_1")
        .unwrap()
        .unwrap();
    assert_eq!(comm_1.actor_count, 2);
}

#[test]
fn test_shoutouts_are_one_row_per_event() {
    let (store, engine) = setup();
    let alice = create_test_user(&store, "alice");

    engine.ingest(&shoutout_event("bob", &alice, "s_1")).unwrap();
    engine.ingest(&shoutout_event("bob", &alice, "s_2")).unwrap();

    let notifications = store
        .list_notifications(&alice, None, None, 50, 0)
        .unwrap();
    assert_eq!(notifications.len(), 2);
    assert!(notifications.iter().all(|n| n.actor_count == 1));
}

// ==================== Suppression ====================

#[test]
fn test_self_action_never_notifies_for_any_kind() {
    let (store, engine) = setup();
    let alice = create_test_user(&store, "alice");

    let events = vec![
        comment_created_event(&alice, vec![alice.clone()], "res_1", "c_1"),
        claim_created_event(&alice, &alice, "res_1", "claim_1"),
        shoutout_event(&alice, &alice, "s_1"),
        new_resource_event(&alice, vec![alice.clone()], "res_1", "comm_1"),
        member_joined_event(&alice, vec![alice.clone()], "comm_1"),
        member_left_event(&alice, vec![alice.clone()], "comm_1"),
        message_received_event(&alice, vec![alice.clone()], "conv_1", "m_1"),
        community_message_event(&alice, vec![alice.clone()], "comm_1", "m_1"),
    ];

    for event in events {
        let outcomes = engine.ingest(&event).unwrap();
        assert!(
            matches!(
                outcomes[0],
                IngestOutcome::Suppressed {
                    reason: SuppressReason::SelfAction,
                    ..
                }
            ),
            "kind {:?} was not suppressed",
            event.kind
        );
    }
    assert_eq!(store.unread_notification_count(&alice).unwrap(), 0);
}

#[test]
fn test_disabling_one_category_leaves_others_alone() {
    let (store, engine) = setup();
    let alice = create_test_user(&store, "alice");

    let update = UpdatePreferencesRequest {
        social_interactions: Some(false),
        ..Default::default()
    };
    store.update_preferences(&alice, &update).unwrap();

    // comment is gated by social_interactions: suppressed, no row at all
    let outcomes = engine
        .ingest(&comment_created_event(
            "bob",
            vec![alice.clone()],
            "res_1",
            "c_1",
        ))
        .unwrap();
    assert!(matches!(
        outcomes[0],
        IngestOutcome::Suppressed {
            reason: SuppressReason::PreferenceDisabled,
            ..
        }
    ));
    assert_eq!(store.unread_notification_count(&alice).unwrap(), 0);

    // a shoutout is a different category and still lands
    let outcomes = engine.ingest(&shoutout_event("bob", &alice, "s_1")).unwrap();
    assert!(outcomes[0].delivered().is_some());
    assert_eq!(store.unread_notification_count(&alice).unwrap(), 1);
}

#[test]
fn test_mixed_recipients_get_individual_outcomes() {
    let (store, engine) = setup();
    let alice = create_test_user(&store, "alice");
    let bob = create_test_user(&store, "bob");

    // bob shares a resource; alice and bob are both community members
    let event = new_resource_event(&bob, vec![alice.clone(), bob.clone()], "res_1", "comm_1");
    let outcomes = engine.ingest(&event).unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes[0].delivered().is_some());
    assert!(matches!(
        outcomes[1],
        IngestOutcome::Suppressed {
            reason: SuppressReason::SelfAction,
            ..
        }
    ));

    assert_eq!(store.unread_notification_count(&alice).unwrap(), 1);
    assert_eq!(store.unread_notification_count(&bob).unwrap(), 0);
}
