use actix_web::{test, web, App};
use serde_json::json;
use std::sync::Arc;

use commons_server::api::{self, AppState};
use commons_server::auth::AuthService;
use commons_server::models::User;
use commons_server::notify::NotificationEngine;
use commons_server::store::Store;

/// Helper to create AppState with all required components
fn create_app_state(store: Arc<Store>, auth_service: Arc<AuthService>) -> AppState {
    AppState {
        store: store.clone(),
        auth_service: auth_service.clone(),
        engine: Arc::new(NotificationEngine::new(store)),
    }
}

/// Helper to create a test user and return their auth token
fn create_test_user_with_token(
    store: &Arc<Store>,
    auth_service: &Arc<AuthService>,
    username: &str,
) -> (User, String) {
    let password_hash = auth_service.hash_password("testpass123").unwrap();

    let mut user = User {
        id: String::new(),
        username: username.to_string(),
        email: format!("{}@test.com", username),
        password_hash,
        display_name: username.to_string(),
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    };

    store.create_user(&mut user).unwrap();
    let token = auth_service.generate_token(&user.id).unwrap();
    (user, token)
}

macro_rules! init_app {
    ($store:expr, $auth:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($store.clone()))
                .app_data(web::Data::new($auth.clone()))
                .app_data(web::Data::new(create_app_state($store.clone(), $auth.clone())))
                .configure(api::configure_routes),
        )
        .await
    };
}

macro_rules! create_conversation_via_api {
    ($app:expr, $token:expr, $other_id:expr) => {{
        let req = test::TestRequest::post()
            .uri("/api/conversations")
            .insert_header(("Authorization", format!("Bearer {}", $token)))
            .set_json(json!({ "participant_ids": [$other_id] }))
            .to_request();
        let resp: serde_json::Value = test::call_and_read_body_json(&$app, req).await;
        assert_eq!(resp["success"], true);
        resp["data"]["id"].as_str().unwrap().to_string()
    }};
}

#[actix_web::test]
async fn test_create_and_list_conversations() {
    let store = Arc::new(Store::in_memory().unwrap());
    let auth_service = Arc::new(AuthService::new("test_secret".to_string()));
    let (_alice, alice_token) = create_test_user_with_token(&store, &auth_service, "alice");
    let (bob, bob_token) = create_test_user_with_token(&store, &auth_service, "bob");
    let app = init_app!(store, auth_service);

    let conv_id = create_conversation_via_api!(app, alice_token, bob.id);

    for token in [&alice_token, &bob_token] {
        let req = test::TestRequest::get()
            .uri("/api/conversations")
            .insert_header(("Authorization", format!("Bearer {}", token)))
            .to_request();
        let resp: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        let conversations = resp["data"].as_array().unwrap();
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0]["id"], conv_id.as_str());
        assert_eq!(conversations[0]["unread"], 0);
        assert_eq!(
            conversations[0]["participant_ids"].as_array().unwrap().len(),
            2
        );
    }
}

#[actix_web::test]
async fn test_conversation_needs_another_participant() {
    let store = Arc::new(Store::in_memory().unwrap());
    let auth_service = Arc::new(AuthService::new("test_secret".to_string()));
    let (_alice, token) = create_test_user_with_token(&store, &auth_service, "alice");
    let app = init_app!(store, auth_service);

    let req = test::TestRequest::post()
        .uri("/api/conversations")
        .insert_header(("Authorization", format!("Bearer {}", token)))
        .set_json(json!({ "participant_ids": [] }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_web::test]
async fn test_unread_counts_and_mark_read() {
    let store = Arc::new(Store::in_memory().unwrap());
    let auth_service = Arc::new(AuthService::new("test_secret".to_string()));
    let (_alice, alice_token) = create_test_user_with_token(&store, &auth_service, "alice");
    let (bob, bob_token) = create_test_user_with_token(&store, &auth_service, "bob");
    let app = init_app!(store, auth_service);

    let conv_id = create_conversation_via_api!(app, alice_token, bob.id);

    for body in ["hey", "you around?"] {
        let req = test::TestRequest::post()
            .uri(&format!("/api/conversations/{}/messages", conv_id))
            .insert_header(("Authorization", format!("Bearer {}", bob_token)))
            .set_json(json!({ "body": body }))
            .to_request();
        let resp: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp["success"], true);
    }

    let req = test::TestRequest::get()
        .uri(&format!("/api/conversations/{}/unread-count", conv_id))
        .insert_header(("Authorization", format!("Bearer {}", alice_token)))
        .to_request();
    let resp: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp["data"]["count"], 2);

    let req = test::TestRequest::get()
        .uri("/api/messages/unread-count")
        .insert_header(("Authorization", format!("Bearer {}", alice_token)))
        .to_request();
    let resp: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp["data"]["count"], 2);

    // the sender has nothing unread
    let req = test::TestRequest::get()
        .uri(&format!("/api/conversations/{}/unread-count", conv_id))
        .insert_header(("Authorization", format!("Bearer {}", bob_token)))
        .to_request();
    let resp: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp["data"]["count"], 0);

    let req = test::TestRequest::post()
        .uri(&format!("/api/conversations/{}/read", conv_id))
        .insert_header(("Authorization", format!("Bearer {}", alice_token)))
        .to_request();
    let resp: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp["success"], true);

    let req = test::TestRequest::get()
        .uri(&format!("/api/conversations/{}/unread-count", conv_id))
        .insert_header(("Authorization", format!("Bearer {}", alice_token)))
        .to_request();
    let resp: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp["data"]["count"], 0);

    // marking read twice stays at zero
    let req = test::TestRequest::post()
        .uri(&format!("/api/conversations/{}/read", conv_id))
        .insert_header(("Authorization", format!("Bearer {}", alice_token)))
        .to_request();
    test::call_service(&app, req).await;
    let req = test::TestRequest::get()
        .uri("/api/messages/unread-count")
        .insert_header(("Authorization", format!("Bearer {}", alice_token)))
        .to_request();
    let resp: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp["data"]["count"], 0);
}

#[actix_web::test]
async fn test_messages_generate_notifications_for_recipients_only() {
    let store = Arc::new(Store::in_memory().unwrap());
    let auth_service = Arc::new(AuthService::new("test_secret".to_string()));
    let (_alice, alice_token) = create_test_user_with_token(&store, &auth_service, "alice");
    let (bob, bob_token) = create_test_user_with_token(&store, &auth_service, "bob");
    let app = init_app!(store, auth_service);

    let conv_id = create_conversation_via_api!(app, alice_token, bob.id);

    for body in ["hello", "anyone home?"] {
        let req = test::TestRequest::post()
            .uri(&format!("/api/conversations/{}/messages", conv_id))
            .insert_header(("Authorization", format!("Bearer {}", bob_token)))
            .set_json(json!({ "body": body }))
            .to_request();
        test::call_service(&app, req).await;
    }

    // each message is its own notification (never grouped)
    let req = test::TestRequest::get()
        .uri("/api/notifications?kind=message_received")
        .insert_header(("Authorization", format!("Bearer {}", alice_token)))
        .to_request();
    let resp: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp["data"]["total"], 2);
    let notifications = resp["data"]["notifications"].as_array().unwrap();
    assert!(notifications
        .iter()
        .all(|n| n["actor_id"] == bob.id.as_str() && n["actor_count"] == 1));

    // the sender gets none
    let req = test::TestRequest::get()
        .uri("/api/notifications")
        .insert_header(("Authorization", format!("Bearer {}", bob_token)))
        .to_request();
    let resp: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp["data"]["total"], 0);
}

#[actix_web::test]
async fn test_direct_message_preference_gates_notification_not_message() {
    let store = Arc::new(Store::in_memory().unwrap());
    let auth_service = Arc::new(AuthService::new("test_secret".to_string()));
    let (_alice, alice_token) = create_test_user_with_token(&store, &auth_service, "alice");
    let (bob, bob_token) = create_test_user_with_token(&store, &auth_service, "bob");
    let app = init_app!(store, auth_service);

    let req = test::TestRequest::put()
        .uri("/api/notifications/preferences")
        .insert_header(("Authorization", format!("Bearer {}", alice_token)))
        .set_json(json!({ "direct_messages": false }))
        .to_request();
    test::call_service(&app, req).await;

    let conv_id = create_conversation_via_api!(app, alice_token, bob.id);
    let req = test::TestRequest::post()
        .uri(&format!("/api/conversations/{}/messages", conv_id))
        .insert_header(("Authorization", format!("Bearer {}", bob_token)))
        .set_json(json!({ "body": "psst" }))
        .to_request();
    test::call_service(&app, req).await;

    // the message is there and counts as unread
    let req = test::TestRequest::get()
        .uri(&format!("/api/conversations/{}/messages", conv_id))
        .insert_header(("Authorization", format!("Bearer {}", alice_token)))
        .to_request();
    let resp: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp["data"]["total"], 1);
    let req = test::TestRequest::get()
        .uri(&format!("/api/conversations/{}/unread-count", conv_id))
        .insert_header(("Authorization", format!("Bearer {}", alice_token)))
        .to_request();
    let resp: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp["data"]["count"], 1);

    // but no notification row was written
    let req = test::TestRequest::get()
        .uri("/api/notifications")
        .insert_header(("Authorization", format!("Bearer {}", alice_token)))
        .to_request();
    let resp: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp["data"]["total"], 0);
}

#[actix_web::test]
async fn test_non_participants_are_locked_out() {
    let store = Arc::new(Store::in_memory().unwrap());
    let auth_service = Arc::new(AuthService::new("test_secret".to_string()));
    let (_alice, alice_token) = create_test_user_with_token(&store, &auth_service, "alice");
    let (bob, _) = create_test_user_with_token(&store, &auth_service, "bob");
    let (_carol, carol_token) = create_test_user_with_token(&store, &auth_service, "carol");
    let app = init_app!(store, auth_service);

    let conv_id = create_conversation_via_api!(app, alice_token, bob.id);

    let req = test::TestRequest::get()
        .uri(&format!("/api/conversations/{}/messages", conv_id))
        .insert_header(("Authorization", format!("Bearer {}", carol_token)))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);

    let req = test::TestRequest::post()
        .uri(&format!("/api/conversations/{}/messages", conv_id))
        .insert_header(("Authorization", format!("Bearer {}", carol_token)))
        .set_json(json!({ "body": "let me in" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);

    let req = test::TestRequest::get()
        .uri(&format!("/api/conversations/{}/unread-count", conv_id))
        .insert_header(("Authorization", format!("Bearer {}", carol_token)))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);

    let req = test::TestRequest::post()
        .uri(&format!("/api/conversations/{}/read", conv_id))
        .insert_header(("Authorization", format!("Bearer {}", carol_token)))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}
