use actix_web::{web, HttpResponse, Responder};
use chrono::Utc;
use log::error;
use serde::Deserialize;
use std::sync::Arc;

use crate::auth::{AuthService, AuthUser};
use crate::events::{self, DomainEvent};
use crate::models::*;
use crate::notify::{IngestError, NotificationEngine};
use crate::store::{Store, StoreError};

pub struct AppState {
    pub store: Arc<Store>,
    pub auth_service: Arc<AuthService>,
    pub engine: Arc<NotificationEngine>,
}

// ==================== Health Check ====================

pub async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339()
    }))
}

// ==================== Auth Endpoints ====================

pub async fn register(
    state: web::Data<AppState>,
    body: web::Json<RegisterRequest>,
) -> impl Responder {
    let password_hash = match state.auth_service.hash_password(&body.password) {
        Ok(hash) => hash,
        Err(_) => {
            return HttpResponse::InternalServerError()
                .json(ApiResponse::<()>::error("Failed to hash password"))
        }
    };

    let mut user = User {
        id: String::new(),
        username: body.username.clone(),
        email: body.email.clone(),
        password_hash,
        display_name: body
            .display_name
            .clone()
            .unwrap_or_else(|| body.username.clone()),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };

    if let Err(e) = state.store.create_user(&mut user) {
        return HttpResponse::BadRequest()
            .json(ApiResponse::<()>::error(format!("Failed to create user: {}", e)));
    }

    let token = match state.auth_service.generate_token(&user.id) {
        Ok(t) => t,
        Err(_) => {
            return HttpResponse::InternalServerError()
                .json(ApiResponse::<()>::error("Failed to generate token"))
        }
    };

    HttpResponse::Created().json(ApiResponse::success(LoginResponse { token, user }))
}

pub async fn login(state: web::Data<AppState>, body: web::Json<LoginRequest>) -> impl Responder {
    let user = match state.store.get_user_by_username(&body.username) {
        Ok(u) => u,
        Err(StoreError::NotFound(_)) => {
            return HttpResponse::Unauthorized()
                .json(ApiResponse::<()>::error("Invalid credentials"));
        }
        Err(_) => {
            return HttpResponse::InternalServerError()
                .json(ApiResponse::<()>::error("Database error"));
        }
    };

    let valid = state
        .auth_service
        .verify_password(&body.password, &user.password_hash)
        .unwrap_or(false);

    if !valid {
        return HttpResponse::Unauthorized().json(ApiResponse::<()>::error("Invalid credentials"));
    }

    let token = match state.auth_service.generate_token(&user.id) {
        Ok(t) => t,
        Err(_) => {
            return HttpResponse::InternalServerError()
                .json(ApiResponse::<()>::error("Failed to generate token"))
        }
    };

    HttpResponse::Ok().json(ApiResponse::success(LoginResponse { token, user }))
}

pub async fn get_current_user(state: web::Data<AppState>, auth_user: AuthUser) -> impl Responder {
    match state.store.get_user(&auth_user.user_id) {
        Ok(user) => HttpResponse::Ok().json(ApiResponse::success(user)),
        Err(_) => HttpResponse::NotFound().json(ApiResponse::<()>::error("User not found")),
    }
}

// ==================== Notification Endpoints ====================

#[derive(Deserialize)]
pub struct ListNotificationsQuery {
    kind: Option<String>,
    is_read: Option<bool>,
    limit: Option<i64>,
    offset: Option<i64>,
}

pub async fn list_notifications(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    query: web::Query<ListNotificationsQuery>,
) -> impl Responder {
    let kind = match query.kind.as_deref() {
        None => None,
        Some(raw) => match NotificationKind::from_str(raw) {
            Some(kind) => Some(kind),
            None => {
                return HttpResponse::BadRequest()
                    .json(ApiResponse::<()>::error(format!("Unknown kind: {}", raw)));
            }
        },
    };
    let limit = query.limit.unwrap_or(50).min(100);
    let offset = query.offset.unwrap_or(0);

    let notifications =
        match state
            .store
            .list_notifications(&auth_user.user_id, kind, query.is_read, limit, offset)
        {
            Ok(n) => n,
            Err(e) => {
                return HttpResponse::InternalServerError()
                    .json(ApiResponse::<()>::error(format!("Failed to list notifications: {}", e)));
            }
        };
    let total = match state
        .store
        .count_notifications(&auth_user.user_id, kind, query.is_read)
    {
        Ok(t) => t,
        Err(e) => {
            return HttpResponse::InternalServerError()
                .json(ApiResponse::<()>::error(format!("Failed to count notifications: {}", e)));
        }
    };
    let unread = match state.store.unread_notification_count(&auth_user.user_id) {
        Ok(u) => u,
        Err(e) => {
            return HttpResponse::InternalServerError()
                .json(ApiResponse::<()>::error(format!("Failed to count unread: {}", e)));
        }
    };

    HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({
        "notifications": notifications,
        "total": total,
        "unread": unread,
    })))
}

pub async fn notification_unread_count(
    state: web::Data<AppState>,
    auth_user: AuthUser,
) -> impl Responder {
    match state.store.unread_notification_count(&auth_user.user_id) {
        Ok(count) => {
            HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({ "count": count })))
        }
        Err(e) => HttpResponse::InternalServerError()
            .json(ApiResponse::<()>::error(format!("Failed to count unread: {}", e))),
    }
}

pub async fn mark_notification_read(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    path: web::Path<String>,
) -> impl Responder {
    match state
        .store
        .mark_notification_read(&auth_user.user_id, &path.into_inner())
    {
        Ok(notification) => HttpResponse::Ok().json(ApiResponse::success(notification)),
        Err(StoreError::NotFound(_)) => {
            HttpResponse::NotFound().json(ApiResponse::<()>::error("Notification not found"))
        }
        Err(e) => HttpResponse::InternalServerError()
            .json(ApiResponse::<()>::error(format!("Failed to mark read: {}", e))),
    }
}

pub async fn mark_all_notifications_read(
    state: web::Data<AppState>,
    auth_user: AuthUser,
) -> impl Responder {
    match state.store.mark_all_notifications_read(&auth_user.user_id) {
        Ok(updated) => {
            HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({ "updated": updated })))
        }
        Err(e) => HttpResponse::InternalServerError()
            .json(ApiResponse::<()>::error(format!("Failed to mark all read: {}", e))),
    }
}

// ==================== Preference Endpoints ====================

pub async fn get_preferences(state: web::Data<AppState>, auth_user: AuthUser) -> impl Responder {
    match state.store.get_preferences(&auth_user.user_id) {
        Ok(prefs) => HttpResponse::Ok().json(ApiResponse::success(prefs)),
        Err(StoreError::NotFound(_)) => {
            HttpResponse::NotFound().json(ApiResponse::<()>::error("Preferences not found"))
        }
        Err(e) => HttpResponse::InternalServerError()
            .json(ApiResponse::<()>::error(format!("Failed to load preferences: {}", e))),
    }
}

pub async fn update_preferences(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    body: web::Json<UpdatePreferencesRequest>,
) -> impl Responder {
    match state.store.update_preferences(&auth_user.user_id, &body) {
        Ok(prefs) => HttpResponse::Ok().json(ApiResponse::success(prefs)),
        Err(StoreError::NotFound(_)) => {
            HttpResponse::NotFound().json(ApiResponse::<()>::error("Preferences not found"))
        }
        Err(e) => HttpResponse::InternalServerError()
            .json(ApiResponse::<()>::error(format!("Failed to update preferences: {}", e))),
    }
}

// ==================== Event Ingestion ====================

/// Inbound endpoint for the trusted event source. The engine applies the
/// self-action and preference gates per recipient and aggregates into
/// open notification rows.
pub async fn ingest_event(
    state: web::Data<AppState>,
    body: web::Json<DomainEvent>,
) -> impl Responder {
    match state.engine.ingest(&body) {
        Ok(outcomes) => {
            let delivered = outcomes.iter().filter(|o| o.delivered().is_some()).count();
            let suppressed = outcomes.len() - delivered;
            HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({
                "delivered": delivered,
                "suppressed": suppressed,
            })))
        }
        Err(IngestError::Event(e)) => {
            HttpResponse::BadRequest().json(ApiResponse::<()>::error(e.to_string()))
        }
        Err(IngestError::Store(e)) => HttpResponse::InternalServerError()
            .json(ApiResponse::<()>::error(format!("Failed to ingest event: {}", e))),
    }
}

// ==================== Conversation Endpoints ====================

pub async fn create_conversation(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    body: web::Json<CreateConversationRequest>,
) -> impl Responder {
    let mut participants = body.participant_ids.clone();
    if !participants.contains(&auth_user.user_id) {
        participants.push(auth_user.user_id.clone());
    }
    if participants.len() < 2 {
        return HttpResponse::BadRequest()
            .json(ApiResponse::<()>::error("A conversation needs at least two participants"));
    }
    match state.store.create_conversation(&participants) {
        Ok(conversation) => HttpResponse::Created().json(ApiResponse::success(conversation)),
        Err(e) => HttpResponse::InternalServerError()
            .json(ApiResponse::<()>::error(format!("Failed to create conversation: {}", e))),
    }
}

pub async fn list_conversations(state: web::Data<AppState>, auth_user: AuthUser) -> impl Responder {
    let conversations = match state.store.list_conversations(&auth_user.user_id) {
        Ok(c) => c,
        Err(e) => {
            return HttpResponse::InternalServerError()
                .json(ApiResponse::<()>::error(format!("Failed to list conversations: {}", e)));
        }
    };
    let mut summaries = Vec::with_capacity(conversations.len());
    for conversation in conversations {
        let unread = match state
            .store
            .unread_message_count(&auth_user.user_id, &conversation.id)
        {
            Ok(u) => u,
            Err(e) => {
                return HttpResponse::InternalServerError()
                    .json(ApiResponse::<()>::error(format!("Failed to count unread: {}", e)));
            }
        };
        summaries.push(ConversationSummary {
            conversation,
            unread,
        });
    }
    HttpResponse::Ok().json(ApiResponse::success(summaries))
}

#[derive(Deserialize)]
pub struct ListMessagesQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

pub async fn list_messages(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    path: web::Path<String>,
    query: web::Query<ListMessagesQuery>,
) -> impl Responder {
    let conversation_id = path.into_inner();
    match state.store.is_participant(&conversation_id, &auth_user.user_id) {
        Ok(true) => {}
        Ok(false) => {
            return HttpResponse::Forbidden()
                .json(ApiResponse::<()>::error("Not a participant of this conversation"));
        }
        Err(e) => {
            return HttpResponse::InternalServerError()
                .json(ApiResponse::<()>::error(format!("Database error: {}", e)));
        }
    }
    let limit = query.limit.unwrap_or(50).min(100);
    let offset = query.offset.unwrap_or(0);
    let items = match state.store.list_messages(&conversation_id, limit, offset) {
        Ok(m) => m,
        Err(e) => {
            return HttpResponse::InternalServerError()
                .json(ApiResponse::<()>::error(format!("Failed to list messages: {}", e)));
        }
    };
    let total = match state.store.count_messages(&conversation_id) {
        Ok(t) => t,
        Err(e) => {
            return HttpResponse::InternalServerError()
                .json(ApiResponse::<()>::error(format!("Failed to count messages: {}", e)));
        }
    };
    HttpResponse::Ok().json(ApiResponse::success(PaginatedResponse {
        items,
        total,
        limit,
        offset,
    }))
}

pub async fn send_message(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    path: web::Path<String>,
    body: web::Json<SendMessageRequest>,
) -> impl Responder {
    let conversation_id = path.into_inner();
    let conversation = match state.store.get_conversation(&conversation_id) {
        Ok(c) => c,
        Err(StoreError::NotFound(_)) => {
            return HttpResponse::NotFound()
                .json(ApiResponse::<()>::error("Conversation not found"));
        }
        Err(e) => {
            return HttpResponse::InternalServerError()
                .json(ApiResponse::<()>::error(format!("Database error: {}", e)));
        }
    };
    if !conversation
        .participant_ids
        .iter()
        .any(|p| p == &auth_user.user_id)
    {
        return HttpResponse::Forbidden()
            .json(ApiResponse::<()>::error("Not a participant of this conversation"));
    }

    let mut message = Message {
        id: String::new(),
        conversation_id: conversation_id.clone(),
        sender_id: auth_user.user_id.clone(),
        body: body.body.clone(),
        created_at: Utc::now(),
    };
    if let Err(e) = state.store.create_message(&mut message) {
        return HttpResponse::InternalServerError()
            .json(ApiResponse::<()>::error(format!("Failed to send message: {}", e)));
    }

    // The message is durable at this point; a notification failure is
    // logged rather than failing the send.
    let recipients: Vec<String> = conversation
        .participant_ids
        .iter()
        .filter(|p| *p != &auth_user.user_id)
        .cloned()
        .collect();
    let event = events::message_received_event(
        &auth_user.user_id,
        recipients,
        &conversation_id,
        &message.id,
    );
    if let Err(e) = state.engine.ingest(&event) {
        error!("failed to ingest message notification: {}", e);
    }

    HttpResponse::Created().json(ApiResponse::success(message))
}

pub async fn mark_conversation_read(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    path: web::Path<String>,
) -> impl Responder {
    match state
        .store
        .mark_conversation_read(&auth_user.user_id, &path.into_inner())
    {
        Ok(()) => HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({}))),
        Err(StoreError::NotFound(_)) => {
            HttpResponse::NotFound().json(ApiResponse::<()>::error("Conversation not found"))
        }
        Err(e) => HttpResponse::InternalServerError()
            .json(ApiResponse::<()>::error(format!("Failed to mark read: {}", e))),
    }
}

pub async fn conversation_unread_count(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    path: web::Path<String>,
) -> impl Responder {
    let conversation_id = path.into_inner();
    match state.store.is_participant(&conversation_id, &auth_user.user_id) {
        Ok(true) => {}
        Ok(false) => {
            return HttpResponse::Forbidden()
                .json(ApiResponse::<()>::error("Not a participant of this conversation"));
        }
        Err(e) => {
            return HttpResponse::InternalServerError()
                .json(ApiResponse::<()>::error(format!("Database error: {}", e)));
        }
    }
    match state
        .store
        .unread_message_count(&auth_user.user_id, &conversation_id)
    {
        Ok(count) => {
            HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({ "count": count })))
        }
        Err(e) => HttpResponse::InternalServerError()
            .json(ApiResponse::<()>::error(format!("Failed to count unread: {}", e))),
    }
}

pub async fn total_message_unread_count(
    state: web::Data<AppState>,
    auth_user: AuthUser,
) -> impl Responder {
    match state.store.total_unread_message_count(&auth_user.user_id) {
        Ok(count) => {
            HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({ "count": count })))
        }
        Err(e) => HttpResponse::InternalServerError()
            .json(ApiResponse::<()>::error(format!("Failed to count unread: {}", e))),
    }
}

// ==================== Routes ====================

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg
        // Health check
        .route("/health", web::get().to(health))
        // Auth routes (no auth required)
        .route("/api/auth/register", web::post().to(register))
        .route("/api/auth/login", web::post().to(login))
        .route("/api/auth/me", web::get().to(get_current_user))
        // Notifications
        .route("/api/notifications", web::get().to(list_notifications))
        .route(
            "/api/notifications/unread-count",
            web::get().to(notification_unread_count),
        )
        .route(
            "/api/notifications/read-all",
            web::post().to(mark_all_notifications_read),
        )
        .route(
            "/api/notifications/preferences",
            web::get().to(get_preferences),
        )
        .route(
            "/api/notifications/preferences",
            web::put().to(update_preferences),
        )
        .route(
            "/api/notifications/{id}/read",
            web::post().to(mark_notification_read),
        )
        // Event ingestion (trusted event source)
        .route("/api/events/inbound", web::post().to(ingest_event))
        // Conversations and messages
        .route("/api/conversations", web::post().to(create_conversation))
        .route("/api/conversations", web::get().to(list_conversations))
        .route(
            "/api/conversations/{id}/messages",
            web::get().to(list_messages),
        )
        .route(
            "/api/conversations/{id}/messages",
            web::post().to(send_message),
        )
        .route(
            "/api/conversations/{id}/read",
            web::post().to(mark_conversation_read),
        )
        .route(
            "/api/conversations/{id}/unread-count",
            web::get().to(conversation_unread_count),
        )
        .route(
            "/api/messages/unread-count",
            web::get().to(total_message_unread_count),
        );
}
