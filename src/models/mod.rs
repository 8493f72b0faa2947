use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// User represents a member of the platform. Profile data beyond what the
/// notification pipeline needs lives in the main application service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The kinds of domain events that can produce a notification.
/// Each kind maps to exactly one preference category.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Comment,
    ClaimCreated,
    ClaimStatusChanged,
    ShoutoutReceived,
    NewResource,
    CommunityMemberJoined,
    CommunityMemberLeft,
    MessageReceived,
    CommunityMessageReceived,
}

impl NotificationKind {
    pub const ALL: [NotificationKind; 9] = [
        NotificationKind::Comment,
        NotificationKind::ClaimCreated,
        NotificationKind::ClaimStatusChanged,
        NotificationKind::ShoutoutReceived,
        NotificationKind::NewResource,
        NotificationKind::CommunityMemberJoined,
        NotificationKind::CommunityMemberLeft,
        NotificationKind::MessageReceived,
        NotificationKind::CommunityMessageReceived,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Comment => "comment",
            NotificationKind::ClaimCreated => "claim_created",
            NotificationKind::ClaimStatusChanged => "claim_status_changed",
            NotificationKind::ShoutoutReceived => "shoutout_received",
            NotificationKind::NewResource => "new_resource",
            NotificationKind::CommunityMemberJoined => "community_member_joined",
            NotificationKind::CommunityMemberLeft => "community_member_left",
            NotificationKind::MessageReceived => "message_received",
            NotificationKind::CommunityMessageReceived => "community_message_received",
        }
    }

    pub fn from_str(s: &str) -> Option<NotificationKind> {
        Self::ALL.iter().copied().find(|k| k.as_str() == s)
    }

    /// The preference category governing this kind.
    pub fn category(&self) -> PreferenceCategory {
        match self {
            NotificationKind::Comment => PreferenceCategory::SocialInteractions,
            NotificationKind::ClaimCreated => PreferenceCategory::MyResources,
            NotificationKind::ClaimStatusChanged => PreferenceCategory::MyRegistrations,
            NotificationKind::ShoutoutReceived => PreferenceCategory::TrustRecognition,
            NotificationKind::NewResource => PreferenceCategory::CommunityActivity,
            NotificationKind::CommunityMemberJoined => PreferenceCategory::MyCommunities,
            NotificationKind::CommunityMemberLeft => PreferenceCategory::MyCommunities,
            NotificationKind::MessageReceived => PreferenceCategory::DirectMessages,
            NotificationKind::CommunityMessageReceived => PreferenceCategory::CommunityMessages,
        }
    }
}

/// Preference categories a user can toggle. One category gates several
/// notification kinds; one kind never spans two categories.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PreferenceCategory {
    SocialInteractions,
    MyResources,
    MyRegistrations,
    MyCommunities,
    CommunityActivity,
    TrustRecognition,
    DirectMessages,
    CommunityMessages,
}

/// Per-user notification preferences. One row per user, created with
/// defaults at registration and mutated only by its owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPreferences {
    pub user_id: String,
    pub social_interactions: bool,
    pub my_resources: bool,
    pub my_registrations: bool,
    pub my_communities: bool,
    pub community_activity: bool,
    pub trust_recognition: bool,
    pub direct_messages: bool,
    pub community_messages: bool,
    pub email_enabled: bool,
    pub push_enabled: bool,
    pub updated_at: DateTime<Utc>,
}

impl NotificationPreferences {
    /// Everything on. New accounts start here.
    pub fn defaults(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            social_interactions: true,
            my_resources: true,
            my_registrations: true,
            my_communities: true,
            community_activity: true,
            trust_recognition: true,
            direct_messages: true,
            community_messages: true,
            email_enabled: true,
            push_enabled: true,
            updated_at: Utc::now(),
        }
    }

    pub fn allows(&self, category: PreferenceCategory) -> bool {
        match category {
            PreferenceCategory::SocialInteractions => self.social_interactions,
            PreferenceCategory::MyResources => self.my_resources,
            PreferenceCategory::MyRegistrations => self.my_registrations,
            PreferenceCategory::MyCommunities => self.my_communities,
            PreferenceCategory::CommunityActivity => self.community_activity,
            PreferenceCategory::TrustRecognition => self.trust_recognition,
            PreferenceCategory::DirectMessages => self.direct_messages,
            PreferenceCategory::CommunityMessages => self.community_messages,
        }
    }
}

/// Partial preference update; absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdatePreferencesRequest {
    pub social_interactions: Option<bool>,
    pub my_resources: Option<bool>,
    pub my_registrations: Option<bool>,
    pub my_communities: Option<bool>,
    pub community_activity: Option<bool>,
    pub trust_recognition: Option<bool>,
    pub direct_messages: Option<bool>,
    pub community_messages: Option<bool>,
    pub email_enabled: Option<bool>,
    pub push_enabled: Option<bool>,
}

impl UpdatePreferencesRequest {
    pub fn apply(&self, prefs: &mut NotificationPreferences) {
        if let Some(v) = self.social_interactions {
            prefs.social_interactions = v;
        }
        if let Some(v) = self.my_resources {
            prefs.my_resources = v;
        }
        if let Some(v) = self.my_registrations {
            prefs.my_registrations = v;
        }
        if let Some(v) = self.my_communities {
            prefs.my_communities = v;
        }
        if let Some(v) = self.community_activity {
            prefs.community_activity = v;
        }
        if let Some(v) = self.trust_recognition {
            prefs.trust_recognition = v;
        }
        if let Some(v) = self.direct_messages {
            prefs.direct_messages = v;
        }
        if let Some(v) = self.community_messages {
            prefs.community_messages = v;
        }
        if let Some(v) = self.email_enabled {
            prefs.email_enabled = v;
        }
        if let Some(v) = self.push_enabled {
            prefs.push_enabled = v;
        }
    }
}

/// A delivered (or still aggregating) notification record.
///
/// While a row is unread it can absorb further events with the same group
/// key: `actor_id` tracks the most recent contributor and `actor_count`
/// the number of distinct contributors. Reading the row closes that
/// window; the next event with the same key starts a fresh row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub recipient_id: String,
    pub kind: NotificationKind,
    pub actor_id: String,
    pub actor_count: i64,
    pub group_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shoutout_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub community_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub is_read: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input to the store's grouped upsert: everything a new row needs except
/// its identity and timestamps, which the store assigns.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub recipient_id: String,
    pub kind: NotificationKind,
    pub actor_id: String,
    pub group_key: String,
    pub resource_id: Option<String>,
    pub claim_id: Option<String>,
    pub comment_id: Option<String>,
    pub shoutout_id: Option<String>,
    pub community_id: Option<String>,
    pub conversation_id: Option<String>,
    pub message_id: Option<String>,
}

/// A direct-message conversation between two or more users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub participant_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

// Request/Response types for API

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: User,
}

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    pub participant_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub body: String,
}

/// Conversation as listed for one user, with that user's unread count.
#[derive(Debug, Serialize)]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub unread: i64,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PaginatedResponse<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}
