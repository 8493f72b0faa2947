//! Domain events consumed by the notification pipeline.
//!
//! Events are ephemeral triggers: the upstream application (resource
//! service, community service, messaging) emits one whenever something
//! notification-worthy happens, addressed to explicit recipients. They
//! are NOT stored — the aggregation engine turns them into notification
//! rows and discards them.
//!
//! Flow: DomainEvent -> preference gate -> grouped upsert -> store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{NewNotification, NotificationKind};

#[derive(Error, Debug)]
pub enum EventError {
    #[error("event kind {kind} requires {field}")]
    MissingTarget {
        kind: &'static str,
        field: &'static str,
    },
    #[error("event has no recipients")]
    NoRecipients,
}

/// A notification-worthy occurrence, already resolved to its recipients
/// and deduplicated upstream. Delivery to the engine is at-least-once:
/// re-ingesting an identical event is safe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: String,
    pub kind: NotificationKind,
    pub actor_id: String,
    pub recipient_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shoutout_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub community_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl DomainEvent {
    pub fn new(kind: NotificationKind, actor_id: &str) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            kind,
            actor_id: actor_id.to_string(),
            recipient_ids: Vec::new(),
            resource_id: None,
            claim_id: None,
            comment_id: None,
            shoutout_id: None,
            community_id: None,
            conversation_id: None,
            message_id: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_recipients(mut self, recipient_ids: Vec<String>) -> Self {
        self.recipient_ids = recipient_ids;
        self
    }

    pub fn with_recipient(mut self, recipient_id: &str) -> Self {
        self.recipient_ids.push(recipient_id.to_string());
        self
    }

    /// Reject events missing the targets their kind requires.
    pub fn validate(&self) -> Result<(), EventError> {
        if self.recipient_ids.is_empty() {
            return Err(EventError::NoRecipients);
        }
        let require = |field: Option<&String>, name: &'static str| {
            if field.is_none() {
                Err(EventError::MissingTarget {
                    kind: self.kind.as_str(),
                    field: name,
                })
            } else {
                Ok(())
            }
        };
        match self.kind {
            NotificationKind::Comment => {
                require(self.resource_id.as_ref(), "resource_id")?;
                require(self.comment_id.as_ref(), "comment_id")
            }
            NotificationKind::ClaimCreated | NotificationKind::ClaimStatusChanged => {
                require(self.resource_id.as_ref(), "resource_id")?;
                require(self.claim_id.as_ref(), "claim_id")
            }
            NotificationKind::ShoutoutReceived => require(self.shoutout_id.as_ref(), "shoutout_id"),
            NotificationKind::NewResource => {
                require(self.resource_id.as_ref(), "resource_id")?;
                require(self.community_id.as_ref(), "community_id")
            }
            NotificationKind::CommunityMemberJoined | NotificationKind::CommunityMemberLeft => {
                require(self.community_id.as_ref(), "community_id")
            }
            NotificationKind::MessageReceived => {
                require(self.conversation_id.as_ref(), "conversation_id")?;
                require(self.message_id.as_ref(), "message_id")
            }
            NotificationKind::CommunityMessageReceived => {
                require(self.community_id.as_ref(), "community_id")?;
                require(self.message_id.as_ref(), "message_id")
            }
        }
    }

    /// The aggregation window this event falls into. Comments and claims
    /// merge per resource, new-resource announcements per community (the
    /// stable id, never the display name). Everything else is a single
    /// interaction and gets a per-event key.
    pub fn group_key(&self) -> String {
        let missing = || "unknown".to_string();
        match self.kind {
            NotificationKind::Comment => format!(
                "resource_comment:{}",
                self.resource_id.clone().unwrap_or_else(missing)
            ),
            NotificationKind::ClaimCreated => format!(
                "claim_created:{}",
                self.resource_id.clone().unwrap_or_else(missing)
            ),
            NotificationKind::ClaimStatusChanged => format!(
                "claim_status:{}",
                self.resource_id.clone().unwrap_or_else(missing)
            ),
            NotificationKind::NewResource => format!(
                "new_resource:{}",
                self.community_id.clone().unwrap_or_else(missing)
            ),
            _ => format!("{}:{}", self.kind.as_str(), self.event_id),
        }
    }

    /// The notification row this event seeds for one recipient.
    pub fn notification_for(&self, recipient_id: &str) -> NewNotification {
        NewNotification {
            recipient_id: recipient_id.to_string(),
            kind: self.kind,
            actor_id: self.actor_id.clone(),
            group_key: self.group_key(),
            resource_id: self.resource_id.clone(),
            claim_id: self.claim_id.clone(),
            comment_id: self.comment_id.clone(),
            shoutout_id: self.shoutout_id.clone(),
            community_id: self.community_id.clone(),
            conversation_id: self.conversation_id.clone(),
            message_id: self.message_id.clone(),
        }
    }
}

// ============================================================
// Helper functions for emitting events
// ============================================================

/// Someone commented on a resource; notify its owner (and anyone else
/// already in the thread, as resolved by the caller).
pub fn comment_created_event(
    actor_id: &str,
    recipient_ids: Vec<String>,
    resource_id: &str,
    comment_id: &str,
) -> DomainEvent {
    let mut event =
        DomainEvent::new(NotificationKind::Comment, actor_id).with_recipients(recipient_ids);
    event.resource_id = Some(resource_id.to_string());
    event.comment_id = Some(comment_id.to_string());
    event
}

/// Someone claimed a resource; notify the resource owner.
pub fn claim_created_event(
    actor_id: &str,
    owner_id: &str,
    resource_id: &str,
    claim_id: &str,
) -> DomainEvent {
    let mut event =
        DomainEvent::new(NotificationKind::ClaimCreated, actor_id).with_recipient(owner_id);
    event.resource_id = Some(resource_id.to_string());
    event.claim_id = Some(claim_id.to_string());
    event
}

/// A claim's status changed; notify the claimant.
pub fn claim_status_changed_event(
    actor_id: &str,
    claimant_id: &str,
    resource_id: &str,
    claim_id: &str,
) -> DomainEvent {
    let mut event = DomainEvent::new(NotificationKind::ClaimStatusChanged, actor_id)
        .with_recipient(claimant_id);
    event.resource_id = Some(resource_id.to_string());
    event.claim_id = Some(claim_id.to_string());
    event
}

pub fn shoutout_event(actor_id: &str, recipient_id: &str, shoutout_id: &str) -> DomainEvent {
    let mut event =
        DomainEvent::new(NotificationKind::ShoutoutReceived, actor_id).with_recipient(recipient_id);
    event.shoutout_id = Some(shoutout_id.to_string());
    event
}

/// A resource was shared into a community; notify its members.
pub fn new_resource_event(
    actor_id: &str,
    recipient_ids: Vec<String>,
    resource_id: &str,
    community_id: &str,
) -> DomainEvent {
    let mut event =
        DomainEvent::new(NotificationKind::NewResource, actor_id).with_recipients(recipient_ids);
    event.resource_id = Some(resource_id.to_string());
    event.community_id = Some(community_id.to_string());
    event
}

pub fn member_joined_event(
    actor_id: &str,
    recipient_ids: Vec<String>,
    community_id: &str,
) -> DomainEvent {
    let mut event = DomainEvent::new(NotificationKind::CommunityMemberJoined, actor_id)
        .with_recipients(recipient_ids);
    event.community_id = Some(community_id.to_string());
    event
}

pub fn member_left_event(
    actor_id: &str,
    recipient_ids: Vec<String>,
    community_id: &str,
) -> DomainEvent {
    let mut event = DomainEvent::new(NotificationKind::CommunityMemberLeft, actor_id)
        .with_recipients(recipient_ids);
    event.community_id = Some(community_id.to_string());
    event
}

pub fn message_received_event(
    sender_id: &str,
    recipient_ids: Vec<String>,
    conversation_id: &str,
    message_id: &str,
) -> DomainEvent {
    let mut event = DomainEvent::new(NotificationKind::MessageReceived, sender_id)
        .with_recipients(recipient_ids);
    event.conversation_id = Some(conversation_id.to_string());
    event.message_id = Some(message_id.to_string());
    event
}

pub fn community_message_event(
    sender_id: &str,
    recipient_ids: Vec<String>,
    community_id: &str,
    message_id: &str,
) -> DomainEvent {
    let mut event = DomainEvent::new(NotificationKind::CommunityMessageReceived, sender_id)
        .with_recipients(recipient_ids);
    event.community_id = Some(community_id.to_string());
    event.message_id = Some(message_id.to_string());
    event
}
