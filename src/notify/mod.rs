//! The aggregation engine: turns domain events into notification rows.
//!
//! Per recipient the pipeline is: self-action gate, preference gate,
//! group-key derivation, then one atomic create-or-increment in the
//! store. Suppression is a value, not an error.

use std::sync::Arc;

use log::warn;
use thiserror::Error;

use crate::events::{DomainEvent, EventError};
use crate::models::{Notification, NotificationKind};
use crate::store::{Store, StoreError, StoreResult};

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Invalid event: {0}")]
    Event(#[from] EventError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    /// Users are never notified about their own actions.
    SelfAction,
    /// The recipient disabled this category; no row is written at all.
    PreferenceDisabled,
}

#[derive(Debug)]
pub enum IngestOutcome {
    Delivered(Notification),
    Suppressed {
        recipient_id: String,
        reason: SuppressReason,
    },
}

impl IngestOutcome {
    pub fn delivered(&self) -> Option<&Notification> {
        match self {
            IngestOutcome::Delivered(n) => Some(n),
            IngestOutcome::Suppressed { .. } => None,
        }
    }
}

pub struct NotificationEngine {
    store: Arc<Store>,
}

impl NotificationEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Whether an event of `kind` should produce a notification for this
    /// user. A missing preference row should not happen (registration
    /// creates one) and is treated as deny.
    pub fn should_notify(&self, user_id: &str, kind: NotificationKind) -> StoreResult<bool> {
        match self.store.get_preferences(user_id) {
            Ok(prefs) => Ok(prefs.allows(kind.category())),
            Err(StoreError::NotFound(_)) => {
                warn!(
                    "no preference row for user {}, suppressing {} notification",
                    user_id,
                    kind.as_str()
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Ingest one event, producing an outcome per recipient. Safe against
    /// at-least-once delivery: re-ingesting an identical event cannot
    /// double count an actor within an open window.
    pub fn ingest(&self, event: &DomainEvent) -> Result<Vec<IngestOutcome>, IngestError> {
        event.validate()?;
        let mut outcomes = Vec::with_capacity(event.recipient_ids.len());
        for recipient_id in &event.recipient_ids {
            outcomes.push(self.ingest_for(recipient_id, event)?);
        }
        Ok(outcomes)
    }

    fn ingest_for(
        &self,
        recipient_id: &str,
        event: &DomainEvent,
    ) -> Result<IngestOutcome, IngestError> {
        if event.actor_id == recipient_id {
            return Ok(IngestOutcome::Suppressed {
                recipient_id: recipient_id.to_string(),
                reason: SuppressReason::SelfAction,
            });
        }
        if !self.should_notify(recipient_id, event.kind)? {
            return Ok(IngestOutcome::Suppressed {
                recipient_id: recipient_id.to_string(),
                reason: SuppressReason::PreferenceDisabled,
            });
        }
        let (notification, _created) = self
            .store
            .upsert_grouped(&event.notification_for(recipient_id))?;
        Ok(IngestOutcome::Delivered(notification))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{comment_created_event, shoutout_event};
    use crate::models::{UpdatePreferencesRequest, User};
    use chrono::Utc;

    fn setup_user(store: &Store, name: &str) -> String {
        let mut user = User {
            id: String::new(),
            username: name.to_string(),
            email: format!("{}@test.com", name),
            password_hash: "hash".to_string(),
            display_name: name.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.create_user(&mut user).unwrap();
        user.id
    }

    #[test]
    fn test_self_action_is_suppressed() {
        let store = Arc::new(Store::in_memory().unwrap());
        let alice = setup_user(&store, "alice");
        let engine = NotificationEngine::new(store.clone());

        let event = comment_created_event(&alice, vec![alice.clone()], "res_1", "c_1");
        let outcomes = engine.ingest(&event).unwrap();
        assert!(matches!(
            outcomes[0],
            IngestOutcome::Suppressed {
                reason: SuppressReason::SelfAction,
                ..
            }
        ));
        assert_eq!(store.unread_notification_count(&alice).unwrap(), 0);
    }

    #[test]
    fn test_disabled_preference_suppresses_without_row() {
        let store = Arc::new(Store::in_memory().unwrap());
        let alice = setup_user(&store, "alice");
        let engine = NotificationEngine::new(store.clone());

        let update = UpdatePreferencesRequest {
            trust_recognition: Some(false),
            ..Default::default()
        };
        store.update_preferences(&alice, &update).unwrap();

        let outcomes = engine
            .ingest(&shoutout_event("bob", &alice, "s_1"))
            .unwrap();
        assert!(matches!(
            outcomes[0],
            IngestOutcome::Suppressed {
                reason: SuppressReason::PreferenceDisabled,
                ..
            }
        ));
        // other categories unaffected
        let outcomes = engine
            .ingest(&comment_created_event("bob", vec![alice.clone()], "r", "c"))
            .unwrap();
        assert!(outcomes[0].delivered().is_some());
    }

    #[test]
    fn test_missing_preferences_deny() {
        let store = Arc::new(Store::in_memory().unwrap());
        let engine = NotificationEngine::new(store.clone());
        // recipient was never registered, so no preference row exists
        let outcomes = engine
            .ingest(&shoutout_event("bob", "ghost", "s_1"))
            .unwrap();
        assert!(matches!(
            outcomes[0],
            IngestOutcome::Suppressed {
                reason: SuppressReason::PreferenceDisabled,
                ..
            }
        ));
    }
}
