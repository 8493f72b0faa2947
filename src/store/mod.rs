use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, ToSql};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::*;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Not found: {0}")]
    NotFound(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A committed row change, published on the store's broadcast bus for
/// realtime delivery. Bulk mark-all-read is a single change, not a
/// per-row fan-out.
#[derive(Debug, Clone)]
pub enum StoreChange {
    NotificationCreated(Notification),
    NotificationUpdated(Notification),
    AllNotificationsRead { recipient_id: String },
    MessageCreated {
        message: Message,
        participant_ids: Vec<String>,
    },
}

impl StoreChange {
    pub fn visible_to(&self, user_id: &str) -> bool {
        match self {
            StoreChange::NotificationCreated(n) | StoreChange::NotificationUpdated(n) => {
                n.recipient_id == user_id
            }
            StoreChange::AllNotificationsRead { recipient_id } => recipient_id == user_id,
            StoreChange::MessageCreated {
                participant_ids, ..
            } => participant_ids.iter().any(|p| p == user_id),
        }
    }
}

const CHANGE_BUS_CAPACITY: usize = 256;

/// Thread-safe SQLite store.
///
/// All mutation goes through this type; the connection mutex plus a
/// per-operation transaction is the linearization point for the grouped
/// notification upsert and the bulk mark-all-read. Changes are published
/// on the broadcast bus before the connection lock is released, so
/// receivers observe them in commit order.
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    changes: broadcast::Sender<StoreChange>,
}

impl Store {
    /// Create a new store with the given database path
    pub fn new(db_path: &str) -> StoreResult<Self> {
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn)
    }

    /// Create an in-memory store for testing
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        let (changes, _) = broadcast::channel(CHANGE_BUS_CAPACITY);
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            changes,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Subscribe to committed row changes. Slow receivers can lag and are
    /// expected to reconnect (see the realtime module).
    pub fn subscribe_changes(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT UNIQUE NOT NULL,
                email TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                display_name TEXT DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS notification_preferences (
                user_id TEXT PRIMARY KEY,
                social_interactions INTEGER NOT NULL DEFAULT 1,
                my_resources INTEGER NOT NULL DEFAULT 1,
                my_registrations INTEGER NOT NULL DEFAULT 1,
                my_communities INTEGER NOT NULL DEFAULT 1,
                community_activity INTEGER NOT NULL DEFAULT 1,
                trust_recognition INTEGER NOT NULL DEFAULT 1,
                direct_messages INTEGER NOT NULL DEFAULT 1,
                community_messages INTEGER NOT NULL DEFAULT 1,
                email_enabled INTEGER NOT NULL DEFAULT 1,
                push_enabled INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS notifications (
                id TEXT PRIMARY KEY,
                recipient_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                actor_id TEXT NOT NULL,
                actor_count INTEGER NOT NULL DEFAULT 1,
                group_key TEXT NOT NULL,
                resource_id TEXT,
                claim_id TEXT,
                comment_id TEXT,
                shoutout_id TEXT,
                community_id TEXT,
                conversation_id TEXT,
                message_id TEXT,
                is_read INTEGER NOT NULL DEFAULT 0,
                read_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (recipient_id) REFERENCES users(id)
            );

            -- at most one open row per (recipient, group key)
            CREATE UNIQUE INDEX IF NOT EXISTS idx_notifications_open_group
                ON notifications(recipient_id, group_key) WHERE is_read = 0;
            CREATE INDEX IF NOT EXISTS idx_notifications_recipient
                ON notifications(recipient_id, is_read);

            CREATE TABLE IF NOT EXISTS notification_actors (
                notification_id TEXT NOT NULL,
                actor_id TEXT NOT NULL,
                PRIMARY KEY (notification_id, actor_id),
                FOREIGN KEY (notification_id) REFERENCES notifications(id)
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS conversation_participants (
                conversation_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                PRIMARY KEY (conversation_id, user_id),
                FOREIGN KEY (conversation_id) REFERENCES conversations(id)
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id)
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id, created_at);

            CREATE TABLE IF NOT EXISTS conversation_reads (
                user_id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                last_read_at TEXT NOT NULL,
                PRIMARY KEY (user_id, conversation_id),
                FOREIGN KEY (conversation_id) REFERENCES conversations(id)
            );
            "#,
        )?;
        Ok(())
    }

    // ==================== User Operations ====================

    /// Create a user together with their default notification preference
    /// row. Every user has preferences from the moment the account exists.
    pub fn create_user(&self, user: &mut User) -> StoreResult<()> {
        if user.id.is_empty() {
            user.id = Uuid::new_v4().to_string();
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO users (id, username, email, password_hash, display_name, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                user.id,
                user.username,
                user.email,
                user.password_hash,
                user.display_name,
                fmt_ts(&user.created_at),
                fmt_ts(&user.updated_at),
            ],
        )?;
        let prefs = NotificationPreferences::defaults(&user.id);
        insert_preferences(&tx, &prefs)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_user(&self, id: &str) -> StoreResult<User> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, username, email, password_hash, display_name, created_at, updated_at
             FROM users WHERE id = ?1",
            params![id],
            row_to_user,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("user {}", id)))
    }

    pub fn get_user_by_username(&self, username: &str) -> StoreResult<User> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, username, email, password_hash, display_name, created_at, updated_at
             FROM users WHERE username = ?1",
            params![username],
            row_to_user,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("user {}", username)))
    }

    pub fn count_users(&self) -> StoreResult<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(count)
    }

    // ==================== Preference Operations ====================

    pub fn get_preferences(&self, user_id: &str) -> StoreResult<NotificationPreferences> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT user_id, social_interactions, my_resources, my_registrations, my_communities,
                    community_activity, trust_recognition, direct_messages, community_messages,
                    email_enabled, push_enabled, updated_at
             FROM notification_preferences WHERE user_id = ?1",
            params![user_id],
            row_to_preferences,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("preferences for user {}", user_id)))
    }

    /// Apply a partial update to a user's preference row and return the
    /// updated preferences.
    pub fn update_preferences(
        &self,
        user_id: &str,
        update: &UpdatePreferencesRequest,
    ) -> StoreResult<NotificationPreferences> {
        let mut prefs = self.get_preferences(user_id)?;
        update.apply(&mut prefs);
        prefs.updated_at = Utc::now();

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE notification_preferences SET
                social_interactions = ?1, my_resources = ?2, my_registrations = ?3,
                my_communities = ?4, community_activity = ?5, trust_recognition = ?6,
                direct_messages = ?7, community_messages = ?8,
                email_enabled = ?9, push_enabled = ?10, updated_at = ?11
             WHERE user_id = ?12",
            params![
                prefs.social_interactions,
                prefs.my_resources,
                prefs.my_registrations,
                prefs.my_communities,
                prefs.community_activity,
                prefs.trust_recognition,
                prefs.direct_messages,
                prefs.community_messages,
                prefs.email_enabled,
                prefs.push_enabled,
                fmt_ts(&prefs.updated_at),
                user_id,
            ],
        )?;
        Ok(prefs)
    }

    // ==================== Notification Operations ====================

    /// Atomic create-or-increment for a grouped notification.
    ///
    /// Looks for an open row with the same `(recipient, group_key)`. If
    /// one exists, the incoming actor is added to its contributor set
    /// (`INSERT OR IGNORE`, so re-ingesting the same event never double
    /// counts), `actor_count` is recomputed from that set, `actor_id`
    /// becomes the latest contributor and `updated_at` is bumped.
    /// Otherwise a fresh unread row is inserted with `actor_count = 1`.
    ///
    /// Returns the resulting row and whether it was newly created.
    pub fn upsert_grouped(&self, new: &NewNotification) -> StoreResult<(Notification, bool)> {
        let now = Utc::now();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM notifications
                 WHERE recipient_id = ?1 AND group_key = ?2 AND is_read = 0",
                params![new.recipient_id, new.group_key],
                |row| row.get(0),
            )
            .optional()?;

        let (notification, created) = match existing {
            Some(id) => {
                tx.execute(
                    "INSERT OR IGNORE INTO notification_actors (notification_id, actor_id)
                     VALUES (?1, ?2)",
                    params![id, new.actor_id],
                )?;
                let actor_count: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM notification_actors WHERE notification_id = ?1",
                    params![id],
                    |row| row.get(0),
                )?;
                tx.execute(
                    "UPDATE notifications SET actor_id = ?1, actor_count = ?2, updated_at = ?3
                     WHERE id = ?4",
                    params![new.actor_id, actor_count, fmt_ts(&now), id],
                )?;
                (query_notification(&tx, &id)?, false)
            }
            None => {
                let id = Uuid::new_v4().to_string();
                tx.execute(
                    "INSERT INTO notifications (
                        id, recipient_id, kind, actor_id, actor_count, group_key,
                        resource_id, claim_id, comment_id, shoutout_id, community_id,
                        conversation_id, message_id, is_read, read_at, created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0, NULL, ?13, ?13)",
                    params![
                        id,
                        new.recipient_id,
                        new.kind.as_str(),
                        new.actor_id,
                        new.group_key,
                        new.resource_id,
                        new.claim_id,
                        new.comment_id,
                        new.shoutout_id,
                        new.community_id,
                        new.conversation_id,
                        new.message_id,
                        fmt_ts(&now),
                    ],
                )?;
                tx.execute(
                    "INSERT INTO notification_actors (notification_id, actor_id) VALUES (?1, ?2)",
                    params![id, new.actor_id],
                )?;
                (query_notification(&tx, &id)?, true)
            }
        };

        tx.commit()?;
        // Published while the connection lock is still held: receivers see
        // changes in commit order.
        let change = if created {
            StoreChange::NotificationCreated(notification.clone())
        } else {
            StoreChange::NotificationUpdated(notification.clone())
        };
        let _ = self.changes.send(change);
        Ok((notification, created))
    }

    pub fn get_notification(&self, user_id: &str, id: &str) -> StoreResult<Notification> {
        let conn = self.conn.lock().unwrap();
        let notification = query_notification_opt(&conn, id)?
            .filter(|n| n.recipient_id == user_id)
            .ok_or_else(|| StoreError::NotFound(format!("notification {}", id)))?;
        Ok(notification)
    }

    /// The open (unread) row for a group key, if any. At most one exists.
    pub fn find_open_by_group_key(
        &self,
        user_id: &str,
        group_key: &str,
    ) -> StoreResult<Option<Notification>> {
        let conn = self.conn.lock().unwrap();
        let id: Option<String> = conn
            .query_row(
                "SELECT id FROM notifications
                 WHERE recipient_id = ?1 AND group_key = ?2 AND is_read = 0",
                params![user_id, group_key],
                |row| row.get(0),
            )
            .optional()?;
        match id {
            Some(id) => Ok(Some(query_notification(&conn, &id)?)),
            None => Ok(None),
        }
    }

    pub fn list_notifications(
        &self,
        user_id: &str,
        kind: Option<NotificationKind>,
        is_read: Option<bool>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<Notification>> {
        let mut sql = String::from(
            "SELECT id, recipient_id, kind, actor_id, actor_count, group_key,
                    resource_id, claim_id, comment_id, shoutout_id, community_id,
                    conversation_id, message_id, is_read, read_at, created_at, updated_at
             FROM notifications WHERE recipient_id = ?",
        );
        let mut values: Vec<Box<dyn ToSql>> =
            vec![Box::new(user_id.to_string())];
        if let Some(kind) = kind {
            sql.push_str(" AND kind = ?");
            values.push(Box::new(kind.as_str().to_string()));
        }
        if let Some(is_read) = is_read {
            sql.push_str(" AND is_read = ?");
            values.push(Box::new(is_read));
        }
        sql.push_str(" ORDER BY updated_at DESC, id LIMIT ? OFFSET ?");
        values.push(Box::new(limit));
        values.push(Box::new(offset));

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params_from_iter(values.iter().map(|v| v.as_ref())),
            row_to_notification,
        )?;
        let mut notifications = Vec::new();
        for row in rows {
            notifications.push(row?);
        }
        Ok(notifications)
    }

    pub fn count_notifications(
        &self,
        user_id: &str,
        kind: Option<NotificationKind>,
        is_read: Option<bool>,
    ) -> StoreResult<i64> {
        let mut sql = String::from("SELECT COUNT(*) FROM notifications WHERE recipient_id = ?");
        let mut values: Vec<Box<dyn ToSql>> =
            vec![Box::new(user_id.to_string())];
        if let Some(kind) = kind {
            sql.push_str(" AND kind = ?");
            values.push(Box::new(kind.as_str().to_string()));
        }
        if let Some(is_read) = is_read {
            sql.push_str(" AND is_read = ?");
            values.push(Box::new(is_read));
        }
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            &sql,
            params_from_iter(values.iter().map(|v| v.as_ref())),
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Unread notification count, always computed from current row state.
    pub fn unread_notification_count(&self, user_id: &str) -> StoreResult<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM notifications WHERE recipient_id = ?1 AND is_read = 0",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Mark one notification read. Idempotent: a second call is a no-op
    /// and `read_at` keeps its original value. Returns the row.
    pub fn mark_notification_read(&self, user_id: &str, id: &str) -> StoreResult<Notification> {
        let now = Utc::now();
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE notifications SET is_read = 1, read_at = ?1, updated_at = ?1
             WHERE id = ?2 AND recipient_id = ?3 AND is_read = 0",
            params![fmt_ts(&now), id, user_id],
        )?;
        let notification = query_notification_opt(&conn, id)?
            .filter(|n| n.recipient_id == user_id)
            .ok_or_else(|| StoreError::NotFound(format!("notification {}", id)))?;
        if changed > 0 {
            let _ = self
                .changes
                .send(StoreChange::NotificationUpdated(notification.clone()));
        }
        Ok(notification)
    }

    /// Mark every unread notification for a user read in one bulk write.
    /// Returns how many rows changed; calling again immediately returns 0.
    pub fn mark_all_notifications_read(&self, user_id: &str) -> StoreResult<i64> {
        let now = Utc::now();
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE notifications SET is_read = 1, read_at = ?1, updated_at = ?1
             WHERE recipient_id = ?2 AND is_read = 0",
            params![fmt_ts(&now), user_id],
        )?;
        if changed > 0 {
            let _ = self.changes.send(StoreChange::AllNotificationsRead {
                recipient_id: user_id.to_string(),
            });
        }
        Ok(changed as i64)
    }

    // ==================== Conversation Operations ====================

    pub fn create_conversation(&self, participant_ids: &[String]) -> StoreResult<Conversation> {
        let mut participants: Vec<String> = participant_ids.to_vec();
        participants.sort();
        participants.dedup();
        if participants.len() < 2 {
            return Err(StoreError::NotFound(
                "conversation needs at least two participants".to_string(),
            ));
        }

        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            participant_ids: participants.clone(),
            created_at: Utc::now(),
        };

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO conversations (id, created_at) VALUES (?1, ?2)",
            params![conversation.id, fmt_ts(&conversation.created_at)],
        )?;
        for user_id in &participants {
            tx.execute(
                "INSERT INTO conversation_participants (conversation_id, user_id) VALUES (?1, ?2)",
                params![conversation.id, user_id],
            )?;
        }
        tx.commit()?;
        Ok(conversation)
    }

    pub fn get_conversation(&self, id: &str) -> StoreResult<Conversation> {
        let conn = self.conn.lock().unwrap();
        let created_at: Option<String> = conn
            .query_row(
                "SELECT created_at FROM conversations WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let created_at =
            created_at.ok_or_else(|| StoreError::NotFound(format!("conversation {}", id)))?;
        let participant_ids = query_participants(&conn, id)?;
        Ok(Conversation {
            id: id.to_string(),
            participant_ids,
            created_at: parse_datetime(created_at),
        })
    }

    pub fn list_conversations(&self, user_id: &str) -> StoreResult<Vec<Conversation>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT c.id, c.created_at FROM conversations c
             JOIN conversation_participants p ON p.conversation_id = c.id
             WHERE p.user_id = ?1 ORDER BY c.created_at DESC",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut conversations = Vec::new();
        for row in rows {
            let (id, created_at) = row?;
            let participant_ids = query_participants(&conn, &id)?;
            conversations.push(Conversation {
                id,
                participant_ids,
                created_at: parse_datetime(created_at),
            });
        }
        Ok(conversations)
    }

    pub fn is_participant(&self, conversation_id: &str, user_id: &str) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM conversation_participants
             WHERE conversation_id = ?1 AND user_id = ?2",
            params![conversation_id, user_id],
            |row| row.get(0),
        )?;
        Ok(exists > 0)
    }

    // ==================== Message Operations ====================

    /// Insert a message. The caller supplies the timestamp (the API layer
    /// uses the current time); the id is assigned if empty.
    pub fn create_message(&self, message: &mut Message) -> StoreResult<()> {
        if message.id.is_empty() {
            message.id = Uuid::new_v4().to_string();
        }
        let conn = self.conn.lock().unwrap();
        let participant_ids = query_participants(&conn, &message.conversation_id)?;
        if participant_ids.is_empty() {
            return Err(StoreError::NotFound(format!(
                "conversation {}",
                message.conversation_id
            )));
        }
        conn.execute(
            "INSERT INTO messages (id, conversation_id, sender_id, body, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.id,
                message.conversation_id,
                message.sender_id,
                message.body,
                fmt_ts(&message.created_at),
            ],
        )?;
        let _ = self.changes.send(StoreChange::MessageCreated {
            message: message.clone(),
            participant_ids,
        });
        Ok(())
    }

    pub fn list_messages(
        &self,
        conversation_id: &str,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<Message>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, sender_id, body, created_at FROM messages
             WHERE conversation_id = ?1 ORDER BY created_at ASC, id LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(params![conversation_id, limit, offset], row_to_message)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    pub fn count_messages(&self, conversation_id: &str) -> StoreResult<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Unread messages in one conversation: rows from other senders newer
    /// than the user's read cursor. No cursor counts everything.
    pub fn unread_message_count(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> StoreResult<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM messages m
             LEFT JOIN conversation_reads r
                    ON r.conversation_id = m.conversation_id AND r.user_id = ?1
             WHERE m.conversation_id = ?2 AND m.sender_id != ?1
               AND (r.last_read_at IS NULL OR m.created_at > r.last_read_at)",
            params![user_id, conversation_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Total unread messages across every conversation the user is in.
    pub fn total_unread_message_count(&self, user_id: &str) -> StoreResult<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM messages m
             JOIN conversation_participants p
                   ON p.conversation_id = m.conversation_id AND p.user_id = ?1
             LEFT JOIN conversation_reads r
                    ON r.conversation_id = m.conversation_id AND r.user_id = ?1
             WHERE m.sender_id != ?1
               AND (r.last_read_at IS NULL OR m.created_at > r.last_read_at)",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Move the user's read cursor to the latest message in the
    /// conversation. The cursor never moves backward, so a message that
    /// arrives late with an earlier timestamp stays below it.
    pub fn mark_conversation_read(&self, user_id: &str, conversation_id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let participant: i64 = conn.query_row(
            "SELECT COUNT(*) FROM conversation_participants
             WHERE conversation_id = ?1 AND user_id = ?2",
            params![conversation_id, user_id],
            |row| row.get(0),
        )?;
        if participant == 0 {
            return Err(StoreError::NotFound(format!(
                "conversation {}",
                conversation_id
            )));
        }
        let latest: Option<String> = conn.query_row(
            "SELECT MAX(created_at) FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;
        let cursor = latest.unwrap_or_else(|| fmt_ts(&Utc::now()));
        conn.execute(
            "INSERT INTO conversation_reads (user_id, conversation_id, last_read_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id, conversation_id) DO UPDATE SET
                last_read_at = excluded.last_read_at
             WHERE excluded.last_read_at > conversation_reads.last_read_at",
            params![user_id, conversation_id, cursor],
        )?;
        Ok(())
    }
}

// ==================== Row mapping helpers ====================

fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        display_name: row.get(4)?,
        created_at: parse_datetime(row.get(5)?),
        updated_at: parse_datetime(row.get(6)?),
    })
}

fn row_to_preferences(row: &rusqlite::Row) -> rusqlite::Result<NotificationPreferences> {
    Ok(NotificationPreferences {
        user_id: row.get(0)?,
        social_interactions: row.get(1)?,
        my_resources: row.get(2)?,
        my_registrations: row.get(3)?,
        my_communities: row.get(4)?,
        community_activity: row.get(5)?,
        trust_recognition: row.get(6)?,
        direct_messages: row.get(7)?,
        community_messages: row.get(8)?,
        email_enabled: row.get(9)?,
        push_enabled: row.get(10)?,
        updated_at: parse_datetime(row.get(11)?),
    })
}

fn row_to_notification(row: &rusqlite::Row) -> rusqlite::Result<Notification> {
    let kind_raw: String = row.get(2)?;
    let kind = NotificationKind::from_str(&kind_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown notification kind: {}", kind_raw).into(),
        )
    })?;
    Ok(Notification {
        id: row.get(0)?,
        recipient_id: row.get(1)?,
        kind,
        actor_id: row.get(3)?,
        actor_count: row.get(4)?,
        group_key: row.get(5)?,
        resource_id: row.get(6)?,
        claim_id: row.get(7)?,
        comment_id: row.get(8)?,
        shoutout_id: row.get(9)?,
        community_id: row.get(10)?,
        conversation_id: row.get(11)?,
        message_id: row.get(12)?,
        is_read: row.get(13)?,
        read_at: row.get::<_, Option<String>>(14)?.map(parse_datetime),
        created_at: parse_datetime(row.get(15)?),
        updated_at: parse_datetime(row.get(16)?),
    })
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        body: row.get(3)?,
        created_at: parse_datetime(row.get(4)?),
    })
}

fn query_notification(conn: &Connection, id: &str) -> StoreResult<Notification> {
    query_notification_opt(conn, id)?
        .ok_or_else(|| StoreError::NotFound(format!("notification {}", id)))
}

fn query_notification_opt(conn: &Connection, id: &str) -> StoreResult<Option<Notification>> {
    let notification = conn
        .query_row(
            "SELECT id, recipient_id, kind, actor_id, actor_count, group_key,
                    resource_id, claim_id, comment_id, shoutout_id, community_id,
                    conversation_id, message_id, is_read, read_at, created_at, updated_at
             FROM notifications WHERE id = ?1",
            params![id],
            row_to_notification,
        )
        .optional()?;
    Ok(notification)
}

fn query_participants(conn: &Connection, conversation_id: &str) -> StoreResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM conversation_participants WHERE conversation_id = ?1 ORDER BY user_id",
    )?;
    let rows = stmt.query_map(params![conversation_id], |row| row.get::<_, String>(0))?;
    let mut participants = Vec::new();
    for row in rows {
        participants.push(row?);
    }
    Ok(participants)
}

fn insert_preferences(conn: &Connection, prefs: &NotificationPreferences) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO notification_preferences (
            user_id, social_interactions, my_resources, my_registrations, my_communities,
            community_activity, trust_recognition, direct_messages, community_messages,
            email_enabled, push_enabled, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            prefs.user_id,
            prefs.social_interactions,
            prefs.my_resources,
            prefs.my_registrations,
            prefs.my_communities,
            prefs.community_activity,
            prefs.trust_recognition,
            prefs.direct_messages,
            prefs.community_messages,
            prefs.email_enabled,
            prefs.push_enabled,
            fmt_ts(&prefs.updated_at),
        ],
    )?;
    Ok(())
}

/// Fixed-precision RFC 3339 so that lexicographic order on the TEXT
/// column equals chronological order (cursor comparisons rely on this).
fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
