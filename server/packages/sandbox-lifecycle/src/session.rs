use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;

const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Creating,
    Active,
    Sleeping,
    Terminated,
    PendingDelete,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_wake_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_config_check_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(flatten, default)]
    pub extra: Map<String, Value>,
}

/// Durable record for one conversation bound to one sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub sandbox_id: String,
    pub status: SessionStatus,
    #[serde(default)]
    pub continuity_id: Option<String>,
    pub last_active_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: SessionMetadata,
}

impl Session {
    pub fn new(id: impl Into<String>, sandbox_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            user_id: None,
            sandbox_id: sandbox_id.into(),
            status: SessionStatus::Creating,
            continuity_id: None,
            last_active_at: now,
            created_at: now,
            metadata: SessionMetadata::default(),
        }
    }

    /// Terminated and pending-delete sessions never talk to their sandbox again.
    pub fn is_gone(&self) -> bool {
        matches!(
            self.status,
            SessionStatus::Terminated | SessionStatus::PendingDelete
        )
    }

    /// The host may suspend idle sandboxes silently, so a long idle
    /// `active` session is treated like a sleeping one.
    pub fn possibly_asleep(&self, now: DateTime<Utc>, sleep_after: Duration) -> bool {
        if self.status == SessionStatus::Sleeping {
            return true;
        }
        let idle = now.signed_duration_since(self.last_active_at);
        idle.to_std().map(|idle| idle > sleep_after).unwrap_or(false)
    }
}

pub fn session_key(session_id: &str) -> String {
    format!("session:{session_id}")
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to encode session record: {0}")]
    Encode(String),
    #[error("failed to decode session record {key}: {message}")]
    Decode { key: String, message: String },
    #[error("session store unavailable: {0}")]
    Backend(String),
}

type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Key-value persistence for session records.
pub trait SessionStore: Send + Sync + 'static {
    fn get(&self, session_id: &str) -> StoreFuture<'_, Option<Session>>;

    fn put(&self, session: &Session) -> StoreFuture<'_, ()>;
}

#[derive(Debug)]
struct StoredRecord {
    json: String,
    expires_at: Instant,
}

/// Process-local store holding JSON records with a retention TTL.
#[derive(Debug)]
pub struct InMemorySessionStore {
    records: Mutex<HashMap<String, StoredRecord>>,
    ttl: Duration,
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}

impl InMemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let records = self.records.lock().await;
        records
            .values()
            .filter(|record| record.expires_at > now)
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl SessionStore for InMemorySessionStore {
    fn get(&self, session_id: &str) -> StoreFuture<'_, Option<Session>> {
        let key = session_key(session_id);
        Box::pin(async move {
            let mut records = self.records.lock().await;
            let Some(record) = records.get(&key) else {
                return Ok(None);
            };
            if record.expires_at <= Instant::now() {
                records.remove(&key);
                return Ok(None);
            }
            serde_json::from_str(&record.json)
                .map(Some)
                .map_err(|err| StoreError::Decode {
                    key: key.clone(),
                    message: err.to_string(),
                })
        })
    }

    fn put(&self, session: &Session) -> StoreFuture<'_, ()> {
        let key = session_key(&session.id);
        let encoded = serde_json::to_string(session).map_err(|err| StoreError::Encode(err.to_string()));
        Box::pin(async move {
            let json = encoded?;
            let expires_at = Instant::now() + self.ttl;
            self.records
                .lock()
                .await
                .insert(key, StoredRecord { json, expires_at });
            Ok(())
        })
    }
}
