//! Session registry: the single source of truth for which sessions are live.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::task::AbortHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Terminating,
    Terminated,
}

/// Cancellation handle for a scheduled expiry callback.
///
/// Dropping the handle leaves the callback scheduled; only `cancel` stops it.
#[derive(Debug)]
pub struct TimerHandle {
    generation: u64,
    abort: AbortHandle,
}

impl TimerHandle {
    pub fn new(generation: u64, abort: AbortHandle) -> Self {
        Self { generation, abort }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cancel(self) {
        self.abort.abort();
    }
}

#[derive(Debug)]
pub struct SessionRecord {
    pub id: String,
    pub owner_client_id: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub hard_expires_at: DateTime<Utc>,
    pub connection_url: String,
    pub state: SessionState,
    pub(crate) admin_token: Option<String>,
    pub(crate) hard_timer: Option<TimerHandle>,
    pub(crate) inactivity_timer: Option<TimerHandle>,
}

impl SessionRecord {
    pub fn new(
        id: impl Into<String>,
        owner_client_id: impl Into<String>,
        connection_url: impl Into<String>,
        created_at: DateTime<Utc>,
        hard_expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            owner_client_id: owner_client_id.into(),
            created_at,
            last_active_at: created_at,
            hard_expires_at,
            connection_url: connection_url.into(),
            state: SessionState::Active,
            admin_token: None,
            hard_timer: None,
            inactivity_timer: None,
        }
    }

    pub fn is_owned_by(&self, client_id: &str) -> bool {
        self.owner_client_id == client_id
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.hard_expires_at <= now
    }

    pub fn expires_at_millis(&self) -> i64 {
        self.hard_expires_at.timestamp_millis()
    }

    pub fn has_admin_token(&self) -> bool {
        self.admin_token.is_some()
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, SessionRecord>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, returning any record previously stored under its id.
    pub fn insert(&mut self, record: SessionRecord) -> Option<SessionRecord> {
        self.sessions.insert(record.id.clone(), record)
    }

    pub fn get(&self, id: &str) -> Option<&SessionRecord> {
        self.sessions.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut SessionRecord> {
        self.sessions.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<SessionRecord> {
        self.sessions.remove(id)
    }

    /// Remove and return the record only if `pred` holds for it.
    pub fn take_if<F>(&mut self, id: &str, pred: F) -> Option<SessionRecord>
    where
        F: FnOnce(&SessionRecord) -> bool,
    {
        if pred(self.sessions.get(id)?) {
            self.sessions.remove(id)
        } else {
            None
        }
    }

    pub fn update_last_active(&mut self, id: &str, at: DateTime<Utc>) -> bool {
        match self.sessions.get_mut(id) {
            Some(record) => {
                record.last_active_at = at;
                true
            }
            None => false,
        }
    }

    /// Remove every record whose hard expiry is at or before `now`.
    pub fn take_expired(&mut self, now: DateTime<Utc>) -> Vec<SessionRecord> {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.sessions.remove(&id))
            .collect()
    }

    pub fn drain(&mut self) -> Vec<SessionRecord> {
        self.sessions.drain().map(|(_, record)| record).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
