//! Per-client cap on concurrently live sessions.
//!
//! Creation is two-phase: `try_reserve` claims a slot before the remote call,
//! then `commit` binds it to the session id (or `cancel` hands it back when the
//! provider fails). Pending reservations count against the cap, so two
//! concurrent creates from one client cannot both slip under the limit.

use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
struct ClientEntry {
    sessions: HashSet<String>,
    pending: usize,
}

impl ClientEntry {
    fn in_use(&self) -> usize {
        self.sessions.len() + self.pending
    }

    fn is_empty(&self) -> bool {
        self.sessions.is_empty() && self.pending == 0
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    max_per_client: usize,
    clients: HashMap<String, ClientEntry>,
    owners: HashMap<String, String>,
}

impl RateLimiter {
    pub fn new(max_per_client: usize) -> Self {
        Self {
            max_per_client,
            clients: HashMap::new(),
            owners: HashMap::new(),
        }
    }

    /// Claim a slot for `client_id`. Returns false when the client is at its cap.
    pub fn try_reserve(&mut self, client_id: &str) -> bool {
        let entry = self.clients.entry(client_id.to_string()).or_default();
        if entry.in_use() >= self.max_per_client {
            if entry.is_empty() {
                self.clients.remove(client_id);
            }
            return false;
        }
        entry.pending += 1;
        true
    }

    /// Turn a pending reservation into an attributed session.
    pub fn commit(&mut self, client_id: &str, session_id: &str) {
        // A session id belongs to at most one client.
        if let Some(previous) = self.owners.get(session_id).cloned() {
            self.release(&previous, session_id);
        }
        let entry = self.clients.entry(client_id.to_string()).or_default();
        entry.pending = entry.pending.saturating_sub(1);
        entry.sessions.insert(session_id.to_string());
        self.owners
            .insert(session_id.to_string(), client_id.to_string());
    }

    /// Drop a pending reservation that never became a session.
    pub fn cancel(&mut self, client_id: &str) {
        if let Some(entry) = self.clients.get_mut(client_id) {
            entry.pending = entry.pending.saturating_sub(1);
            if entry.is_empty() {
                self.clients.remove(client_id);
            }
        }
    }

    pub fn release(&mut self, client_id: &str, session_id: &str) {
        if self.owners.get(session_id).map(String::as_str) == Some(client_id) {
            self.owners.remove(session_id);
        }
        if let Some(entry) = self.clients.get_mut(client_id) {
            entry.sessions.remove(session_id);
            if entry.is_empty() {
                self.clients.remove(client_id);
            }
        }
    }

    pub fn active_count(&self, client_id: &str) -> usize {
        self.clients
            .get(client_id)
            .map(|e| e.sessions.len())
            .unwrap_or(0)
    }

    pub fn sessions_for(&self, client_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .clients
            .get(client_id)
            .map(|e| e.sessions.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }
}
