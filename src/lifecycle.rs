//! Session lifecycle: creation, keep-alive pings and the one termination path.
//!
//! Each live session carries two expiry timers: a hard limit counted from
//! creation and an inactivity timer that every ping pushes forward. Whatever
//! ends a session first (either timer, an explicit delete, the sweep or
//! shutdown) goes through an atomic take of the registry entry, so the remote
//! terminate call happens at most once per session.

use crate::config::LifecycleConfig;
use crate::provider::{
    CreateVmRequest, ProviderError, TerminateOutcome, VmProvider, VmTimeouts,
};
use crate::rate_limit::RateLimiter;
use crate::registry::{SessionRecord, SessionRegistry, SessionState, TimerHandle};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    HardLimit,
    Inactivity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    HardLimit,
    Inactivity,
    UserRequest,
    Sweep,
    Shutdown,
}

impl From<TimerKind> for TerminationReason {
    fn from(kind: TimerKind) -> Self {
        match kind {
            TimerKind::HardLimit => TerminationReason::HardLimit,
            TimerKind::Inactivity => TerminationReason::Inactivity,
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TerminationReason::HardLimit => "time_limit",
            TerminationReason::Inactivity => "inactivity",
            TerminationReason::UserRequest => "user_request",
            TerminationReason::Sweep => "sweep",
            TerminationReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Rate limit exceeded. Maximum {max} sessions allowed per IP.")]
    RateLimited { max: usize, retry_after: u64 },

    #[error("Session not found or expired")]
    NotFound,

    #[error("Access denied")]
    AccessDenied,

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("session creation was interrupted")]
    Interrupted,

    #[error("Service is shutting down")]
    ShuttingDown,
}

/// What the remote side said when asked to terminate.
#[derive(Debug)]
pub enum RemoteOutcome {
    Terminated,
    AlreadyGone,
    Failed(ProviderError),
    Interrupted,
}

impl RemoteOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, RemoteOutcome::Failed(_) | RemoteOutcome::Interrupted)
    }
}

#[derive(Debug)]
pub enum Termination {
    /// Nothing was tracked under the id; already gone counts as success.
    NotTracked,
    Completed {
        snapshot: SessionSnapshot,
        reason: TerminationReason,
        remote: RemoteOutcome,
    },
}

impl Termination {
    pub fn remote(&self) -> Option<&RemoteOutcome> {
        match self {
            Termination::NotTracked => None,
            Termination::Completed { remote, .. } => Some(remote),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSession {
    pub id: String,
    pub url: String,
    pub expires_at: i64,
}

/// Read-only view of a session record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub id: String,
    pub owner_client_id: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub hard_expires_at: DateTime<Utc>,
    pub connection_url: String,
    pub state: SessionState,
}

impl From<&SessionRecord> for SessionSnapshot {
    fn from(r: &SessionRecord) -> Self {
        Self {
            id: r.id.clone(),
            owner_client_id: r.owner_client_id.clone(),
            created_at: r.created_at,
            last_active_at: r.last_active_at,
            hard_expires_at: r.hard_expires_at,
            connection_url: r.connection_url.clone(),
            state: r.state,
        }
    }
}

struct Tracked {
    registry: SessionRegistry,
    limiter: RateLimiter,
}

pub struct LifecycleManager {
    config: LifecycleConfig,
    provider: Arc<dyn VmProvider>,
    tracked: RwLock<Tracked>,
    next_generation: AtomicU64,
    // In-flight creates; shutdown waits for them before draining.
    creates: TaskTracker,
    // Handed to timer tasks so they do not keep the manager alive.
    this: Weak<LifecycleManager>,
}

impl LifecycleManager {
    pub fn new(config: LifecycleConfig, provider: Arc<dyn VmProvider>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            tracked: RwLock::new(Tracked {
                registry: SessionRegistry::new(),
                limiter: RateLimiter::new(config.max_sessions_per_client),
            }),
            config,
            provider,
            next_generation: AtomicU64::new(1),
            creates: TaskTracker::new(),
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    fn create_request(&self) -> CreateVmRequest {
        CreateVmRequest {
            timeout: VmTimeouts {
                absolute: self.config.hard_lifetime.as_secs(),
                inactive: self.config.inactivity_window.as_secs(),
                offline: self.config.offline_timeout.as_secs(),
            },
        }
    }

    /// Reserve a slot for `client_id`, start a remote VM and begin tracking it.
    ///
    /// Runs on its own task: once the provider has been asked for a VM, the
    /// session is tracked even if the caller goes away.
    pub async fn create(
        self: &Arc<Self>,
        client_id: &str,
    ) -> Result<CreatedSession, LifecycleError> {
        if self.creates.is_closed() {
            return Err(LifecycleError::ShuttingDown);
        }
        let manager = Arc::clone(self);
        let client_id = client_id.to_string();
        self.creates
            .spawn(async move { manager.create_tracked(&client_id).await })
            .await
            .map_err(|e| {
                warn!(error = %e, "Session creation task failed");
                LifecycleError::Interrupted
            })?
    }

    async fn create_tracked(&self, client_id: &str) -> Result<CreatedSession, LifecycleError> {
        {
            let mut tracked = self.tracked.write().await;
            if !tracked.limiter.try_reserve(client_id) {
                warn!(
                    client = %client_id,
                    max = self.config.max_sessions_per_client,
                    "Rate limit exceeded"
                );
                return Err(LifecycleError::RateLimited {
                    max: self.config.max_sessions_per_client,
                    retry_after: self.config.retry_after_secs,
                });
            }
        }

        let vm = match self.provider.create(&self.create_request()).await {
            Ok(vm) => vm,
            Err(e) => {
                self.tracked.write().await.limiter.cancel(client_id);
                return Err(e.into());
            }
        };

        let now = Utc::now();
        let mut record = SessionRecord::new(
            vm.session_id.clone(),
            client_id,
            vm.embed_url.clone(),
            now,
            expiry_after(now, self.config.hard_lifetime),
        );
        record.admin_token = vm.admin_token;
        let created = CreatedSession {
            id: record.id.clone(),
            url: record.connection_url.clone(),
            expires_at: record.expires_at_millis(),
        };

        let mut tracked = self.tracked.write().await;
        // Timers are armed under the lock so none can fire before the insert.
        record.hard_timer =
            Some(self.schedule(&record.id, TimerKind::HardLimit, self.config.hard_lifetime));
        record.inactivity_timer = Some(self.schedule(
            &record.id,
            TimerKind::Inactivity,
            self.config.inactivity_window,
        ));
        if let Some(mut stale) = tracked.registry.insert(record) {
            warn!(session = %stale.id, "Provider reused a tracked session id");
            tracked.limiter.release(&stale.owner_client_id, &stale.id);
            cancel_timers(&mut stale);
        }
        tracked.limiter.commit(client_id, &created.id);

        info!(session = %created.id, client = %client_id, "Session created");
        Ok(created)
    }

    /// Reset the inactivity timer for a session.
    pub async fn ping(&self, id: &str) -> Result<DateTime<Utc>, LifecycleError> {
        self.ping_inner(id, None).await
    }

    /// Like `ping`, but only for the client that owns the session.
    pub async fn ping_owned(
        &self,
        id: &str,
        client_id: &str,
    ) -> Result<DateTime<Utc>, LifecycleError> {
        self.ping_inner(id, Some(client_id)).await
    }

    async fn ping_inner(
        &self,
        id: &str,
        client_id: Option<&str>,
    ) -> Result<DateTime<Utc>, LifecycleError> {
        let mut tracked = self.tracked.write().await;
        let record = tracked
            .registry
            .get_mut(id)
            .ok_or(LifecycleError::NotFound)?;
        if let Some(client_id) = client_id {
            if !record.is_owned_by(client_id) {
                return Err(LifecycleError::AccessDenied);
            }
        }

        if let Some(previous) = record.inactivity_timer.take() {
            previous.cancel();
        }
        record.inactivity_timer = Some(self.schedule(
            id,
            TimerKind::Inactivity,
            self.config.inactivity_window,
        ));

        let now = Utc::now();
        tracked.registry.update_last_active(id, now);
        debug!(session = %id, "Inactivity timer reset");
        Ok(now)
    }

    /// End a session. Unknown ids succeed with `Termination::NotTracked`.
    pub async fn terminate(&self, id: &str, reason: TerminationReason) -> Termination {
        let record = self.take(id, |_| true).await;
        match record {
            Some(record) => self.finish(record, reason).await,
            None => {
                debug!(session = %id, %reason, "Terminate on untracked session");
                Termination::NotTracked
            }
        }
    }

    /// Like `terminate`, but refuses sessions owned by another client.
    pub async fn terminate_owned(
        &self,
        id: &str,
        client_id: &str,
        reason: TerminationReason,
    ) -> Result<Termination, LifecycleError> {
        let mut denied = false;
        let record = self
            .take(id, |r| {
                denied = !r.is_owned_by(client_id);
                !denied
            })
            .await;
        if denied {
            return Err(LifecycleError::AccessDenied);
        }
        Ok(match record {
            Some(record) => self.finish(record, reason).await,
            None => Termination::NotTracked,
        })
    }

    /// Safety net for records whose timers never fired.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let expired = {
            let mut tracked = self.tracked.write().await;
            let expired = tracked.registry.take_expired(now);
            for record in &expired {
                tracked
                    .limiter
                    .release(&record.owner_client_id, &record.id);
            }
            expired
        };
        let count = expired.len();
        if count > 0 {
            info!(count, "Sweeping expired sessions");
        }
        self.finish_all(expired, TerminationReason::Sweep).await;
        count
    }

    /// Refuse new creates, wait for those in flight, then terminate
    /// everything still tracked.
    pub async fn shutdown(&self) -> usize {
        self.creates.close();
        if !self.creates.is_empty() {
            info!(pending = self.creates.len(), "Waiting for in-flight session creates");
        }
        self.creates.wait().await;

        let all = {
            let mut tracked = self.tracked.write().await;
            let all = tracked.registry.drain();
            for record in &all {
                tracked
                    .limiter
                    .release(&record.owner_client_id, &record.id);
            }
            all
        };
        let count = all.len();
        info!(count, "Terminating remaining sessions");
        self.finish_all(all, TerminationReason::Shutdown).await;
        count
    }

    pub async fn session(&self, id: &str) -> Option<SessionSnapshot> {
        self.tracked.read().await.registry.get(id).map(Into::into)
    }

    pub async fn session_count(&self) -> usize {
        self.tracked.read().await.registry.len()
    }

    pub async fn sessions_for(&self, client_id: &str) -> Vec<String> {
        self.tracked.read().await.limiter.sessions_for(client_id)
    }

    fn schedule(&self, id: &str, kind: TimerKind, delay: Duration) -> TimerHandle {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let manager = self.this.clone();
        let id = id.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = manager.upgrade() {
                manager.expire(&id, kind, generation).await;
            }
        });
        TimerHandle::new(generation, task.abort_handle())
    }

    async fn expire(&self, id: &str, kind: TimerKind, generation: u64) {
        let current = |r: &SessionRecord| {
            let timer = match kind {
                TimerKind::HardLimit => r.hard_timer.as_ref(),
                TimerKind::Inactivity => r.inactivity_timer.as_ref(),
            };
            timer.map(TimerHandle::generation) == Some(generation)
        };
        let Some(mut record) = self.take_uncancelled(id, current).await else {
            debug!(session = %id, ?kind, "Stale timer ignored");
            return;
        };
        // This task is the timer that fired; only the other one is cancelled.
        match kind {
            TimerKind::HardLimit => record.hard_timer = None,
            TimerKind::Inactivity => record.inactivity_timer = None,
        }
        cancel_timers(&mut record);
        self.finish(record, kind.into()).await;
    }

    /// Atomically remove the record and release its rate-limit slot, then
    /// cancel both timers.
    async fn take<F>(&self, id: &str, pred: F) -> Option<SessionRecord>
    where
        F: FnOnce(&SessionRecord) -> bool,
    {
        let mut record = self.take_uncancelled(id, pred).await?;
        cancel_timers(&mut record);
        Some(record)
    }

    async fn take_uncancelled<F>(&self, id: &str, pred: F) -> Option<SessionRecord>
    where
        F: FnOnce(&SessionRecord) -> bool,
    {
        let mut tracked = self.tracked.write().await;
        let mut record = tracked.registry.take_if(id, pred)?;
        tracked
            .limiter
            .release(&record.owner_client_id, &record.id);
        record.state = SessionState::Terminating;
        Some(record)
    }

    async fn finish(&self, record: SessionRecord, reason: TerminationReason) -> Termination {
        info!(session = %record.id, %reason, "Terminating session");
        let mut snapshot = SessionSnapshot::from(&record);

        // Run the remote call on its own task so a dropped request cannot
        // abandon it halfway.
        let task = tokio::spawn(remote_terminate(self.provider.clone(), record.id));
        let remote = match task.await {
            Ok(remote) => remote,
            Err(e) => {
                warn!(session = %snapshot.id, error = %e, "Remote terminate task failed");
                RemoteOutcome::Interrupted
            }
        };

        snapshot.state = SessionState::Terminated;
        Termination::Completed {
            snapshot,
            reason,
            remote,
        }
    }

    async fn finish_all(&self, records: Vec<SessionRecord>, reason: TerminationReason) {
        let mut set = JoinSet::new();
        for mut record in records {
            cancel_timers(&mut record);
            record.state = SessionState::Terminating;
            info!(session = %record.id, %reason, "Terminating session");
            set.spawn(remote_terminate(self.provider.clone(), record.id));
        }
        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "Remote terminate task failed");
            }
        }
    }
}

async fn remote_terminate(provider: Arc<dyn VmProvider>, id: String) -> RemoteOutcome {
    match provider.terminate(&id).await {
        Ok(TerminateOutcome::Terminated) => RemoteOutcome::Terminated,
        Ok(TerminateOutcome::AlreadyGone) => {
            debug!(session = %id, "Remote session already gone");
            RemoteOutcome::AlreadyGone
        }
        Err(e) => {
            warn!(session = %id, error = %e, "Remote terminate failed; local state released");
            RemoteOutcome::Failed(e)
        }
    }
}

fn cancel_timers(record: &mut SessionRecord) {
    if let Some(timer) = record.hard_timer.take() {
        timer.cancel();
    }
    if let Some(timer) = record.inactivity_timer.take() {
        timer.cancel();
    }
}

fn expiry_after(start: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| start.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
