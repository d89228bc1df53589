//! In-memory provider for exercising the lifecycle without a network.

use crate::provider::{CreateVmRequest, ProviderError, ProvisionedVm, TerminateOutcome, VmProvider};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Scripted response for the next terminate call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockTerminate {
    Ok,
    NotFound,
    Fail,
}

/// Records every call and answers from a script.
///
/// Creates hand out `vm-1`, `vm-2`, ... unless ids were queued with
/// `queue_session`. Terminates succeed unless a failure was queued.
#[derive(Default)]
pub struct MockProvider {
    queued: Mutex<VecDeque<Result<ProvisionedVm, u16>>>,
    terminate_script: Mutex<VecDeque<MockTerminate>>,
    created: AtomicUsize,
    terminated: Mutex<Vec<String>>,
    requests: Mutex<Vec<CreateVmRequest>>,
    create_delay: Mutex<Option<Duration>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_session(&self, session_id: &str, embed_url: &str) {
        self.lock_queue().push_back(Ok(ProvisionedVm {
            session_id: session_id.to_string(),
            embed_url: embed_url.to_string(),
            admin_token: Some(format!("admin-{session_id}")),
        }));
    }

    /// Make every following create take `delay` before answering.
    pub fn delay_creates(&self, delay: Duration) {
        if let Ok(mut d) = self.create_delay.lock() {
            *d = Some(delay);
        }
    }

    pub fn queue_create_failure(&self, status: u16) {
        self.lock_queue().push_back(Err(status));
    }

    pub fn queue_terminate(&self, outcome: MockTerminate) {
        if let Ok(mut script) = self.terminate_script.lock() {
            script.push_back(outcome);
        }
    }

    pub fn create_calls(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn terminate_calls(&self) -> Vec<String> {
        self.terminated
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    pub fn terminate_count(&self, session_id: &str) -> usize {
        self.terminate_calls()
            .iter()
            .filter(|id| id.as_str() == session_id)
            .count()
    }

    pub fn last_request(&self) -> Option<CreateVmRequest> {
        self.requests.lock().ok().and_then(|r| r.last().cloned())
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<ProvisionedVm, u16>>> {
        self.queued.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl VmProvider for MockProvider {
    async fn create(&self, request: &CreateVmRequest) -> Result<ProvisionedVm, ProviderError> {
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let delay = self.create_delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.lock_queue().pop_front() {
            Some(Ok(vm)) => Ok(vm),
            Some(Err(status)) => Err(ProviderError::Http {
                status,
                body: format!("scripted failure {status}"),
            }),
            None => Ok(ProvisionedVm {
                session_id: format!("vm-{n}"),
                embed_url: format!("https://embed.example/vm-{n}"),
                admin_token: None,
            }),
        }
    }

    async fn terminate(&self, session_id: &str) -> Result<TerminateOutcome, ProviderError> {
        if let Ok(mut terminated) = self.terminated.lock() {
            terminated.push(session_id.to_string());
        }
        let next = self
            .terminate_script
            .lock()
            .ok()
            .and_then(|mut s| s.pop_front())
            .unwrap_or(MockTerminate::Ok);
        match next {
            MockTerminate::Ok => Ok(TerminateOutcome::Terminated),
            MockTerminate::NotFound => Ok(TerminateOutcome::AlreadyGone),
            MockTerminate::Fail => Err(ProviderError::Http {
                status: 503,
                body: "engine unavailable".to_string(),
            }),
        }
    }
}
