use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, PoisonError, RwLock,
};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LinkPhase {
    #[default]
    Idle,
    Connecting,
    Streaming,
    Closing,
    Failed,
    Demo,
}

#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct ConnectionState {
    pub connected: bool,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
    #[serde(skip)]
    pub phase: LinkPhase,
}

impl ConnectionState {
    pub fn is_demo(&self) -> bool {
        self.phase == LinkPhase::Demo
    }
}

struct LinkInner {
    state: RwLock<ConnectionState>,
    /// Supervisor restarts since the last attempt that reached `Streaming`.
    supervisor_failures: AtomicU32,
}

/// Shared, lock-guarded view of the instrument link.
///
/// Written by the connection manager, read by every sample and status
/// query. Each transition happens under one write lock.
#[derive(Clone)]
pub struct LinkState {
    inner: Arc<LinkInner>,
}

impl Default for LinkState {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LinkInner {
                state: RwLock::new(ConnectionState::default()),
                supervisor_failures: AtomicU32::new(0),
            }),
        }
    }

    pub fn snapshot(&self) -> ConnectionState {
        self.inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update<F: FnOnce(&mut ConnectionState)>(&self, f: F) {
        let mut guard = self
            .inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut guard);
    }

    /// Enters `Connecting` and returns the attempt number.
    pub fn begin_attempt(&self) -> u32 {
        let mut attempt = 0;
        self.update(|state| {
            state.phase = LinkPhase::Connecting;
            state.reconnect_attempts = state.reconnect_attempts.saturating_add(1);
            attempt = state.reconnect_attempts;
        });
        attempt
    }

    pub fn mark_streaming(&self, at: DateTime<Utc>) {
        self.update(|state| {
            state.phase = LinkPhase::Streaming;
            state.connected = true;
            state.last_connected_at = Some(at);
            state.reconnect_attempts = 0;
            state.last_error = None;
        });
        self.inner.supervisor_failures.store(0, Ordering::SeqCst);
    }

    pub fn mark_failed(&self, error: impl Into<String>) {
        let error = error.into();
        self.update(|state| {
            state.phase = LinkPhase::Failed;
            state.connected = false;
            state.last_error = Some(error);
        });
    }

    /// Peer closed or the link dropped mid-stream.
    pub fn mark_closing(&self, error: Option<String>) {
        self.update(|state| {
            state.phase = LinkPhase::Closing;
            state.connected = false;
            if error.is_some() {
                state.last_error = error;
            }
        });
    }

    pub fn enter_demo(&self) {
        self.update(|state| {
            state.phase = LinkPhase::Demo;
            state.connected = false;
            state.last_error = Some("Using demo data".into());
        });
    }

    /// Clears the retry budget, e.g. after a manual reconnect request.
    pub fn reset_attempts(&self) {
        self.update(|state| {
            state.reconnect_attempts = 0;
            if state.phase == LinkPhase::Demo {
                state.phase = LinkPhase::Idle;
            }
        });
    }

    pub fn mark_idle(&self) {
        self.update(|state| {
            state.phase = LinkPhase::Idle;
            state.connected = false;
        });
    }

    pub fn supervisor_failures(&self) -> u32 {
        self.inner.supervisor_failures.load(Ordering::SeqCst)
    }

    /// Records one more unexpected manager exit and returns the new count.
    pub fn record_supervisor_failure(&self) -> u32 {
        self.inner.supervisor_failures.fetch_add(1, Ordering::SeqCst) + 1
    }
}
