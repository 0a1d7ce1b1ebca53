//! # Session State Management
//!
//! The single shared record of one voice session. Components receive an
//! `Arc<SessionShared>` instead of reaching into each other's internals.
//!
//! ## Write-Access Rules:
//! - **status / last_error / started_at**: written only by the lifecycle manager
//! - **capture counters**: written only by the capture pipeline and its send view
//! - **playback counters**: written only by the playback scheduler
//! - everything is readable by anyone (the UI subscribes to `status`)
//!
//! ## Thread Safety:
//! Counters are atomics because they are bumped from audio callback threads.
//! The status lives in a `tokio::sync::watch` channel so UIs can await changes.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::SessionError;

/// Current status of a voice session.
///
/// ## Transitions:
/// `idle -> connecting -> active -> (error | closed)`. `active -> active` is the
/// steady state. `error` and `closed` are terminal and re-entering them is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Created, `start()` not called yet
    Idle,
    /// Acquiring devices and opening the transport
    Connecting,
    /// Call in progress
    Active,
    /// Failed; the cause is in `SessionShared::last_error`
    Error,
    /// Ended by the user or by the remote side
    Closed,
}

impl SessionState {
    /// Convert status to string for logs and UIs.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Error => "error",
            SessionState::Closed => "closed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Error | SessionState::Closed)
    }

    /// Whether `self -> to` is a legal edge of the state machine.
    pub fn can_transition_to(&self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Idle, Connecting)
                | (Idle, Closed)
                | (Connecting, Active)
                | (Connecting, Error)
                | (Connecting, Closed)
                | (Active, Active)
                | (Active, Error)
                | (Active, Closed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of asking the shared record to change state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// State changed
    Applied,
    /// Already in a terminal state that swallows the request
    Ignored,
    /// The edge does not exist
    Rejected,
}

/// Counters collected over the life of a session.
///
/// Plain atomics with `Relaxed` ordering: each counter is independent and only
/// read for reporting.
#[derive(Debug, Default)]
pub struct SessionMetrics {
    pub frames_captured: AtomicU64,
    pub frames_sent: AtomicU64,
    pub frames_muted: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub send_failures: AtomicU64,
    pub chunks_received: AtomicU64,
    pub chunks_scheduled: AtomicU64,
    pub chunks_dropped: AtomicU64,
    pub units_completed: AtomicU64,
    pub units_cancelled: AtomicU64,
    pub interruptions: AtomicU64,
}

impl SessionMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Copy every counter out for reporting.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            frames_captured: load(&self.frames_captured),
            frames_sent: load(&self.frames_sent),
            frames_muted: load(&self.frames_muted),
            bytes_sent: load(&self.bytes_sent),
            send_failures: load(&self.send_failures),
            chunks_received: load(&self.chunks_received),
            chunks_scheduled: load(&self.chunks_scheduled),
            chunks_dropped: load(&self.chunks_dropped),
            units_completed: load(&self.units_completed),
            units_cancelled: load(&self.units_cancelled),
            interruptions: load(&self.interruptions),
        }
    }
}

/// Point-in-time copy of [`SessionMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub frames_captured: u64,
    pub frames_sent: u64,
    pub frames_muted: u64,
    pub bytes_sent: u64,
    pub send_failures: u64,
    pub chunks_received: u64,
    pub chunks_scheduled: u64,
    pub chunks_dropped: u64,
    pub units_completed: u64,
    pub units_cancelled: u64,
    pub interruptions: u64,
}

/// The shared session record.
#[derive(Debug)]
pub struct SessionShared {
    /// Unique identifier used in every log line of this session
    pub id: Uuid,

    /// When the session object was created
    pub created_at: DateTime<Utc>,

    /// When the session became active (if it ever did)
    started_at: Mutex<Option<DateTime<Utc>>>,

    /// When the session reached `error` or `closed`
    ended_at: Mutex<Option<DateTime<Utc>>>,

    /// Current status, observable by UIs
    status: watch::Sender<SessionState>,

    /// Cause of the terminal `error` state
    last_error: Mutex<Option<SessionError>>,

    pub metrics: SessionMetrics,
}

impl SessionShared {
    pub fn new() -> Self {
        let (status, _) = watch::channel(SessionState::Idle);
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            started_at: Mutex::new(None),
            ended_at: Mutex::new(None),
            status,
            last_error: Mutex::new(None),
            metrics: SessionMetrics::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.status.borrow()
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.status.subscribe()
    }

    /// Move to `to` if the state machine allows it.
    ///
    /// Requests made from a terminal state are ignored rather than rejected, so
    /// late `closed`/`error` notifications after teardown are harmless.
    pub fn transition(&self, to: SessionState) -> Transition {
        let mut outcome = Transition::Rejected;
        self.status.send_if_modified(|current| {
            if current.can_transition_to(to) {
                let changed = *current != to;
                *current = to;
                outcome = Transition::Applied;
                changed
            } else {
                if current.is_terminal() {
                    outcome = Transition::Ignored;
                }
                false
            }
        });

        if outcome == Transition::Applied {
            let stamp = match to {
                SessionState::Active => Some(&self.started_at),
                SessionState::Error | SessionState::Closed => Some(&self.ended_at),
                _ => None,
            };
            if let Some(stamp) = stamp {
                stamp
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get_or_insert_with(Utc::now);
            }
        }
        outcome
    }

    /// Record the cause of a failure. The first fatal cause wins.
    pub fn record_error(&self, error: SessionError) {
        let mut slot = self.last_error.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    pub fn last_error(&self) -> Option<SessionError> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        *self.ended_at.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SessionShared {
    fn default() -> Self {
        Self::new()
    }
}
