//! # Error Handling
//!
//! Error taxonomy for a voice session. Every failure a component can report is one
//! variant of [`SessionError`], so the lifecycle manager can decide in one place
//! whether an error ends the call or is recovered locally.
//!
//! ## Error Categories:
//! - **Device**: microphone or speaker could not be acquired (fatal, never retried)
//! - **Transport**: the connection to the remote agent failed to open, backed up, or closed
//! - **Remote**: the agent itself reported an error
//! - **MalformedAudio**: one inbound chunk could not be decoded (dropped, session continues)
//! - **SchedulingInvariantViolation**: an internal bug in the playback timeline (fatal)
//!
//! ## Propagation:
//! Fatal errors travel up to the lifecycle manager, which tears the session down and
//! keeps the cause for the UI. Only `MalformedAudio` is handled where it happens.

use std::fmt;

/// Which of the two audio devices an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    /// Microphone, owned by the capture pipeline
    Input,
    /// Speaker, owned by the playback scheduler
    Output,
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceRole::Input => write!(f, "input"),
            DeviceRole::Output => write!(f, "output"),
        }
    }
}

/// Errors produced anywhere in the voice session.
///
/// ## Why Clone:
/// The same cause is stored in the shared session record (for the UI) and also
/// delivered through the event channel, so the error has to be cheap to duplicate.
/// All payloads are plain strings for that reason.
///
/// ## Usage Example:
/// ```rust
/// use voice_duplex::error::{DeviceRole, SessionError};
///
/// let err = SessionError::DeviceUnavailable {
///     role: DeviceRole::Input,
///     reason: "permission denied".to_string(),
/// };
/// assert!(err.is_capture_unavailable());
/// assert!(err.is_fatal());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// A device could not be opened or failed while running.
    /// With `role == Input` this is the "capture unavailable" condition.
    DeviceUnavailable { role: DeviceRole, reason: String },

    /// The connection to the remote agent could not be established
    TransportOpenFailed(String),

    /// The outbound queue is full; frames would be dropped
    TransportBackpressure { queued: usize },

    /// The connection went away (socket error, or sending on a closed handle)
    TransportClosed(String),

    /// The remote agent reported an error event
    Remote(String),

    /// An audio buffer could not be decoded
    MalformedAudio(String),

    /// The playback timeline reached a state that should be impossible
    SchedulingInvariantViolation(String),

    /// A lifecycle operation was requested from a state that does not allow it
    InvalidTransition { from: String, to: String },

    /// Configuration file or environment variable problems
    Config(String),
}

impl SessionError {
    /// Shorthand for an input-device failure.
    pub fn capture_unavailable(reason: impl Into<String>) -> Self {
        SessionError::DeviceUnavailable {
            role: DeviceRole::Input,
            reason: reason.into(),
        }
    }

    /// Shorthand for an output-device failure.
    pub fn playback_unavailable(reason: impl Into<String>) -> Self {
        SessionError::DeviceUnavailable {
            role: DeviceRole::Output,
            reason: reason.into(),
        }
    }

    /// True when the microphone could not be acquired or stopped delivering frames.
    pub fn is_capture_unavailable(&self) -> bool {
        matches!(
            self,
            SessionError::DeviceUnavailable {
                role: DeviceRole::Input,
                ..
            }
        )
    }

    /// Whether this error ends the session.
    ///
    /// One bad inbound chunk must not kill an otherwise healthy call, so
    /// `MalformedAudio` is the only recoverable variant.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SessionError::MalformedAudio(_))
    }

    /// Machine-readable error code, used in log fields and by UIs.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::DeviceUnavailable { .. } => "device_unavailable",
            SessionError::TransportOpenFailed(_) => "transport_open_failed",
            SessionError::TransportBackpressure { .. } => "transport_backpressure",
            SessionError::TransportClosed(_) => "transport_closed",
            SessionError::Remote(_) => "remote_error",
            SessionError::MalformedAudio(_) => "malformed_audio",
            SessionError::SchedulingInvariantViolation(_) => "scheduling_invariant_violation",
            SessionError::InvalidTransition { .. } => "invalid_transition",
            SessionError::Config(_) => "config_error",
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::DeviceUnavailable { role, reason } => {
                write!(f, "Audio {} device unavailable: {}", role, reason)
            }
            SessionError::TransportOpenFailed(msg) => write!(f, "Transport open failed: {}", msg),
            SessionError::TransportBackpressure { queued } => {
                write!(f, "Transport backpressure: {} frames already queued", queued)
            }
            SessionError::TransportClosed(msg) => write!(f, "Transport closed: {}", msg),
            SessionError::Remote(msg) => write!(f, "Remote agent error: {}", msg),
            SessionError::MalformedAudio(msg) => write!(f, "Malformed audio: {}", msg),
            SessionError::SchedulingInvariantViolation(msg) => {
                write!(f, "Scheduling invariant violated: {}", msg)
            }
            SessionError::InvalidTransition { from, to } => {
                write!(f, "Invalid session transition: {} -> {}", from, to)
            }
            SessionError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for SessionError {}

/// Configuration loading failures surface as `SessionError::Config`.
impl From<config::ConfigError> for SessionError {
    fn from(err: config::ConfigError) -> Self {
        SessionError::Config(err.to_string())
    }
}

/// Shorthand for `Result<T, SessionError>`.
pub type SessionResult<T> = Result<T, SessionError>;
