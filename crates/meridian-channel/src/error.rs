//! Error types for the worker channel.

use std::time::Duration;

use thiserror::Error;

use crate::channel::ChannelState;

/// Worker channel errors.
///
/// Invocation-scoped errors never poison the channel; channel-scoped
/// errors propagate to every waiting promise and transition the channel
/// to `Failed`. `Clone` lets one failure fan out to every waiting sink.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// A bounded wait expired.
    #[error("timed out after {timeout:?} waiting for {phase}")]
    Timeout {
        /// Protocol phase that was awaited.
        phase: &'static str,
        /// The configured bound.
        timeout: Duration,
    },

    /// An inbound message was illegal in the current state, or malformed.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The worker subprocess exited, refused to start, or failed init.
    #[error("worker process failure: {0}")]
    WorkerProcessFailure(String),

    /// A function failed to load; scoped to that function.
    #[error("function load failed for {function_id}: {reason}")]
    LoadFailure {
        /// The function that failed to load.
        function_id: String,
        /// Worker-supplied or host-side reason.
        reason: String,
    },

    /// An invocation failed; surfaced via its result sink only.
    #[error("invocation failed: {0}")]
    InvocationFailure(String),

    /// The worker rejected an environment reload.
    #[error("environment reload failed: {0}")]
    ReloadFailure(String),

    /// The caller or the channel requested cancellation.
    #[error("cancelled")]
    Cancelled,

    /// A verb was invoked in a state that forbids it.
    #[error("verb {verb} not permitted in state {state:?}")]
    InvalidState {
        /// The rejected verb.
        verb: &'static str,
        /// The state the channel was in.
        state: ChannelState,
    },

    /// New invocations are rejected while the channel drains.
    #[error("channel is draining")]
    ChannelDraining,
}

impl ChannelError {
    /// Creates a timeout error for a protocol phase.
    #[must_use]
    pub const fn timeout(phase: &'static str, timeout: Duration) -> Self {
        Self::Timeout { phase, timeout }
    }
}

/// Result type for channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;
