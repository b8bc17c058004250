//! The Meridian worker channel.
//!
//! A [`WorkerChannel`] owns one language-worker subprocess and one
//! bidirectional RPC stream, and exposes the verbs the host dispatcher
//! uses to drive it: start, load functions, invoke, cancel, reload
//! environment, drain, terminate. Channels run in parallel across
//! workers but are logically single-threaded internally: inbound
//! messages are handed to a per-channel pump task and every protocol
//! wait is bounded by a configured timeout.

mod capabilities;
mod channel;
mod config;
mod environment;
mod error;
mod functions;
mod logs;
mod metrics;
mod probe;
mod registry;

pub use capabilities::{names as capability_names, CapabilitySet};
pub use channel::{
    ChannelServices, ChannelState, InvocationContext, InvocationInput, WorkerChannel,
};
pub use config::{
    is_truthy, ChannelConfig, FeatureFlags, SharedMemorySettings, TimeoutConfig,
    DYNAMIC_CONCURRENCY_ENV_VAR, SHARED_MEMORY_ENV_VAR, TELEMETRY_AGENT_ENV_VAR,
    V2_COMPATIBILITY_ENV_VAR,
};
pub use environment::{
    sanitize_environment, APPLICATION_DIRECTORY_KEY, WORKER_DIRECTORY_KEY,
};
pub use error::{ChannelError, Result};
pub use functions::{FunctionLoadStatus, LoadState, WorkerIndexedMetadata};
pub use logs::{effective_level, forward_worker_log};
pub use metrics::{markers, phases, MetricEvent, MetricsSink, NullMetrics, RecordingMetrics};
pub use probe::LatencyHistory;
pub use registry::{InvocationOutcome, InvocationRegistry, RegisteredInvocation};
