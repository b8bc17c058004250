//! Forwarding of worker log lines into host logging.

use meridian_proto::{LogCategory, LogLevel, RpcLog};
use tracing::{debug, error, info, warn};

/// Returns the level a worker line is forwarded at.
///
/// `Trace` is promoted to `Information`; other levels pass through.
#[must_use]
pub const fn effective_level(level: LogLevel) -> LogLevel {
    match level {
        LogLevel::Trace => LogLevel::Information,
        other => other,
    }
}

/// Routes one worker log line to the host's user or system log stream.
///
/// System lines go to the `worker::system` target, which the host's
/// console subscriber mirrors; user lines go to `worker::user`.
pub fn forward_worker_log(worker_id: &str, log: &RpcLog) {
    let level = effective_level(log.level);
    let invocation_id = log.invocation_id.map(|id| id.to_string());
    let invocation_id = invocation_id.as_deref().unwrap_or("");

    match log.log_category {
        LogCategory::System => match level {
            LogLevel::Trace | LogLevel::Debug => debug!(
                target: "worker::system",
                worker_id, invocation_id, category = %log.category, "{}", log.message
            ),
            LogLevel::Information => info!(
                target: "worker::system",
                worker_id, invocation_id, category = %log.category, "{}", log.message
            ),
            LogLevel::Warning => warn!(
                target: "worker::system",
                worker_id, invocation_id, category = %log.category, "{}", log.message
            ),
            LogLevel::Error | LogLevel::Critical => error!(
                target: "worker::system",
                worker_id, invocation_id, category = %log.category, "{}", log.message
            ),
        },
        LogCategory::User => match level {
            LogLevel::Trace | LogLevel::Debug => debug!(
                target: "worker::user",
                worker_id, invocation_id, category = %log.category, "{}", log.message
            ),
            LogLevel::Information => info!(
                target: "worker::user",
                worker_id, invocation_id, category = %log.category, "{}", log.message
            ),
            LogLevel::Warning => warn!(
                target: "worker::user",
                worker_id, invocation_id, category = %log.category, "{}", log.message
            ),
            LogLevel::Error | LogLevel::Critical => error!(
                target: "worker::user",
                worker_id, invocation_id, category = %log.category, "{}", log.message
            ),
        },
    }
}
