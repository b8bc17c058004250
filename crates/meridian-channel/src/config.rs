//! Configuration types for the worker channel.

use std::path::PathBuf;
use std::time::Duration;

use meridian_core::{WorkerDescription, DEFAULT_TRANSFER_THRESHOLD};
use serde::Deserialize;

/// Environment variable enabling shared-memory data transfer.
pub const SHARED_MEMORY_ENV_VAR: &str = "FunctionsWorkerSharedMemoryDataTransferEnabled";

/// Environment variable enabling the dynamic-concurrency latency probe.
pub const DYNAMIC_CONCURRENCY_ENV_VAR: &str = "FunctionsWorkerDynamicConcurrencyEnabled";

/// Environment variable enabling trace-context enrichment.
pub const TELEMETRY_AGENT_ENV_VAR: &str = "APPLICATIONINSIGHTS_ENABLE_AGENT";

/// Environment variable enabling V2 compatibility mode.
pub const V2_COMPATIBILITY_ENV_VAR: &str = "FUNCTIONS_V2_COMPATIBILITY_MODE";

/// Worker channel configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    /// Worker executable description.
    pub worker: WorkerDescription,
    /// Host version reported in the init request.
    pub host_version: String,
    /// Host instance id attached to trace contexts.
    pub host_instance_id: String,
    /// Function app directory.
    pub function_app_directory: PathBuf,
    /// Protocol version negotiated with the worker.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    /// Per-phase timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Environment-derived feature toggles.
    #[serde(default)]
    pub features: FeatureFlags,
    /// Shared-memory transfer settings.
    #[serde(default)]
    pub shared_memory: SharedMemorySettings,
    /// Bound on invocations buffered per function before its load completes.
    #[serde(default = "default_invocation_buffer_capacity")]
    pub invocation_buffer_capacity: usize,
    /// Grace period granted to the worker on terminate.
    #[serde(with = "serde_duration_secs", default = "default_terminate_grace")]
    pub terminate_grace_period: Duration,
    /// Interval between latency probe round-trips.
    #[serde(with = "serde_duration_secs", default = "default_probe_interval")]
    pub probe_interval: Duration,
    /// Number of latency samples retained.
    #[serde(default = "default_latency_history_size")]
    pub latency_history_size: usize,
}

impl ChannelConfig {
    /// Creates a configuration with defaults for everything beyond the
    /// worker description and host identity.
    #[must_use]
    pub fn new(
        worker: WorkerDescription,
        host_version: impl Into<String>,
        host_instance_id: impl Into<String>,
        function_app_directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            worker,
            host_version: host_version.into(),
            host_instance_id: host_instance_id.into(),
            function_app_directory: function_app_directory.into(),
            protocol_version: default_protocol_version(),
            timeouts: TimeoutConfig::default(),
            features: FeatureFlags::default(),
            shared_memory: SharedMemorySettings::default(),
            invocation_buffer_capacity: default_invocation_buffer_capacity(),
            terminate_grace_period: default_terminate_grace(),
            probe_interval: default_probe_interval(),
            latency_history_size: default_latency_history_size(),
        }
    }
}

fn default_protocol_version() -> String {
    "1.0".to_owned()
}

const fn default_invocation_buffer_capacity() -> usize {
    128
}

const fn default_terminate_grace() -> Duration {
    Duration::from_secs(5)
}

const fn default_probe_interval() -> Duration {
    Duration::from_secs(10)
}

const fn default_latency_history_size() -> usize {
    100
}

/// Per-phase timeouts. Every protocol wait is bounded by one of these.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Bound on waiting for the worker's StartStream handshake.
    #[serde(with = "serde_duration_secs")]
    pub startup: Duration,
    /// Bound on waiting for the init response.
    #[serde(with = "serde_duration_secs")]
    pub initialization: Duration,
    /// Bound on waiting for the environment reload response.
    #[serde(with = "serde_duration_secs")]
    pub environment_reload: Duration,
    /// Bound on waiting for a function load batch; `None` is unbounded.
    #[serde(with = "serde_opt_duration_secs")]
    pub function_load: Option<Duration>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            startup: Duration::from_secs(60),
            initialization: Duration::from_secs(30),
            environment_reload: Duration::from_secs(30),
            function_load: None,
        }
    }
}

/// Feature toggles sourced from host environment variables.
///
/// Read once at the configuration edge; the channel itself never touches
/// ambient environment.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    /// Shared-memory transfer toggle (capability still required).
    pub shared_memory_data_transfer: bool,
    /// Starts the dynamic-concurrency latency probe.
    pub dynamic_concurrency: bool,
    /// Enables trace-context enrichment.
    pub telemetry_agent: bool,
    /// V2 compatibility mode, carried in the init request.
    pub v2_compatibility: bool,
}

impl FeatureFlags {
    /// Reads the toggles from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            shared_memory_data_transfer: env_truthy(SHARED_MEMORY_ENV_VAR),
            dynamic_concurrency: env_truthy(DYNAMIC_CONCURRENCY_ENV_VAR),
            telemetry_agent: env_truthy(TELEMETRY_AGENT_ENV_VAR),
            v2_compatibility: env_truthy(V2_COMPATIBILITY_ENV_VAR),
        }
    }
}

/// Shared-memory transfer settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SharedMemorySettings {
    /// Payload size above which eligible inputs go out-of-band.
    pub transfer_threshold: usize,
}

impl Default for SharedMemorySettings {
    fn default() -> Self {
        Self {
            transfer_threshold: DEFAULT_TRANSFER_THRESHOLD,
        }
    }
}

/// Returns true for "1", "true", "yes", "on" (case-insensitive).
#[must_use]
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_truthy(name: &str) -> bool {
    std::env::var(name).map(|v| is_truthy(&v)).unwrap_or(false)
}

/// Serde helper for Duration as seconds.
mod serde_duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serde helper for Option<Duration> as seconds.
mod serde_opt_duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn test_config() -> ChannelConfig {
        ChannelConfig::new(
            WorkerDescription::new("node", "/opt/workers/node", "/usr/bin/node"),
            "4.0.0",
            "host-1",
            "/home/site/wwwroot",
        )
    }

    #[test]
    fn defaults() {
        let config = test_config();
        assert_eq!(config.protocol_version, "1.0");
        assert_eq!(config.invocation_buffer_capacity, 128);
        assert_eq!(config.terminate_grace_period, Duration::from_secs(5));
        assert_eq!(config.timeouts.startup, Duration::from_secs(60));
        assert!(config.timeouts.function_load.is_none());
        assert!(!config.features.shared_memory_data_transfer);
    }

    #[test]
    fn truthy_values() {
        assert!(is_truthy("1"));
        assert!(is_truthy("true"));
        assert!(is_truthy("TRUE"));
        assert!(is_truthy(" yes "));
        assert!(!is_truthy("0"));
        assert!(!is_truthy(""));
        assert!(!is_truthy("false"));
    }

    #[test]
    fn timeout_config_from_json() {
        let timeouts: TimeoutConfig =
            serde_json::from_str(r#"{"startup": 5, "function_load": 10}"#).unwrap();
        assert_eq!(timeouts.startup, Duration::from_secs(5));
        assert_eq!(timeouts.function_load, Some(Duration::from_secs(10)));
        assert_eq!(timeouts.initialization, Duration::from_secs(30));
    }
}
