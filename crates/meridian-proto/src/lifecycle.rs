//! Worker lifecycle messages: handshake, initialization, environment
//! reload, termination, status probe and log forwarding.

use rkyv::{Archive, Deserialize, Serialize};

use crate::types::{
    CorrelationId, FunctionMetadata, InvocationId, LogCategory, LogLevel, StatusResult, WorkerId,
};

/// Worker handshake, sent as the first message on the stream.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StartStream {
    /// Identifier of the worker opening the stream.
    pub worker_id: WorkerId,
}

/// Host request to initialize a freshly started worker.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WorkerInitRequest {
    /// Host version string.
    pub host_version: String,
    /// Directory the worker executable runs from.
    pub worker_directory: String,
    /// Directory of the loaded function app.
    pub function_app_directory: String,
    /// Negotiated protocol version.
    pub protocol_version: String,
    /// Capabilities offered by the host.
    pub capabilities: Vec<(String, String)>,
    /// True when the host runs in V2 compatibility mode.
    pub v2_compatibility: bool,
}

/// Worker reply to [`WorkerInitRequest`], carrying its capabilities.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WorkerInitResponse {
    /// Capabilities advertised by the worker. Frozen by the host on success.
    pub capabilities: Vec<(String, String)>,
    /// Init outcome.
    pub result: StatusResult,
}

impl WorkerInitResponse {
    /// Creates a successful response with the given capabilities.
    #[must_use]
    pub fn success(capabilities: Vec<(String, String)>) -> Self {
        Self {
            capabilities,
            result: StatusResult::success(),
        }
    }

    /// Creates a failed response with an error message.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            capabilities: Vec::new(),
            result: StatusResult::failure(message),
        }
    }
}

/// Host request to replace the worker's environment during specialization.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FunctionEnvironmentReloadRequest {
    /// Sanitized environment snapshot.
    pub environment_variables: Vec<(String, String)>,
    /// Function app directory after specialization.
    pub function_app_directory: String,
}

impl FunctionEnvironmentReloadRequest {
    /// Gets an environment value by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.environment_variables
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Worker reply to [`FunctionEnvironmentReloadRequest`].
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FunctionEnvironmentReloadResponse {
    /// Reload outcome.
    pub result: StatusResult,
}

/// Host request for the worker to shut down within a grace period.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerTerminate {
    /// Seconds the worker has to exit before it is killed.
    pub grace_period_secs: u64,
}

/// A log line emitted by the worker.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RpcLog {
    /// Invocation the line belongs to, if any.
    pub invocation_id: Option<InvocationId>,
    /// Logger category name.
    pub category: String,
    /// User/system routing class.
    pub log_category: LogCategory,
    /// Severity.
    pub level: LogLevel,
    /// Message text.
    pub message: String,
}

/// Function metadata discovered by the worker's own indexing.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WorkerMetadataResponse {
    /// Discovered function metadata.
    pub function_metadata: Vec<FunctionMetadata>,
    /// True if the worker defers to host-side metadata indexing.
    pub use_default_metadata_indexing: bool,
    /// Indexing outcome.
    pub result: StatusResult,
}

/// Lightweight round-trip probe request.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStatusRequest {
    /// Correlates the response to this request.
    pub request_id: CorrelationId,
}

/// Reply to [`WorkerStatusRequest`].
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStatusResponse {
    /// Correlation id echoed from the request.
    pub request_id: CorrelationId,
}
