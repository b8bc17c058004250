//! Common types shared by all protocol messages.

use rkyv::{Archive, Deserialize, Serialize};

/// Opaque worker identifier, generated by the host.
pub type WorkerId = String;

/// Identifier for a single function invocation.
///
/// Backed by a UUID (128-bit). Unique within a channel's lifetime.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[rkyv(compare(PartialEq))]
pub struct InvocationId(pub [u8; 16]);

impl InvocationId {
    /// Creates a new random invocation ID.
    #[must_use]
    pub fn new() -> Self {
        Self(*uuid::Uuid::new_v4().as_bytes())
    }

    /// Creates an invocation ID from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes of this invocation ID.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Converts to a UUID for display purposes.
    #[must_use]
    pub const fn to_uuid(&self) -> uuid::Uuid {
        uuid::Uuid::from_bytes(self.0)
    }
}

impl Default for InvocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InvocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_uuid())
    }
}

impl From<uuid::Uuid> for InvocationId {
    fn from(uuid: uuid::Uuid) -> Self {
        Self(*uuid.as_bytes())
    }
}

/// Correlation ID for request/response matching on auxiliary exchanges
/// (the worker status probe).
///
/// Uses ULID format (128-bit, lexicographically sortable, monotonic).
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[rkyv(compare(PartialEq))]
pub struct CorrelationId(pub [u8; 16]);

impl CorrelationId {
    /// Creates a new correlation ID from the current timestamp.
    #[must_use]
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_bytes())
    }

    /// Creates a correlation ID from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Converts to a ULID for display purposes.
    #[must_use]
    pub fn to_ulid(&self) -> ulid::Ulid {
        ulid::Ulid::from_bytes(self.0)
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_ulid())
    }
}

/// Outcome reported by the worker for a protocol operation.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// The operation succeeded.
    Success,
    /// The operation failed.
    Failure,
    /// The operation was cancelled.
    Cancelled,
}

/// Status plus an optional error message, attached to worker responses.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StatusResult {
    /// The outcome.
    pub status: Status,
    /// Worker-supplied error message for failures.
    pub error_message: Option<String>,
}

impl StatusResult {
    /// Creates a success result.
    #[must_use]
    pub const fn success() -> Self {
        Self {
            status: Status::Success,
            error_message: None,
        }
    }

    /// Creates a failure result with a message.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: Status::Failure,
            error_message: Some(message.into()),
        }
    }

    /// Creates a cancelled result.
    #[must_use]
    pub const fn cancelled() -> Self {
        Self {
            status: Status::Cancelled,
            error_message: None,
        }
    }

    /// Returns true if the status is `Success`.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.status, Status::Success)
    }
}

/// Inline typed payload for an invocation input or output.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum TypedData {
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// UTF-8 string.
    String(String),
    /// JSON document, carried as its string form.
    Json(String),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit float.
    Double(f64),
}

impl TypedData {
    /// Returns the payload length in bytes for transfer-eligibility checks.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        match self {
            Self::Bytes(b) => b.len(),
            Self::String(s) | Self::Json(s) => s.len(),
            Self::Int(_) | Self::Double(_) => std::mem::size_of::<i64>(),
        }
    }

    /// Returns true if this payload may be carried in a shared-memory region.
    ///
    /// Only byte buffers and strings are transferable.
    #[must_use]
    pub const fn is_transferable(&self) -> bool {
        matches!(self, Self::Bytes(_) | Self::String(_))
    }
}

/// Payload type tag for a shared-memory region.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SharedMemoryDataType {
    /// Raw bytes.
    Bytes,
    /// UTF-8 string.
    String,
}

/// Descriptor for a payload carried out-of-band in a named memory region.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RpcSharedMemory {
    /// Name of the memory region.
    pub name: String,
    /// Byte offset of the payload within the region.
    pub offset: u64,
    /// Payload length in bytes.
    pub count: u64,
    /// Payload type tag.
    pub data_type: SharedMemoryDataType,
}

/// A value carried in a protocol message: inline or by shared-memory reference.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum RpcValue {
    /// Value carried inline in the message body.
    Inline(TypedData),
    /// Value carried in a shared-memory region.
    SharedMemory(RpcSharedMemory),
}

/// A named invocation input or output.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ParameterBinding {
    /// Parameter name.
    pub name: String,
    /// Parameter value.
    pub data: RpcValue,
}

impl ParameterBinding {
    /// Creates an inline binding.
    #[must_use]
    pub fn inline(name: impl Into<String>, data: TypedData) -> Self {
        Self {
            name: name.into(),
            data: RpcValue::Inline(data),
        }
    }

    /// Creates a shared-memory binding.
    #[must_use]
    pub fn shared_memory(name: impl Into<String>, region: RpcSharedMemory) -> Self {
        Self {
            name: name.into(),
            data: RpcValue::SharedMemory(region),
        }
    }
}

/// Correlation attributes carried with every invocation for telemetry.
///
/// Passed by value through the invocation path; never read from ambient
/// task-local state.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct TraceContext {
    /// W3C `traceparent` value.
    pub trace_parent: String,
    /// W3C `tracestate` value.
    pub trace_state: String,
    /// Additional correlation attributes.
    pub attributes: Vec<(String, String)>,
}

impl TraceContext {
    /// Creates a trace context from parent/state values.
    #[must_use]
    pub fn new(trace_parent: impl Into<String>, trace_state: impl Into<String>) -> Self {
        Self {
            trace_parent: trace_parent.into(),
            trace_state: trace_state.into(),
            attributes: Vec::new(),
        }
    }

    /// Sets or replaces an attribute.
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();

        if let Some(entry) = self.attributes.iter_mut().find(|(k, _)| k == &key) {
            entry.1 = value;
        } else {
            self.attributes.push((key, value));
        }
    }

    /// Gets an attribute value by key.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Metadata describing one user function, as registered with a worker.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FunctionMetadata {
    /// Stable function identifier.
    pub function_id: String,
    /// Human-readable function name.
    pub name: String,
    /// Language tag of the owning worker.
    pub language: String,
    /// Trigger descriptors.
    pub triggers: Vec<String>,
    /// Binding descriptors.
    pub bindings: Vec<String>,
    /// True if the function is disabled in configuration.
    pub disabled: bool,
}

impl FunctionMetadata {
    /// Creates enabled metadata with the given id, name and language.
    #[must_use]
    pub fn new(
        function_id: impl Into<String>,
        name: impl Into<String>,
        language: impl Into<String>,
    ) -> Self {
        Self {
            function_id: function_id.into(),
            name: name.into(),
            language: language.into(),
            triggers: Vec::new(),
            bindings: Vec::new(),
            disabled: false,
        }
    }

    /// Marks the function as disabled.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }
}

/// Severity of a worker log line.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
    /// Finest-grained diagnostic output.
    Trace,
    /// Debug output.
    Debug,
    /// Informational output.
    Information,
    /// Warning.
    Warning,
    /// Error.
    Error,
    /// Critical failure.
    Critical,
}

/// Routing class of a worker log line.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogCategory {
    /// Output of user function code.
    User,
    /// Worker runtime diagnostics, mirrored to the host console.
    System,
}
