//! Invocation messages.

use rkyv::{Archive, Deserialize, Serialize};

use crate::types::{InvocationId, ParameterBinding, StatusResult, TraceContext, TypedData};

/// Host request to execute one function invocation.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InvocationRequest {
    /// Invocation identifier, unique within the channel's lifetime.
    pub invocation_id: InvocationId,
    /// Target function identifier.
    pub function_id: String,
    /// Correlation attributes for telemetry.
    pub trace_context: TraceContext,
    /// Ordered input bindings.
    pub inputs: Vec<ParameterBinding>,
}

/// Worker reply carrying the outcome of one invocation.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InvocationResponse {
    /// Invocation identifier echoed from the request.
    pub invocation_id: InvocationId,
    /// Invocation outcome.
    pub result: StatusResult,
    /// Output bindings.
    pub outputs: Vec<ParameterBinding>,
    /// Function return value, if any.
    pub return_value: Option<TypedData>,
}

impl InvocationResponse {
    /// Creates a successful response with no outputs.
    #[must_use]
    pub const fn success(invocation_id: InvocationId) -> Self {
        Self {
            invocation_id,
            result: StatusResult::success(),
            outputs: Vec::new(),
            return_value: None,
        }
    }

    /// Creates a failed response with an error message.
    #[must_use]
    pub fn failure(invocation_id: InvocationId, message: impl Into<String>) -> Self {
        Self {
            invocation_id,
            result: StatusResult::failure(message),
            outputs: Vec::new(),
            return_value: None,
        }
    }

    /// Creates a cancelled response.
    #[must_use]
    pub const fn cancelled(invocation_id: InvocationId) -> Self {
        Self {
            invocation_id,
            result: StatusResult::cancelled(),
            outputs: Vec::new(),
            return_value: None,
        }
    }

    /// Adds an output binding.
    #[must_use]
    pub fn with_output(mut self, output: ParameterBinding) -> Self {
        self.outputs.push(output);
        self
    }
}

/// Host request to cancel an in-flight invocation.
///
/// Only sent when the worker advertised the invocation-cancel capability.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvocationCancel {
    /// Invocation to cancel.
    pub invocation_id: InvocationId,
}
