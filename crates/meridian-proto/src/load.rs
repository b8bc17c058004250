//! Function load messages.

use rkyv::{Archive, Deserialize, Serialize};

use crate::types::{FunctionMetadata, StatusResult};

/// Host request to load one function into the worker.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FunctionLoadRequest {
    /// Function identifier.
    pub function_id: String,
    /// Function metadata.
    pub metadata: FunctionMetadata,
}

impl FunctionLoadRequest {
    /// Creates a load request from metadata.
    #[must_use]
    pub fn new(metadata: FunctionMetadata) -> Self {
        Self {
            function_id: metadata.function_id.clone(),
            metadata,
        }
    }
}

/// Batched form of [`FunctionLoadRequest`], used when the worker
/// advertises collection support.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FunctionLoadRequestCollection {
    /// The batched requests, in load order.
    pub requests: Vec<FunctionLoadRequest>,
}

/// Worker reply for one function load.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FunctionLoadResponse {
    /// Function identifier echoed from the request.
    pub function_id: String,
    /// Load outcome.
    pub result: StatusResult,
}

impl FunctionLoadResponse {
    /// Creates a successful load response.
    #[must_use]
    pub fn success(function_id: impl Into<String>) -> Self {
        Self {
            function_id: function_id.into(),
            result: StatusResult::success(),
        }
    }

    /// Creates a failed load response.
    #[must_use]
    pub fn failure(function_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            function_id: function_id.into(),
            result: StatusResult::failure(message),
        }
    }
}

/// Batched form of [`FunctionLoadResponse`].
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FunctionLoadResponseCollection {
    /// Per-function responses.
    pub responses: Vec<FunctionLoadResponse>,
}
