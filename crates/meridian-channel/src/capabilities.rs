//! Worker capabilities negotiated at init time.

use std::collections::HashMap;

use crate::config::is_truthy;

/// Names of the capabilities the host recognizes.
pub mod names {
    /// Worker shuts itself down on WorkerTerminate.
    pub const HANDLES_WORKER_TERMINATE: &str = "HandlesWorkerTerminate";
    /// Worker honors InvocationCancel messages.
    pub const HANDLES_INVOCATION_CANCEL: &str = "HandlesInvocationCancel";
    /// Worker accepts batched function load requests.
    pub const SUPPORTS_LOAD_RESPONSE_COLLECTION: &str = "SupportsLoadResponseCollection";
    /// Worker supports shared-memory payload transfer.
    pub const SHARED_MEMORY_DATA_TRANSFER: &str = "SharedMemoryDataTransfer";
    /// Worker consumes raw HTTP body bytes.
    pub const RAW_HTTP_BODY_BYTES: &str = "RawHttpBodyBytes";
    /// Worker expects nullable value dictionaries for HTTP data.
    pub const USE_NULLABLE_VALUE_DICTIONARY_FOR_HTTP: &str = "UseNullableValueDictionaryForHttp";
}

/// The capability map a worker advertised in its init response.
///
/// Immutable once constructed; the channel freezes it in a write-once
/// cell after a successful init, so reads after `Initialized` always see
/// the same map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    values: HashMap<String, String>,
}

impl CapabilitySet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from negotiated name/value pairs.
    #[must_use]
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            values: pairs.into_iter().collect(),
        }
    }

    /// Gets a capability value by name.
    #[must_use]
    pub fn value(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// True if the capability is present with a truthy value.
    #[must_use]
    pub fn is_enabled(&self, name: &str) -> bool {
        self.value(name).is_some_and(is_truthy)
    }

    /// Number of advertised capabilities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if the worker advertised nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
