//! Function load tracking and pre-load invocation buffering.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use dashmap::DashMap;
use meridian_proto::{FunctionLoadResponse, FunctionMetadata, InvocationRequest};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::ChannelError;

/// Load status of one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    /// Load request not yet acknowledged.
    Pending,
    /// Worker acknowledged the load.
    Loaded,
    /// Worker rejected the load.
    Failed,
}

/// An invocation held back until its function finishes loading.
pub struct BufferedInvocation {
    /// The fully built request, ready to publish.
    pub request: InvocationRequest,
    /// The caller's cancellation token, checked again at flush time.
    pub cancellation: CancellationToken,
    /// Local completion deadline, armed when the request is published.
    pub deadline: Option<std::time::Duration>,
}

/// Where an invocation goes, decided atomically against load state.
pub enum InvocationRoute {
    /// Function still pending; the invocation was buffered.
    Buffered,
    /// Function loaded; publish the request now.
    Dispatch(BufferedInvocation),
    /// Function failed to load, buffer overflowed, or no entry exists.
    Rejected(ChannelError),
}

/// What the channel must do after a load response is applied.
pub enum LoadAction {
    /// The function loaded; publish these buffered requests in order.
    Flush(Vec<BufferedInvocation>),
    /// The function failed to load; fail these buffered invocations.
    FailBuffered {
        /// Worker-supplied failure reason.
        reason: String,
        /// The buffered invocations to fail.
        buffered: Vec<BufferedInvocation>,
    },
}

/// Snapshot of one function's load status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionLoadStatus {
    /// Function identifier.
    pub function_id: String,
    /// Current state.
    pub state: LoadState,
    /// Failure reason, for failed loads.
    pub error: Option<String>,
}

struct LoadEntry {
    metadata: FunctionMetadata,
    state: LoadState,
    error: Option<String>,
    buffered: VecDeque<BufferedInvocation>,
}

/// Tracks function load state for one channel.
///
/// Invariant: an invocation is buffered only while its function is
/// `Pending`; once `Loaded` the buffer flushes in arrival order, once
/// `Failed` every buffered invocation fails with the load error.
pub struct FunctionLoadManager {
    entries: DashMap<String, LoadEntry>,
    order: Mutex<Vec<String>>,
    buffer_capacity: usize,
    buffers_ready: AtomicBool,
    pending: watch::Sender<usize>,
    worker_metadata: Mutex<Option<WorkerIndexedMetadata>>,
}

/// Function metadata supplied by the worker's own indexing. Advisory.
#[derive(Debug, Clone)]
pub struct WorkerIndexedMetadata {
    /// Discovered metadata records.
    pub functions: Vec<FunctionMetadata>,
    /// True if the worker defers to host-side indexing.
    pub use_default_metadata_indexing: bool,
}

impl FunctionLoadManager {
    /// Creates a manager with the given per-function buffer bound.
    #[must_use]
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(Vec::new()),
            buffer_capacity,
            buffers_ready: AtomicBool::new(false),
            pending: watch::Sender::new(0),
            worker_metadata: Mutex::new(None),
        }
    }

    /// Creates a pending entry for every metadata record.
    ///
    /// Until this runs the channel is not ready for invocations.
    pub fn setup_buffers(&self, metadata: Vec<FunctionMetadata>) {
        let mut order = self
            .order
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        for record in metadata {
            let function_id = record.function_id.clone();
            if self.entries.contains_key(&function_id) {
                continue;
            }
            order.push(function_id.clone());
            self.entries.insert(
                function_id,
                LoadEntry {
                    metadata: record,
                    state: LoadState::Pending,
                    error: None,
                    buffered: VecDeque::new(),
                },
            );
        }
        drop(order);

        self.buffers_ready.store(true, Ordering::Release);
        self.pending.send_replace(self.pending_count());
    }

    /// True once invocation buffers exist for every registered function.
    #[must_use]
    pub fn buffers_ready(&self) -> bool {
        self.buffers_ready.load(Ordering::Acquire)
    }

    /// True if at least one function loaded successfully.
    #[must_use]
    pub fn any_loaded(&self) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.state == LoadState::Loaded)
    }

    /// Returns metadata in load order: enabled functions first, disabled
    /// last, ties broken by insertion order. Disabled functions are
    /// still loaded so they appear in status output.
    #[must_use]
    pub fn load_order(&self) -> Vec<FunctionMetadata> {
        let order = self
            .order
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let metadata_of = |function_id: &String| {
            self.entries
                .get(function_id)
                .map(|entry| entry.metadata.clone())
        };

        let enabled = order
            .iter()
            .filter_map(&metadata_of)
            .filter(|m| !m.disabled);
        let disabled = order.iter().filter_map(&metadata_of).filter(|m| m.disabled);

        enabled.chain(disabled).collect()
    }

    /// Current state of one function.
    #[must_use]
    pub fn state_of(&self, function_id: &str) -> Option<LoadState> {
        self.entries.get(function_id).map(|entry| entry.state)
    }

    /// Status snapshot for every registered function, in insertion order.
    #[must_use]
    pub fn statuses(&self) -> Vec<FunctionLoadStatus> {
        let order = self
            .order
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        order
            .iter()
            .filter_map(|function_id| {
                self.entries.get(function_id).map(|entry| FunctionLoadStatus {
                    function_id: function_id.clone(),
                    state: entry.state,
                    error: entry.error.clone(),
                })
            })
            .collect()
    }

    /// Routes an invocation against the function's load state.
    ///
    /// The decision happens under the entry's lock, so it cannot race a
    /// concurrent load response flushing the buffer.
    pub fn route_invocation(
        &self,
        function_id: &str,
        invocation: BufferedInvocation,
    ) -> InvocationRoute {
        let Some(mut entry) = self.entries.get_mut(function_id) else {
            return InvocationRoute::Rejected(ChannelError::InvocationFailure(format!(
                "unknown function {function_id}"
            )));
        };

        match entry.state {
            LoadState::Loaded => InvocationRoute::Dispatch(invocation),
            LoadState::Failed => InvocationRoute::Rejected(ChannelError::LoadFailure {
                function_id: function_id.to_owned(),
                reason: entry
                    .error
                    .clone()
                    .unwrap_or_else(|| "function load failed".to_owned()),
            }),
            LoadState::Pending => {
                if entry.buffered.len() >= self.buffer_capacity {
                    return InvocationRoute::Rejected(ChannelError::LoadFailure {
                        function_id: function_id.to_owned(),
                        reason: format!(
                            "invocation buffer full ({} queued before load completed)",
                            self.buffer_capacity
                        ),
                    });
                }
                entry.buffered.push_back(invocation);
                InvocationRoute::Buffered
            }
        }
    }

    /// Applies a load response and returns the follow-up action.
    ///
    /// Returns `None` for unknown functions or entries already terminal;
    /// the caller logs and drops those.
    pub fn apply_response(&self, response: &FunctionLoadResponse) -> Option<LoadAction> {
        let action = {
            let mut entry = self.entries.get_mut(&response.function_id)?;
            if entry.state != LoadState::Pending {
                return None;
            }

            if response.result.is_success() {
                entry.state = LoadState::Loaded;
                LoadAction::Flush(entry.buffered.drain(..).collect())
            } else {
                let reason = response
                    .result
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "function load failed".to_owned());
                entry.state = LoadState::Failed;
                entry.error = Some(reason.clone());
                LoadAction::FailBuffered {
                    reason,
                    buffered: entry.buffered.drain(..).collect(),
                }
            }
        };

        self.pending.send_replace(self.pending_count());
        Some(action)
    }

    /// Marks every still-pending function failed (load batch expiry) and
    /// returns the buffered invocations to fail, per function.
    pub fn fail_pending(&self, reason: &str) -> Vec<(String, Vec<BufferedInvocation>)> {
        let mut failed = Vec::new();

        for mut entry in self.entries.iter_mut() {
            if entry.state == LoadState::Pending {
                entry.state = LoadState::Failed;
                entry.error = Some(reason.to_owned());
                let buffered: Vec<BufferedInvocation> = entry.buffered.drain(..).collect();
                failed.push((entry.key().clone(), buffered));
            }
        }

        self.pending.send_replace(self.pending_count());
        failed
    }

    /// Number of functions still awaiting a load response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.state == LoadState::Pending)
            .count()
    }

    /// Resolves once no function is pending load.
    pub async fn wait_all_terminal(&self) {
        let mut receiver = self.pending.subscribe();
        loop {
            if *receiver.borrow_and_update() == 0 {
                return;
            }
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }

    /// Records metadata the worker discovered through its own indexing.
    pub fn record_worker_metadata(&self, metadata: WorkerIndexedMetadata) {
        *self
            .worker_metadata
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(metadata);
    }

    /// Worker-supplied metadata, if any arrived.
    #[must_use]
    pub fn worker_metadata(&self) -> Option<WorkerIndexedMetadata> {
        self.worker_metadata
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Number of registered functions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no functions are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_proto::{InvocationId, TraceContext};

    fn metadata(function_id: &str) -> FunctionMetadata {
        FunctionMetadata::new(function_id, function_id, "node")
    }

    fn buffered(function_id: &str) -> BufferedInvocation {
        BufferedInvocation {
            request: InvocationRequest {
                invocation_id: InvocationId::new(),
                function_id: function_id.to_owned(),
                trace_context: TraceContext::default(),
                inputs: Vec::new(),
            },
            cancellation: CancellationToken::new(),
            deadline: None,
        }
    }

    #[test]
    fn setup_creates_pending_entries() {
        let manager = FunctionLoadManager::new(8);
        assert!(!manager.buffers_ready());

        manager.setup_buffers(vec![metadata("js1"), metadata("js2")]);

        assert!(manager.buffers_ready());
        assert_eq!(manager.len(), 2);
        assert_eq!(manager.state_of("js1"), Some(LoadState::Pending));
        assert_eq!(manager.pending_count(), 2);
    }

    #[test]
    fn load_order_puts_disabled_last() {
        let manager = FunctionLoadManager::new(8);
        manager.setup_buffers(vec![
            metadata("aDisabled").disabled(),
            metadata("js1"),
            metadata("js2"),
        ]);

        let order = manager.load_order();
        let ids: Vec<&str> = order.iter().map(|m| m.function_id.as_str()).collect();
        assert_eq!(ids, vec!["js1", "js2", "aDisabled"]);
    }

    #[test]
    fn successful_response_flushes_buffer_in_order() {
        let manager = FunctionLoadManager::new(8);
        manager.setup_buffers(vec![metadata("js1")]);

        let first = buffered("js1");
        let first_id = first.request.invocation_id;
        let second = buffered("js1");
        let second_id = second.request.invocation_id;

        assert!(matches!(
            manager.route_invocation("js1", first),
            InvocationRoute::Buffered
        ));
        assert!(matches!(
            manager.route_invocation("js1", second),
            InvocationRoute::Buffered
        ));

        let action = manager
            .apply_response(&FunctionLoadResponse::success("js1"))
            .unwrap();

        match action {
            LoadAction::Flush(flushed) => {
                assert_eq!(flushed.len(), 2);
                assert_eq!(flushed[0].request.invocation_id, first_id);
                assert_eq!(flushed[1].request.invocation_id, second_id);
            }
            LoadAction::FailBuffered { .. } => panic!("expected Flush"),
        }

        assert_eq!(manager.state_of("js1"), Some(LoadState::Loaded));
        assert!(manager.any_loaded());
        assert_eq!(manager.pending_count(), 0);
    }

    #[test]
    fn failed_response_fails_buffer() {
        let manager = FunctionLoadManager::new(8);
        manager.setup_buffers(vec![metadata("js1")]);
        assert!(matches!(
            manager.route_invocation("js1", buffered("js1")),
            InvocationRoute::Buffered
        ));

        let action = manager
            .apply_response(&FunctionLoadResponse::failure("js1", "missing module"))
            .unwrap();

        match action {
            LoadAction::FailBuffered { reason, buffered } => {
                assert_eq!(reason, "missing module");
                assert_eq!(buffered.len(), 1);
            }
            LoadAction::Flush(_) => panic!("expected FailBuffered"),
        }

        let status = &manager.statuses()[0];
        assert_eq!(status.state, LoadState::Failed);
        assert_eq!(status.error.as_deref(), Some("missing module"));
    }

    #[test]
    fn response_for_unknown_or_terminal_function_is_dropped() {
        let manager = FunctionLoadManager::new(8);
        manager.setup_buffers(vec![metadata("js1")]);

        assert!(manager
            .apply_response(&FunctionLoadResponse::success("unknown"))
            .is_none());

        manager
            .apply_response(&FunctionLoadResponse::success("js1"))
            .unwrap();
        assert!(manager
            .apply_response(&FunctionLoadResponse::success("js1"))
            .is_none());
    }

    #[test]
    fn buffer_bound_is_enforced() {
        let manager = FunctionLoadManager::new(2);
        manager.setup_buffers(vec![metadata("js1")]);

        for _ in 0..2 {
            assert!(matches!(
                manager.route_invocation("js1", buffered("js1")),
                InvocationRoute::Buffered
            ));
        }

        let overflow = manager.route_invocation("js1", buffered("js1"));
        assert!(matches!(
            overflow,
            InvocationRoute::Rejected(ChannelError::LoadFailure { .. })
        ));
    }

    #[test]
    fn routing_after_terminal_states() {
        let manager = FunctionLoadManager::new(2);
        manager.setup_buffers(vec![metadata("loaded"), metadata("broken")]);
        manager
            .apply_response(&FunctionLoadResponse::success("loaded"))
            .unwrap();
        manager
            .apply_response(&FunctionLoadResponse::failure("broken", "no exports"))
            .unwrap();

        assert!(matches!(
            manager.route_invocation("loaded", buffered("loaded")),
            InvocationRoute::Dispatch(_)
        ));
        assert!(matches!(
            manager.route_invocation("broken", buffered("broken")),
            InvocationRoute::Rejected(ChannelError::LoadFailure { .. })
        ));
        assert!(matches!(
            manager.route_invocation("missing", buffered("missing")),
            InvocationRoute::Rejected(ChannelError::InvocationFailure(_))
        ));
    }

    #[test]
    fn fail_pending_marks_and_returns_buffers() {
        let manager = FunctionLoadManager::new(8);
        manager.setup_buffers(vec![metadata("js1"), metadata("js2")]);
        assert!(matches!(
            manager.route_invocation("js1", buffered("js1")),
            InvocationRoute::Buffered
        ));

        manager
            .apply_response(&FunctionLoadResponse::success("js2"))
            .unwrap();

        let failed = manager.fail_pending("load batch timed out");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, "js1");
        assert_eq!(failed[0].1.len(), 1);
        assert_eq!(manager.state_of("js1"), Some(LoadState::Failed));
        assert_eq!(manager.state_of("js2"), Some(LoadState::Loaded));
    }
}
