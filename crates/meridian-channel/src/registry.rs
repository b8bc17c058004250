//! In-flight invocation tracking.

use std::time::Instant;

use dashmap::DashMap;
use meridian_proto::{InvocationId, ParameterBinding, TypedData};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ChannelError;

/// Terminal outcome of one invocation, delivered on its result sink.
#[derive(Debug)]
pub enum InvocationOutcome {
    /// The function ran to completion.
    Success {
        /// Output bindings, shared-memory payloads already copied out.
        outputs: Vec<ParameterBinding>,
        /// Function return value, if any.
        return_value: Option<TypedData>,
    },
    /// The invocation failed.
    Failure(ChannelError),
    /// The invocation was cancelled.
    Cancelled,
}

/// Handles returned when an invocation is registered.
pub struct RegisteredInvocation {
    /// Resolves exactly once with the invocation's terminal outcome.
    pub receiver: oneshot::Receiver<InvocationOutcome>,
    /// Fires when the invocation completes; stops per-invocation watchers.
    pub completed: CancellationToken,
}

struct InFlight {
    function_id: String,
    sink: oneshot::Sender<InvocationOutcome>,
    completed: CancellationToken,
    started_at: Instant,
}

/// Registry of in-flight invocations for one channel.
///
/// Exactly-once signalling holds by construction: an entry is removed
/// atomically and its sink moved out before the signal is sent, so a
/// second completion attempt finds nothing.
pub struct InvocationRegistry {
    entries: DashMap<InvocationId, InFlight>,
    count: watch::Sender<usize>,
}

impl InvocationRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            count: watch::Sender::new(0),
        }
    }

    /// Registers an invocation and returns its completion handles.
    ///
    /// Must be called before the request is published so a racing
    /// response cannot miss its sink. Invocation ids are unique within a
    /// channel's lifetime; a duplicate is rejected.
    pub fn register(
        &self,
        invocation_id: InvocationId,
        function_id: impl Into<String>,
    ) -> Result<RegisteredInvocation, ChannelError> {
        use dashmap::mapref::entry::Entry;

        let (sink, receiver) = oneshot::channel();
        let completed = CancellationToken::new();

        match self.entries.entry(invocation_id) {
            Entry::Occupied(_) => Err(ChannelError::InvocationFailure(format!(
                "duplicate invocation id {invocation_id}"
            ))),
            Entry::Vacant(entry) => {
                entry.insert(InFlight {
                    function_id: function_id.into(),
                    sink,
                    completed: completed.clone(),
                    started_at: Instant::now(),
                });
                self.count.send_replace(self.entries.len());
                Ok(RegisteredInvocation {
                    receiver,
                    completed,
                })
            }
        }
    }

    /// Completes an invocation, signalling its sink exactly once.
    ///
    /// Returns false if the invocation is not (or no longer) registered.
    pub fn complete(&self, invocation_id: &InvocationId, outcome: InvocationOutcome) -> bool {
        let Some((_, entry)) = self.entries.remove(invocation_id) else {
            return false;
        };
        self.count.send_replace(self.entries.len());

        debug!(
            invocation_id = %invocation_id,
            function_id = %entry.function_id,
            elapsed_ms = entry.started_at.elapsed().as_millis() as u64,
            "invocation completed"
        );

        entry.completed.cancel();
        // The caller may have dropped its receiver; that is not an error.
        let _ = entry.sink.send(outcome);
        true
    }

    /// True iff the invocation is registered.
    #[must_use]
    pub fn is_executing(&self, invocation_id: &InvocationId) -> bool {
        self.entries.contains_key(invocation_id)
    }

    /// Function id of a registered invocation.
    #[must_use]
    pub fn function_id(&self, invocation_id: &InvocationId) -> Option<String> {
        self.entries
            .get(invocation_id)
            .map(|entry| entry.function_id.clone())
    }

    /// Completion token of a registered invocation, for watcher tasks.
    #[must_use]
    pub fn completion_token(&self, invocation_id: &InvocationId) -> Option<CancellationToken> {
        self.entries
            .get(invocation_id)
            .map(|entry| entry.completed.clone())
    }

    /// Fails every in-flight invocation with the given error and clears
    /// the registry. Applying this twice is equivalent to once.
    pub fn fail_all(&self, error: &ChannelError) {
        for invocation_id in self.active_ids() {
            self.complete(&invocation_id, InvocationOutcome::Failure(error.clone()));
        }
    }

    /// Cancels every in-flight invocation and clears the registry.
    pub fn cancel_all(&self) {
        for invocation_id in self.active_ids() {
            self.complete(&invocation_id, InvocationOutcome::Cancelled);
        }
    }

    /// Resolves once the registry is empty.
    pub async fn wait_empty(&self) {
        let mut receiver = self.count.subscribe();
        loop {
            if *receiver.borrow_and_update() == 0 {
                return;
            }
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }

    /// Number of in-flight invocations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no invocations are in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn active_ids(&self) -> Vec<InvocationId> {
        self.entries.iter().map(|entry| *entry.key()).collect()
    }
}

impl Default for InvocationRegistry {
    fn default() -> Self {
        Self::new()
    }
}
