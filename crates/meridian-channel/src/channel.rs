//! The worker channel: one worker subprocess, one RPC stream, and the
//! verbs the host uses to drive them.
//!
//! Control flow is logically single-threaded per channel: verbs mutate
//! state behind short locks, inbound messages are handed off to the
//! channel's pump task by the bus, and every protocol wait is a oneshot
//! bounded by a configured timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::time::{Duration, Instant};

use meridian_core::{
    BusEvent, Direction, FunctionDataCache, MessageBus, ProcessSupervisor, SharedMemoryManager,
    Subscription, WorkerProcess,
};
use meridian_proto::{
    CorrelationId, FunctionEnvironmentReloadRequest, FunctionLoadRequest,
    FunctionLoadRequestCollection, FunctionLoadResponse, InvocationCancel, InvocationId,
    InvocationRequest, InvocationResponse, ParameterBinding, RpcValue, SharedMemoryDataType,
    StartStream, Status, StatusResult, StreamingMessage, TraceContext, TypedData,
    WorkerInitRequest, WorkerInitResponse, WorkerMetadataResponse, WorkerStatusRequest,
    WorkerStatusResponse, WorkerTerminate, WorkerId,
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capabilities::{names, CapabilitySet};
use crate::config::ChannelConfig;
use crate::environment::sanitize_environment;
use crate::error::{ChannelError, Result};
use crate::functions::{
    BufferedInvocation, FunctionLoadManager, FunctionLoadStatus, InvocationRoute, LoadAction,
    WorkerIndexedMetadata,
};
use crate::logs::forward_worker_log;
use crate::metrics::{markers, phases, MetricEvent, MetricsSink};
use crate::probe::LatencyHistory;
use crate::registry::{InvocationOutcome, InvocationRegistry};

/// Channel lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Constructed, worker not started.
    Created,
    /// Worker process is being spawned.
    Starting,
    /// Worker process is up, awaiting its StartStream handshake.
    Started,
    /// WorkerInit request sent, awaiting the response.
    Initializing,
    /// Capabilities negotiated; functions not yet loaded.
    Initialized,
    /// Function load requests in flight; invocations are buffered.
    LoadingFunctions,
    /// At least one function loaded; accepting invocations.
    Ready,
    /// No new invocations; waiting for in-flight work to finish.
    Draining,
    /// Terminate in progress.
    Terminating,
    /// Worker shut down.
    Terminated,
    /// Channel failed; all pending work rejected.
    Failed,
}

impl ChannelState {
    /// True for states no transition leaves.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }

    /// True if `next` is a legal successor of this state.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Failed | Self::Terminating => true,
            Self::Terminated => matches!(self, Self::Terminating),
            Self::Starting => matches!(self, Self::Created),
            Self::Started => matches!(self, Self::Starting),
            Self::Initializing => matches!(self, Self::Started),
            Self::Initialized => matches!(self, Self::Initializing),
            Self::LoadingFunctions => matches!(self, Self::Initialized),
            Self::Ready => matches!(self, Self::LoadingFunctions),
            Self::Draining => matches!(self, Self::Ready),
            Self::Created => false,
        }
    }
}

/// One invocation input before wire encoding.
#[derive(Debug, Clone)]
pub struct InvocationInput {
    /// Parameter name.
    pub name: String,
    /// Payload.
    pub data: TypedData,
}

/// Everything the dispatcher hands the channel for one invocation.
pub struct InvocationContext {
    /// Invocation identifier, unique within the channel's lifetime.
    pub invocation_id: InvocationId,
    /// Target function.
    pub function_id: String,
    /// Ordered inputs.
    pub inputs: Vec<InvocationInput>,
    /// Correlation attributes for telemetry.
    pub trace_context: TraceContext,
    /// Caller's cancellation token.
    pub cancellation: CancellationToken,
    /// Local completion deadline, if the caller wants one.
    pub deadline: Option<Duration>,
    /// Live-logs session id from the caller's baggage, if any.
    pub live_logs_session_id: Option<String>,
}

impl InvocationContext {
    /// Creates a context with a fresh invocation id and no inputs.
    #[must_use]
    pub fn new(function_id: impl Into<String>) -> Self {
        Self {
            invocation_id: InvocationId::new(),
            function_id: function_id.into(),
            inputs: Vec::new(),
            trace_context: TraceContext::default(),
            cancellation: CancellationToken::new(),
            deadline: None,
            live_logs_session_id: None,
        }
    }

    /// Adds an input.
    #[must_use]
    pub fn with_input(mut self, name: impl Into<String>, data: TypedData) -> Self {
        self.inputs.push(InvocationInput {
            name: name.into(),
            data,
        });
        self
    }

    /// Uses the given cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Sets a local completion deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Shared host services a channel depends on.
pub struct ChannelServices {
    /// The in-process message bus.
    pub bus: Arc<MessageBus>,
    /// Worker process supervision.
    pub supervisor: Arc<dyn ProcessSupervisor>,
    /// Shared-memory region owner.
    pub shared_memory: Arc<SharedMemoryManager>,
    /// Output pin cache.
    pub data_cache: Arc<FunctionDataCache>,
    /// Metric event sink.
    pub metrics: Arc<dyn MetricsSink>,
}

impl ChannelServices {
    /// Builds services with a fresh shared-memory manager, a disabled
    /// data cache and no metrics.
    #[must_use]
    pub fn with_defaults(bus: Arc<MessageBus>, supervisor: Arc<dyn ProcessSupervisor>) -> Self {
        let shared_memory = Arc::new(SharedMemoryManager::new());
        let data_cache = Arc::new(FunctionDataCache::disabled(shared_memory.clone()));
        Self {
            bus,
            supervisor,
            shared_memory,
            data_cache,
            metrics: Arc::new(crate::metrics::NullMetrics),
        }
    }
}

/// The per-worker channel.
///
/// Cheap to clone; all clones drive the same worker.
#[derive(Clone)]
pub struct WorkerChannel {
    inner: Arc<ChannelInner>,
}

struct PendingWaits {
    start_stream: Mutex<Option<oneshot::Sender<()>>>,
    init: Mutex<Option<oneshot::Sender<WorkerInitResponse>>>,
    env_reload: Mutex<Option<oneshot::Sender<StatusResult>>>,
    status_probe: Mutex<Option<(CorrelationId, Instant)>>,
}

impl PendingWaits {
    fn new() -> Self {
        Self {
            start_stream: Mutex::new(None),
            init: Mutex::new(None),
            env_reload: Mutex::new(None),
            status_probe: Mutex::new(None),
        }
    }

    fn arm_start_stream(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        *lock(&self.start_stream) = Some(tx);
        rx
    }

    fn arm_init(&self) -> oneshot::Receiver<WorkerInitResponse> {
        let (tx, rx) = oneshot::channel();
        *lock(&self.init) = Some(tx);
        rx
    }

    fn arm_env_reload(&self) -> oneshot::Receiver<StatusResult> {
        let (tx, rx) = oneshot::channel();
        *lock(&self.env_reload) = Some(tx);
        rx
    }

    /// Drops every armed sender; waiters observe cancellation (or the
    /// channel's recorded failure).
    fn drop_all(&self) {
        lock(&self.start_stream).take();
        lock(&self.init).take();
        lock(&self.env_reload).take();
        lock(&self.status_probe).take();
    }
}

struct ChannelInner {
    worker_id: WorkerId,
    config: ChannelConfig,
    bus: Arc<MessageBus>,
    supervisor: Arc<dyn ProcessSupervisor>,
    shared_memory: Arc<SharedMemoryManager>,
    data_cache: Arc<FunctionDataCache>,
    metrics: Arc<dyn MetricsSink>,
    state: Mutex<ChannelState>,
    failure: Mutex<Option<ChannelError>>,
    capabilities: OnceLock<CapabilitySet>,
    process: tokio::sync::Mutex<Option<Box<dyn WorkerProcess>>>,
    pid: AtomicU32,
    invocations: InvocationRegistry,
    functions: FunctionLoadManager,
    pending: PendingWaits,
    latencies: LatencyHistory,
    shutdown: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WorkerChannel {
    /// Creates a channel and starts its message pump.
    ///
    /// Must run inside a tokio runtime; the pump is a spawned task that
    /// holds only a weak reference back to the channel.
    #[must_use]
    pub fn new(
        worker_id: impl Into<WorkerId>,
        config: ChannelConfig,
        services: ChannelServices,
    ) -> Self {
        let worker_id = worker_id.into();
        let invocation_buffer_capacity = config.invocation_buffer_capacity;
        let latency_history_size = config.latency_history_size;

        let inner = Arc::new(ChannelInner {
            worker_id: worker_id.clone(),
            config,
            bus: services.bus.clone(),
            supervisor: services.supervisor,
            shared_memory: services.shared_memory,
            data_cache: services.data_cache,
            metrics: services.metrics,
            state: Mutex::new(ChannelState::Created),
            failure: Mutex::new(None),
            capabilities: OnceLock::new(),
            process: tokio::sync::Mutex::new(None),
            pid: AtomicU32::new(0),
            invocations: InvocationRegistry::new(),
            functions: FunctionLoadManager::new(invocation_buffer_capacity),
            pending: PendingWaits::new(),
            latencies: LatencyHistory::new(latency_history_size),
            shutdown: CancellationToken::new(),
        });

        let subscription = services
            .bus
            .subscribe(&worker_id, Direction::WorkerToHost);
        tokio::spawn(run_pump(
            Arc::downgrade(&inner),
            subscription,
            inner.shutdown.clone(),
        ));

        Self { inner }
    }

    /// The host-generated worker id.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.inner.worker_id
    }

    /// Current channel state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.inner.state()
    }

    /// PID of the worker process, 0 before start.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.inner.pid.load(Ordering::Relaxed)
    }

    /// The negotiated capability set, empty before init completes.
    ///
    /// Frozen after a successful init: every later read yields the same
    /// map.
    #[must_use]
    pub fn capabilities(&self) -> CapabilitySet {
        self.inner.capabilities()
    }

    /// Starts the worker process and runs the init handshake.
    ///
    /// Bounded by the startup timeout (StartStream) and the
    /// initialization timeout (WorkerInitResponse). Completes with
    /// [`ChannelError::Cancelled`] if the channel is disposed while the
    /// handshake is in flight.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        inner.transition_verb(ChannelState::Created, ChannelState::Starting, "Start")?;
        inner.metrics.record(MetricEvent::PhaseBegin {
            phase: phases::WORKER_STARTUP,
        });

        // Armed before the process exists so a fast handshake cannot race
        // past its waiter.
        let start_stream = inner.pending.arm_start_stream();

        match inner.supervisor.spawn(&inner.config.worker).await {
            Ok(process) => {
                inner.pid.store(process.pid(), Ordering::Relaxed);
                *inner.process.lock().await = Some(process);
            }
            Err(e) => {
                let failure = ChannelError::WorkerProcessFailure(e.to_string());
                inner.fail_channel(&failure);
                return Err(failure);
            }
        }
        inner.set_state(ChannelState::Started)?;

        match inner
            .await_pending(start_stream, inner.config.timeouts.startup, "StartStream")
            .await
        {
            Ok(()) => {}
            Err(failure) => return Err(inner.fail_unless_cancelled(failure)),
        }
        inner.metrics.record(MetricEvent::PhaseEnd {
            phase: phases::WORKER_STARTUP,
        });

        inner.metrics.record(MetricEvent::PhaseBegin {
            phase: phases::WORKER_INITIALIZATION,
        });
        let init = inner.pending.arm_init();
        inner.set_state(ChannelState::Initializing)?;

        if inner.config.features.v2_compatibility {
            info!(
                worker_id = %inner.worker_id,
                "V2 compatibility mode enabled for worker initialization"
            );
        }

        inner.publish(StreamingMessage::WorkerInitRequest(WorkerInitRequest {
            host_version: inner.config.host_version.clone(),
            worker_directory: inner.config.worker.worker_directory.display().to_string(),
            function_app_directory: inner.config.function_app_directory.display().to_string(),
            protocol_version: inner.config.protocol_version.clone(),
            capabilities: inner.host_capabilities(),
            v2_compatibility: inner.config.features.v2_compatibility,
        }));

        let response = match inner
            .await_pending(
                init,
                inner.config.timeouts.initialization,
                "WorkerInitResponse",
            )
            .await
        {
            Ok(response) => response,
            Err(failure) => return Err(inner.fail_unless_cancelled(failure)),
        };

        if response.result.is_success() {
            let negotiated = CapabilitySet::from_pairs(response.capabilities);
            info!(
                worker_id = %inner.worker_id,
                capabilities = negotiated.len(),
                "worker initialized"
            );
            let _ = inner.capabilities.set(negotiated);
            inner.set_state(ChannelState::Initialized)?;
            inner.metrics.record(MetricEvent::PhaseEnd {
                phase: phases::WORKER_INITIALIZATION,
            });

            if inner.config.features.dynamic_concurrency {
                spawn_probe(inner);
            }
            Ok(())
        } else {
            let failure = ChannelError::WorkerProcessFailure(
                response
                    .result
                    .error_message
                    .unwrap_or_else(|| "worker initialization failed".to_owned()),
            );
            inner.fail_channel(&failure);
            Err(failure)
        }
    }

    /// Creates a pending load entry (and invocation buffer) per function.
    ///
    /// Until this runs, [`Self::is_channel_ready_for_invocations`] is
    /// false.
    pub fn setup_function_invocation_buffers(
        &self,
        metadata: Vec<meridian_proto::FunctionMetadata>,
    ) -> Result<()> {
        let state = self.inner.state();
        if !matches!(
            state,
            ChannelState::Initialized | ChannelState::LoadingFunctions
        ) {
            return Err(ChannelError::InvalidState {
                verb: "SetupFunctionInvocationBuffers",
                state,
            });
        }

        self.inner.functions.setup_buffers(metadata);
        Ok(())
    }

    /// True once invocation buffers exist for every registered function.
    #[must_use]
    pub fn is_channel_ready_for_invocations(&self) -> bool {
        self.inner.functions.buffers_ready()
    }

    /// Sends load requests for every registered function and waits for
    /// the responses.
    ///
    /// Enabled functions load first, disabled last. With the
    /// load-response-collection capability the batch goes out as one
    /// message; otherwise one request per function. `deadline` bounds the
    /// wait (`None` falls back to the configured bound; both `None`
    /// means unbounded). On expiry, still-pending functions are marked
    /// failed and their buffered invocations fail; the channel stays
    /// live.
    pub async fn send_function_load_requests(&self, deadline: Option<Duration>) -> Result<()> {
        let inner = &self.inner;
        inner.transition_verb(
            ChannelState::Initialized,
            ChannelState::LoadingFunctions,
            "LoadFunctions",
        )?;
        inner.metrics.record(MetricEvent::PhaseBegin {
            phase: phases::FUNCTION_LOAD,
        });

        let order = inner.functions.load_order();
        if order.is_empty() {
            return Ok(());
        }

        if inner
            .capabilities()
            .is_enabled(names::SUPPORTS_LOAD_RESPONSE_COLLECTION)
        {
            info!(
                worker_id = %inner.worker_id,
                count = order.len(),
                "sending function load request collection"
            );
            let requests = order.into_iter().map(FunctionLoadRequest::new).collect();
            inner.publish(StreamingMessage::FunctionLoadRequestCollection(
                FunctionLoadRequestCollection { requests },
            ));
        } else {
            for metadata in order {
                info!(
                    worker_id = %inner.worker_id,
                    function_id = %metadata.function_id,
                    function_name = %metadata.name,
                    disabled = metadata.disabled,
                    "sending function load request"
                );
                inner.publish(StreamingMessage::FunctionLoadRequest(
                    FunctionLoadRequest::new(metadata),
                ));
            }
        }

        let bound = deadline.or(inner.config.timeouts.function_load);
        match bound {
            None => {
                inner.functions.wait_all_terminal().await;
            }
            Some(bound) => {
                if tokio::time::timeout(bound, inner.functions.wait_all_terminal())
                    .await
                    .is_err()
                {
                    let failure = ChannelError::timeout("FunctionLoadResponse", bound);
                    for (function_id, buffered) in
                        inner.functions.fail_pending("function load timed out")
                    {
                        for invocation in buffered {
                            inner.invocations.complete(
                                &invocation.request.invocation_id,
                                InvocationOutcome::Failure(ChannelError::LoadFailure {
                                    function_id: function_id.clone(),
                                    reason: "function load timed out".to_owned(),
                                }),
                            );
                        }
                    }
                    return Err(failure);
                }
            }
        }

        inner.metrics.record(MetricEvent::Marker {
            name: markers::FUNCTION_LOAD_REQUEST_RESPONSE,
        });
        inner.metrics.record(MetricEvent::PhaseEnd {
            phase: phases::FUNCTION_LOAD,
        });
        Ok(())
    }

    /// Load status per registered function, in insertion order.
    #[must_use]
    pub fn function_load_statuses(&self) -> Vec<FunctionLoadStatus> {
        self.inner.functions.statuses()
    }

    /// Metadata the worker supplied through its own indexing, if any.
    #[must_use]
    pub fn worker_indexed_metadata(&self) -> Option<WorkerIndexedMetadata> {
        self.inner.functions.worker_metadata()
    }

    /// Dispatches one invocation to the worker.
    ///
    /// The returned receiver resolves exactly once with the terminal
    /// outcome. Invocations for functions still loading are buffered and
    /// flushed, in order, when the load completes.
    pub async fn send_invocation(
        &self,
        ctx: InvocationContext,
    ) -> Result<oneshot::Receiver<InvocationOutcome>> {
        let inner = &self.inner;
        let state = inner.state();
        match state {
            ChannelState::Ready | ChannelState::LoadingFunctions => {}
            ChannelState::Draining => return Err(ChannelError::ChannelDraining),
            other => {
                return Err(ChannelError::InvalidState {
                    verb: "Invoke",
                    state: other,
                })
            }
        }

        if inner.functions.state_of(&ctx.function_id).is_none() {
            return Err(ChannelError::InvocationFailure(format!(
                "no load entry for function {}",
                ctx.function_id
            )));
        }

        if ctx.cancellation.is_cancelled() {
            info!(
                worker_id = %inner.worker_id,
                invocation_id = %ctx.invocation_id,
                "Cancellation has been requested, cancelling invocation request"
            );
            let (sink, receiver) = oneshot::channel();
            let _ = sink.send(InvocationOutcome::Cancelled);
            return Ok(receiver);
        }

        let request = inner.build_invocation_request(&ctx);
        let registered = inner
            .invocations
            .register(ctx.invocation_id, ctx.function_id.clone())?;

        let invocation = BufferedInvocation {
            request,
            cancellation: ctx.cancellation.clone(),
            deadline: ctx.deadline,
        };
        match inner.functions.route_invocation(&ctx.function_id, invocation) {
            InvocationRoute::Buffered => {}
            InvocationRoute::Dispatch(invocation) => {
                inner.publish_invocation(
                    invocation.request,
                    &invocation.cancellation,
                    registered.completed.clone(),
                    invocation.deadline,
                );
            }
            InvocationRoute::Rejected(failure) => {
                inner
                    .invocations
                    .complete(&ctx.invocation_id, InvocationOutcome::Failure(failure));
            }
        }

        Ok(registered.receiver)
    }

    /// Sends a wire-level cancel for an in-flight invocation.
    ///
    /// Only acts when the worker advertised the invocation-cancel
    /// capability; the registry entry is retained either way and the
    /// invocation completes with whatever the worker returns.
    pub fn send_invocation_cancel(&self, invocation_id: InvocationId) {
        self.inner.send_invocation_cancel(invocation_id);
    }

    /// True iff the invocation is in the registry.
    #[must_use]
    pub fn is_executing_invocation(&self, invocation_id: &InvocationId) -> bool {
        self.inner.invocations.is_executing(invocation_id)
    }

    /// Number of in-flight invocations.
    #[must_use]
    pub fn executing_count(&self) -> usize {
        self.inner.invocations.len()
    }

    /// Fails every in-flight invocation with the given error and clears
    /// the registry. Idempotent.
    pub fn try_fail_executions(&self, error: &ChannelError) {
        self.inner.invocations.fail_all(error);
    }

    /// Sends a sanitized environment snapshot to the worker for
    /// specialization.
    ///
    /// Entries with null or empty values are dropped; the worker
    /// directory and function app directory are always included. Bounded
    /// by the environment-reload timeout.
    pub async fn send_environment_reload_request(
        &self,
        environment: &HashMap<String, Option<String>>,
    ) -> Result<()> {
        let inner = &self.inner;
        let state = inner.state();
        if !matches!(state, ChannelState::Initialized | ChannelState::Ready) {
            return Err(ChannelError::InvalidState {
                verb: "ReloadEnvironment",
                state,
            });
        }

        inner.metrics.record(MetricEvent::PhaseBegin {
            phase: phases::ENVIRONMENT_RELOAD,
        });

        let environment_variables = sanitize_environment(
            environment,
            &inner.config.worker.worker_directory,
            &inner.config.function_app_directory,
        );

        let reload = inner.pending.arm_env_reload();
        info!(
            worker_id = %inner.worker_id,
            variables = environment_variables.len(),
            "sending environment reload request"
        );
        inner.publish(StreamingMessage::FunctionEnvironmentReloadRequest(
            FunctionEnvironmentReloadRequest {
                environment_variables,
                function_app_directory: inner.config.function_app_directory.display().to_string(),
            },
        ));

        let result = inner
            .await_pending(
                reload,
                inner.config.timeouts.environment_reload,
                "FunctionEnvironmentReloadResponse",
            )
            .await?;

        inner.metrics.record(MetricEvent::Marker {
            name: markers::SPECIALIZATION_ENVIRONMENT_RELOAD_REQUEST_RESPONSE,
        });
        inner.metrics.record(MetricEvent::PhaseEnd {
            phase: phases::ENVIRONMENT_RELOAD,
        });

        if result.is_success() {
            Ok(())
        } else {
            Err(ChannelError::ReloadFailure(
                result
                    .error_message
                    .unwrap_or_else(|| "environment reload failed".to_owned()),
            ))
        }
    }

    /// Stops accepting invocations and resolves once the registry is
    /// empty.
    ///
    /// In-flight work is not aborted; callers that want to bound drain
    /// time race this against a timer.
    pub async fn drain_invocations(&self) -> Result<()> {
        let inner = &self.inner;
        inner.transition_verb(ChannelState::Ready, ChannelState::Draining, "Drain")?;

        info!(
            worker_id = %inner.worker_id,
            in_flight = inner.invocations.len(),
            "draining worker channel"
        );
        inner.invocations.wait_empty().await;
        Ok(())
    }

    /// Shuts the worker down.
    ///
    /// With the worker-terminate capability, sends WorkerTerminate and
    /// waits up to the grace period for the process to exit before
    /// killing it; without the capability the process is killed
    /// immediately. Every remaining invocation fails with `Cancelled`,
    /// pending protocol waits complete with `Cancelled`, and the bus
    /// subscription is released. Idempotent.
    pub async fn terminate(&self) -> Result<()> {
        let inner = &self.inner;
        {
            let mut state = lock(&inner.state);
            if matches!(
                *state,
                ChannelState::Terminating | ChannelState::Terminated | ChannelState::Failed
            ) {
                return Ok(());
            }
            debug!(
                worker_id = %inner.worker_id,
                from = ?*state,
                to = ?ChannelState::Terminating,
                "channel state transition"
            );
            *state = ChannelState::Terminating;
        }

        // Unblock anyone awaiting start/init/reload before the grace wait.
        inner.pending.drop_all();

        let grace = inner.config.terminate_grace_period;
        if inner
            .capabilities()
            .is_enabled(names::HANDLES_WORKER_TERMINATE)
        {
            info!(
                worker_id = %inner.worker_id,
                "Sending WorkerTerminate message with grace period {} seconds",
                grace.as_secs()
            );
            inner.publish(StreamingMessage::WorkerTerminate(WorkerTerminate {
                grace_period_secs: grace.as_secs(),
            }));

            let mut guard = inner.process.lock().await;
            if let Some(process) = guard.as_mut() {
                match tokio::time::timeout(grace, process.wait()).await {
                    Ok(Ok(code)) => {
                        info!(worker_id = %inner.worker_id, code, "worker process exited");
                    }
                    Ok(Err(e)) => {
                        warn!(
                            worker_id = %inner.worker_id,
                            error = %e,
                            "error waiting for worker process"
                        );
                    }
                    Err(_) => {
                        warn!(
                            worker_id = %inner.worker_id,
                            "worker did not exit within the grace period, killing"
                        );
                        if let Err(e) = process.kill().await {
                            warn!(worker_id = %inner.worker_id, error = %e, "kill failed");
                        }
                    }
                }
            }
        } else {
            let mut guard = inner.process.lock().await;
            if let Some(process) = guard.as_mut() {
                if let Err(e) = process.kill().await {
                    warn!(worker_id = %inner.worker_id, error = %e, "kill failed");
                }
            }
        }

        inner.invocations.cancel_all();
        inner.shutdown.cancel();
        inner.set_state(ChannelState::Terminated)?;
        Ok(())
    }

    /// Disposes the channel; alias for [`Self::terminate`].
    pub async fn dispose(&self) -> Result<()> {
        self.terminate().await
    }

    /// Round-trip latency samples recorded by the status probe, oldest
    /// first. Empty unless dynamic concurrency is enabled.
    #[must_use]
    pub fn latencies(&self) -> Vec<Duration> {
        self.inner.latencies.snapshot()
    }
}

impl ChannelInner {
    fn state(&self) -> ChannelState {
        *lock(&self.state)
    }

    fn set_state(&self, next: ChannelState) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.can_transition_to(next) {
            return Err(ChannelError::ProtocolViolation(format!(
                "illegal state transition {:?} -> {next:?}",
                *state
            )));
        }
        debug!(
            worker_id = %self.worker_id,
            from = ?*state,
            to = ?next,
            "channel state transition"
        );
        *state = next;
        Ok(())
    }

    fn transition_verb(
        &self,
        expected: ChannelState,
        next: ChannelState,
        verb: &'static str,
    ) -> Result<()> {
        let mut state = lock(&self.state);
        if *state != expected {
            return Err(ChannelError::InvalidState {
                verb,
                state: *state,
            });
        }
        debug!(
            worker_id = %self.worker_id,
            from = ?*state,
            to = ?next,
            "channel state transition"
        );
        *state = next;
        Ok(())
    }

    fn capabilities(&self) -> CapabilitySet {
        self.capabilities.get().cloned().unwrap_or_default()
    }

    fn host_capabilities(&self) -> Vec<(String, String)> {
        let mut offered = Vec::new();
        if self.config.features.shared_memory_data_transfer {
            offered.push((names::SHARED_MEMORY_DATA_TRANSFER.to_owned(), "1".to_owned()));
        }
        offered
    }

    fn shared_memory_transfer_active(&self) -> bool {
        self.config.features.shared_memory_data_transfer
            && self
                .capabilities()
                .is_enabled(names::SHARED_MEMORY_DATA_TRANSFER)
    }

    fn publish(&self, message: StreamingMessage) {
        self.bus.publish(
            Direction::HostToWorker,
            BusEvent {
                worker_id: self.worker_id.clone(),
                message,
            },
        );
    }

    /// Awaits a pending protocol response within `bound`.
    ///
    /// Timeout yields the distinct timeout error; a dropped sender yields
    /// the channel's recorded failure, or `Cancelled` on dispose.
    async fn await_pending<T>(
        &self,
        receiver: oneshot::Receiver<T>,
        bound: Duration,
        phase: &'static str,
    ) -> Result<T> {
        match tokio::time::timeout(bound, receiver).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(self.recorded_failure()),
            Err(_) => Err(ChannelError::timeout(phase, bound)),
        }
    }

    fn recorded_failure(&self) -> ChannelError {
        lock(&self.failure)
            .clone()
            .unwrap_or(ChannelError::Cancelled)
    }

    /// Fails the channel for `failure` unless it is a dispose-driven
    /// cancellation (terminate owns the state in that case).
    fn fail_unless_cancelled(&self, failure: ChannelError) -> ChannelError {
        if !matches!(failure, ChannelError::Cancelled) {
            self.fail_channel(&failure);
        }
        failure
    }

    fn fail_channel(&self, failure: &ChannelError) {
        {
            let mut state = lock(&self.state);
            if matches!(
                *state,
                ChannelState::Terminating | ChannelState::Terminated | ChannelState::Failed
            ) {
                return;
            }
            error!(
                worker_id = %self.worker_id,
                error = %failure,
                "worker channel failed"
            );
            *state = ChannelState::Failed;
        }

        *lock(&self.failure) = Some(failure.clone());
        self.pending.drop_all();
        self.invocations.fail_all(failure);
        self.shutdown.cancel();
    }

    fn build_invocation_request(&self, ctx: &InvocationContext) -> InvocationRequest {
        let transfer_active = self.shared_memory_transfer_active();
        let threshold = self.config.shared_memory.transfer_threshold;

        let inputs = ctx
            .inputs
            .iter()
            .map(|input| self.encode_input(input, transfer_active, threshold))
            .collect();

        let mut trace_context = ctx.trace_context.clone();
        if self.config.features.telemetry_agent {
            trace_context
                .set_attribute("ProcessId", self.pid.load(Ordering::Relaxed).to_string());
            trace_context.set_attribute("HostInstanceId", self.config.host_instance_id.clone());
            trace_context.set_attribute("CategoryName", format!("Function.{}", ctx.function_id));
            if let Some(session) = &ctx.live_logs_session_id {
                trace_context.set_attribute("LiveLogsSessionId", session.clone());
            }
        }

        InvocationRequest {
            invocation_id: ctx.invocation_id,
            function_id: ctx.function_id.clone(),
            trace_context,
            inputs,
        }
    }

    fn encode_input(
        &self,
        input: &InvocationInput,
        transfer_active: bool,
        threshold: usize,
    ) -> ParameterBinding {
        if transfer_active && input.data.is_transferable() && input.data.payload_len() > threshold {
            let (payload, data_type) = match &input.data {
                TypedData::Bytes(bytes) => (bytes.as_slice(), SharedMemoryDataType::Bytes),
                TypedData::String(text) => (text.as_bytes(), SharedMemoryDataType::String),
                // is_transferable already excluded the rest
                _ => return ParameterBinding::inline(&input.name, input.data.clone()),
            };
            let descriptor = self.shared_memory.allocate(payload, data_type);
            debug!(
                worker_id = %self.worker_id,
                region = %descriptor.name,
                len = descriptor.count,
                "input transferred via shared memory"
            );
            ParameterBinding::shared_memory(&input.name, descriptor)
        } else {
            ParameterBinding::inline(&input.name, input.data.clone())
        }
    }

    fn publish_invocation(
        self: &Arc<Self>,
        request: InvocationRequest,
        cancellation: &CancellationToken,
        completed: CancellationToken,
        deadline: Option<Duration>,
    ) {
        let invocation_id = request.invocation_id;
        debug!(
            worker_id = %self.worker_id,
            invocation_id = %invocation_id,
            function_id = %request.function_id,
            "sending invocation request"
        );
        self.publish(StreamingMessage::InvocationRequest(request));
        self.spawn_invocation_watcher(invocation_id, cancellation.clone(), completed, deadline);
    }

    /// Watches one published invocation for caller cancellation or local
    /// deadline expiry; completion stops the watcher.
    fn spawn_invocation_watcher(
        self: &Arc<Self>,
        invocation_id: InvocationId,
        cancellation: CancellationToken,
        completed: CancellationToken,
        deadline: Option<Duration>,
    ) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let expiry = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                () = completed.cancelled() => {}
                () = cancellation.cancelled() => {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_invocation_cancellation(invocation_id);
                    }
                }
                () = expiry => {
                    if let Some(inner) = weak.upgrade() {
                        inner.invocations.complete(
                            &invocation_id,
                            InvocationOutcome::Failure(ChannelError::timeout(
                                "InvocationResponse",
                                deadline.unwrap_or_default(),
                            )),
                        );
                    }
                }
            }
        });
    }

    fn handle_invocation_cancellation(&self, invocation_id: InvocationId) {
        if self
            .capabilities()
            .is_enabled(names::HANDLES_INVOCATION_CANCEL)
        {
            self.send_invocation_cancel(invocation_id);
        } else {
            // No wire support; cancel locally.
            self.invocations
                .complete(&invocation_id, InvocationOutcome::Cancelled);
        }
    }

    fn send_invocation_cancel(&self, invocation_id: InvocationId) {
        if !self
            .capabilities()
            .is_enabled(names::HANDLES_INVOCATION_CANCEL)
        {
            return;
        }
        if !self.invocations.is_executing(&invocation_id) {
            debug!(
                worker_id = %self.worker_id,
                invocation_id = %invocation_id,
                "skipping cancel for unregistered invocation"
            );
            return;
        }

        info!(
            worker_id = %self.worker_id,
            "Sending invocation cancel request for InvocationId {invocation_id}"
        );
        self.publish(StreamingMessage::InvocationCancel(InvocationCancel {
            invocation_id,
        }));
    }

    // ---- inbound dispatch (pump task) ----

    fn dispatch(self: &Arc<Self>, message: StreamingMessage) {
        match message {
            StreamingMessage::StartStream(m) => self.on_start_stream(&m),
            StreamingMessage::WorkerInitResponse(m) => self.on_init_response(m),
            StreamingMessage::FunctionLoadResponse(m) => self.on_load_response(&m),
            StreamingMessage::FunctionLoadResponseCollection(c) => {
                for response in c.responses {
                    self.on_load_response(&response);
                }
            }
            StreamingMessage::InvocationResponse(m) => self.on_invocation_response(m),
            StreamingMessage::FunctionEnvironmentReloadResponse(m) => {
                self.on_env_reload_response(m.result);
            }
            StreamingMessage::RpcLog(m) => forward_worker_log(&self.worker_id, &m),
            StreamingMessage::WorkerMetadataResponse(m) => self.on_worker_metadata(m),
            StreamingMessage::WorkerStatusResponse(m) => self.on_status_response(&m),
            StreamingMessage::WorkerStatusRequest(m) => {
                // Keep the probe path symmetric for worker-initiated checks.
                self.publish(StreamingMessage::WorkerStatusResponse(WorkerStatusResponse {
                    request_id: m.request_id,
                }));
            }
            other @ (StreamingMessage::WorkerInitRequest(_)
            | StreamingMessage::FunctionLoadRequest(_)
            | StreamingMessage::FunctionLoadRequestCollection(_)
            | StreamingMessage::InvocationRequest(_)
            | StreamingMessage::InvocationCancel(_)
            | StreamingMessage::FunctionEnvironmentReloadRequest(_)
            | StreamingMessage::WorkerTerminate(_)) => {
                self.on_protocol_violation(format!(
                    "received host-only message {} from worker",
                    other.name()
                ));
            }
        }
    }

    fn on_start_stream(self: &Arc<Self>, handshake: &StartStream) {
        let state = self.state();
        if !matches!(state, ChannelState::Starting | ChannelState::Started) {
            self.on_protocol_violation(format!("StartStream received in state {state:?}"));
            return;
        }

        debug!(
            worker_id = %self.worker_id,
            handshake_worker_id = %handshake.worker_id,
            "worker stream started"
        );
        match lock(&self.pending.start_stream).take() {
            Some(waiter) => {
                let _ = waiter.send(());
            }
            None => {
                self.on_protocol_violation("unexpected StartStream with no waiter".to_owned());
            }
        }
    }

    fn on_init_response(self: &Arc<Self>, response: WorkerInitResponse) {
        let state = self.state();
        if state != ChannelState::Initializing {
            self.on_protocol_violation(format!("WorkerInitResponse received in state {state:?}"));
            return;
        }

        match lock(&self.pending.init).take() {
            Some(waiter) => {
                let _ = waiter.send(response);
            }
            None => {
                self.on_protocol_violation(
                    "unexpected WorkerInitResponse with no waiter".to_owned(),
                );
            }
        }
    }

    fn on_load_response(self: &Arc<Self>, response: &FunctionLoadResponse) {
        match self.functions.apply_response(response) {
            None => {
                debug!(
                    worker_id = %self.worker_id,
                    function_id = %response.function_id,
                    "dropping load response with no pending entry"
                );
            }
            Some(LoadAction::Flush(buffered)) => {
                info!(
                    worker_id = %self.worker_id,
                    function_id = %response.function_id,
                    "function loaded"
                );
                for invocation in buffered {
                    let invocation_id = invocation.request.invocation_id;
                    if invocation.cancellation.is_cancelled() {
                        info!(
                            worker_id = %self.worker_id,
                            invocation_id = %invocation_id,
                            "Cancellation has been requested, cancelling invocation request"
                        );
                        self.invocations
                            .complete(&invocation_id, InvocationOutcome::Cancelled);
                        continue;
                    }
                    if let Some(completed) = self.invocations.completion_token(&invocation_id) {
                        self.publish_invocation(
                            invocation.request,
                            &invocation.cancellation,
                            completed,
                            invocation.deadline,
                        );
                    }
                }

                if self.state() == ChannelState::LoadingFunctions && self.functions.any_loaded() {
                    let _ = self.set_state(ChannelState::Ready);
                }
            }
            Some(LoadAction::FailBuffered { reason, buffered }) => {
                warn!(
                    worker_id = %self.worker_id,
                    function_id = %response.function_id,
                    reason = %reason,
                    "function failed to load"
                );
                for invocation in buffered {
                    self.invocations.complete(
                        &invocation.request.invocation_id,
                        InvocationOutcome::Failure(ChannelError::LoadFailure {
                            function_id: response.function_id.clone(),
                            reason: reason.clone(),
                        }),
                    );
                }
            }
        }
    }

    fn on_invocation_response(&self, response: InvocationResponse) {
        let invocation_id = response.invocation_id;
        if !self.invocations.is_executing(&invocation_id) {
            debug!(
                worker_id = %self.worker_id,
                invocation_id = %invocation_id,
                "dropping invocation response with no registered invocation"
            );
            return;
        }

        let mut outputs = Vec::with_capacity(response.outputs.len());
        for binding in response.outputs {
            match binding.data {
                RpcValue::Inline(data) => outputs.push(ParameterBinding::inline(binding.name, data)),
                RpcValue::SharedMemory(descriptor) => {
                    match self.shared_memory.read(&descriptor) {
                        Ok(bytes) => {
                            let data = match descriptor.data_type {
                                SharedMemoryDataType::Bytes => TypedData::Bytes(bytes),
                                SharedMemoryDataType::String => TypedData::String(
                                    String::from_utf8_lossy(&bytes).into_owned(),
                                ),
                            };
                            if self.data_cache.is_enabled() {
                                let key = format!("{invocation_id}:{}", binding.name);
                                self.data_cache.put(key, descriptor.clone());
                            }
                            self.shared_memory.release(&descriptor.name);
                            outputs.push(ParameterBinding::inline(binding.name, data));
                        }
                        Err(e) => {
                            self.invocations.complete(
                                &invocation_id,
                                InvocationOutcome::Failure(ChannelError::InvocationFailure(
                                    format!("failed to read shared memory output: {e}"),
                                )),
                            );
                            return;
                        }
                    }
                }
            }
        }

        let outcome = match response.result.status {
            Status::Success => InvocationOutcome::Success {
                outputs,
                return_value: response.return_value,
            },
            Status::Failure => InvocationOutcome::Failure(ChannelError::InvocationFailure(
                response
                    .result
                    .error_message
                    .unwrap_or_else(|| "invocation failed".to_owned()),
            )),
            Status::Cancelled => InvocationOutcome::Cancelled,
        };
        self.invocations.complete(&invocation_id, outcome);
    }

    fn on_env_reload_response(&self, result: StatusResult) {
        match lock(&self.pending.env_reload).take() {
            Some(waiter) => {
                let _ = waiter.send(result);
            }
            None => {
                // Late response after a timeout; nothing is waiting.
                debug!(
                    worker_id = %self.worker_id,
                    "dropping environment reload response with no waiter"
                );
            }
        }
    }

    fn on_worker_metadata(&self, response: WorkerMetadataResponse) {
        if response.use_default_metadata_indexing {
            info!(
                worker_id = %self.worker_id,
                "worker deferred to host metadata indexing"
            );
        } else {
            info!(
                worker_id = %self.worker_id,
                count = response.function_metadata.len(),
                "worker supplied function metadata"
            );
        }
        self.functions.record_worker_metadata(WorkerIndexedMetadata {
            functions: response.function_metadata,
            use_default_metadata_indexing: response.use_default_metadata_indexing,
        });
    }

    fn on_status_response(&self, response: &WorkerStatusResponse) {
        let recorded = {
            let mut slot = lock(&self.pending.status_probe);
            match slot.take() {
                Some((request_id, sent_at)) if request_id == response.request_id => {
                    Some(sent_at.elapsed())
                }
                other => {
                    *slot = other;
                    None
                }
            }
        };

        match recorded {
            Some(latency) => self.latencies.record(latency),
            None => debug!(
                worker_id = %self.worker_id,
                "dropping status response with no matching probe"
            ),
        }
    }

    fn on_protocol_violation(self: &Arc<Self>, detail: String) {
        self.fail_channel(&ChannelError::ProtocolViolation(detail));
    }

    fn send_status_probe(&self) {
        let request_id = CorrelationId::new();
        *lock(&self.pending.status_probe) = Some((request_id, Instant::now()));
        self.publish(StreamingMessage::WorkerStatusRequest(WorkerStatusRequest {
            request_id,
        }));
    }
}

async fn run_pump(
    inner: Weak<ChannelInner>,
    mut subscription: Subscription,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            event = subscription.recv() => {
                let Some(event) = event else { break };
                let Some(inner) = inner.upgrade() else { break };
                inner.dispatch(event.message);
            }
        }
    }
}

fn spawn_probe(inner: &Arc<ChannelInner>) {
    let weak = Arc::downgrade(inner);
    let interval = inner.config.probe_interval;
    let shutdown = inner.shutdown.clone();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(inner) = weak.upgrade() else { break };
                    inner.send_status_probe();
                }
            }
        }
    });
}
