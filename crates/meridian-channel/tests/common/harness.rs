//! Loopback harness: drives a real channel over the in-process bus,
//! playing the worker side of the protocol.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meridian_channel::{
    ChannelConfig, ChannelServices, RecordingMetrics, WorkerChannel,
};
use meridian_core::{
    BusEvent, CoreError, Direction, FunctionDataCache, MessageBus, ProcessSupervisor,
    SharedMemoryManager, Subscription, WorkerDescription, WorkerProcess,
};
use meridian_proto::{
    FunctionLoadRequest, FunctionLoadResponse, FunctionMetadata, StartStream, StreamingMessage,
    WorkerInitResponse,
};
use tokio::sync::watch;

/// Worker id used by every harness channel.
pub const WORKER_ID: &str = "testWorkerId";

/// Remote control for the fake worker process.
#[derive(Clone)]
pub struct FakeProcessControl {
    exit: Arc<watch::Sender<Option<i32>>>,
    kills: Arc<AtomicUsize>,
    fail_spawn: bool,
}

impl FakeProcessControl {
    fn new() -> Self {
        Self {
            exit: Arc::new(watch::Sender::new(None)),
            kills: Arc::new(AtomicUsize::new(0)),
            fail_spawn: false,
        }
    }

    /// Makes the process exit with the given code.
    pub fn trigger_exit(&self, code: i32) {
        let _ = self.exit.send(Some(code));
    }

    /// Number of times the process was killed.
    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

struct FakeProcess {
    pid: u32,
    exit: watch::Receiver<Option<i32>>,
    control: FakeProcessControl,
}

#[async_trait]
impl WorkerProcess for FakeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn wait(&mut self) -> meridian_core::Result<i32> {
        loop {
            if let Some(code) = *self.exit.borrow_and_update() {
                return Ok(code);
            }
            if self.exit.changed().await.is_err() {
                return Ok(-1);
            }
        }
    }

    async fn kill(&mut self) -> meridian_core::Result<()> {
        self.control.kills.fetch_add(1, Ordering::SeqCst);
        let _ = self.control.exit.send(Some(-9));
        Ok(())
    }
}

/// Supervisor handing out fake processes wired to one control.
pub struct FakeSupervisor {
    control: FakeProcessControl,
}

impl FakeSupervisor {
    pub fn new() -> (Self, FakeProcessControl) {
        let control = FakeProcessControl::new();
        (
            Self {
                control: control.clone(),
            },
            control,
        )
    }

    /// A supervisor whose spawn always fails.
    pub fn failing() -> Self {
        let mut control = FakeProcessControl::new();
        control.fail_spawn = true;
        Self { control }
    }
}

#[async_trait]
impl ProcessSupervisor for FakeSupervisor {
    async fn spawn(
        &self,
        _description: &WorkerDescription,
    ) -> meridian_core::Result<Box<dyn WorkerProcess>> {
        if self.control.fail_spawn {
            return Err(CoreError::Spawn("spawn refused by test".to_owned()));
        }
        Ok(Box::new(FakeProcess {
            pid: 4242,
            exit: self.control.exit.subscribe(),
            control: self.control.clone(),
        }))
    }
}

/// A channel under test plus the worker side of its bus.
pub struct TestChannel {
    pub bus: Arc<MessageBus>,
    pub channel: WorkerChannel,
    pub outbound: Subscription,
    pub metrics: Arc<RecordingMetrics>,
    pub process: FakeProcessControl,
    pub shared_memory: Arc<SharedMemoryManager>,
}

impl TestChannel {
    pub fn new() -> Self {
        Self::with_config(default_config())
    }

    pub fn with_config(config: ChannelConfig) -> Self {
        let bus = Arc::new(MessageBus::new());
        let metrics = Arc::new(RecordingMetrics::new());
        let (supervisor, process) = FakeSupervisor::new();
        let shared_memory = Arc::new(SharedMemoryManager::new());

        let services = ChannelServices {
            bus: bus.clone(),
            supervisor: Arc::new(supervisor),
            shared_memory: shared_memory.clone(),
            data_cache: Arc::new(FunctionDataCache::disabled(shared_memory.clone())),
            metrics: metrics.clone(),
        };

        let outbound = bus.subscribe(WORKER_ID, Direction::HostToWorker);
        let channel = WorkerChannel::new(WORKER_ID, config, services);

        Self {
            bus,
            channel,
            outbound,
            metrics,
            process,
            shared_memory,
        }
    }

    /// Publishes a message as the worker.
    pub fn send_inbound(&self, message: StreamingMessage) {
        self.bus.publish(
            Direction::WorkerToHost,
            BusEvent {
                worker_id: WORKER_ID.to_owned(),
                message,
            },
        );
    }

    /// Next host-to-worker message, bounded so hung tests fail fast.
    pub async fn expect_outbound(&mut self) -> StreamingMessage {
        tokio::time::timeout(Duration::from_secs(2), self.outbound.recv())
            .await
            .expect("timed out waiting for outbound message")
            .expect("bus closed")
            .message
    }

    /// True if nothing further was published host-to-worker.
    pub fn no_more_outbound(&mut self) -> bool {
        self.outbound.try_recv().is_none()
    }

    /// Drives start through a successful init with the given worker
    /// capabilities.
    pub async fn start_initialized(&mut self, capabilities: &[(&str, &str)]) {
        let channel = self.channel.clone();
        let start = tokio::spawn(async move { channel.start().await });

        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        self.send_inbound(StreamingMessage::StartStream(StartStream {
            worker_id: WORKER_ID.to_owned(),
        }));

        let init_request = self.expect_outbound().await;
        assert!(
            matches!(init_request, StreamingMessage::WorkerInitRequest(_)),
            "expected WorkerInitRequest, got {}",
            init_request.name()
        );

        let capabilities = capabilities
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        self.send_inbound(StreamingMessage::WorkerInitResponse(
            WorkerInitResponse::success(capabilities),
        ));

        start
            .await
            .expect("start task panicked")
            .expect("start failed");
    }

    /// Registers buffers and loads every function successfully.
    pub async fn load_functions_ok(&mut self, metadata: Vec<FunctionMetadata>) {
        let count = metadata.len();
        self.channel
            .setup_function_invocation_buffers(metadata)
            .expect("buffer setup failed");

        let channel = self.channel.clone();
        let load = tokio::spawn(async move { channel.send_function_load_requests(None).await });

        for _ in 0..count {
            let request = self.expect_outbound().await;
            let StreamingMessage::FunctionLoadRequest(FunctionLoadRequest {
                function_id, ..
            }) = request
            else {
                panic!("expected FunctionLoadRequest, got {}", request.name());
            };
            self.send_inbound(StreamingMessage::FunctionLoadResponse(
                FunctionLoadResponse::success(function_id),
            ));
        }

        load.await.expect("load task panicked").expect("load failed");
    }
}

/// Short-timeout configuration for tests.
pub fn default_config() -> ChannelConfig {
    let mut config = ChannelConfig::new(
        WorkerDescription::new("node", "/opt/workers/node", "/usr/bin/node"),
        "4.0.0",
        "test-host-instance",
        "/home/site/wwwroot",
    );
    config.timeouts.startup = Duration::from_secs(2);
    config.timeouts.initialization = Duration::from_secs(2);
    config.timeouts.environment_reload = Duration::from_secs(2);
    config
}

/// Enabled function metadata.
pub fn metadata(function_id: &str) -> FunctionMetadata {
    FunctionMetadata::new(function_id, function_id, "node")
}
