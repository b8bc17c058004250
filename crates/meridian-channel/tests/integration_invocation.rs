//! Integration tests for the invocation protocol: dispatch, buffering,
//! cancellation, shared-memory transfer and failure injection.

mod common;

use std::time::Duration;

use common::harness::{default_config, metadata, TestChannel};
use common::logging::LogCapture;
use meridian_channel::{
    capability_names, ChannelError, ChannelState, InvocationContext, InvocationOutcome,
};
use meridian_proto::{
    FunctionLoadResponse, InvocationResponse, ParameterBinding, RpcValue, SharedMemoryDataType,
    StreamingMessage, TypedData,
};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn invocation_round_trip_succeeds() {
    let mut harness = TestChannel::new();
    harness.start_initialized(&[]).await;
    harness.load_functions_ok(vec![metadata("js1")]).await;

    let ctx = InvocationContext::new("js1")
        .with_input("body", TypedData::String("hello".to_owned()));
    let invocation_id = ctx.invocation_id;

    let receiver = harness.channel.send_invocation(ctx).await.unwrap();
    assert!(harness.channel.is_executing_invocation(&invocation_id));

    let message = harness.expect_outbound().await;
    let StreamingMessage::InvocationRequest(request) = message else {
        panic!("expected InvocationRequest, got {}", message.name());
    };
    assert_eq!(request.invocation_id, invocation_id);
    assert_eq!(request.function_id, "js1");
    assert_eq!(request.inputs.len(), 1);

    harness.send_inbound(StreamingMessage::InvocationResponse(
        InvocationResponse::success(invocation_id).with_output(ParameterBinding::inline(
            "result",
            TypedData::String("world".to_owned()),
        )),
    ));

    let outcome = receiver.await.unwrap();
    match outcome {
        InvocationOutcome::Success { outputs, .. } => {
            assert_eq!(outputs.len(), 1);
            assert_eq!(outputs[0].name, "result");
        }
        other => panic!("expected Success, got {other:?}"),
    }
    assert!(!harness.channel.is_executing_invocation(&invocation_id));
}

#[tokio::test]
async fn pre_cancelled_token_short_circuits_without_wire_traffic() {
    let (logs, _guard) = LogCapture::install();
    let mut harness = TestChannel::new();
    harness.start_initialized(&[]).await;
    harness.load_functions_ok(vec![metadata("js1")]).await;

    let token = CancellationToken::new();
    token.cancel();

    let ctx = InvocationContext::new("js1").with_cancellation(token);
    let invocation_id = ctx.invocation_id;

    let receiver = harness.channel.send_invocation(ctx).await.unwrap();

    let outcome = receiver.await.unwrap();
    assert!(matches!(outcome, InvocationOutcome::Cancelled));
    assert!(!harness.channel.is_executing_invocation(&invocation_id));
    assert!(harness.no_more_outbound());
    assert!(logs.contains("Cancellation has been requested, cancelling invocation request"));
}

#[tokio::test]
async fn cancel_with_capability_sends_wire_cancel() {
    let (logs, _guard) = LogCapture::install();
    let mut harness = TestChannel::new();
    harness
        .start_initialized(&[(capability_names::HANDLES_INVOCATION_CANCEL, "1")])
        .await;
    harness.load_functions_ok(vec![metadata("js1")]).await;

    let token = CancellationToken::new();
    let ctx = InvocationContext::new("js1").with_cancellation(token.clone());
    let invocation_id = ctx.invocation_id;

    let receiver = harness.channel.send_invocation(ctx).await.unwrap();

    let request = harness.expect_outbound().await;
    assert!(matches!(request, StreamingMessage::InvocationRequest(_)));

    // Caller gives up after the request is already on the wire.
    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    let cancel = harness.expect_outbound().await;
    let StreamingMessage::InvocationCancel(cancel) = cancel else {
        panic!("expected InvocationCancel, got {}", cancel.name());
    };
    assert_eq!(cancel.invocation_id, invocation_id);
    assert!(logs.contains(&format!(
        "Sending invocation cancel request for InvocationId {invocation_id}"
    )));

    // The registry entry is retained; the worker gets the last word.
    assert!(harness.channel.is_executing_invocation(&invocation_id));
    harness.send_inbound(StreamingMessage::InvocationResponse(
        InvocationResponse::cancelled(invocation_id),
    ));

    let outcome = receiver.await.unwrap();
    assert!(matches!(outcome, InvocationOutcome::Cancelled));
}

#[tokio::test]
async fn cancel_without_capability_is_local_only() {
    let (logs, _guard) = LogCapture::install();
    let mut harness = TestChannel::new();
    harness.start_initialized(&[]).await;
    harness.load_functions_ok(vec![metadata("js1")]).await;

    let token = CancellationToken::new();
    let ctx = InvocationContext::new("js1").with_cancellation(token.clone());
    let invocation_id = ctx.invocation_id;

    let receiver = harness.channel.send_invocation(ctx).await.unwrap();
    let _request = harness.expect_outbound().await;

    token.cancel();

    let outcome = receiver.await.unwrap();
    assert!(matches!(outcome, InvocationOutcome::Cancelled));
    assert!(!harness.channel.is_executing_invocation(&invocation_id));

    // No wire cancel and no cancel log without the capability.
    assert!(harness.no_more_outbound());
    assert!(!logs.contains("Sending invocation cancel request"));
}

#[tokio::test]
async fn invocations_buffered_while_loading_flush_in_order() {
    let mut harness = TestChannel::new();
    harness.start_initialized(&[]).await;

    harness
        .channel
        .setup_function_invocation_buffers(vec![metadata("js1")])
        .unwrap();

    let channel = harness.channel.clone();
    let load = tokio::spawn(async move { channel.send_function_load_requests(None).await });

    let load_request = harness.expect_outbound().await;
    assert!(matches!(
        load_request,
        StreamingMessage::FunctionLoadRequest(_)
    ));
    assert_eq!(harness.channel.state(), ChannelState::LoadingFunctions);

    // Two invocations arrive before the worker acknowledges the load.
    let first = InvocationContext::new("js1");
    let first_id = first.invocation_id;
    let second = InvocationContext::new("js1");
    let second_id = second.invocation_id;

    let first_rx = harness.channel.send_invocation(first).await.unwrap();
    let second_rx = harness.channel.send_invocation(second).await.unwrap();

    // Nothing crosses the wire before the load response.
    assert!(harness.no_more_outbound());

    harness.send_inbound(StreamingMessage::FunctionLoadResponse(
        FunctionLoadResponse::success("js1"),
    ));
    load.await.unwrap().unwrap();
    assert_eq!(harness.channel.state(), ChannelState::Ready);

    for expected in [first_id, second_id] {
        let message = harness.expect_outbound().await;
        let StreamingMessage::InvocationRequest(request) = message else {
            panic!("expected InvocationRequest, got {}", message.name());
        };
        assert_eq!(request.invocation_id, expected);
        harness.send_inbound(StreamingMessage::InvocationResponse(
            InvocationResponse::success(expected),
        ));
    }

    assert!(matches!(
        first_rx.await.unwrap(),
        InvocationOutcome::Success { .. }
    ));
    assert!(matches!(
        second_rx.await.unwrap(),
        InvocationOutcome::Success { .. }
    ));
}

#[tokio::test]
async fn load_failure_fails_buffered_invocations() {
    let mut harness = TestChannel::new();
    harness.start_initialized(&[]).await;

    harness
        .channel
        .setup_function_invocation_buffers(vec![metadata("js1"), metadata("js2")])
        .unwrap();

    let channel = harness.channel.clone();
    let load = tokio::spawn(async move { channel.send_function_load_requests(None).await });
    let _first_load = harness.expect_outbound().await;
    let _second_load = harness.expect_outbound().await;

    let ctx = InvocationContext::new("js1");
    let receiver = harness.channel.send_invocation(ctx).await.unwrap();

    harness.send_inbound(StreamingMessage::FunctionLoadResponse(
        FunctionLoadResponse::failure("js1", "missing module"),
    ));
    harness.send_inbound(StreamingMessage::FunctionLoadResponse(
        FunctionLoadResponse::success("js2"),
    ));
    load.await.unwrap().unwrap();

    let outcome = receiver.await.unwrap();
    match outcome {
        InvocationOutcome::Failure(ChannelError::LoadFailure {
            function_id,
            reason,
        }) => {
            assert_eq!(function_id, "js1");
            assert_eq!(reason, "missing module");
        }
        other => panic!("expected LoadFailure, got {other:?}"),
    }

    // A later invoke against the failed function fails immediately.
    let late = InvocationContext::new("js1");
    let late_rx = harness.channel.send_invocation(late).await.unwrap();
    assert!(matches!(
        late_rx.await.unwrap(),
        InvocationOutcome::Failure(ChannelError::LoadFailure { .. })
    ));
}

#[tokio::test]
async fn try_fail_executions_faults_in_flight_work_idempotently() {
    let mut harness = TestChannel::new();
    harness.start_initialized(&[]).await;
    harness.load_functions_ok(vec![metadata("js1")]).await;

    let ctx = InvocationContext::new("js1");
    let invocation_id = ctx.invocation_id;
    let receiver = harness.channel.send_invocation(ctx).await.unwrap();
    let _request = harness.expect_outbound().await;

    let failure = ChannelError::WorkerProcessFailure("worker crashed".to_owned());
    harness.channel.try_fail_executions(&failure);
    harness.channel.try_fail_executions(&failure);

    assert!(!harness.channel.is_executing_invocation(&invocation_id));
    assert_eq!(harness.channel.executing_count(), 0);

    let outcome = receiver.await.unwrap();
    assert!(matches!(
        outcome,
        InvocationOutcome::Failure(ChannelError::WorkerProcessFailure(_))
    ));
}

#[tokio::test]
async fn unknown_invocation_response_is_dropped() {
    let mut harness = TestChannel::new();
    harness.start_initialized(&[]).await;
    harness.load_functions_ok(vec![metadata("js1")]).await;

    harness.send_inbound(StreamingMessage::InvocationResponse(
        InvocationResponse::success(meridian_proto::InvocationId::new()),
    ));

    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
    // Channel unaffected.
    assert_eq!(harness.channel.state(), ChannelState::Ready);
}

#[tokio::test]
async fn large_inputs_use_shared_memory_when_negotiated() {
    let mut config = default_config();
    config.features.shared_memory_data_transfer = true;
    config.shared_memory.transfer_threshold = 64;
    let mut harness = TestChannel::with_config(config);

    harness
        .start_initialized(&[(capability_names::SHARED_MEMORY_DATA_TRANSFER, "1")])
        .await;
    harness.load_functions_ok(vec![metadata("js1")]).await;

    let big = vec![0xAB; 4096];
    let ctx = InvocationContext::new("js1")
        .with_input("payload", TypedData::Bytes(big.clone()))
        .with_input("small", TypedData::String("tiny".to_owned()));
    let invocation_id = ctx.invocation_id;

    let receiver = harness.channel.send_invocation(ctx).await.unwrap();

    let message = harness.expect_outbound().await;
    let StreamingMessage::InvocationRequest(request) = message else {
        panic!("expected InvocationRequest");
    };

    let RpcValue::SharedMemory(descriptor) = &request.inputs[0].data else {
        panic!("large input should travel via shared memory");
    };
    assert_eq!(descriptor.count, 4096);
    assert!(matches!(request.inputs[1].data, RpcValue::Inline(_)));

    // The worker side can read the payload out of the region.
    let payload = harness.shared_memory.read(descriptor).unwrap();
    assert_eq!(payload, big);
    harness.shared_memory.release(&descriptor.name);

    // Worker answers with a shared-memory output; the host copies it out
    // and releases the region.
    let output = harness
        .shared_memory
        .allocate(b"function output", SharedMemoryDataType::Bytes);
    harness.send_inbound(StreamingMessage::InvocationResponse(
        InvocationResponse::success(invocation_id)
            .with_output(ParameterBinding::shared_memory("out", output)),
    ));

    let outcome = receiver.await.unwrap();
    match outcome {
        InvocationOutcome::Success { outputs, .. } => {
            assert_eq!(outputs.len(), 1);
            match &outputs[0].data {
                RpcValue::Inline(TypedData::Bytes(bytes)) => {
                    assert_eq!(bytes, b"function output");
                }
                other => panic!("expected copied-out bytes, got {other:?}"),
            }
        }
        other => panic!("expected Success, got {other:?}"),
    }

    // All regions released once the exchange completes.
    assert_eq!(harness.shared_memory.region_count(), 0);
}

#[tokio::test]
async fn without_negotiation_no_message_carries_shared_memory() {
    // Env toggle off even though the worker advertises the capability.
    let mut harness = TestChannel::new();
    harness
        .start_initialized(&[(capability_names::SHARED_MEMORY_DATA_TRANSFER, "1")])
        .await;
    harness.load_functions_ok(vec![metadata("js1")]).await;

    let ctx = InvocationContext::new("js1")
        .with_input("payload", TypedData::Bytes(vec![0xCD; 4 * 1024 * 1024]));
    let _receiver = harness.channel.send_invocation(ctx).await.unwrap();

    let message = harness.expect_outbound().await;
    let StreamingMessage::InvocationRequest(request) = message else {
        panic!("expected InvocationRequest");
    };
    assert!(request
        .inputs
        .iter()
        .all(|input| matches!(input.data, RpcValue::Inline(_))));
    assert_eq!(harness.shared_memory.region_count(), 0);
}

#[tokio::test]
async fn trace_context_is_enriched_only_with_telemetry_agent() {
    let mut config = default_config();
    config.features.telemetry_agent = true;
    let mut harness = TestChannel::with_config(config);
    harness.start_initialized(&[]).await;
    harness.load_functions_ok(vec![metadata("js1")]).await;

    let mut ctx = InvocationContext::new("js1");
    ctx.live_logs_session_id = Some("session-7".to_owned());
    let _receiver = harness.channel.send_invocation(ctx).await.unwrap();

    let message = harness.expect_outbound().await;
    let StreamingMessage::InvocationRequest(request) = message else {
        panic!("expected InvocationRequest");
    };
    assert_eq!(request.trace_context.attribute("ProcessId"), Some("4242"));
    assert_eq!(
        request.trace_context.attribute("HostInstanceId"),
        Some("test-host-instance")
    );
    assert_eq!(
        request.trace_context.attribute("CategoryName"),
        Some("Function.js1")
    );
    assert_eq!(
        request.trace_context.attribute("LiveLogsSessionId"),
        Some("session-7")
    );

    // With the agent disabled, nothing is attached.
    let mut plain = TestChannel::new();
    plain.start_initialized(&[]).await;
    plain.load_functions_ok(vec![metadata("js1")]).await;

    let _receiver = plain
        .channel
        .send_invocation(InvocationContext::new("js1"))
        .await
        .unwrap();
    let message = plain.expect_outbound().await;
    let StreamingMessage::InvocationRequest(request) = message else {
        panic!("expected InvocationRequest");
    };
    assert!(request.trace_context.attributes.is_empty());
}

#[tokio::test]
async fn invocation_deadline_expires_locally() {
    let mut harness = TestChannel::new();
    harness.start_initialized(&[]).await;
    harness.load_functions_ok(vec![metadata("js1")]).await;

    let ctx = InvocationContext::new("js1").with_deadline(Duration::from_millis(50));
    let invocation_id = ctx.invocation_id;
    let receiver = harness.channel.send_invocation(ctx).await.unwrap();
    let _request = harness.expect_outbound().await;

    let outcome = receiver.await.unwrap();
    assert!(matches!(
        outcome,
        InvocationOutcome::Failure(ChannelError::Timeout { .. })
    ));
    assert!(!harness.channel.is_executing_invocation(&invocation_id));
}
