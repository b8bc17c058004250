//! Wire protocol types for the Meridian host ↔ worker RPC stream.
//!
//! Every exchange between the host and a language worker is a variant of
//! the [`StreamingMessage`] envelope: handshake, initialization, function
//! load, invocation, environment reload, termination, log forwarding and
//! the status probe. Messages are rkyv-serialisable; [`codec`] provides
//! the framed wire form (8-byte header + payload).
//!
//! Large invocation payloads may be carried out-of-band as
//! [`RpcSharedMemory`] descriptors when shared-memory transfer is
//! negotiated.

pub mod codec;
mod error;
mod invocation;
mod lifecycle;
mod load;
mod streaming;
mod types;

pub use codec::{Codec, FrameHeader, CURRENT_VERSION, FRAME_HEADER_SIZE, MAX_MESSAGE_SIZE};
pub use error::ProtocolError;
pub use invocation::{InvocationCancel, InvocationRequest, InvocationResponse};
pub use lifecycle::{
    FunctionEnvironmentReloadRequest, FunctionEnvironmentReloadResponse, RpcLog, StartStream,
    WorkerInitRequest, WorkerInitResponse, WorkerMetadataResponse, WorkerStatusRequest,
    WorkerStatusResponse, WorkerTerminate,
};
pub use load::{
    FunctionLoadRequest, FunctionLoadRequestCollection, FunctionLoadResponse,
    FunctionLoadResponseCollection,
};
pub use streaming::{MessageKind, StreamingMessage};
pub use types::{
    CorrelationId, FunctionMetadata, InvocationId, LogCategory, LogLevel, ParameterBinding,
    RpcSharedMemory, RpcValue, SharedMemoryDataType, Status, StatusResult, TraceContext, TypedData,
    WorkerId,
};
