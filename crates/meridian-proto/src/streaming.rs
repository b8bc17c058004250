//! The discriminated message envelope carried on the worker stream.

use rkyv::{Archive, Deserialize, Serialize};

use crate::invocation::{InvocationCancel, InvocationRequest, InvocationResponse};
use crate::lifecycle::{
    FunctionEnvironmentReloadRequest, FunctionEnvironmentReloadResponse, RpcLog, StartStream,
    WorkerInitRequest, WorkerInitResponse, WorkerMetadataResponse, WorkerStatusRequest,
    WorkerStatusResponse, WorkerTerminate,
};
use crate::load::{
    FunctionLoadRequest, FunctionLoadRequestCollection, FunctionLoadResponse,
    FunctionLoadResponseCollection,
};

/// One message on the bidirectional worker stream.
///
/// Every host/worker exchange is a variant of this envelope; consumers
/// match it exhaustively.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum StreamingMessage {
    /// Worker handshake.
    StartStream(StartStream),
    /// Host → worker init request.
    WorkerInitRequest(WorkerInitRequest),
    /// Worker → host init response.
    WorkerInitResponse(WorkerInitResponse),
    /// Host → worker single function load.
    FunctionLoadRequest(FunctionLoadRequest),
    /// Host → worker batched function load.
    FunctionLoadRequestCollection(FunctionLoadRequestCollection),
    /// Worker → host single load response.
    FunctionLoadResponse(FunctionLoadResponse),
    /// Worker → host batched load response.
    FunctionLoadResponseCollection(FunctionLoadResponseCollection),
    /// Host → worker invocation request.
    InvocationRequest(InvocationRequest),
    /// Worker → host invocation response.
    InvocationResponse(InvocationResponse),
    /// Host → worker invocation cancel.
    InvocationCancel(InvocationCancel),
    /// Host → worker environment reload.
    FunctionEnvironmentReloadRequest(FunctionEnvironmentReloadRequest),
    /// Worker → host environment reload response.
    FunctionEnvironmentReloadResponse(FunctionEnvironmentReloadResponse),
    /// Host → worker terminate request.
    WorkerTerminate(WorkerTerminate),
    /// Worker → host log line.
    RpcLog(RpcLog),
    /// Worker → host function metadata from worker-side indexing.
    WorkerMetadataResponse(WorkerMetadataResponse),
    /// Status probe request.
    WorkerStatusRequest(WorkerStatusRequest),
    /// Status probe response.
    WorkerStatusResponse(WorkerStatusResponse),
}

/// Wire discriminant for [`StreamingMessage`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageKind {
    /// Worker handshake.
    StartStream = 0x01,
    /// Init request.
    WorkerInitRequest = 0x02,
    /// Init response.
    WorkerInitResponse = 0x03,
    /// Single function load request.
    FunctionLoadRequest = 0x04,
    /// Batched function load request.
    FunctionLoadRequestCollection = 0x05,
    /// Single function load response.
    FunctionLoadResponse = 0x06,
    /// Batched function load response.
    FunctionLoadResponseCollection = 0x07,
    /// Invocation request.
    InvocationRequest = 0x08,
    /// Invocation response.
    InvocationResponse = 0x09,
    /// Invocation cancel.
    InvocationCancel = 0x0A,
    /// Environment reload request.
    FunctionEnvironmentReloadRequest = 0x0B,
    /// Environment reload response.
    FunctionEnvironmentReloadResponse = 0x0C,
    /// Terminate request.
    WorkerTerminate = 0x0D,
    /// Worker log line.
    RpcLog = 0x0E,
    /// Worker-side metadata.
    WorkerMetadataResponse = 0x0F,
    /// Status probe request.
    WorkerStatusRequest = 0x10,
    /// Status probe response.
    WorkerStatusResponse = 0x11,
}

impl MessageKind {
    /// Returns the numeric value of this kind.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Creates a kind from a numeric value.
    #[must_use]
    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x01 => Some(Self::StartStream),
            0x02 => Some(Self::WorkerInitRequest),
            0x03 => Some(Self::WorkerInitResponse),
            0x04 => Some(Self::FunctionLoadRequest),
            0x05 => Some(Self::FunctionLoadRequestCollection),
            0x06 => Some(Self::FunctionLoadResponse),
            0x07 => Some(Self::FunctionLoadResponseCollection),
            0x08 => Some(Self::InvocationRequest),
            0x09 => Some(Self::InvocationResponse),
            0x0A => Some(Self::InvocationCancel),
            0x0B => Some(Self::FunctionEnvironmentReloadRequest),
            0x0C => Some(Self::FunctionEnvironmentReloadResponse),
            0x0D => Some(Self::WorkerTerminate),
            0x0E => Some(Self::RpcLog),
            0x0F => Some(Self::WorkerMetadataResponse),
            0x10 => Some(Self::WorkerStatusRequest),
            0x11 => Some(Self::WorkerStatusResponse),
            _ => None,
        }
    }
}

impl StreamingMessage {
    /// Returns the wire discriminant for this message.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::StartStream(_) => MessageKind::StartStream,
            Self::WorkerInitRequest(_) => MessageKind::WorkerInitRequest,
            Self::WorkerInitResponse(_) => MessageKind::WorkerInitResponse,
            Self::FunctionLoadRequest(_) => MessageKind::FunctionLoadRequest,
            Self::FunctionLoadRequestCollection(_) => MessageKind::FunctionLoadRequestCollection,
            Self::FunctionLoadResponse(_) => MessageKind::FunctionLoadResponse,
            Self::FunctionLoadResponseCollection(_) => MessageKind::FunctionLoadResponseCollection,
            Self::InvocationRequest(_) => MessageKind::InvocationRequest,
            Self::InvocationResponse(_) => MessageKind::InvocationResponse,
            Self::InvocationCancel(_) => MessageKind::InvocationCancel,
            Self::FunctionEnvironmentReloadRequest(_) => {
                MessageKind::FunctionEnvironmentReloadRequest
            }
            Self::FunctionEnvironmentReloadResponse(_) => {
                MessageKind::FunctionEnvironmentReloadResponse
            }
            Self::WorkerTerminate(_) => MessageKind::WorkerTerminate,
            Self::RpcLog(_) => MessageKind::RpcLog,
            Self::WorkerMetadataResponse(_) => MessageKind::WorkerMetadataResponse,
            Self::WorkerStatusRequest(_) => MessageKind::WorkerStatusRequest,
            Self::WorkerStatusResponse(_) => MessageKind::WorkerStatusResponse,
        }
    }

    /// Returns the message name for diagnostics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::StartStream(_) => "StartStream",
            Self::WorkerInitRequest(_) => "WorkerInitRequest",
            Self::WorkerInitResponse(_) => "WorkerInitResponse",
            Self::FunctionLoadRequest(_) => "FunctionLoadRequest",
            Self::FunctionLoadRequestCollection(_) => "FunctionLoadRequestCollection",
            Self::FunctionLoadResponse(_) => "FunctionLoadResponse",
            Self::FunctionLoadResponseCollection(_) => "FunctionLoadResponseCollection",
            Self::InvocationRequest(_) => "InvocationRequest",
            Self::InvocationResponse(_) => "InvocationResponse",
            Self::InvocationCancel(_) => "InvocationCancel",
            Self::FunctionEnvironmentReloadRequest(_) => "FunctionEnvironmentReloadRequest",
            Self::FunctionEnvironmentReloadResponse(_) => "FunctionEnvironmentReloadResponse",
            Self::WorkerTerminate(_) => "WorkerTerminate",
            Self::RpcLog(_) => "RpcLog",
            Self::WorkerMetadataResponse(_) => "WorkerMetadataResponse",
            Self::WorkerStatusRequest(_) => "WorkerStatusRequest",
            Self::WorkerStatusResponse(_) => "WorkerStatusResponse",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_roundtrip() {
        let kinds = [
            MessageKind::StartStream,
            MessageKind::WorkerInitRequest,
            MessageKind::WorkerInitResponse,
            MessageKind::FunctionLoadRequest,
            MessageKind::FunctionLoadRequestCollection,
            MessageKind::FunctionLoadResponse,
            MessageKind::FunctionLoadResponseCollection,
            MessageKind::InvocationRequest,
            MessageKind::InvocationResponse,
            MessageKind::InvocationCancel,
            MessageKind::FunctionEnvironmentReloadRequest,
            MessageKind::FunctionEnvironmentReloadResponse,
            MessageKind::WorkerTerminate,
            MessageKind::RpcLog,
            MessageKind::WorkerMetadataResponse,
            MessageKind::WorkerStatusRequest,
            MessageKind::WorkerStatusResponse,
        ];

        for kind in kinds {
            assert_eq!(MessageKind::from_u16(kind.as_u16()), Some(kind));
        }

        assert_eq!(MessageKind::from_u16(0xFF), None);
    }

    #[test]
    fn message_kind_and_name_agree() {
        let message = StreamingMessage::StartStream(StartStream {
            worker_id: "testWorkerId".to_owned(),
        });

        assert_eq!(message.kind(), MessageKind::StartStream);
        assert_eq!(message.name(), "StartStream");
    }
}
