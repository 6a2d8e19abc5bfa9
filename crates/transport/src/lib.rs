pub mod backend;
pub mod event;
pub mod failure;
pub mod frame;
pub mod http;
pub mod pump;

pub use backend::{
    BackendError, BackendResult, BackendStreamHandle, BackendWorker, ChatBackend, ChatEventStream,
    ChatRequest, StreamEventMapped, StreamEventPayload, StreamId, StreamTarget, event_channel,
};
pub use event::{DONE_SENTINEL, Interpreted, interpret};
pub use failure::{FailureKind, server_failure_message, transport_failure_message};
pub use frame::{Frame, FrameDecoder, extract_payload};
pub use http::{
    BackendConfig, DEFAULT_BASE_URL, DEFAULT_REQUEST_TIMEOUT, HTTP_BACKEND_ID, HttpChatBackend,
    MAX_REQUEST_TIMEOUT,
};
pub use pump::{PumpOutcome, pump_byte_stream};
