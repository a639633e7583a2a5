//! Core chat contract shared between the connection runtime and UI consumers.
//!
//! This crate defines the command/event protocol, the connection lifecycle
//! model, retry scheduling, activity normalization, chronological ordering and
//! the streaming-reveal simulator. It performs no I/O.

/// Async command/event channel primitives.
pub mod channel;
/// Locally validated secret/token wrapper.
pub mod credential;
/// Stable chat error types and HTTP classification helpers.
pub mod error;
/// Inbound activity normalization, send acknowledgements and error events.
pub mod normalization;
/// Backoff scheduling used by the connection supervisor.
pub mod retry;
/// Connection lifecycle state machine.
pub mod state_machine;
/// Progressive reveal of complete messages.
pub mod streaming;
/// Chronological message ordering buffer.
pub mod timeline;
/// Protocol types (commands, events, payloads).
pub mod types;

pub use channel::{ChatChannelError, ChatChannels, EventSink, EventStream};
pub use credential::Credential;
pub use error::{ChatError, ChatErrorKind, classify_http_status};
pub use normalization::{
    ActivityNormalizer, NormalizeRejection, SendOutcome, normalize_connection_error,
    normalize_send_outcome, send_ack_for,
};
pub use retry::{RetryDecision, RetryScheduler, RetryState};
pub use state_machine::ConnectionStateMachine;
pub use streaming::{RevealPlan, StreamId, StreamingConfig, StreamingError, StreamingSimulator};
pub use timeline::{MessageOrderingBuffer, OrderingError};
pub use types::{
    ActivityKind, Attachment, CardAction, ChannelAccount, ChatCommand, ChatEvent, ChatInitConfig,
    ConnectionState, NormalizedActivity, OrderedMessage, RawActivity, RenderState, Role, SendAck,
    StreamingUpdate, SuggestedActions,
};
