//! DirectLine connectivity and the chat runtime actor.
//!
//! The runtime owns a [`ConnectionSupervisor`], feeds normalized activities
//! into the ordering buffer, drives streaming reveals and archives finalized
//! messages through a session bridge. Transports are pluggable: the DirectLine
//! REST/WebSocket client for real agents and a loopback echo agent for offline use.

pub mod directline;
pub mod loopback;
pub mod runtime;
pub mod supervisor;
pub mod ticker;
pub mod transport;

pub use directline::{
    DEFAULT_DIRECTLINE_DOMAIN, DirectLineConfig, DirectLineTransport, RequestPhase, TransportError,
};
pub use loopback::LoopbackTransport;
pub use runtime::{ChatRuntimeConfig, ChatRuntimeHandle, spawn_runtime};
pub use supervisor::{
    ConnectionSupervisor, DEFAULT_CONNECT_TIMEOUT, SupervisorConfig, SupervisorSignal,
};
pub use ticker::{StreamTick, StreamTicker};
pub use transport::{
    DEFAULT_OUTBOX_BUFFER, OpenMode, OutgoingActivity, Transport, TransportEvent, TransportSession,
};
