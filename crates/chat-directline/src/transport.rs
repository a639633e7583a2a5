use async_trait::async_trait;
use chat_core::{ChatError, Credential, RawActivity, SendOutcome};
use futures::stream::{self, BoxStream};
use tokio::sync::mpsc;
use tokio_util::sync::DropGuard;

/// Outbox capacity of a transport session.
pub const DEFAULT_OUTBOX_BUFFER: usize = 32;

/// How a transport should open the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Start a brand new conversation.
    Fresh,
    /// Reconnect to the last conversation, continuing after the last watermark.
    Resume,
}

/// User message queued for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingActivity {
    pub client_activity_id: String,
    pub from_id: String,
    pub text: String,
}

/// Signal produced by an open transport session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// One inbound activity, unvalidated.
    Activity(RawActivity),
    /// The stream broke; the error says whether a retry makes sense.
    Dropped(ChatError),
    /// The remote reported the session token as expired.
    AuthorizationExpired,
    /// The remote ended the conversation.
    Closed,
    /// Delivery result of an [`OutgoingActivity`].
    SendOutcome {
        client_activity_id: String,
        outcome: SendOutcome,
    },
}

/// An open connection: inbound events plus the outbound queue.
///
/// Dropping `events` releases the connection.
pub struct TransportSession {
    pub events: BoxStream<'static, TransportEvent>,
    pub outbox: mpsc::Sender<OutgoingActivity>,
}

impl TransportSession {
    /// Build a session whose event stream cancels `guard` when dropped.
    pub fn from_channel(
        events: mpsc::Receiver<TransportEvent>,
        outbox: mpsc::Sender<OutgoingActivity>,
        guard: DropGuard,
    ) -> Self {
        let events = stream::unfold((events, guard), |(mut rx, guard)| async move {
            rx.recv().await.map(|event| (event, (rx, guard)))
        });
        Self {
            events: Box::pin(events),
            outbox,
        }
    }
}

impl std::fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSession").finish_non_exhaustive()
    }
}

/// Connection factory used by the supervisor.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a conversation. Errors carry the kind that drives retry decisions.
    async fn open(
        &self,
        credential: &Credential,
        mode: OpenMode,
    ) -> Result<TransportSession, ChatError>;
}
