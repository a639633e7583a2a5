use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ChatErrorKind;

/// Connection health reported to subscribers.
///
/// The numeric codes are part of the external contract and must not change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    /// No `Start` has been issued yet.
    Uninitialized = 0,
    /// A connection attempt is in flight.
    Connecting = 1,
    /// The activity stream is open.
    Online = 2,
    /// The remote rejected the credential as expired. Terminal for the session.
    ExpiredToken = 3,
    /// The last attempt failed. Terminal once the retry budget is exhausted.
    FailedToConnect = 4,
    /// The conversation was closed locally or by the remote. Terminal.
    Ended = 5,
}

impl ConnectionState {
    /// Stable numeric code exposed to external subscribers.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Inverse of [`ConnectionState::code`].
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Uninitialized),
            1 => Some(Self::Connecting),
            2 => Some(Self::Online),
            3 => Some(Self::ExpiredToken),
            4 => Some(Self::FailedToConnect),
            5 => Some(Self::Ended),
            _ => None,
        }
    }
}

/// Activity category after normalization.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    Message,
    Typing,
    ConversationUpdate,
    Event,
}

impl ActivityKind {
    /// Parse the wire `type` field.
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "message" => Some(Self::Message),
            "typing" => Some(Self::Typing),
            "conversationUpdate" => Some(Self::ConversationUpdate),
            "event" => Some(Self::Event),
            _ => None,
        }
    }

    /// Wire representation of the kind.
    pub fn as_wire(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Typing => "typing",
            Self::ConversationUpdate => "conversationUpdate",
            Self::Event => "event",
        }
    }

    /// Whether activities of this kind belong in the ordered history.
    ///
    /// Typing indicators are transient hints and never enter the buffer.
    pub fn is_orderable(self) -> bool {
        !matches!(self, Self::Typing)
    }
}

/// Who authored an activity, from the local user's point of view.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Agent,
}

/// Sender reference carried by inbound activities.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChannelAccount {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Attachment reference. Content is never fetched or decoded by the core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(default)]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// One suggested quick-reply action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CardAction {
    #[serde(rename = "type", default)]
    pub action_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

/// Container for suggested actions as sent on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SuggestedActions {
    #[serde(default)]
    pub actions: Vec<CardAction>,
}

/// Inbound activity payload exactly as received from the transport.
///
/// Every field is optional; validation happens in the normalizer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RawActivity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub activity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<ChannelAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_actions: Option<SuggestedActions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
}

/// Canonical activity produced by the normalizer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizedActivity {
    /// Wire ID, or a synthetic `local-<sequence>` ID when the payload had none.
    pub id: String,
    pub kind: ActivityKind,
    pub from_role: Role,
    pub sender_id: Option<String>,
    /// Display text; empty when the activity only carries attachments/actions.
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub suggested_actions: Vec<CardAction>,
    pub reply_to_id: Option<String>,
    /// Resolved timestamp used for ordering.
    pub timestamp: DateTime<Utc>,
    /// Timestamp string as received, kept for diagnostics.
    pub source_timestamp: Option<String>,
    /// `true` when the timestamp was absent or unparsable and receipt time was used.
    pub timestamp_defaulted: bool,
    /// `true` when the source timestamp was outside the allowed clock skew.
    pub ordering_anomaly: bool,
    /// Monotonic ingestion counter, used as the ordering tie-break.
    pub received_sequence: u64,
}

/// Render progress of an ordered message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RenderState {
    Pending,
    Streaming,
    Finalized,
}

/// Entry of the ordered message history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderedMessage {
    pub activity: NormalizedActivity,
    pub resolved_timestamp: DateTime<Utc>,
    pub render_state: RenderState,
}

impl OrderedMessage {
    /// Wrap a normalized activity as a pending ordered message.
    pub fn pending(activity: NormalizedActivity) -> Self {
        let resolved_timestamp = activity.timestamp;
        Self {
            activity,
            resolved_timestamp,
            render_state: RenderState::Pending,
        }
    }

    pub fn id(&self) -> &str {
        &self.activity.id
    }

    /// Sort key: `(resolved_timestamp, received_sequence)`.
    pub fn sort_key(&self) -> (DateTime<Utc>, u64) {
        (self.resolved_timestamp, self.activity.received_sequence)
    }
}

/// One progressive-reveal emission for a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamingUpdate {
    pub message_id: String,
    /// Revealed prefix. Equals the full content when `is_final`.
    pub prefix: String,
    pub is_final: bool,
}

/// Acknowledgement for an outbound user message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendAck {
    /// Client-generated ID returned by the send call.
    pub client_activity_id: String,
    /// Server-assigned activity ID on success.
    pub activity_id: Option<String>,
    /// Stable error code on failure.
    pub error_code: Option<String>,
}

/// Optional runtime tuning supplied when spawning a runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ChatInitConfig {
    /// Connect attempt time box in milliseconds.
    pub connect_timeout_ms: Option<u64>,
    /// Allowed distance between a source timestamp and the local clock.
    pub max_clock_skew_secs: Option<u64>,
    /// Retention cap of the ordering buffer.
    pub timeline_max_items: Option<usize>,
    /// Upper bound of a simulated reveal in milliseconds.
    pub reveal_ceiling_ms: Option<u64>,
    /// Whether agent messages are revealed progressively.
    pub simulate_streaming: Option<bool>,
}

/// Command channel input accepted by the chat runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    /// Begin a new session with the given secret or token.
    Start { credential: String },
    /// End the current session.
    Stop,
    /// Send a user text message.
    SendText {
        /// Caller-chosen ID echoed in `SendAck`.
        client_activity_id: String,
        text: String,
    },
    /// Skip a simulated reveal to the end.
    CancelStream { message_id: String },
    /// Emit the full ordered history.
    Snapshot,
}

/// Event channel output emitted by the chat runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ChatEvent {
    /// Connection state transition.
    StatusChanged { state: ConnectionState },
    /// A message entered the ordered history at `position`.
    ///
    /// Consumers must re-render from `position` forward when it is not the tail.
    ActivityOrdered {
        message: OrderedMessage,
        position: usize,
    },
    /// Transient typing hint; never part of the history.
    Typing { activity: NormalizedActivity },
    /// Progressive reveal of a message.
    StreamingUpdate(StreamingUpdate),
    /// Terminal or non-retryable connection failure.
    ConnectionError {
        kind: ChatErrorKind,
        code: String,
        message: String,
    },
    /// Outbound message acknowledgement.
    SendAck(SendAck),
    /// Full ordered history, in display order.
    TimelineSnapshot { messages: Vec<OrderedMessage> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_state_codes_are_stable() {
        let expected = [
            (ConnectionState::Uninitialized, 0),
            (ConnectionState::Connecting, 1),
            (ConnectionState::Online, 2),
            (ConnectionState::ExpiredToken, 3),
            (ConnectionState::FailedToConnect, 4),
            (ConnectionState::Ended, 5),
        ];
        for (state, code) in expected {
            assert_eq!(state.code(), code);
            assert_eq!(ConnectionState::from_code(code), Some(state));
        }
        assert_eq!(ConnectionState::from_code(6), None);
    }

    #[test]
    fn parses_wire_activity_payload() {
        let raw: RawActivity = serde_json::from_str(
            r#"{
                "id": "conv|0001",
                "type": "message",
                "from": { "id": "bot-1", "name": "Helper" },
                "text": "hi",
                "timestamp": "2024-05-01T10:00:02.1234567Z",
                "attachments": [{ "contentType": "image/png", "contentUrl": "https://x/y.png" }],
                "suggestedActions": { "actions": [{ "type": "imBack", "title": "Yes", "value": "yes" }] }
            }"#,
        )
        .expect("payload should parse");

        assert_eq!(raw.activity_type.as_deref(), Some("message"));
        assert_eq!(raw.from.as_ref().map(|f| f.id.as_str()), Some("bot-1"));
        let attachments = raw.attachments.expect("attachments");
        assert_eq!(attachments[0].content_type, "image/png");
        assert_eq!(attachments[0].name, None);
        let actions = raw.suggested_actions.expect("actions").actions;
        assert_eq!(actions[0].action_type, "imBack");
    }

    #[test]
    fn typing_is_the_only_transient_kind() {
        assert!(!ActivityKind::Typing.is_orderable());
        assert!(ActivityKind::Message.is_orderable());
        assert!(ActivityKind::ConversationUpdate.is_orderable());
        assert!(ActivityKind::Event.is_orderable());
        assert_eq!(
            ActivityKind::from_wire("conversationUpdate"),
            Some(ActivityKind::ConversationUpdate)
        );
        assert_eq!(ActivityKind::from_wire("invoke"), None);
    }
}
