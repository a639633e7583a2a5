use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    error::{ChatError, ChatErrorKind},
    types::{ActivityKind, ChatEvent, NormalizedActivity, RawActivity, Role, SendAck},
};

/// Number of recent activity IDs remembered for duplicate suppression.
pub const DEFAULT_DEDUP_WINDOW: usize = 500;
/// Allowed distance between a source timestamp and the local clock.
pub const DEFAULT_MAX_CLOCK_SKEW_SECS: u64 = 24 * 60 * 60;
const MAX_CLOCK_SKEW_CLAMP_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Why a raw payload produced no activity.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NormalizeRejection {
    /// The ID was already seen within the recent-ID window.
    #[error("activity '{0}' was already delivered")]
    Duplicate(String),
    /// The payload has an unknown type or no renderable content.
    #[error("malformed activity: {0}")]
    Malformed(String),
}

/// Converts inbound payloads into [`NormalizedActivity`] values.
///
/// Owns timestamp resolution, duplicate suppression, role resolution and the
/// ingestion sequence counter, so downstream ordering never re-parses input.
#[derive(Debug, Clone)]
pub struct ActivityNormalizer {
    local_user_id: String,
    max_clock_skew: ChronoDuration,
    dedup_window: usize,
    recent_ids: VecDeque<String>,
    seen_ids: HashSet<String>,
    next_sequence: u64,
}

impl ActivityNormalizer {
    pub fn new(local_user_id: impl Into<String>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            max_clock_skew: ChronoDuration::seconds(DEFAULT_MAX_CLOCK_SKEW_SECS as i64),
            dedup_window: DEFAULT_DEDUP_WINDOW,
            recent_ids: VecDeque::with_capacity(DEFAULT_DEDUP_WINDOW),
            seen_ids: HashSet::with_capacity(DEFAULT_DEDUP_WINDOW),
            next_sequence: 0,
        }
    }

    pub fn with_max_clock_skew_secs(mut self, secs: u64) -> Self {
        let secs = secs.min(MAX_CLOCK_SKEW_CLAMP_SECS) as i64;
        self.max_clock_skew = ChronoDuration::seconds(secs);
        self
    }

    /// Resize the recent-ID window (`window >= 1`).
    pub fn with_dedup_window(mut self, window: usize) -> Self {
        self.dedup_window = window.max(1);
        while self.recent_ids.len() > self.dedup_window {
            self.forget_oldest_id();
        }
        self
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    /// Sequence number that the next accepted activity will receive.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Continue numbering after a restored history and remember its IDs.
    pub fn resume_after<'a>(
        &mut self,
        last_sequence: Option<u64>,
        known_ids: impl IntoIterator<Item = &'a str>,
    ) {
        if let Some(last) = last_sequence {
            self.next_sequence = self.next_sequence.max(last.saturating_add(1));
        }
        for id in known_ids {
            self.remember_id(id);
        }
    }

    /// Normalize one payload received at `received_at`.
    pub fn normalize(
        &mut self,
        raw: RawActivity,
        received_at: DateTime<Utc>,
    ) -> Result<NormalizedActivity, NormalizeRejection> {
        let kind = match raw.activity_type.as_deref() {
            Some(value) => ActivityKind::from_wire(value).ok_or_else(|| {
                NormalizeRejection::Malformed(format!("unsupported activity type '{value}'"))
            })?,
            None => {
                return Err(NormalizeRejection::Malformed(
                    "activity has no type".to_owned(),
                ));
            }
        };

        if let Some(id) = raw.id.as_deref()
            && self.seen_ids.contains(id)
        {
            return Err(NormalizeRejection::Duplicate(id.to_owned()));
        }

        let text = raw.text.unwrap_or_default();
        let attachments = raw.attachments.unwrap_or_default();
        let suggested_actions = raw
            .suggested_actions
            .map(|actions| actions.actions)
            .unwrap_or_default();

        let renderable =
            !text.trim().is_empty() || !attachments.is_empty() || !suggested_actions.is_empty();
        if !renderable && kind != ActivityKind::Typing {
            return Err(NormalizeRejection::Malformed(format!(
                "{} activity carries no text, attachments or suggested actions",
                kind.as_wire()
            )));
        }

        let (timestamp, timestamp_defaulted, ordering_anomaly) =
            self.resolve_timestamp(raw.timestamp.as_deref(), received_at);

        let sender_id = raw.from.map(|from| from.id).filter(|id| !id.is_empty());
        let from_role = if sender_id.as_deref() == Some(self.local_user_id.as_str()) {
            Role::User
        } else {
            Role::Agent
        };

        let received_sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.saturating_add(1);

        let id = match raw.id {
            Some(id) => {
                self.remember_id(&id);
                id
            }
            None => format!("local-{received_sequence}"),
        };

        Ok(NormalizedActivity {
            id,
            kind,
            from_role,
            sender_id,
            text,
            attachments,
            suggested_actions,
            reply_to_id: raw.reply_to_id,
            timestamp,
            source_timestamp: raw.timestamp,
            timestamp_defaulted,
            ordering_anomaly,
            received_sequence,
        })
    }

    /// Normalize and log drops the way the connection pipeline expects.
    pub fn ingest(
        &mut self,
        raw: RawActivity,
        received_at: DateTime<Utc>,
    ) -> Option<NormalizedActivity> {
        match self.normalize(raw, received_at) {
            Ok(activity) => {
                if activity.ordering_anomaly {
                    warn!(
                        activity_id = %activity.id,
                        source_timestamp = ?activity.source_timestamp,
                        code = "ordering_anomaly",
                        "activity timestamp outside allowed clock skew; using receipt time"
                    );
                } else if activity.timestamp_defaulted {
                    debug!(
                        activity_id = %activity.id,
                        source_timestamp = ?activity.source_timestamp,
                        "activity timestamp missing or unparsable; using receipt time"
                    );
                }
                Some(activity)
            }
            Err(NormalizeRejection::Duplicate(id)) => {
                debug!(activity_id = %id, "dropping duplicate activity");
                None
            }
            Err(NormalizeRejection::Malformed(reason)) => {
                debug!(code = "malformed_activity", %reason, "dropping activity");
                None
            }
        }
    }

    fn resolve_timestamp(
        &self,
        source: Option<&str>,
        received_at: DateTime<Utc>,
    ) -> (DateTime<Utc>, bool, bool) {
        let Some(parsed) = source.and_then(parse_timestamp) else {
            return (received_at, true, false);
        };

        let skew = if parsed > received_at {
            parsed - received_at
        } else {
            received_at - parsed
        };
        if skew > self.max_clock_skew {
            return (received_at, true, true);
        }

        (parsed, false, false)
    }

    fn remember_id(&mut self, id: &str) {
        if !self.seen_ids.insert(id.to_owned()) {
            return;
        }
        self.recent_ids.push_back(id.to_owned());
        while self.recent_ids.len() > self.dedup_window {
            self.forget_oldest_id();
        }
    }

    fn forget_oldest_id(&mut self) {
        if let Some(old) = self.recent_ids.pop_front() {
            self.seen_ids.remove(&old);
        }
    }
}

/// Parse an ISO-8601 / RFC 3339 timestamp into UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .ok()
}

/// Internal helper describing send success/failure before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Send succeeded and the remote assigned an activity ID.
    Success { activity_id: String },
    /// Send failed with error details.
    Failure { error: ChatError },
}

/// Build the acknowledgement for a send outcome.
pub fn send_ack_for(client_activity_id: impl Into<String>, outcome: SendOutcome) -> SendAck {
    let client_activity_id = client_activity_id.into();
    match outcome {
        SendOutcome::Success { activity_id } => SendAck {
            client_activity_id,
            activity_id: Some(activity_id),
            error_code: None,
        },
        SendOutcome::Failure { error } => SendAck {
            client_activity_id,
            activity_id: None,
            error_code: Some(error.code),
        },
    }
}

/// Convert a send outcome to a stable [`ChatEvent::SendAck`].
pub fn normalize_send_outcome(
    client_activity_id: impl Into<String>,
    outcome: SendOutcome,
) -> ChatEvent {
    ChatEvent::SendAck(send_ack_for(client_activity_id, outcome))
}

/// Convert an error into a [`ChatEvent::ConnectionError`].
pub fn normalize_connection_error(error: ChatError) -> ChatEvent {
    ChatEvent::ConnectionError {
        kind: error.kind,
        code: error.code,
        message: error.message,
    }
}

/// Convert a generic send failure message to a network-classified error.
pub fn classify_send_error_message(message: impl Into<String>) -> ChatError {
    ChatError::new(
        ChatErrorKind::TransientConnectionFailure,
        "send_failed",
        message.into(),
    )
}
