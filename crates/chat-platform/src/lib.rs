//! Session-history persistence consumed by the chat runtime.
//!
//! The runtime never touches storage directly; it hands each finalized
//! message to a [`ConversationSessionBridge`] and reloads the history through
//! the same contract when a runtime is spawned.

use std::{
    collections::HashMap,
    fmt::Write as _,
    fs::{self, OpenOptions},
    io::{ErrorKind, Read as _, Seek as _, SeekFrom, Write as _},
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use chat_core::{ChatError, ChatErrorKind, OrderedMessage};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionStoreError {
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),
    #[error("session store unavailable: {0}")]
    Unavailable(String),
    #[error("session store backend failure: {0}")]
    Backend(String),
}

impl From<SessionStoreError> for ChatError {
    fn from(err: SessionStoreError) -> Self {
        let code = match &err {
            SessionStoreError::InvalidSessionId(_) => "invalid_session_id",
            SessionStoreError::Unavailable(_) => "session_store_unavailable",
            SessionStoreError::Backend(_) => "session_store_failure",
        };
        ChatError::new(ChatErrorKind::Storage, code, err.to_string())
    }
}

/// Conversation history store keyed by session id.
pub trait ConversationSessionBridge: Send + Sync {
    /// Append one finalized message to the session history.
    fn append(&self, session_id: &str, message: &OrderedMessage) -> Result<(), SessionStoreError>;

    /// Load the session history in the order it was appended.
    ///
    /// Unknown sessions yield an empty history.
    fn load_history(&self, session_id: &str) -> Result<Vec<OrderedMessage>, SessionStoreError>;
}

impl<B: ConversationSessionBridge + ?Sized> ConversationSessionBridge for Arc<B> {
    fn append(&self, session_id: &str, message: &OrderedMessage) -> Result<(), SessionStoreError> {
        (**self).append(session_id, message)
    }

    fn load_history(&self, session_id: &str) -> Result<Vec<OrderedMessage>, SessionStoreError> {
        (**self).load_history(session_id)
    }
}

#[derive(Clone, Default)]
pub struct InMemorySessionBridge {
    data: Arc<RwLock<HashMap<String, Vec<OrderedMessage>>>>,
}

impl ConversationSessionBridge for InMemorySessionBridge {
    fn append(&self, session_id: &str, message: &OrderedMessage) -> Result<(), SessionStoreError> {
        validate_session_id(session_id)?;
        let mut data = self
            .data
            .write()
            .map_err(|_| SessionStoreError::Backend("poisoned lock".to_owned()))?;
        data.entry(session_id.to_owned())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    fn load_history(&self, session_id: &str) -> Result<Vec<OrderedMessage>, SessionStoreError> {
        validate_session_id(session_id)?;
        let data = self
            .data
            .read()
            .map_err(|_| SessionStoreError::Backend("poisoned lock".to_owned()))?;
        Ok(data.get(session_id).cloned().unwrap_or_default())
    }
}

/// One JSON-lines file per session under a root directory.
///
/// Lines that fail to parse (for example a write torn by a crash) are skipped
/// with a warning instead of failing the whole load.
#[derive(Debug, Clone)]
pub struct JsonFileSessionBridge {
    root: PathBuf,
}

impl JsonFileSessionBridge {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File backing `session_id`.
    pub fn session_path(&self, session_id: &str) -> Result<PathBuf, SessionStoreError> {
        validate_session_id(session_id)?;
        Ok(self
            .root
            .join(format!("{}.jsonl", encode_file_stem(session_id))))
    }
}

impl ConversationSessionBridge for JsonFileSessionBridge {
    fn append(&self, session_id: &str, message: &OrderedMessage) -> Result<(), SessionStoreError> {
        let path = self.session_path(session_id)?;
        fs::create_dir_all(&self.root).map_err(|err| {
            SessionStoreError::Unavailable(format!(
                "failed creating session directory {}: {err}",
                self.root.display()
            ))
        })?;

        let mut record = serde_json::to_vec(message)
            .map_err(|err| SessionStoreError::Backend(err.to_string()))?;
        record.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|err| {
                SessionStoreError::Unavailable(format!(
                    "failed opening session file {}: {err}",
                    path.display()
                ))
            })?;

        // A torn previous write leaves no line terminator; start a fresh line
        // so this record stays readable.
        let terminated = ends_with_newline(&mut file).map_err(|err| {
            SessionStoreError::Unavailable(format!(
                "failed inspecting session file {}: {err}",
                path.display()
            ))
        })?;
        if !terminated {
            warn!(path = %path.display(), "session history ends with a torn line");
            record.insert(0, b'\n');
        }

        file.write_all(&record).map_err(|err| {
            SessionStoreError::Backend(format!(
                "failed writing session file {}: {err}",
                path.display()
            ))
        })
    }

    fn load_history(&self, session_id: &str) -> Result<Vec<OrderedMessage>, SessionStoreError> {
        let path = self.session_path(session_id)?;
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(SessionStoreError::Unavailable(format!(
                    "failed reading session file {}: {err}",
                    path.display()
                )));
            }
        };

        let mut history = Vec::new();
        for (index, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<OrderedMessage>(line) {
                Ok(message) => history.push(message),
                Err(err) => warn!(
                    path = %path.display(),
                    line = index + 1,
                    error = %err,
                    "skipping unreadable session history line"
                ),
            }
        }
        Ok(history)
    }
}

/// Bridge bound to one session id.
#[derive(Clone)]
pub struct ScopedSessionBridge<B: ConversationSessionBridge> {
    inner: B,
    session_id: String,
}

impl<B: ConversationSessionBridge> ScopedSessionBridge<B> {
    pub fn new(inner: B, session_id: impl Into<String>) -> Self {
        Self {
            inner,
            session_id: session_id.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn append(&self, message: &OrderedMessage) -> Result<(), SessionStoreError> {
        self.inner.append(&self.session_id, message)
    }

    pub fn load_history(&self) -> Result<Vec<OrderedMessage>, SessionStoreError> {
        self.inner.load_history(&self.session_id)
    }
}

/// Whether the file is empty or its last byte is a line terminator.
fn ends_with_newline(file: &mut fs::File) -> std::io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

fn validate_session_id(session_id: &str) -> Result<(), SessionStoreError> {
    if session_id.trim().is_empty() {
        return Err(SessionStoreError::InvalidSessionId(
            "session id is empty".to_owned(),
        ));
    }
    Ok(())
}

/// Keep `[A-Za-z0-9_-]` and percent-encode every other byte so distinct ids
/// never share a file.
fn encode_file_stem(session_id: &str) -> String {
    let mut stem = String::with_capacity(session_id.len());
    for byte in session_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            stem.push(byte as char);
        } else {
            let _ = write!(stem, "%{byte:02X}");
        }
    }
    stem
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use chat_core::{ActivityKind, NormalizedActivity, RenderState, Role};
    use chrono::{TimeZone, Utc};

    use super::*;

    fn finalized(id: &str, second: u32) -> OrderedMessage {
        let timestamp = Utc
            .with_ymd_and_hms(2024, 5, 1, 10, 0, second)
            .single()
            .expect("valid time");
        let mut message = OrderedMessage::pending(NormalizedActivity {
            id: id.to_owned(),
            kind: ActivityKind::Message,
            from_role: Role::Agent,
            sender_id: Some("bot".to_owned()),
            text: format!("text of {id}"),
            attachments: Vec::new(),
            suggested_actions: Vec::new(),
            reply_to_id: None,
            timestamp,
            source_timestamp: None,
            timestamp_defaulted: false,
            ordering_anomaly: false,
            received_sequence: u64::from(second),
        });
        message.render_state = RenderState::Finalized;
        message
    }

    #[test]
    fn in_memory_roundtrip() {
        let bridge = InMemorySessionBridge::default();
        bridge.append("s1", &finalized("a", 1)).expect("append a");
        bridge.append("s1", &finalized("b", 2)).expect("append b");

        let history = bridge.load_history("s1").expect("load");
        let ids: Vec<_> = history.iter().map(OrderedMessage::id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(bridge.load_history("unknown").expect("load").is_empty());
    }

    #[test]
    fn scoped_bridge_isolates_sessions() {
        let base = InMemorySessionBridge::default();
        let a = ScopedSessionBridge::new(base.clone(), "session-a");
        let b = ScopedSessionBridge::new(base.clone(), "session-b");

        a.append(&finalized("one", 1)).expect("append a");
        b.append(&finalized("two", 2)).expect("append b");

        assert_eq!(a.load_history().expect("load a")[0].id(), "one");
        assert_eq!(b.load_history().expect("load b")[0].id(), "two");
        assert_eq!(a.session_id(), "session-a");
    }

    #[test]
    fn json_file_roundtrip_preserves_messages() {
        let dir = tempfile::tempdir().expect("temp dir");
        let bridge = JsonFileSessionBridge::new(dir.path().join("sessions"));

        let first = finalized("conv|0001", 1);
        let second = finalized("conv|0002", 2);
        bridge.append("s/1", &first).expect("append first");
        bridge.append("s/1", &second).expect("append second");

        let reopened = JsonFileSessionBridge::new(dir.path().join("sessions"));
        let history = reopened.load_history("s/1").expect("load");
        assert_eq!(history, vec![first, second]);
        assert!(
            reopened
                .session_path("s/1")
                .expect("path")
                .ends_with("s%2F1.jsonl")
        );
    }

    #[test]
    fn json_file_skips_torn_lines() {
        let dir = tempfile::tempdir().expect("temp dir");
        let bridge = JsonFileSessionBridge::new(dir.path());
        bridge.append("s", &finalized("ok", 1)).expect("append");

        let path = bridge.session_path("s").expect("path");
        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .expect("open for append");
        file.write_all(b"{\"activity\":{\"id\":").expect("write torn line");

        let history = bridge.load_history("s").expect("load");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id(), "ok");
    }

    #[test]
    fn json_file_append_after_torn_line_starts_a_new_record() {
        let dir = tempfile::tempdir().expect("temp dir");
        let bridge = JsonFileSessionBridge::new(dir.path());
        bridge.append("s", &finalized("ok", 1)).expect("append ok");

        let path = bridge.session_path("s").expect("path");
        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .expect("open for append");
        file.write_all(b"{\"activity\":{\"id\":").expect("write torn line");
        drop(file);

        bridge.append("s", &finalized("after", 2)).expect("append after");
        bridge.append("s", &finalized("later", 3)).expect("append later");

        let history = bridge.load_history("s").expect("load");
        let ids: Vec<_> = history.iter().map(OrderedMessage::id).collect();
        assert_eq!(ids, vec!["ok", "after", "later"]);
    }

    #[test]
    fn missing_session_file_is_empty_history() {
        let dir = tempfile::tempdir().expect("temp dir");
        let bridge = JsonFileSessionBridge::new(dir.path());
        assert!(bridge.load_history("never-written").expect("load").is_empty());
    }

    #[test]
    fn rejects_blank_session_ids() {
        let bridge = InMemorySessionBridge::default();
        let err = bridge
            .append(" ", &finalized("x", 1))
            .expect_err("blank session id");
        assert!(matches!(err, SessionStoreError::InvalidSessionId(_)));

        let chat_error: ChatError = err.into();
        assert_eq!(chat_error.kind, ChatErrorKind::Storage);
        assert_eq!(chat_error.code, "invalid_session_id");
    }

    #[derive(Default)]
    struct FailingBridge;

    impl ConversationSessionBridge for FailingBridge {
        fn append(
            &self,
            _session_id: &str,
            _message: &OrderedMessage,
        ) -> Result<(), SessionStoreError> {
            Err(SessionStoreError::Unavailable("mock outage".to_owned()))
        }

        fn load_history(
            &self,
            _session_id: &str,
        ) -> Result<Vec<OrderedMessage>, SessionStoreError> {
            Err(SessionStoreError::Unavailable("mock outage".to_owned()))
        }
    }

    #[test]
    fn mock_failure_propagates_through_scoped_bridge() {
        let scoped = ScopedSessionBridge::new(FailingBridge, "s");
        let err = scoped
            .append(&finalized("x", 1))
            .expect_err("append must fail");
        assert_eq!(err, SessionStoreError::Unavailable("mock outage".to_owned()));
    }
}
