use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chat_core::{ChannelAccount, ChatError, Credential, RawActivity, SendOutcome};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::transport::{
    DEFAULT_OUTBOX_BUFFER, OpenMode, OutgoingActivity, Transport, TransportEvent,
    TransportSession,
};

const LOOPBACK_AGENT_ID: &str = "loopback-agent";
const DEFAULT_REPLY_DELAY: Duration = Duration::from_millis(400);

/// Offline transport with an echo agent.
///
/// Every user message is echoed back, followed by a typing hint and an agent
/// reply. `/end` closes the conversation and `/expire` simulates token expiry.
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    reply_delay: Duration,
    conversations: Arc<AtomicU64>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self {
            reply_delay: DEFAULT_REPLY_DELAY,
            conversations: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl LoopbackTransport {
    pub fn with_reply_delay(mut self, reply_delay: Duration) -> Self {
        self.reply_delay = reply_delay;
        self
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn open(
        &self,
        _credential: &Credential,
        mode: OpenMode,
    ) -> Result<TransportSession, ChatError> {
        let conversation = match mode {
            OpenMode::Fresh => self.conversations.fetch_add(1, Ordering::SeqCst) + 1,
            OpenMode::Resume => self.conversations.load(Ordering::SeqCst).max(1),
        };
        debug!(conversation, ?mode, "opening loopback conversation");

        let (event_tx, event_rx) = mpsc::channel(DEFAULT_OUTBOX_BUFFER * 4);
        let (outbox_tx, outbox_rx) = mpsc::channel(DEFAULT_OUTBOX_BUFFER);
        let stop = CancellationToken::new();

        let agent = LoopbackAgent {
            conversation_id: format!("loopback-{conversation}"),
            reply_delay: self.reply_delay,
            next_activity: 0,
            events: event_tx,
        };
        tokio::spawn(agent.run(outbox_rx, stop.clone(), mode));

        Ok(TransportSession::from_channel(
            event_rx,
            outbox_tx,
            stop.drop_guard(),
        ))
    }
}

struct LoopbackAgent {
    conversation_id: String,
    reply_delay: Duration,
    next_activity: u64,
    events: mpsc::Sender<TransportEvent>,
}

impl LoopbackAgent {
    async fn run(
        mut self,
        mut outbox: mpsc::Receiver<OutgoingActivity>,
        stop: CancellationToken,
        mode: OpenMode,
    ) {
        if mode == OpenMode::Fresh {
            let greeting = self.agent_message("Hello! I echo everything you send.");
            if !self.emit(TransportEvent::Activity(greeting)).await {
                return;
            }
        }

        loop {
            let outgoing = tokio::select! {
                _ = stop.cancelled() => break,
                outgoing = outbox.recv() => match outgoing {
                    Some(outgoing) => outgoing,
                    None => break,
                },
            };

            if !self.handle(outgoing, &stop).await {
                break;
            }
        }
        debug!(conversation_id = %self.conversation_id, "loopback conversation stopped");
    }

    /// Returns `false` once the conversation is over.
    async fn handle(&mut self, outgoing: OutgoingActivity, stop: &CancellationToken) -> bool {
        let echo_id = self.next_id();
        let ack = TransportEvent::SendOutcome {
            client_activity_id: outgoing.client_activity_id.clone(),
            outcome: SendOutcome::Success {
                activity_id: echo_id.clone(),
            },
        };
        let echo = RawActivity {
            id: Some(echo_id),
            activity_type: Some("message".to_owned()),
            from: Some(ChannelAccount {
                id: outgoing.from_id.clone(),
                name: None,
            }),
            text: Some(outgoing.text.clone()),
            timestamp: Some(Utc::now().to_rfc3339()),
            ..RawActivity::default()
        };
        if !self.emit(ack).await || !self.emit(TransportEvent::Activity(echo)).await {
            return false;
        }

        match outgoing.text.trim() {
            "/end" => {
                self.emit(TransportEvent::Closed).await;
                return false;
            }
            "/expire" => {
                self.emit(TransportEvent::AuthorizationExpired).await;
                return false;
            }
            _ => {}
        }

        let typing = RawActivity {
            id: Some(self.next_id()),
            activity_type: Some("typing".to_owned()),
            from: Some(agent_account()),
            ..RawActivity::default()
        };
        if !self.emit(TransportEvent::Activity(typing)).await {
            return false;
        }

        tokio::select! {
            _ = stop.cancelled() => return false,
            _ = tokio::time::sleep(self.reply_delay) => {}
        }

        let reply = self.agent_message(&format!("You said: {}", outgoing.text));
        self.emit(TransportEvent::Activity(reply)).await
    }

    fn agent_message(&mut self, text: &str) -> RawActivity {
        RawActivity {
            id: Some(self.next_id()),
            activity_type: Some("message".to_owned()),
            from: Some(agent_account()),
            text: Some(text.to_owned()),
            timestamp: Some(Utc::now().to_rfc3339()),
            ..RawActivity::default()
        }
    }

    fn next_id(&mut self) -> String {
        self.next_activity += 1;
        format!("{}|{:07}", self.conversation_id, self.next_activity)
    }

    async fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}

fn agent_account() -> ChannelAccount {
    ChannelAccount {
        id: LOOPBACK_AGENT_ID.to_owned(),
        name: Some("Loopback".to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    fn credential() -> Credential {
        Credential::parse("loopback-secret").expect("valid credential")
    }

    #[tokio::test(start_paused = true)]
    async fn greets_then_echoes_and_replies() {
        let transport = LoopbackTransport::default();
        let mut session = transport
            .open(&credential(), OpenMode::Fresh)
            .await
            .expect("open should work");

        match session.events.next().await {
            Some(TransportEvent::Activity(greeting)) => {
                assert_eq!(
                    greeting.from.map(|from| from.id).as_deref(),
                    Some(LOOPBACK_AGENT_ID)
                );
            }
            other => panic!("unexpected event: {other:?}"),
        }

        session
            .outbox
            .send(OutgoingActivity {
                client_activity_id: "cid-1".into(),
                from_id: "me".into(),
                text: "ping".into(),
            })
            .await
            .expect("outbox send should work");

        match session.events.next().await {
            Some(TransportEvent::SendOutcome {
                client_activity_id,
                outcome: SendOutcome::Success { .. },
            }) => assert_eq!(client_activity_id, "cid-1"),
            other => panic!("unexpected event: {other:?}"),
        }
        match session.events.next().await {
            Some(TransportEvent::Activity(echo)) => {
                assert_eq!(echo.text.as_deref(), Some("ping"));
                assert_eq!(echo.from.map(|from| from.id).as_deref(), Some("me"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match session.events.next().await {
            Some(TransportEvent::Activity(typing)) => {
                assert_eq!(typing.activity_type.as_deref(), Some("typing"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match session.events.next().await {
            Some(TransportEvent::Activity(reply)) => {
                assert_eq!(reply.text.as_deref(), Some("You said: ping"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn end_command_closes_conversation() {
        let transport = LoopbackTransport::default();
        let mut session = transport
            .open(&credential(), OpenMode::Resume)
            .await
            .expect("open should work");

        session
            .outbox
            .send(OutgoingActivity {
                client_activity_id: "cid-end".into(),
                from_id: "me".into(),
                text: "/end".into(),
            })
            .await
            .expect("outbox send should work");

        let events: Vec<_> = session.events.collect().await;
        assert_eq!(events.len(), 3, "ack, echo, closed: {events:?}");
        assert_eq!(events[2], TransportEvent::Closed);
    }
}
