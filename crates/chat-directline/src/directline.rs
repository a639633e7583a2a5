use std::{future, sync::Arc, time::Duration};

use async_trait::async_trait;
use chat_core::{
    ChatError, ChatErrorKind, Credential, RawActivity, SendOutcome, classify_http_status,
    normalization::classify_send_error_message,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::{
    sync::{Mutex, mpsc},
    time::Instant,
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transport::{
    DEFAULT_OUTBOX_BUFFER, OpenMode, OutgoingActivity, Transport, TransportEvent,
    TransportSession,
};

pub const DEFAULT_DIRECTLINE_DOMAIN: &str = "https://directline.botframework.com/v3/directline";
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(20);
const TOKEN_REFRESH_RETRY: Duration = Duration::from_secs(30);
const END_OF_CONVERSATION: &str = "endOfConversation";

/// Which side of the handshake a request belongs to.
///
/// A 401/403 while connecting means the credential was refused; once the
/// conversation is open it means the session token expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Connect,
    Session,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("websocket failure: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("unexpected payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("{during} returned HTTP {status}: {body}")]
    Status {
        during: &'static str,
        phase: RequestPhase,
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },
    #[error("conversation response carries no stream url")]
    MissingStreamUrl,
}

impl From<TransportError> for ChatError {
    fn from(err: TransportError) -> Self {
        let message = err.to_string();
        match err {
            TransportError::Http(_) => ChatError::new(
                ChatErrorKind::TransientConnectionFailure,
                "directline_http_transport",
                message,
            ),
            TransportError::WebSocket(_) => ChatError::new(
                ChatErrorKind::TransientConnectionFailure,
                "directline_websocket",
                message,
            ),
            TransportError::Decode(_) | TransportError::MissingStreamUrl => ChatError::new(
                ChatErrorKind::ServiceUnavailable,
                "directline_invalid_response",
                message,
            ),
            TransportError::Status {
                phase,
                status,
                retry_after,
                ..
            } => {
                let kind = match classify_http_status(status) {
                    ChatErrorKind::CredentialRejected if phase == RequestPhase::Session => {
                        ChatErrorKind::AuthorizationExpired
                    }
                    other => other,
                };
                let code = match (kind, status) {
                    (ChatErrorKind::CredentialRejected, _) => "credential_rejected",
                    (ChatErrorKind::AuthorizationExpired, _) => "authorization_expired",
                    (_, 429) => "rate_limited",
                    (ChatErrorKind::ServiceUnavailable, _) => "service_unavailable",
                    _ => "directline_http_error",
                };
                let error = ChatError::new(kind, code, message);
                match retry_after {
                    Some(delay) => error.with_retry_after(delay),
                    None => error,
                }
            }
        }
    }
}

/// DirectLine endpoint settings.
#[derive(Debug, Clone)]
pub struct DirectLineConfig {
    /// Base URL, for example `https://directline.botframework.com/v3/directline`.
    pub domain: String,
    pub http_timeout: Duration,
}

impl Default for DirectLineConfig {
    fn default() -> Self {
        Self {
            domain: DEFAULT_DIRECTLINE_DOMAIN.to_owned(),
            http_timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }
}

impl DirectLineConfig {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into().trim_end_matches('/').to_owned(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Conversation {
    conversation_id: String,
    #[serde(default)]
    token: Option<String>,
    #[serde(rename = "expires_in", default)]
    expires_in: Option<u64>,
    #[serde(default)]
    stream_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ActivitySet {
    #[serde(default)]
    activities: Vec<RawActivity>,
    #[serde(default)]
    watermark: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResourceResponse {
    id: String,
}

/// Conversation remembered between attempts so a drop can resume it.
#[derive(Debug, Clone)]
struct ConversationState {
    conversation_id: String,
    token: String,
    watermark: Option<String>,
}

/// Parsed WebSocket frame.
#[derive(Debug, PartialEq)]
enum Frame {
    Heartbeat,
    Activities {
        activities: Vec<RawActivity>,
        watermark: Option<String>,
    },
}

fn parse_frame(text: &str) -> Result<Frame, serde_json::Error> {
    if text.trim().is_empty() {
        return Ok(Frame::Heartbeat);
    }
    let set: ActivitySet = serde_json::from_str(text)?;
    Ok(Frame::Activities {
        activities: set.activities,
        watermark: set.watermark,
    })
}

fn is_end_of_conversation(activity: &RawActivity) -> bool {
    activity.activity_type.as_deref() == Some(END_OF_CONVERSATION)
}

fn bearer(token: &str) -> String {
    format!("Bearer {token}")
}

fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    value
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

async fn expect_success(
    response: reqwest::Response,
    during: &'static str,
    phase: RequestPhase,
) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = parse_retry_after(response.headers().get(reqwest::header::RETRY_AFTER));
    let body = response.text().await.unwrap_or_default();
    Err(TransportError::Status {
        during,
        phase,
        status: status.as_u16(),
        body,
        retry_after,
    })
}

/// DirectLine v3 transport: REST handshake plus WebSocket activity stream.
#[derive(Debug, Clone)]
pub struct DirectLineTransport {
    client: reqwest::Client,
    config: DirectLineConfig,
    conversation: Arc<Mutex<Option<ConversationState>>>,
}

impl DirectLineTransport {
    pub fn new(config: DirectLineConfig) -> Result<Self, ChatError> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|err| {
                ChatError::new(ChatErrorKind::Config, "http_client_build", err.to_string())
            })?;
        Ok(Self {
            client,
            config,
            conversation: Arc::new(Mutex::new(None)),
        })
    }

    async fn start_conversation(
        &self,
        credential: &Credential,
    ) -> Result<(ConversationState, String, Option<u64>), TransportError> {
        let response = self
            .client
            .post(format!("{}/conversations", self.config.domain))
            .header("Authorization", bearer(credential.expose()))
            .send()
            .await?;
        let conversation: Conversation =
            expect_success(response, "start conversation", RequestPhase::Connect)
                .await?
                .json()
                .await?;

        let stream_url = conversation
            .stream_url
            .ok_or(TransportError::MissingStreamUrl)?;
        let state = ConversationState {
            conversation_id: conversation.conversation_id,
            token: conversation
                .token
                .unwrap_or_else(|| credential.expose().to_owned()),
            watermark: None,
        };
        Ok((state, stream_url, conversation.expires_in))
    }

    async fn reconnect(
        &self,
        state: ConversationState,
    ) -> Result<(ConversationState, String, Option<u64>), TransportError> {
        let mut request = self
            .client
            .get(format!(
                "{}/conversations/{}",
                self.config.domain, state.conversation_id
            ))
            .header("Authorization", bearer(&state.token));
        if let Some(watermark) = state.watermark.as_deref() {
            request = request.query(&[("watermark", watermark)]);
        }
        let conversation: Conversation =
            expect_success(request.send().await?, "reconnect", RequestPhase::Session)
                .await?
                .json()
                .await?;

        let stream_url = conversation
            .stream_url
            .ok_or(TransportError::MissingStreamUrl)?;
        let token = conversation.token.unwrap_or(state.token);
        Ok((
            ConversationState { token, ..state },
            stream_url,
            conversation.expires_in,
        ))
    }

    async fn open_inner(
        &self,
        credential: &Credential,
        mode: OpenMode,
    ) -> Result<TransportSession, TransportError> {
        let cached = self.conversation.lock().await.clone();
        let (state, stream_url, expires_in) = match (mode, cached) {
            (OpenMode::Resume, Some(cached)) => {
                info!(conversation_id = %cached.conversation_id, watermark = ?cached.watermark, "resuming directline conversation");
                let conversation_id = cached.conversation_id.clone();
                match self.reconnect(cached).await {
                    Ok(resumed) => resumed,
                    Err(err) if err.conversation_gone() => {
                        warn!(%conversation_id, error = %err, "conversation no longer exists, starting a fresh one");
                        *self.conversation.lock().await = None;
                        self.start_conversation(credential).await?
                    }
                    Err(err) => return Err(err),
                }
            }
            _ => self.start_conversation(credential).await?,
        };
        *self.conversation.lock().await = Some(state.clone());

        let (ws, _) = connect_async(stream_url.as_str()).await?;
        info!(conversation_id = %state.conversation_id, "directline activity stream connected");

        let (event_tx, event_rx) = mpsc::channel(DEFAULT_OUTBOX_BUFFER * 4);
        let (outbox_tx, outbox_rx) = mpsc::channel(DEFAULT_OUTBOX_BUFFER);
        let stop = CancellationToken::new();

        let session = DirectLineSession {
            client: self.client.clone(),
            domain: self.config.domain.clone(),
            conversation_id: state.conversation_id,
            token: state.token,
            shared: self.conversation.clone(),
            events: event_tx,
        };
        let refresh_at = expires_in.map(refresh_deadline);
        tokio::spawn(session.run(ws, outbox_rx, stop.clone(), refresh_at));

        Ok(TransportSession::from_channel(
            event_rx,
            outbox_tx,
            stop.drop_guard(),
        ))
    }
}

impl TransportError {
    /// The service no longer knows the conversation being resumed.
    fn conversation_gone(&self) -> bool {
        matches!(
            self,
            Self::Status {
                phase: RequestPhase::Session,
                status: 404 | 410,
                ..
            }
        )
    }
}

#[async_trait]
impl Transport for DirectLineTransport {
    async fn open(
        &self,
        credential: &Credential,
        mode: OpenMode,
    ) -> Result<TransportSession, ChatError> {
        self.open_inner(credential, mode).await.map_err(ChatError::from)
    }
}

/// Refresh at half of the token lifetime.
fn refresh_deadline(expires_in_secs: u64) -> Instant {
    Instant::now() + Duration::from_secs(expires_in_secs / 2)
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

struct DirectLineSession {
    client: reqwest::Client,
    domain: String,
    conversation_id: String,
    token: String,
    shared: Arc<Mutex<Option<ConversationState>>>,
    events: mpsc::Sender<TransportEvent>,
}

impl DirectLineSession {
    async fn run<S>(
        mut self,
        ws: S,
        mut outbox: mpsc::Receiver<OutgoingActivity>,
        stop: CancellationToken,
        mut refresh_at: Option<Instant>,
    ) where
        S: futures::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
            + futures::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
            + Send
            + Unpin,
    {
        let (mut write, mut read) = ws.split();

        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    break;
                }
                frame = read.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        if !self.handle_frame(&text).await {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = write.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        self.emit(TransportEvent::Dropped(ChatError::new(
                            ChatErrorKind::TransientConnectionFailure,
                            "stream_closed",
                            "activity stream closed by remote",
                        )))
                        .await;
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        self.emit(TransportEvent::Dropped(TransportError::from(err).into()))
                            .await;
                        break;
                    }
                },
                _ = wait_until(refresh_at) => match self.refresh_token().await {
                    Ok(expires_in) => refresh_at = expires_in.map(refresh_deadline),
                    Err(err) if err.kind == ChatErrorKind::AuthorizationExpired => {
                        self.emit(TransportEvent::AuthorizationExpired).await;
                        break;
                    }
                    Err(err) => {
                        warn!(code = %err.code, error = %err.message, "token refresh failed; retrying later");
                        refresh_at = Some(Instant::now() + TOKEN_REFRESH_RETRY);
                    }
                },
                Some(outgoing) = outbox.recv() => self.spawn_send(outgoing),
            }
        }
        debug!(conversation_id = %self.conversation_id, "directline session task stopped");
    }

    /// Returns `false` once the conversation is over or nobody listens.
    async fn handle_frame(&mut self, text: &str) -> bool {
        let (activities, watermark) = match parse_frame(text) {
            Ok(Frame::Heartbeat) => return true,
            Ok(Frame::Activities {
                activities,
                watermark,
            }) => (activities, watermark),
            Err(err) => {
                debug!(error = %err, "dropping undecodable activity frame");
                return true;
            }
        };

        if let Some(watermark) = watermark
            && let Some(state) = self.shared.lock().await.as_mut()
            && state.conversation_id == self.conversation_id
        {
            state.watermark = Some(watermark);
        }

        for activity in activities {
            if is_end_of_conversation(&activity) {
                self.emit(TransportEvent::Closed).await;
                return false;
            }
            if !self.emit(TransportEvent::Activity(activity)).await {
                return false;
            }
        }
        true
    }

    async fn refresh_token(&mut self) -> Result<Option<u64>, ChatError> {
        let response = self
            .client
            .post(format!("{}/tokens/refresh", self.domain))
            .header("Authorization", bearer(&self.token))
            .send()
            .await
            .map_err(TransportError::from)?;
        let conversation: Conversation =
            expect_success(response, "token refresh", RequestPhase::Session)
                .await?
                .json()
                .await
                .map_err(TransportError::from)?;

        if let Some(token) = conversation.token {
            self.token = token.clone();
            if let Some(state) = self.shared.lock().await.as_mut()
                && state.conversation_id == self.conversation_id
            {
                state.token = token;
            }
        }
        debug!(conversation_id = %self.conversation_id, "directline token refreshed");
        Ok(conversation.expires_in)
    }

    fn spawn_send(&self, outgoing: OutgoingActivity) {
        let client = self.client.clone();
        let url = format!(
            "{}/conversations/{}/activities",
            self.domain, self.conversation_id
        );
        let token = self.token.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let outcome = match post_activity(&client, &url, &token, &outgoing).await {
                Ok(activity_id) => SendOutcome::Success { activity_id },
                Err(TransportError::Http(err)) => SendOutcome::Failure {
                    error: classify_send_error_message(err.to_string()),
                },
                Err(err) => SendOutcome::Failure { error: err.into() },
            };
            let _ = events
                .send(TransportEvent::SendOutcome {
                    client_activity_id: outgoing.client_activity_id,
                    outcome,
                })
                .await;
        });
    }

    async fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}

async fn post_activity(
    client: &reqwest::Client,
    url: &str,
    token: &str,
    outgoing: &OutgoingActivity,
) -> Result<String, TransportError> {
    let body = json!({
        "type": "message",
        "from": { "id": outgoing.from_id },
        "text": outgoing.text,
        "channelData": { "clientActivityID": outgoing.client_activity_id },
    });
    let response = client
        .post(url)
        .header("Authorization", bearer(token))
        .json(&body)
        .send()
        .await?;
    let resource: ResourceResponse = expect_success(response, "send activity", RequestPhase::Session)
        .await?
        .json()
        .await?;
    Ok(resource.id)
}
