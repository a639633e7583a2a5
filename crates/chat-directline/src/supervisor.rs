use std::{sync::Arc, time::Duration};

use chat_core::{
    ActivityNormalizer, ChatError, ChatErrorKind, ConnectionState, ConnectionStateMachine,
    Credential, NormalizedActivity, RetryDecision, RetryScheduler, RetryState, SendAck,
    normalization::classify_send_error_message, send_ack_for,
};
use chrono::Utc;
use futures::StreamExt;
use rand::{RngCore, SeedableRng, rngs::StdRng};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::transport::{OpenMode, OutgoingActivity, Transport, TransportEvent, TransportSession};

/// Default time box of one connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

type StatusHandler = Box<dyn FnMut(ConnectionState) + Send>;
type ActivityHandler = Box<dyn FnMut(&NormalizedActivity) + Send>;
type ErrorHandler = Box<dyn FnMut(&ChatError) + Send>;
type SendAckHandler = Box<dyn FnMut(&SendAck) + Send>;

/// Supervisor tuning.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    pub connect_timeout: Duration,
    pub retry: RetryScheduler,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry: RetryScheduler::default(),
        }
    }
}

#[derive(Debug)]
enum Signal {
    Opened {
        outbox: mpsc::Sender<OutgoingActivity>,
    },
    OpenFailed(ChatError),
    Transport(TransportEvent),
    RetryDue,
}

/// Work reported by a spawned attempt, pump or backoff timer.
///
/// Obtain with [`ConnectionSupervisor::next_signal`] and hand back to
/// [`ConnectionSupervisor::apply_signal`] on the owning task.
#[derive(Debug)]
pub struct SupervisorSignal {
    generation: u64,
    signal: Signal,
}

/// Owns the connection lifecycle of one conversation.
///
/// All state lives on the owning task. Attempts, stream pumps and backoff
/// timers run as spawned tasks that only report back through signals tagged
/// with a generation; signals from a superseded generation are ignored.
pub struct ConnectionSupervisor {
    transport: Arc<dyn Transport>,
    config: SupervisorConfig,
    state_machine: ConnectionStateMachine,
    retry_state: RetryState,
    rng: Box<dyn RngCore + Send>,
    normalizer: ActivityNormalizer,
    credential: Option<Credential>,
    generation: u64,
    session_token: Option<CancellationToken>,
    attempt_token: Option<CancellationToken>,
    outbox: Option<mpsc::Sender<OutgoingActivity>>,
    has_connected: bool,
    signal_tx: mpsc::UnboundedSender<SupervisorSignal>,
    signal_rx: mpsc::UnboundedReceiver<SupervisorSignal>,
    status_handlers: Vec<StatusHandler>,
    activity_handlers: Vec<ActivityHandler>,
    error_handlers: Vec<ErrorHandler>,
    send_ack_handlers: Vec<SendAckHandler>,
}

impl ConnectionSupervisor {
    pub fn new(
        transport: Arc<dyn Transport>,
        normalizer: ActivityNormalizer,
        config: SupervisorConfig,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            config,
            state_machine: ConnectionStateMachine::default(),
            retry_state: config.retry.fresh_state(),
            rng: Box::new(StdRng::from_entropy()),
            normalizer,
            credential: None,
            generation: 0,
            session_token: None,
            attempt_token: None,
            outbox: None,
            has_connected: false,
            signal_tx,
            signal_rx,
            status_handlers: Vec::new(),
            activity_handlers: Vec::new(),
            error_handlers: Vec::new(),
            send_ack_handlers: Vec::new(),
        }
    }

    /// Replace the jitter source, for reproducible schedules.
    pub fn with_rng(mut self, rng: impl RngCore + Send + 'static) -> Self {
        self.rng = Box::new(rng);
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state_machine.state()
    }

    pub fn is_terminal(&self) -> bool {
        self.state_machine.is_terminal()
    }

    pub fn retry_state(&self) -> &RetryState {
        &self.retry_state
    }

    pub fn normalizer(&self) -> &ActivityNormalizer {
        &self.normalizer
    }

    /// Continue sequence numbering and deduplication after a restored history.
    pub fn resume_after<'a>(
        &mut self,
        last_sequence: Option<u64>,
        known_ids: impl IntoIterator<Item = &'a str>,
    ) {
        self.normalizer.resume_after(last_sequence, known_ids);
    }

    pub fn on_status_change(&mut self, handler: impl FnMut(ConnectionState) + Send + 'static) {
        self.status_handlers.push(Box::new(handler));
    }

    pub fn on_activity(&mut self, handler: impl FnMut(&NormalizedActivity) + Send + 'static) {
        self.activity_handlers.push(Box::new(handler));
    }

    pub fn on_error(&mut self, handler: impl FnMut(&ChatError) + Send + 'static) {
        self.error_handlers.push(Box::new(handler));
    }

    pub fn on_send_ack(&mut self, handler: impl FnMut(&SendAck) + Send + 'static) {
        self.send_ack_handlers.push(Box::new(handler));
    }

    /// Validate the credential and begin a new session.
    pub fn start(&mut self, credential: &str) -> Result<(), ChatError> {
        let credential = Credential::parse(credential)?;
        self.state_machine.start()?;

        self.teardown();
        self.session_token = Some(CancellationToken::new());
        self.retry_state = self.config.retry.fresh_state();
        self.credential = Some(credential);
        self.has_connected = false;

        info!(state = ?self.state(), "connection session starting");
        self.notify_status();
        self.spawn_attempt(OpenMode::Fresh);
        Ok(())
    }

    /// End the session. Idempotent.
    pub fn stop(&mut self) {
        self.teardown();
        self.credential = None;
        if let Some(state) = self.state_machine.stop() {
            info!(?state, "connection session stopped");
            self.notify_status();
        }
    }

    /// Post a user message with a generated client ID.
    pub fn send_text(&mut self, text: impl Into<String>) -> Result<String, ChatError> {
        let client_activity_id = Uuid::new_v4().to_string();
        self.send_text_with_id(client_activity_id.clone(), text)?;
        Ok(client_activity_id)
    }

    /// Post a user message; the outcome arrives through `on_send_ack`.
    pub fn send_text_with_id(
        &mut self,
        client_activity_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<(), ChatError> {
        if self.state() != ConnectionState::Online {
            return Err(ChatError::invalid_state(self.state(), "send_text"));
        }
        let outbox = self.outbox.as_ref().ok_or_else(|| {
            ChatError::new(
                ChatErrorKind::Internal,
                "outbox_missing",
                "online connection has no outbox",
            )
        })?;

        let outgoing = OutgoingActivity {
            client_activity_id: client_activity_id.into(),
            from_id: self.normalizer.local_user_id().to_owned(),
            text: text.into(),
        };
        outbox
            .try_send(outgoing)
            .map_err(|err| classify_send_error_message(format!("outbox rejected message: {err}")))
    }

    /// Wait for the next signal. Cancel-safe.
    pub async fn next_signal(&mut self) -> Option<SupervisorSignal> {
        self.signal_rx.recv().await
    }

    /// Apply one signal on the owning task.
    pub fn apply_signal(&mut self, signal: SupervisorSignal) {
        if signal.generation != self.generation {
            debug!(
                signal_generation = signal.generation,
                current_generation = self.generation,
                "ignoring stale supervisor signal"
            );
            return;
        }

        match signal.signal {
            Signal::Opened { outbox } => self.handle_opened(outbox),
            Signal::OpenFailed(error) => self.handle_failure(error),
            Signal::RetryDue => self.handle_retry_due(),
            Signal::Transport(event) => self.handle_transport_event(event),
        }
    }

    fn handle_opened(&mut self, outbox: mpsc::Sender<OutgoingActivity>) {
        if let Err(err) = self.state_machine.on_ready() {
            warn!(code = %err.code, "unexpected transport ready signal");
            return;
        }
        self.outbox = Some(outbox);
        self.has_connected = true;
        self.retry_state.reset();
        info!("connection online");
        self.notify_status();
    }

    fn handle_retry_due(&mut self) {
        if let Err(err) = self.state_machine.on_retry() {
            debug!(code = %err.code, "retry no longer applicable");
            return;
        }
        let mode = if self.has_connected {
            OpenMode::Resume
        } else {
            OpenMode::Fresh
        };
        info!(attempt = self.retry_state.attempt, ?mode, "retrying connection");
        self.notify_status();
        self.spawn_attempt(mode);
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Activity(raw) => {
                if let Some(activity) = self.normalizer.ingest(raw, Utc::now()) {
                    for handler in &mut self.activity_handlers {
                        handler(&activity);
                    }
                }
            }
            TransportEvent::SendOutcome {
                client_activity_id,
                outcome,
            } => {
                let ack = send_ack_for(client_activity_id, outcome);
                for handler in &mut self.send_ack_handlers {
                    handler(&ack);
                }
            }
            TransportEvent::Dropped(error) => self.handle_failure(error),
            TransportEvent::AuthorizationExpired => self.handle_authorization_expired(
                ChatError::new(
                    ChatErrorKind::AuthorizationExpired,
                    "authorization_expired",
                    "remote reported the session token as expired",
                ),
            ),
            TransportEvent::Closed => {
                if self.state_machine.on_remote_closed().is_err() {
                    return;
                }
                self.teardown();
                info!("conversation closed by remote");
                self.notify_status();
                self.notify_error(&ChatError::new(
                    ChatErrorKind::RemoteClosed,
                    "remote_closed",
                    "the conversation was closed by the remote",
                ));
            }
        }
    }

    fn handle_authorization_expired(&mut self, error: ChatError) {
        if self.state_machine.on_authorization_expired().is_err() {
            // Expiry reported before the connection came online.
            self.fail_terminally(error);
            return;
        }
        self.teardown();
        warn!(code = %error.code, "session authorization expired");
        self.notify_status();
        self.notify_error(&error);
    }

    fn handle_failure(&mut self, error: ChatError) {
        if error.kind == ChatErrorKind::AuthorizationExpired {
            self.handle_authorization_expired(error);
            return;
        }
        if !error.is_retryable() {
            self.fail_terminally(error);
            return;
        }

        let decision = self.config.retry.next(
            &self.retry_state,
            error.retry_after_ms,
            self.rng.as_mut(),
        );
        match decision {
            RetryDecision::Delay(delay) => {
                if self.state_machine.on_connect_failed().is_err() {
                    return;
                }
                self.release_attempt();
                self.retry_state.record(delay);
                warn!(
                    attempt = self.retry_state.attempt,
                    delay_ms = delay.as_millis() as u64,
                    code = %error.code,
                    error = %error.message,
                    "connection failed; retry scheduled"
                );
                self.notify_status();
                self.spawn_backoff(delay);
            }
            RetryDecision::Exhausted => {
                let attempts = self.retry_state.attempt + 1;
                let exhausted = ChatError::new(
                    error.kind,
                    "retries_exhausted",
                    format!("gave up after {attempts} attempts: {}", error.message),
                );
                self.fail_terminally(exhausted);
            }
        }
    }

    /// Enter a `FailedToConnect` that no automatic retry leaves.
    fn fail_terminally(&mut self, error: ChatError) {
        let announce = match self.state() {
            ConnectionState::Connecting | ConnectionState::Online => {
                self.state_machine.on_connect_failed().is_ok()
            }
            ConnectionState::FailedToConnect => false,
            _ => return,
        };
        if self.state_machine.on_retries_exhausted().is_err() {
            return;
        }
        self.teardown();
        warn!(
            kind = ?error.kind,
            code = %error.code,
            error = %error.message,
            "connection failed terminally"
        );
        if announce {
            self.notify_status();
        }
        self.notify_error(&error);
    }

    fn spawn_attempt(&mut self, mode: OpenMode) {
        let (Some(session_token), Some(credential)) =
            (self.session_token.as_ref(), self.credential.clone())
        else {
            return;
        };

        self.generation += 1;
        let generation = self.generation;
        let attempt_token = session_token.child_token();
        self.attempt_token = Some(attempt_token.clone());

        let transport = self.transport.clone();
        let signal_tx = self.signal_tx.clone();
        let connect_timeout = self.config.connect_timeout;

        tokio::spawn(async move {
            let send = |signal| {
                signal_tx
                    .send(SupervisorSignal { generation, signal })
                    .is_ok()
            };

            let opened = tokio::select! {
                _ = attempt_token.cancelled() => return,
                opened = tokio::time::timeout(connect_timeout, transport.open(&credential, mode)) => opened,
            };
            let TransportSession { mut events, outbox } = match opened {
                Ok(Ok(session)) => session,
                Ok(Err(error)) => {
                    send(Signal::OpenFailed(error));
                    return;
                }
                Err(_) => {
                    send(Signal::OpenFailed(ChatError::timeout(connect_timeout)));
                    return;
                }
            };
            if !send(Signal::Opened { outbox }) {
                return;
            }

            loop {
                tokio::select! {
                    _ = attempt_token.cancelled() => break,
                    event = events.next() => {
                        let event = event.unwrap_or_else(|| {
                            TransportEvent::Dropped(ChatError::new(
                                ChatErrorKind::TransientConnectionFailure,
                                "stream_ended",
                                "transport event stream ended",
                            ))
                        });
                        let last = !matches!(
                            event,
                            TransportEvent::Activity(_) | TransportEvent::SendOutcome { .. }
                        );
                        if !send(Signal::Transport(event)) || last {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn spawn_backoff(&mut self, delay: Duration) {
        let Some(session_token) = self.session_token.clone() else {
            return;
        };
        self.generation += 1;
        let generation = self.generation;
        let signal_tx = self.signal_tx.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = session_token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = signal_tx.send(SupervisorSignal {
                        generation,
                        signal: Signal::RetryDue,
                    });
                }
            }
        });
    }

    /// Drop the current attempt and its connection.
    fn release_attempt(&mut self) {
        if let Some(token) = self.attempt_token.take() {
            token.cancel();
        }
        self.outbox = None;
    }

    /// Cancel everything the session spawned and invalidate pending signals.
    fn teardown(&mut self) {
        self.release_attempt();
        if let Some(token) = self.session_token.take() {
            token.cancel();
        }
        self.generation += 1;
    }

    fn notify_status(&mut self) {
        let state = self.state();
        for handler in &mut self.status_handlers {
            handler(state);
        }
    }

    fn notify_error(&mut self, error: &ChatError) {
        for handler in &mut self.error_handlers {
            handler(error);
        }
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        if let Some(token) = self.session_token.take() {
            token.cancel();
        }
    }
}
