use std::{sync::Arc, time::Duration};

use chat_core::{
    ActivityKind, ActivityNormalizer, ChatChannelError, ChatChannels, ChatCommand, ChatError,
    ChatEvent, ChatInitConfig, ConnectionState, EventSink, EventStream, MessageOrderingBuffer,
    NormalizedActivity, OrderingError, RenderState, RetryScheduler, Role, SendAck, SendOutcome,
    StreamId, StreamingConfig, StreamingError, StreamingSimulator, StreamingUpdate,
    normalize_connection_error, normalize_send_outcome, timeline::DEFAULT_TIMELINE_MAX_ITEMS,
};
use chat_platform::{ConversationSessionBridge, ScopedSessionBridge};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    supervisor::{
        ConnectionSupervisor, DEFAULT_CONNECT_TIMEOUT, SupervisorConfig, SupervisorSignal,
    },
    ticker::{StreamTick, StreamTicker},
    transport::Transport,
};

const COMMAND_BUFFER: usize = 128;
const EVENT_BUFFER: usize = 512;

/// Identity and tuning of one runtime.
#[derive(Debug, Clone)]
pub struct ChatRuntimeConfig {
    /// Sender id of the local user; activities from it resolve to `Role::User`.
    pub user_id: String,
    /// Key of the persisted conversation history.
    pub session_id: String,
    pub init: ChatInitConfig,
}

impl ChatRuntimeConfig {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            init: ChatInitConfig::default(),
        }
    }

    pub fn with_init(mut self, init: ChatInitConfig) -> Self {
        self.init = init;
        self
    }
}

#[derive(Clone, Debug)]
pub struct ChatRuntimeHandle {
    channels: ChatChannels,
}

impl ChatRuntimeHandle {
    pub async fn send(&self, command: ChatCommand) -> Result<(), ChatChannelError> {
        self.channels.send_command(command).await
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }
}

/// Restore the session history and spawn the runtime task.
pub fn spawn_runtime(
    transport: Arc<dyn Transport>,
    bridge: Arc<dyn ConversationSessionBridge>,
    config: ChatRuntimeConfig,
) -> ChatRuntimeHandle {
    let (channels, command_rx) = ChatChannels::new(COMMAND_BUFFER, EVENT_BUFFER);
    let runtime = ChatRuntime::new(channels.event_sink(), command_rx, transport, bridge, config);
    tokio::spawn(async move {
        runtime.run().await;
    });

    ChatRuntimeHandle { channels }
}

/// Supervisor output queued for the pipeline.
#[derive(Debug)]
enum PipelineItem {
    Status(ConnectionState),
    Activity(NormalizedActivity),
    Error(ChatError),
    SendAck(SendAck),
}

enum Step {
    Command(ChatCommand),
    Signal(SupervisorSignal),
    Tick(StreamTick),
}

struct ChatRuntime {
    events: EventSink,
    command_rx: mpsc::Receiver<ChatCommand>,
    supervisor: ConnectionSupervisor,
    pipeline_rx: mpsc::UnboundedReceiver<PipelineItem>,
    buffer: MessageOrderingBuffer,
    simulator: StreamingSimulator,
    ticker: StreamTicker,
    history: ScopedSessionBridge<Arc<dyn ConversationSessionBridge>>,
    simulate_streaming: bool,
}

impl ChatRuntime {
    fn new(
        events: EventSink,
        command_rx: mpsc::Receiver<ChatCommand>,
        transport: Arc<dyn Transport>,
        bridge: Arc<dyn ConversationSessionBridge>,
        config: ChatRuntimeConfig,
    ) -> Self {
        let init = &config.init;

        let mut normalizer = ActivityNormalizer::new(config.user_id.clone());
        if let Some(secs) = init.max_clock_skew_secs {
            normalizer = normalizer.with_max_clock_skew_secs(secs);
        }

        let supervisor_config = SupervisorConfig {
            connect_timeout: init
                .connect_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            retry: RetryScheduler::default(),
        };
        let mut supervisor = ConnectionSupervisor::new(transport, normalizer, supervisor_config);

        let (pipeline_tx, pipeline_rx) = mpsc::unbounded_channel();
        let tx = pipeline_tx.clone();
        supervisor.on_status_change(move |state| {
            let _ = tx.send(PipelineItem::Status(state));
        });
        let tx = pipeline_tx.clone();
        supervisor.on_activity(move |activity| {
            let _ = tx.send(PipelineItem::Activity(activity.clone()));
        });
        let tx = pipeline_tx.clone();
        supervisor.on_error(move |error| {
            let _ = tx.send(PipelineItem::Error(error.clone()));
        });
        let tx = pipeline_tx;
        supervisor.on_send_ack(move |ack| {
            let _ = tx.send(PipelineItem::SendAck(ack.clone()));
        });

        let mut streaming = StreamingConfig::default();
        if let Some(ceiling_ms) = init.reveal_ceiling_ms {
            streaming = streaming.with_reveal_ceiling(Duration::from_millis(ceiling_ms));
        }

        let mut runtime = Self {
            events,
            command_rx,
            supervisor,
            pipeline_rx,
            buffer: MessageOrderingBuffer::new(
                init.timeline_max_items.unwrap_or(DEFAULT_TIMELINE_MAX_ITEMS),
            ),
            simulator: StreamingSimulator::new(streaming),
            ticker: StreamTicker::default(),
            history: ScopedSessionBridge::new(bridge, config.session_id.clone()),
            simulate_streaming: init.simulate_streaming.unwrap_or(true),
        };
        runtime.restore_history();
        runtime
    }

    fn restore_history(&mut self) {
        let history = match self.history.load_history() {
            Ok(history) => history,
            Err(err) => {
                warn!(session_id = %self.history.session_id(), error = %err, "failed loading session history");
                return;
            }
        };

        let history = history
            .into_iter()
            .map(|mut message| {
                message.render_state = RenderState::Finalized;
                message
            })
            .collect();
        self.buffer.restore(history);
        let last_sequence = self.buffer.last_sequence();
        let ids: Vec<String> = self
            .buffer
            .items()
            .iter()
            .map(|message| message.id().to_owned())
            .collect();
        self.supervisor
            .resume_after(last_sequence, ids.iter().map(String::as_str));
        info!(
            session_id = %self.history.session_id(),
            restored = self.buffer.len(),
            "session history restored"
        );
    }

    async fn run(mut self) {
        loop {
            let step = tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(command) => Step::Command(command),
                    None => break,
                },
                Some(signal) = self.supervisor.next_signal() => Step::Signal(signal),
                Some(tick) = self.ticker.next_tick() => Step::Tick(tick),
            };

            match step {
                Step::Command(command) => {
                    if let Err(err) = self.handle_command(command) {
                        self.events.emit(normalize_connection_error(err));
                    }
                }
                Step::Signal(signal) => self.supervisor.apply_signal(signal),
                Step::Tick(tick) => self.handle_tick(tick.stream_id),
            }
            self.drain_pipeline();
        }

        self.finalize_streams();
        self.supervisor.stop();
        self.ticker.shutdown();
        self.drain_pipeline();
        debug!("chat runtime stopped");
    }

    fn handle_command(&mut self, command: ChatCommand) -> Result<(), ChatError> {
        match command {
            ChatCommand::Start { credential } => self.supervisor.start(&credential),
            ChatCommand::Stop => {
                self.finalize_streams();
                self.supervisor.stop();
                Ok(())
            }
            ChatCommand::SendText {
                client_activity_id,
                text,
            } => {
                self.handle_send_text(client_activity_id, text);
                Ok(())
            }
            ChatCommand::CancelStream { message_id } => {
                match self.simulator.cancel_message(&message_id) {
                    Some((stream_id, update)) => self.publish_final(stream_id, update),
                    None => debug!(%message_id, "no reveal in flight for message"),
                }
                Ok(())
            }
            ChatCommand::Snapshot => {
                self.events.emit(ChatEvent::TimelineSnapshot {
                    messages: self.buffer.snapshot(),
                });
                Ok(())
            }
        }
    }

    fn handle_send_text(&mut self, client_activity_id: String, text: String) {
        self.finalize_streams();
        if let Err(error) = self
            .supervisor
            .send_text_with_id(client_activity_id.clone(), text)
        {
            self.events.emit(normalize_send_outcome(
                client_activity_id,
                SendOutcome::Failure { error },
            ));
        }
    }

    fn handle_tick(&mut self, stream_id: StreamId) {
        match self.simulator.advance(stream_id) {
            Some(update) if update.is_final => self.publish_final(stream_id, update),
            Some(update) => self.events.emit(ChatEvent::StreamingUpdate(update)),
            None => self.ticker.cancel(stream_id),
        }
    }

    fn drain_pipeline(&mut self) {
        while let Ok(item) = self.pipeline_rx.try_recv() {
            match item {
                PipelineItem::Status(state) => {
                    self.events.emit(ChatEvent::StatusChanged { state });
                }
                PipelineItem::Activity(activity) => self.handle_activity(activity),
                PipelineItem::Error(error) => {
                    self.events.emit(normalize_connection_error(error));
                }
                PipelineItem::SendAck(ack) => self.events.emit(ChatEvent::SendAck(ack)),
            }
        }
    }

    fn handle_activity(&mut self, activity: NormalizedActivity) {
        if activity.kind == ActivityKind::Typing {
            self.events.emit(ChatEvent::Typing { activity });
            return;
        }

        let reveal = self.simulate_streaming
            && activity.kind == ActivityKind::Message
            && activity.from_role == Role::Agent
            && !activity.text.trim().is_empty();
        let id = activity.id.clone();

        let inserted = self.buffer.insert(activity);
        self.archive_evicted();
        let position = match inserted {
            Ok(position) => position,
            Err(OrderingError::Duplicate(id)) => {
                debug!(activity_id = %id, "activity already in history");
                return;
            }
            Err(OrderingError::Evicted(id)) => {
                debug!(activity_id = %id, "activity older than retained history");
                return;
            }
            Err(err) => {
                warn!(error = %err, "failed ordering activity");
                return;
            }
        };

        if !reveal {
            self.finalize_message(&id);
        } else if let Err(err) = self.start_reveal(position) {
            warn!(activity_id = %id, error = %err, "reveal not started");
            self.finalize_message(&id);
        }

        let message = self.buffer.items()[position].clone();
        self.events.emit(ChatEvent::ActivityOrdered { message, position });
    }

    fn start_reveal(&mut self, position: usize) -> Result<(), StreamingError> {
        let (stream_id, plan) = self.simulator.start(&self.buffer.items()[position])?;
        let id = self.buffer.items()[position].id().to_owned();
        self.buffer.set_render_state(&id, RenderState::Streaming).ok();
        debug!(activity_id = %id, %stream_id, steps = plan.steps, "reveal started");
        self.ticker.schedule(stream_id, plan);
        Ok(())
    }

    /// Flush every in-flight reveal with its full content.
    fn finalize_streams(&mut self) {
        for (stream_id, update) in self.simulator.finalize_all() {
            self.publish_final(stream_id, update);
        }
    }

    fn publish_final(&mut self, stream_id: StreamId, update: StreamingUpdate) {
        self.ticker.cancel(stream_id);
        self.finalize_message(&update.message_id);
        self.events.emit(ChatEvent::StreamingUpdate(update));
    }

    /// Archive messages retention pushed out before they were finalized.
    fn archive_evicted(&mut self) {
        for mut message in self.buffer.take_evicted() {
            if message.render_state == RenderState::Finalized {
                continue;
            }
            if let Some((stream_id, update)) = self.simulator.cancel_message(message.id()) {
                self.ticker.cancel(stream_id);
                self.events.emit(ChatEvent::StreamingUpdate(update));
            }
            message.render_state = RenderState::Finalized;
            debug!(activity_id = %message.id(), "archiving message evicted from retention");
            if let Err(err) = self.history.append(&message) {
                warn!(activity_id = %message.id(), error = %err, "failed archiving message");
            }
        }
    }

    /// Mark a message finalized and archive it.
    fn finalize_message(&mut self, id: &str) {
        match self.buffer.set_render_state(id, RenderState::Finalized) {
            Ok(position) => {
                let message = &self.buffer.items()[position];
                if let Err(err) = self.history.append(message) {
                    warn!(activity_id = %id, error = %err, "failed archiving message");
                }
            }
            Err(err) => {
                debug!(activity_id = %id, error = %err, "message left the buffer before finalizing");
            }
        }
    }
}
