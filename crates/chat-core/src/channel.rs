use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::types::{ChatCommand, ChatEvent};

/// Broadcast event stream type used by UI subscribers.
pub type EventStream = broadcast::Receiver<ChatEvent>;

/// Errors returned by chat channel operations.
#[derive(Debug, Error)]
pub enum ChatChannelError {
    /// The command receiver side is closed.
    #[error("command channel is closed")]
    CommandChannelClosed,
}

/// Caller side of a runtime: command sender plus event subscription.
///
/// The runtime itself only keeps the [`EventSink`], so it observes the command
/// channel closing once every `ChatChannels` clone is dropped.
#[derive(Clone, Debug)]
pub struct ChatChannels {
    command_tx: mpsc::Sender<ChatCommand>,
    event_tx: broadcast::Sender<ChatEvent>,
}

impl ChatChannels {
    /// Create a new channel set and return it with the command receiver.
    pub fn new(command_buffer: usize, event_buffer: usize) -> (Self, mpsc::Receiver<ChatCommand>) {
        let (command_tx, command_rx) = mpsc::channel(command_buffer.max(1));
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));

        (
            Self {
                command_tx,
                event_tx,
            },
            command_rx,
        )
    }

    /// Emitting half handed to the runtime.
    pub fn event_sink(&self) -> EventSink {
        EventSink {
            event_tx: self.event_tx.clone(),
        }
    }

    /// Subscribe to emitted chat events.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Send one command to the runtime.
    pub async fn send_command(&self, command: ChatCommand) -> Result<(), ChatChannelError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| ChatChannelError::CommandChannelClosed)
    }
}

/// Runtime side of the event channel.
#[derive(Clone, Debug)]
pub struct EventSink {
    event_tx: broadcast::Sender<ChatEvent>,
}

impl EventSink {
    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: ChatEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.event_tx.receiver_count()
    }
}
