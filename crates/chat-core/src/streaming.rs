use std::{collections::HashMap, fmt, time::Duration};

use thiserror::Error;

use crate::types::{OrderedMessage, RenderState, StreamingUpdate};

const DEFAULT_TICK_MS: u64 = 30;
const DEFAULT_CHARS_PER_TICK: usize = 3;
const DEFAULT_REVEAL_CEILING_MS: u64 = 4_000;

/// Identifier of one simulated reveal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// Errors returned when a reveal cannot start.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamingError {
    #[error("message '{0}' is already finalized")]
    AlreadyFinalized(String),
    #[error("message '{0}' is already streaming")]
    AlreadyStreaming(String),
}

/// Pacing knobs for simulated reveals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamingConfig {
    /// Delay between two emissions.
    pub tick: Duration,
    /// Characters revealed per emission before the ceiling kicks in.
    pub chars_per_tick: usize,
    /// Upper bound of the whole reveal.
    pub reveal_ceiling: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(DEFAULT_TICK_MS),
            chars_per_tick: DEFAULT_CHARS_PER_TICK,
            reveal_ceiling: Duration::from_millis(DEFAULT_REVEAL_CEILING_MS),
        }
    }
}

impl StreamingConfig {
    pub fn with_reveal_ceiling(mut self, ceiling: Duration) -> Self {
        self.reveal_ceiling = ceiling;
        self
    }

    /// Derive chunk size and step count for a message of `char_count` chars.
    pub fn plan_for(&self, char_count: usize) -> RevealPlan {
        let tick_ms = self.tick.as_millis().max(1);
        let max_steps = ((self.reveal_ceiling.as_millis() / tick_ms) as usize).max(1);

        let mut chunk_chars = self.chars_per_tick.max(1);
        let mut steps = char_count.div_ceil(chunk_chars).max(1);
        if steps > max_steps {
            chunk_chars = char_count.div_ceil(max_steps);
            steps = char_count.div_ceil(chunk_chars).max(1);
        }

        RevealPlan {
            interval: self.tick,
            chunk_chars,
            steps,
        }
    }
}

/// Pacing derived for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevealPlan {
    /// Delay before each emission.
    pub interval: Duration,
    /// Characters added per emission.
    pub chunk_chars: usize,
    /// Emissions including the final one.
    pub steps: usize,
}

impl RevealPlan {
    /// Time until the final emission when never cancelled.
    pub fn total_duration(&self) -> Duration {
        self.interval.saturating_mul(self.steps as u32)
    }
}

#[derive(Debug, Clone)]
struct ActiveStream {
    message_id: String,
    content: String,
    /// Byte offsets of the intermediate prefixes, strictly increasing and
    /// strictly shorter than `content`.
    boundaries: Vec<usize>,
    next: usize,
}

impl ActiveStream {
    fn final_update(self) -> StreamingUpdate {
        StreamingUpdate {
            message_id: self.message_id,
            prefix: self.content,
            is_final: true,
        }
    }
}

/// Progressive reveal of messages that arrived as complete payloads.
///
/// Each stream moves `Pending → Streaming → Finalized`. Intermediate updates
/// are strict prefixes of the content; the final update carries the full
/// content and is produced exactly once, whether the reveal completes or is
/// cancelled.
#[derive(Debug, Clone, Default)]
pub struct StreamingSimulator {
    config: StreamingConfig,
    streams: HashMap<StreamId, ActiveStream>,
    by_message: HashMap<String, StreamId>,
    next_id: u64,
}

impl StreamingSimulator {
    pub fn new(config: StreamingConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn is_active(&self, stream_id: StreamId) -> bool {
        self.streams.contains_key(&stream_id)
    }

    pub fn active_count(&self) -> usize {
        self.streams.len()
    }

    pub fn stream_for_message(&self, message_id: &str) -> Option<StreamId> {
        self.by_message.get(message_id).copied()
    }

    /// Begin revealing `message`. The caller drives emissions with
    /// [`StreamingSimulator::advance`] every `plan.interval`.
    pub fn start(
        &mut self,
        message: &OrderedMessage,
    ) -> Result<(StreamId, RevealPlan), StreamingError> {
        if message.render_state == RenderState::Finalized {
            return Err(StreamingError::AlreadyFinalized(message.id().to_owned()));
        }
        if self.by_message.contains_key(message.id()) {
            return Err(StreamingError::AlreadyStreaming(message.id().to_owned()));
        }

        let content = message.activity.text.clone();
        let char_offsets: Vec<usize> = content.char_indices().map(|(offset, _)| offset).collect();
        let plan = self.config.plan_for(char_offsets.len());

        let boundaries = (1..plan.steps)
            .map(|step| step * plan.chunk_chars)
            .take_while(|chars| *chars < char_offsets.len())
            .map(|chars| char_offsets[chars])
            .collect();

        let stream_id = StreamId(self.next_id);
        self.next_id += 1;
        self.by_message.insert(message.id().to_owned(), stream_id);
        self.streams.insert(
            stream_id,
            ActiveStream {
                message_id: message.id().to_owned(),
                content,
                boundaries,
                next: 0,
            },
        );

        Ok((stream_id, plan))
    }

    /// Emit the next prefix. Returns `None` for unknown or finished streams.
    pub fn advance(&mut self, stream_id: StreamId) -> Option<StreamingUpdate> {
        let stream = self.streams.get_mut(&stream_id)?;
        if let Some(&boundary) = stream.boundaries.get(stream.next) {
            stream.next += 1;
            return Some(StreamingUpdate {
                message_id: stream.message_id.clone(),
                prefix: stream.content[..boundary].to_owned(),
                is_final: false,
            });
        }
        self.finish(stream_id)
    }

    /// Skip to the end: emit the full content now. `None` if already finished.
    pub fn cancel(&mut self, stream_id: StreamId) -> Option<StreamingUpdate> {
        self.finish(stream_id)
    }

    /// [`StreamingSimulator::cancel`] addressed by message ID.
    pub fn cancel_message(&mut self, message_id: &str) -> Option<(StreamId, StreamingUpdate)> {
        let stream_id = self.stream_for_message(message_id)?;
        self.finish(stream_id).map(|update| (stream_id, update))
    }

    /// Finalize every in-flight reveal, oldest stream first.
    pub fn finalize_all(&mut self) -> Vec<(StreamId, StreamingUpdate)> {
        let mut ids: Vec<_> = self.streams.keys().copied().collect();
        ids.sort();
        ids.into_iter()
            .filter_map(|stream_id| self.finish(stream_id).map(|update| (stream_id, update)))
            .collect()
    }

    fn finish(&mut self, stream_id: StreamId) -> Option<StreamingUpdate> {
        let stream = self.streams.remove(&stream_id)?;
        self.by_message.remove(&stream.message_id);
        Some(stream.final_update())
    }
}
