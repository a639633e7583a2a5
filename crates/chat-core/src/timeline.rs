use std::collections::HashSet;

use thiserror::Error;

use crate::types::{NormalizedActivity, OrderedMessage, RenderState};

/// Default retention cap of the ordering buffer.
pub const DEFAULT_TIMELINE_MAX_ITEMS: usize = 1_200;

/// Errors that can occur while mutating the ordered history.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OrderingError {
    /// Typing indicators are transient and never enter the history.
    #[error("activity '{0}' is transient and cannot be ordered")]
    TransientActivity(String),
    /// A message with the same ID is already held.
    #[error("ordered message '{0}' is already in the history")]
    Duplicate(String),
    /// An operation referenced an ID that is not present in the buffer.
    #[error("ordered message '{0}' was not found")]
    MissingMessage(String),
    /// The entry sorted before every retained entry of a full buffer.
    #[error("ordered message '{0}' is older than the retention window")]
    Evicted(String),
}

/// Chronologically ordered message history with bounded retention.
///
/// Entries are kept non-decreasing by `(resolved_timestamp, received_sequence)`
/// and IDs are unique. Entries pushed out by retention are parked until the
/// owner collects them with [`MessageOrderingBuffer::take_evicted`].
#[derive(Debug, Clone)]
pub struct MessageOrderingBuffer {
    items: Vec<OrderedMessage>,
    max_items: usize,
    evicted: Vec<OrderedMessage>,
}

impl Default for MessageOrderingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_TIMELINE_MAX_ITEMS)
    }
}

impl MessageOrderingBuffer {
    /// Create a buffer with an item cap (`max_items >= 1`).
    pub fn new(max_items: usize) -> Self {
        Self {
            items: Vec::new(),
            max_items: max_items.max(1),
            evicted: Vec::new(),
        }
    }

    /// Current messages in display order.
    pub fn items(&self) -> &[OrderedMessage] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Owned copy of the full current ordering.
    pub fn snapshot(&self) -> Vec<OrderedMessage> {
        self.items.clone()
    }

    /// Highest ingestion sequence held, used to resume numbering after a restore.
    pub fn last_sequence(&self) -> Option<u64> {
        self.items
            .iter()
            .map(|message| message.activity.received_sequence)
            .max()
    }

    pub fn get(&self, id: &str) -> Option<&OrderedMessage> {
        self.items.iter().find(|message| message.id() == id)
    }

    pub fn position_of(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|message| message.id() == id)
    }

    /// Insert an activity at its chronological position and return that index.
    ///
    /// Callers must re-render from the returned index forward when it is not
    /// the tail.
    pub fn insert(&mut self, activity: NormalizedActivity) -> Result<usize, OrderingError> {
        self.insert_message(OrderedMessage::pending(activity))
    }

    /// Insert an already wrapped message, keeping its render state.
    pub fn insert_message(&mut self, message: OrderedMessage) -> Result<usize, OrderingError> {
        if !message.activity.kind.is_orderable() {
            return Err(OrderingError::TransientActivity(message.activity.id));
        }
        if self.position_of(message.id()).is_some() {
            return Err(OrderingError::Duplicate(message.activity.id));
        }

        let key = message.sort_key();
        let mut position = self.items.len();
        while position > 0 && self.items[position - 1].sort_key() > key {
            position -= 1;
        }

        let id = message.activity.id.clone();
        self.items.insert(position, message);

        let dropped = self.trim_to_max();
        let shift = dropped.len();
        self.evicted.extend(dropped);
        if position < shift {
            return Err(OrderingError::Evicted(id));
        }
        Ok(position - shift)
    }

    /// Drain the entries retention pushed out of the buffer, in eviction order.
    ///
    /// An insertion rejected with [`OrderingError::Evicted`] is included too.
    pub fn take_evicted(&mut self) -> Vec<OrderedMessage> {
        std::mem::take(&mut self.evicted)
    }

    /// Update the render state of a message and return its position.
    pub fn set_render_state(
        &mut self,
        id: &str,
        render_state: RenderState,
    ) -> Result<usize, OrderingError> {
        let position = self
            .position_of(id)
            .ok_or_else(|| OrderingError::MissingMessage(id.to_owned()))?;
        self.items[position].render_state = render_state;
        Ok(position)
    }

    /// Replace the contents with a previously persisted history.
    ///
    /// Restored entries are re-sorted by key, so a history written out of
    /// order still satisfies the ordering invariant. Repeated IDs keep their
    /// first occurrence.
    pub fn restore(&mut self, history: Vec<OrderedMessage>) {
        let mut seen = HashSet::new();
        let mut history: Vec<_> = history
            .into_iter()
            .filter(|message| message.activity.kind.is_orderable())
            .filter(|message| seen.insert(message.activity.id.clone()))
            .collect();
        history.sort_by_key(OrderedMessage::sort_key);
        self.items = history;
        self.evicted.clear();
        self.trim_to_max();
    }

    /// Whether the buffer currently satisfies the ordering invariant.
    pub fn is_ordered(&self) -> bool {
        self.items
            .windows(2)
            .all(|pair| pair[0].sort_key() <= pair[1].sort_key())
    }

    fn trim_to_max(&mut self) -> Vec<OrderedMessage> {
        if self.items.len() <= self.max_items {
            return Vec::new();
        }

        let excess = self.items.len() - self.max_items;
        self.items.drain(0..excess).collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};
    use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

    use super::*;
    use crate::types::{ActivityKind, Role};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s)
            .single()
            .expect("valid time")
    }

    fn activity(id: &str, timestamp: DateTime<Utc>, sequence: u64) -> NormalizedActivity {
        NormalizedActivity {
            id: id.to_owned(),
            kind: ActivityKind::Message,
            from_role: Role::Agent,
            sender_id: Some("bot".to_owned()),
            text: format!("body of {id}"),
            attachments: Vec::new(),
            suggested_actions: Vec::new(),
            reply_to_id: None,
            timestamp,
            source_timestamp: None,
            timestamp_defaulted: false,
            ordering_anomaly: false,
            received_sequence: sequence,
        }
    }

    fn ids(buffer: &MessageOrderingBuffer) -> Vec<&str> {
        buffer.items().iter().map(OrderedMessage::id).collect()
    }

    #[test]
    fn orders_late_arrivals_and_breaks_ties_by_arrival() {
        let mut buffer = MessageOrderingBuffer::new(50);

        let first = buffer
            .insert(activity("a", at(10, 0, 2), 0))
            .expect("insert a");
        let second = buffer
            .insert(activity("b", at(10, 0, 1), 1))
            .expect("insert b");
        let third = buffer
            .insert(activity("c", at(10, 0, 2), 2))
            .expect("insert c");

        assert_eq!((first, second, third), (0, 0, 2));
        assert_eq!(ids(&buffer), vec!["b", "a", "c"]);
        assert!(buffer.is_ordered());
    }

    #[test]
    fn tie_break_is_stable_across_repeated_snapshots() {
        let mut buffer = MessageOrderingBuffer::new(50);
        buffer.insert(activity("a", at(9, 0, 0), 10)).expect("a");
        buffer.insert(activity("b", at(9, 0, 0), 11)).expect("b");

        for _ in 0..5 {
            let snapshot = buffer.snapshot();
            assert_eq!(snapshot[0].id(), "a");
            assert_eq!(snapshot[1].id(), "b");
        }
    }

    #[test]
    fn snapshot_is_sorted_for_any_arrival_order() {
        let mut rng = StdRng::seed_from_u64(2024);
        for _ in 0..50 {
            let mut arrivals: Vec<(String, DateTime<Utc>)> = (0..40)
                .map(|i| (format!("m{i}"), at(10, 0, (i % 7) as u32)))
                .collect();
            arrivals.shuffle(&mut rng);

            let mut buffer = MessageOrderingBuffer::new(100);
            for (sequence, (id, timestamp)) in arrivals.into_iter().enumerate() {
                buffer
                    .insert(activity(&id, timestamp, sequence as u64))
                    .expect("insert");
                assert!(buffer.is_ordered());
            }

            let snapshot = buffer.snapshot();
            assert_eq!(snapshot.len(), 40);
            assert!(
                snapshot
                    .windows(2)
                    .all(|pair| pair[0].sort_key() <= pair[1].sort_key())
            );
        }
    }

    #[test]
    fn rejects_typing_indicators() {
        let mut buffer = MessageOrderingBuffer::new(10);
        let mut typing = activity("t", at(10, 0, 0), 0);
        typing.kind = ActivityKind::Typing;
        assert_eq!(
            buffer.insert(typing),
            Err(OrderingError::TransientActivity("t".into()))
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn updates_render_state_in_place() {
        let mut buffer = MessageOrderingBuffer::new(10);
        buffer.insert(activity("a", at(10, 0, 0), 0)).expect("a");
        buffer.insert(activity("b", at(10, 0, 1), 1)).expect("b");
        assert_eq!(
            buffer.get("b").map(|message| message.render_state),
            Some(RenderState::Pending)
        );

        let position = buffer
            .set_render_state("b", RenderState::Finalized)
            .expect("known id");
        assert_eq!(position, 1);
        assert_eq!(
            buffer.get("b").map(|message| message.render_state),
            Some(RenderState::Finalized)
        );
        assert_eq!(
            buffer.set_render_state("zzz", RenderState::Streaming),
            Err(OrderingError::MissingMessage("zzz".into()))
        );
    }

    #[test]
    fn trims_oldest_when_over_max_items() {
        let mut buffer = MessageOrderingBuffer::new(2);
        buffer.insert(activity("1", at(10, 0, 1), 0)).expect("1");
        buffer.insert(activity("2", at(10, 0, 2), 1)).expect("2");
        let position = buffer.insert(activity("3", at(10, 0, 3), 2)).expect("3");

        assert_eq!(position, 1);
        assert_eq!(ids(&buffer), vec!["2", "3"]);

        let err = buffer
            .insert(activity("0", at(9, 0, 0), 3))
            .expect_err("older than every retained entry");
        assert_eq!(err, OrderingError::Evicted("0".into()));
        assert_eq!(ids(&buffer), vec!["2", "3"]);

        let evicted = buffer.take_evicted();
        let evicted_ids: Vec<_> = evicted.iter().map(OrderedMessage::id).collect();
        assert_eq!(evicted_ids, vec!["1", "0"]);
        assert!(buffer.take_evicted().is_empty());
    }

    #[test]
    fn evicted_entries_keep_their_render_state() {
        let mut buffer = MessageOrderingBuffer::new(1);
        buffer.insert(activity("first", at(10, 0, 1), 0)).expect("first");
        buffer
            .set_render_state("first", RenderState::Streaming)
            .expect("mark streaming");
        buffer.insert(activity("second", at(10, 0, 2), 1)).expect("second");

        let evicted = buffer.take_evicted();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id(), "first");
        assert_eq!(evicted[0].render_state, RenderState::Streaming);
    }

    #[test]
    fn rejects_ids_already_held() {
        let mut buffer = MessageOrderingBuffer::new(10);
        buffer.insert(activity("m0", at(10, 0, 0), 0)).expect("m0");
        buffer
            .set_render_state("m0", RenderState::Finalized)
            .expect("finalize");

        let err = buffer
            .insert(activity("m0", at(10, 5, 0), 7))
            .expect_err("same id twice");
        assert_eq!(err, OrderingError::Duplicate("m0".into()));
        assert_eq!(ids(&buffer), vec!["m0"]);
        assert_eq!(buffer.items()[0].render_state, RenderState::Finalized);
    }

    #[test]
    fn restore_sorts_history_and_reports_last_sequence() {
        let mut buffer = MessageOrderingBuffer::new(10);
        buffer.restore(vec![
            OrderedMessage::pending(activity("late", at(11, 0, 0), 4)),
            OrderedMessage::pending(activity("early", at(10, 0, 0), 9)),
        ]);

        assert_eq!(ids(&buffer), vec!["early", "late"]);
        assert_eq!(buffer.last_sequence(), Some(9));
        assert!(buffer.take_evicted().is_empty());
        assert_eq!(buffer.position_of("late"), Some(1));
    }
}
