use std::collections::HashMap;

use chat_core::{RevealPlan, StreamId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One reveal step became due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTick {
    pub stream_id: StreamId,
}

/// Independent timers for concurrent reveals.
///
/// Each scheduled stream gets its own task, cancelled through a child of the
/// ticker's root token. Ticks only signal; the owner advances the simulator.
#[derive(Debug)]
pub struct StreamTicker {
    root: CancellationToken,
    tokens: HashMap<StreamId, CancellationToken>,
    tick_tx: mpsc::UnboundedSender<StreamTick>,
    tick_rx: mpsc::UnboundedReceiver<StreamTick>,
}

impl Default for StreamTicker {
    fn default() -> Self {
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        Self {
            root: CancellationToken::new(),
            tokens: HashMap::new(),
            tick_tx,
            tick_rx,
        }
    }
}

impl StreamTicker {
    /// Emit `plan.steps` ticks, one every `plan.interval`.
    pub fn schedule(&mut self, stream_id: StreamId, plan: RevealPlan) {
        let token = self.root.child_token();
        if let Some(previous) = self.tokens.insert(stream_id, token.clone()) {
            previous.cancel();
        }

        let tick_tx = self.tick_tx.clone();
        tokio::spawn(async move {
            for _ in 0..plan.steps {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(plan.interval) => {}
                }
                if tick_tx.send(StreamTick { stream_id }).is_err() {
                    return;
                }
            }
        });
    }

    /// Stop the timer of one stream. Unknown streams are ignored.
    pub fn cancel(&mut self, stream_id: StreamId) {
        if let Some(token) = self.tokens.remove(&stream_id) {
            token.cancel();
        }
    }

    pub fn active_count(&self) -> usize {
        self.tokens.len()
    }

    /// Next due tick. Cancel-safe.
    pub async fn next_tick(&mut self) -> Option<StreamTick> {
        self.tick_rx.recv().await
    }

    /// Stop every timer.
    pub fn shutdown(&mut self) {
        self.root.cancel();
        self.tokens.clear();
    }
}

impl Drop for StreamTicker {
    fn drop(&mut self) {
        self.root.cancel();
    }
}
