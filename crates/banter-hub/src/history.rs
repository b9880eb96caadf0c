//! Bounded FIFO log of recent chat messages, replayed to new joiners.

use std::collections::VecDeque;

use banter_core::messages::ChatMessage;

/// Maximum number of messages retained.
pub const HISTORY_CAPACITY: usize = 100;

/// Insertion order equals arrival order at the hub; once full, the oldest
/// entry is evicted first.
#[derive(Debug, Default)]
pub struct History {
    entries: VecDeque<ChatMessage>,
}

impl History {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(HISTORY_CAPACITY),
        }
    }

    /// Append a message, evicting the oldest entry at capacity.
    pub fn push(&mut self, message: ChatMessage) {
        if self.entries.len() == HISTORY_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(message);
    }

    /// The full current buffer, oldest first.
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
