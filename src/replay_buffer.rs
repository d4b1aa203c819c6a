use serde::{Deserialize, Serialize};

/// A single experience tuple (s, a, r, s', done).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub state: Vec<f32>,
    pub action: usize,
    pub reward: f32,
    pub next_state: Vec<f32>,
    pub done: bool,
}

/// Transitions of the running episode, in insertion order.
/// Unbounded; drained into the durable cache at the episode boundary.
#[derive(Debug, Default)]
pub struct EpisodeMemory {
    buffer: Vec<Transition>,
}

impl EpisodeMemory {
    pub fn new() -> Self {
        Self::default()
    }

    ///add new transition
    pub fn push(&mut self, transition: Transition) {
        self.buffer.push(transition);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_slice(&self) -> &[Transition] {
        &self.buffer
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
