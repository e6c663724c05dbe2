use std::collections::BTreeMap;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushMessage {
    pub token: String,
    pub title: String,
    pub body: String,
    pub data: BTreeMap<String, String>,
}

/// Bounded accumulator for outgoing push messages. Capacity is the provider's
/// per-batch maximum; `push` hands back a full batch as soon as one forms.
#[derive(Debug)]
pub struct PushBuffer {
    capacity: usize,
    pending: Vec<PushMessage>,
}

impl PushBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            pending: Vec::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    #[must_use]
    pub fn push(&mut self, message: PushMessage) -> Option<Vec<PushMessage>> {
        self.pending.push(message);
        if self.pending.len() >= self.capacity {
            Some(std::mem::replace(
                &mut self.pending,
                Vec::with_capacity(self.capacity),
            ))
        } else {
            None
        }
    }

    /// Takes whatever is buffered, if anything.
    pub fn drain(&mut self) -> Option<Vec<PushMessage>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}
