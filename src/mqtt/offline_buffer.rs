//! Outbound messages held while the broker session is down.
//!
//! Entries are resent in arrival order after the next successful connect.
//! A capacity of zero disables buffering.

use std::collections::VecDeque;

use rumqttc::QoS;

/// Publish attempted while the session was down
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferedMessage {
    pub topic: String,
    pub qos: QoS,
    pub payload: Vec<u8>,
}

/// Bounded FIFO of outbound messages held while disconnected.
///
/// When full, the oldest entry is evicted to make room for the newest one.
#[derive(Debug)]
pub struct OfflineBuffer {
    entries: VecDeque<BufferedMessage>,
    capacity: usize,
}

impl OfflineBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    /// Appends a message and returns the entry evicted to make room, if any.
    pub fn push(&mut self, message: BufferedMessage) -> Option<BufferedMessage> {
        if !self.is_enabled() {
            return Some(message);
        }
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(message);
        evicted
    }

    /// Takes every buffered entry in enqueue order.
    pub fn drain(&mut self) -> Vec<BufferedMessage> {
        self.entries.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
