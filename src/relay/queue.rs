//! Bounded drop-oldest queue between the fan-out and one session writer
//!
//! `push` never waits. When the queue is full the oldest packet is
//! discarded so a slow consumer loses data instead of adding latency, and
//! the ingest loop is never held up by it.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::packet::RelayPacket;

/// Lower bound on queue slots, whatever the configuration says
pub const MIN_QUEUE_SLOTS: usize = 2;

/// Number of slots for a session given the configured buffering budget
/// and packet size
pub fn slots_for(write_buffer_size: usize, packet_size: usize, max_slots: usize) -> usize {
    let slots = write_buffer_size / packet_size.max(1);
    slots.clamp(MIN_QUEUE_SLOTS, max_slots.max(MIN_QUEUE_SLOTS))
}

#[derive(Debug)]
pub struct SessionQueue {
    slots: Mutex<VecDeque<RelayPacket>>,
    capacity: usize,
    notify: Notify,
}

impl SessionQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Append a packet, evicting the oldest one when full
    ///
    /// Returns the evicted packet, if any.
    pub fn push(&self, packet: RelayPacket) -> Option<RelayPacket> {
        let evicted = {
            let mut slots = self.slots.lock();
            let evicted = if slots.len() >= self.capacity {
                slots.pop_front()
            } else {
                None
            };
            slots.push_back(packet);
            evicted
        };
        self.notify.notify_one();
        evicted
    }

    /// Wait for the next packet in FIFO order
    pub async fn pop(&self) -> RelayPacket {
        loop {
            let next = self.slots.lock().pop_front();
            if let Some(packet) = next {
                return packet;
            }
            self.notify.notified().await;
        }
    }

    /// Take the next packet without waiting
    pub fn try_pop(&self) -> Option<RelayPacket> {
        self.slots.lock().pop_front()
    }

    /// Discard everything queued, returning how many packets were dropped
    pub fn clear(&self) -> usize {
        let mut slots = self.slots.lock();
        let n = slots.len();
        slots.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
