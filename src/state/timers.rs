//! Deferred events on the connection's queue.
//!
//! Timers never run on their own: the actor sleeps until
//! [`TimerQueue::next_deadline`] and then asks for the due events. A
//! cancelled timer is removed from the queue and can never fire.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use super::channels::ChannelId;
use super::handle::HandleId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// What a timer does when it fires.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TimerEvent {
    /// Repeat the local typing notification.
    TypingResend { channel: ChannelId },
    /// A remote contact stopped typing without saying so.
    TypingStopped { channel: ChannelId, contact: HandleId },
    /// A multi-party conversation stayed without a session too long.
    SessionlessChannel { channel: ChannelId },
}

impl TimerEvent {
    pub fn channel(&self) -> ChannelId {
        match self {
            Self::TypingResend { channel }
            | Self::TypingStopped { channel, .. }
            | Self::SessionlessChannel { channel } => *channel,
        }
    }
}

#[derive(Default)]
pub struct TimerQueue {
    next_id: u64,
    queue: BTreeMap<(Instant, TimerId), TimerEvent>,
    deadlines: HashMap<TimerId, Instant>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, at: Instant, event: TimerEvent) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.queue.insert((at, id), event);
        self.deadlines.insert(id, at);
        id
    }

    /// Returns false if the timer already fired or was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.deadlines.remove(&id) {
            Some(at) => self.queue.remove(&(at, id)).is_some(),
            None => false,
        }
    }

    /// Cancel every timer owned by `channel`.
    pub fn cancel_channel(&mut self, channel: ChannelId) -> usize {
        let doomed: Vec<(Instant, TimerId)> = self
            .queue
            .iter()
            .filter(|(_, event)| event.channel() == channel)
            .map(|(slot, _)| *slot)
            .collect();
        for slot in &doomed {
            self.queue.remove(slot);
            self.deadlines.remove(&slot.1);
        }
        doomed.len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(at, _)| *at)
    }

    /// Remove and return every event due at `now`, earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<(TimerId, TimerEvent)> {
        let mut due = Vec::new();
        while let Some(entry) = self.queue.first_entry() {
            let (at, id) = *entry.key();
            if at > now {
                break;
            }
            let event = entry.remove();
            self.deadlines.remove(&id);
            due.push((id, event));
        }
        due
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
