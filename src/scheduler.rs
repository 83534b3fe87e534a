//! The net's event queue.
//!
//! A single priority queue over device rounds and global event
//! sources (the log schedule). Uses a `BinaryHeap` with reversed
//! `Ord` to act as a min-heap keyed by `(time, kind, uid)`: earliest
//! time first, device rounds before global events at equal times,
//! and equal-time rounds in ascending uid order so that runs are
//! reproducible given the same seed and initial state.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::device::DeviceId;
use crate::time::SimTime;

/// What an event wakes up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A device's round.
    Round(DeviceId),
    /// A scheduled log write.
    Log,
}

impl EventKind {
    /// Tie-break ordinal at equal times: rounds run before log
    /// writes, mirroring the log schedule yielding to the net.
    fn ordinal(self) -> u8 {
        match self {
            EventKind::Round(_) => 0,
            EventKind::Log => 1,
        }
    }

    fn uid(self) -> u32 {
        match self {
            EventKind::Round(uid) => uid.raw(),
            EventKind::Log => 0,
        }
    }
}

/// A scheduled wake-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetEvent {
    pub time: SimTime,
    pub kind: EventKind,
}

impl NetEvent {
    pub fn round(time: SimTime, uid: DeviceId) -> Self {
        NetEvent {
            time,
            kind: EventKind::Round(uid),
        }
    }

    pub fn log(time: SimTime) -> Self {
        NetEvent {
            time,
            kind: EventKind::Log,
        }
    }

    fn key(&self) -> (SimTime, u8, u32) {
        (self.time, self.kind.ordinal(), self.kind.uid())
    }
}

/// Ordering: smallest `(time, ordinal, uid)` first.
///
/// Rust's `BinaryHeap` is a max-heap, so the natural ordering is
/// reversed here to turn it into a min-heap.
impl Ord for NetEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

impl PartialOrd for NetEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The net's priority queue.
#[derive(Debug, Default)]
pub struct EventQueue {
    heap: BinaryHeap<NetEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        EventQueue::default()
    }

    /// Schedule a wake-up. Events at `SimTime::NEVER` are dropped.
    pub fn push(&mut self, event: NetEvent) {
        if event.time < SimTime::NEVER {
            self.heap.push(event);
        }
    }

    /// Pop the earliest event.
    pub fn pop(&mut self) -> Option<NetEvent> {
        self.heap.pop()
    }

    /// Peek at the earliest event without removing it.
    pub fn peek(&self) -> Option<&NetEvent> {
        self.heap.peek()
    }

    /// Pop the front-group: starting from `first`, every queued
    /// *round* event with time at most `first.time + epsilon`.
    ///
    /// Log events never join a front-group; they run alone on the
    /// scheduler thread because they need a consistent global view.
    pub fn pop_front_group(&mut self, first: NetEvent, epsilon: f64) -> Vec<NetEvent> {
        let mut group = vec![first];
        let horizon = first.time.plus(epsilon);
        while let Some(next) = self.heap.peek() {
            if next.time > horizon || !matches!(next.kind, EventKind::Round(_)) {
                break;
            }
            group.push(self.heap.pop().unwrap());
        }
        group
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
