//! Per-device state.
//!
//! A device owns its uid, its user storage, its context, its most
//! recent outbound export, an optional position and velocity, the
//! cursor of its round schedule, and a mailbox that any thread may
//! append envelopes to. The net's identifier layer owns the devices
//! themselves, keyed by uid; neighbour references are always uid
//! values resolved through that arena, never cross-device pointers.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::connector::Envelope;
use crate::context::Context;
use crate::export::Export;
use crate::time::SimTime;

// ── DeviceId ──────────────────────────────────────────────────────────

/// A unique identifier for a device. Stable for the device's whole
/// lifetime; `u32` to match the envelope wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceId(u32);

impl DeviceId {
    #[inline]
    pub fn new(id: u32) -> Self {
        DeviceId(id)
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "D{}", self.0)
    }
}

// ── Storage record ────────────────────────────────────────────────────

/// Storage whose fields the logger can aggregate.
///
/// `tags()` names the columns; `values()` yields one number per tag,
/// in the same order, snapshotted between rounds.
pub trait StorageRecord {
    fn tags() -> &'static [&'static str];
    fn values(&self) -> Vec<f64>;
}

impl StorageRecord for f64 {
    fn tags() -> &'static [&'static str] {
        &["value"]
    }

    fn values(&self) -> Vec<f64> {
        vec![*self]
    }
}

// ── Status ────────────────────────────────────────────────────────────

/// Device lifecycle: `Created` until the first round, `Live` while
/// rounds run, `Retired` after erasure or net shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Created,
    Live,
    Retired,
}

// ── Mailbox ───────────────────────────────────────────────────────────

/// A multi-writer, single-reader queue of incoming envelopes.
///
/// Writers are connector broadcasts (possibly from parallel worker
/// threads); the single reader is the device's own round. The lock
/// is held only for the append or the drain.
#[derive(Debug, Default)]
pub struct Mailbox {
    queue: Mutex<Vec<Envelope>>,
}

impl Mailbox {
    pub fn new() -> Self {
        Mailbox::default()
    }

    /// Append an envelope. Callable from any thread.
    pub fn push(&self, envelope: Envelope) {
        self.queue.lock().push(envelope);
    }

    /// Remove and return the envelopes that arrived strictly before
    /// `now`; later ones stay queued for a future round.
    pub fn drain_before(&self, now: SimTime) -> Vec<Envelope> {
        let mut queue = self.queue.lock();
        let mut due = Vec::new();
        let mut rest = Vec::new();
        for envelope in queue.drain(..) {
            if envelope.arrival < now {
                due.push(envelope);
            } else {
                rest.push(envelope);
            }
        }
        *queue = rest;
        due
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

// ── Round schedule ────────────────────────────────────────────────────

/// A periodic sequence of round times: first event at `start`, then
/// one every `period`, stopping after `end` if set.
#[derive(Debug, Clone)]
pub struct RoundSchedule {
    next: SimTime,
    period: f64,
    end: SimTime,
}

impl RoundSchedule {
    pub fn periodic(start: SimTime, period: f64) -> Self {
        RoundSchedule {
            next: start,
            period,
            end: SimTime::NEVER,
        }
    }

    pub fn until(mut self, end: SimTime) -> Self {
        self.end = end;
        self
    }

    /// Next scheduled time, `SimTime::NEVER` when exhausted.
    pub fn next(&self) -> SimTime {
        if self.next <= self.end {
            self.next
        } else {
            SimTime::NEVER
        }
    }

    /// Step past the current event.
    pub fn step(&mut self) {
        self.next = self.next.plus(self.period);
    }
}

// ── Device ────────────────────────────────────────────────────────────

/// One participant in the net.
pub struct Device<S> {
    uid: DeviceId,
    status: DeviceStatus,
    storage: S,
    context: Context,
    export: Arc<Export>,
    mailbox: Arc<Mailbox>,
    position: Option<[f64; 2]>,
    velocity: [f64; 2],
    schedule: RoundSchedule,
    last_round: SimTime,
    rounds: u64,
    failed_rounds: u64,
}

impl<S> Device<S> {
    /// Create a device in the `Created` state.
    pub fn new(uid: DeviceId, storage: S, schedule: RoundSchedule) -> Self {
        Device {
            uid,
            status: DeviceStatus::Created,
            storage,
            context: Context::new(uid),
            export: Arc::new(Export::new()),
            mailbox: Arc::new(Mailbox::new()),
            position: None,
            velocity: [0.0, 0.0],
            schedule,
            last_round: SimTime::ZERO,
            rounds: 0,
            failed_rounds: 0,
        }
    }

    #[inline]
    pub fn uid(&self) -> DeviceId {
        self.uid
    }

    #[inline]
    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    /// Earliest future event for this device.
    pub fn next(&self) -> SimTime {
        if self.status == DeviceStatus::Retired {
            SimTime::NEVER
        } else {
            self.schedule.next()
        }
    }

    /// The mailbox handle used by connectors to deliver envelopes.
    pub fn mailbox(&self) -> Arc<Mailbox> {
        Arc::clone(&self.mailbox)
    }

    /// Called by the connector when a neighbour message arrives
    /// outside the simulated broadcast path (real mode).
    pub fn receive(&self, envelope: Envelope) {
        self.mailbox.push(envelope);
    }

    #[inline]
    pub fn storage(&self) -> &S {
        &self.storage
    }

    #[inline]
    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    #[inline]
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Split borrow for the round engine: the context read view and
    /// the storage write view.
    pub fn round_parts(&mut self) -> (&Context, &mut S) {
        (&self.context, &mut self.storage)
    }

    /// The most recent sealed outbound export.
    pub fn export(&self) -> &Arc<Export> {
        &self.export
    }

    #[inline]
    pub fn position(&self) -> Option<[f64; 2]> {
        self.position
    }

    pub fn set_position(&mut self, position: [f64; 2]) {
        self.position = Some(position);
    }

    pub fn set_velocity(&mut self, velocity: [f64; 2]) {
        self.velocity = velocity;
    }

    #[inline]
    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    #[inline]
    pub fn failed_rounds(&self) -> u64 {
        self.failed_rounds
    }

    /// Flush the mailbox into the context and evict stale entries.
    /// Only envelopes that arrived strictly before `now` are visible
    /// to the round starting at `now`.
    pub fn round_start(&mut self, now: SimTime, retain_window: f64) {
        for envelope in self.mailbox.drain_before(now) {
            self.context.insert(
                envelope.sender,
                envelope.arrival,
                envelope.export,
                now,
                retain_window,
            );
        }
        self.context.collect_old(now, retain_window);
        if let Some(p) = self.position.as_mut() {
            let dt = now.since(self.last_round).max(0.0);
            p[0] += self.velocity[0] * dt;
            p[1] += self.velocity[1] * dt;
        }
        self.last_round = now;
    }

    /// Install the round's sealed export and advance the schedule.
    pub fn round_end(&mut self, export: Export) -> Arc<Export> {
        debug_assert!(export.is_sealed());
        let shared = Arc::new(export);
        self.export = Arc::clone(&shared);
        self.context.set_own(Arc::clone(&shared));
        self.status = DeviceStatus::Live;
        self.rounds += 1;
        self.schedule.step();
        shared
    }

    /// Advance past a failed round: the previous export is retained.
    pub fn round_failed(&mut self) {
        self.status = DeviceStatus::Live;
        self.failed_rounds += 1;
        self.schedule.step();
    }

    /// Mark the device retired; it will not be scheduled again.
    pub fn retire(&mut self) {
        self.status = DeviceStatus::Retired;
    }
}
