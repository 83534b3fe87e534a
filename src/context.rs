//! A device's view of its neighbourhood.
//!
//! The context maps each neighbour uid to the reception time and
//! export of that neighbour's most recent message. Entries retire
//! when their reception time falls more than the retain window
//! behind the current round; that eviction is the system's sole
//! liveness mechanism for departed neighbours. Self is always
//! included, reading from the device's own previous export.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::device::DeviceId;
use crate::error::FieldcastResult;
use crate::export::{Export, FieldValue};
use crate::field::Field;
use crate::time::SimTime;

/// One neighbour's most recent contribution.
#[derive(Debug, Clone)]
pub struct NeighbourEntry {
    /// Reception time of the message.
    pub time: SimTime,
    /// The neighbour's export, shared with other receivers.
    pub export: Arc<Export>,
}

/// The per-device neighbourhood state.
#[derive(Debug, Clone)]
pub struct Context {
    self_id: DeviceId,
    own: Arc<Export>,
    neighbours: BTreeMap<DeviceId, NeighbourEntry>,
}

impl Context {
    /// An empty context for a device that has not yet run a round.
    pub fn new(self_id: DeviceId) -> Self {
        Context {
            self_id,
            own: Arc::new(Export::new()),
            neighbours: BTreeMap::new(),
        }
    }

    /// The uid this context belongs to.
    #[inline]
    pub fn self_id(&self) -> DeviceId {
        self.self_id
    }

    /// The device's own previous export.
    #[inline]
    pub fn own(&self) -> &Export {
        &self.own
    }

    /// Replace the device's own export after a completed round.
    pub fn set_own(&mut self, export: Arc<Export>) {
        self.own = export;
    }

    /// Record a neighbour's message.
    ///
    /// An older entry for the same uid is replaced; a message whose
    /// reception time already falls outside the retain window is
    /// discarded. A message from self is ignored (self reads its own
    /// export directly).
    pub fn insert(
        &mut self,
        uid: DeviceId,
        time: SimTime,
        export: Arc<Export>,
        now: SimTime,
        retain_window: f64,
    ) {
        if uid == self.self_id || time < now.minus(retain_window) {
            return;
        }
        let newer = match self.neighbours.get(&uid) {
            Some(existing) => existing.time <= time,
            None => true,
        };
        if newer {
            self.neighbours.insert(uid, NeighbourEntry { time, export });
        }
    }

    /// Evict entries whose reception time is stale at `now`.
    pub fn collect_old(&mut self, now: SimTime, retain_window: f64) {
        let horizon = now.minus(retain_window);
        self.neighbours.retain(|_, entry| entry.time >= horizon);
    }

    /// Number of live neighbour entries (self excluded).
    #[inline]
    pub fn neighbour_count(&self) -> usize {
        self.neighbours.len()
    }

    /// Whether `uid` currently has a live entry.
    pub fn contains(&self, uid: DeviceId) -> bool {
        self.neighbours.contains_key(&uid)
    }

    /// Iterate `(uid, entry)` in ascending uid order.
    pub fn entries(&self) -> impl Iterator<Item = (DeviceId, &NeighbourEntry)> {
        self.neighbours.iter().map(|(uid, e)| (*uid, e))
    }

    /// Build the field at a trace.
    ///
    /// The default is the caller-resolved local value (the device's
    /// previous export value at the trace, or the call point's init);
    /// the overrides are the values present in each neighbour's
    /// export at the same trace. Neighbours whose export has no entry
    /// at the trace did not reach that call point and contribute
    /// nothing. Payloads decode here, once per call point per round;
    /// a decode failure aborts the round.
    pub fn project<T: FieldValue>(
        &self,
        trace: crate::trace::TraceHash,
        default: T,
    ) -> FieldcastResult<Field<T>> {
        let mut entries = Vec::new();
        for (uid, entry) in &self.neighbours {
            if let Some(payload) = entry.export.get(trace) {
                entries.push((*uid, payload.unpack::<T>(trace)?));
            }
        }
        Ok(Field::from_entries(self.self_id, default, entries))
    }
}
