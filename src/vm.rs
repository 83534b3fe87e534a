//! The round engine.
//!
//! One round is one pass of the user's aggregate program on one
//! device. The engine owns the round-local machinery: the trace
//! stack, the outbound export under construction, a read view of the
//! context, and a per-round seeded RNG. The exchange vocabulary is
//! `old` / `nbr` / `share` plus `branch` for alignment-preserving
//! conditionals; everything else a coordination library does is
//! composed from these.
//!
//! A round runs to completion without yielding, and a round must not
//! trigger another round on the same thread; a thread-local marker
//! enforces that.

use std::cell::Cell;
use std::marker::PhantomData;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::context::Context;
use crate::device::DeviceId;
use crate::error::{FieldcastError, FieldcastResult};
use crate::export::{Export, FieldValue};
use crate::field::Field;
use crate::time::SimTime;
use crate::trace::TraceStack;

// ── Program trait ─────────────────────────────────────────────────────

/// A field-calculus aggregate program.
///
/// The same program is evaluated on every device; per-device state
/// lives in `Storage`, which the logger can snapshot between rounds.
pub trait Program: Sync {
    /// User-declared per-device variables.
    type Storage: Clone + Send;

    /// One round of the program on one device.
    fn round(
        &self,
        vm: &mut RoundVm<'_>,
        storage: &mut Self::Storage,
    ) -> FieldcastResult<()>;
}

/// A program backed by a closure, for tests and small deployments.
pub struct FnProgram<S, F> {
    f: F,
    _storage: PhantomData<fn(S)>,
}

/// Wrap a closure as a [`Program`].
pub fn program_fn<S, F>(f: F) -> FnProgram<S, F>
where
    S: Clone + Send,
    F: Fn(&mut RoundVm<'_>, &mut S) -> FieldcastResult<()> + Sync,
{
    FnProgram {
        f,
        _storage: PhantomData,
    }
}

impl<S, F> Program for FnProgram<S, F>
where
    S: Clone + Send,
    F: Fn(&mut RoundVm<'_>, &mut S) -> FieldcastResult<()> + Sync,
{
    type Storage = S;

    fn round(&self, vm: &mut RoundVm<'_>, storage: &mut S) -> FieldcastResult<()> {
        (self.f)(vm, storage)
    }
}

// ── Round re-entrancy guard ──────────────────────────────────────────

thread_local! {
    static IN_ROUND: Cell<bool> = const { Cell::new(false) };
}

struct RoundGuard;

impl RoundGuard {
    fn enter(uid: DeviceId) -> FieldcastResult<RoundGuard> {
        IN_ROUND.with(|flag| {
            if flag.get() {
                Err(FieldcastError::Invariant(format!(
                    "round for {uid} started while another round is running on this thread"
                )))
            } else {
                flag.set(true);
                Ok(RoundGuard)
            }
        })
    }
}

impl Drop for RoundGuard {
    fn drop(&mut self) {
        IN_ROUND.with(|flag| flag.set(false));
    }
}

// ── RoundVm ───────────────────────────────────────────────────────────

/// The mutable state of one round in progress.
pub struct RoundVm<'a> {
    uid: DeviceId,
    now: SimTime,
    context: &'a Context,
    export: Export,
    stack: TraceStack,
    rng: ChaCha8Rng,
}

impl<'a> RoundVm<'a> {
    /// This device's uid.
    #[inline]
    pub fn uid(&self) -> DeviceId {
        self.uid
    }

    /// The scheduled time of this round.
    #[inline]
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Number of neighbours currently in the context.
    pub fn neighbour_count(&self) -> usize {
        self.context.neighbour_count()
    }

    /// The per-round RNG; deterministic given the net seed, the uid
    /// and the round time, independent of the execution strategy.
    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    // ── Exchange primitives ───────────────────────────────

    /// Read this device's own value at the call point from its
    /// previous export (else `init`), apply `update`, write the
    /// result back, return it. Neighbours are not consulted.
    pub fn old<T, U>(&mut self, tag: u32, init: T, update: U) -> FieldcastResult<T>
    where
        T: FieldValue,
        U: FnOnce(T) -> T,
    {
        self.stack.push(tag);
        let out = (|| {
            let tau = self.stack.current();
            let prev = self.context.own().value_at::<T>(tau)?.unwrap_or(init);
            let value = update(prev);
            self.export.insert(tau, &value);
            Ok(value)
        })();
        self.stack.pop();
        out
    }

    /// Project the context to a field at the call point and pass it
    /// to `combine`; the combine result is written into the export
    /// as the new local value (not the field) and returned.
    ///
    /// The field's default is this device's previous value at the
    /// call point, or `init` if it never exported there.
    pub fn nbr<T, C>(&mut self, tag: u32, init: T, combine: C) -> FieldcastResult<T>
    where
        T: FieldValue,
        C: FnOnce(&mut Self, &Field<T>) -> FieldcastResult<T>,
    {
        self.stack.push(tag);
        let out = self.exchange(init, combine);
        self.stack.pop();
        out
    }

    /// The non-lambda spelling of `nbr`: write `local` at the call
    /// point and return the projected field itself.
    pub fn nbr_field<T: FieldValue>(&mut self, tag: u32, local: T) -> FieldcastResult<Field<T>> {
        self.stack.push(tag);
        let out = (|| {
            let tau = self.stack.current();
            let default = self
                .context
                .own()
                .value_at::<T>(tau)?
                .unwrap_or_else(|| local.clone());
            let field = self.context.project(tau, default)?;
            self.export.insert(tau, &local);
            Ok(field)
        })();
        self.stack.pop();
        out
    }

    /// The fused `old`+`nbr`: the projected field's self value is
    /// the device's previous result at this call point (else `init`),
    /// and the combine result is both the return value and the value
    /// neighbours will read here next round.
    pub fn share<T, C>(&mut self, tag: u32, init: T, combine: C) -> FieldcastResult<T>
    where
        T: FieldValue,
        C: FnOnce(&mut Self, &Field<T>) -> FieldcastResult<T>,
    {
        self.stack.push(tag);
        let out = self.exchange(init, combine);
        self.stack.pop();
        out
    }

    fn exchange<T, C>(&mut self, init: T, combine: C) -> FieldcastResult<T>
    where
        T: FieldValue,
        C: FnOnce(&mut Self, &Field<T>) -> FieldcastResult<T>,
    {
        let tau = self.stack.current();
        let default = self.context.own().value_at::<T>(tau)?.unwrap_or(init);
        let field = self.context.project(tau, default)?;
        let value = combine(self, &field)?;
        self.export.insert(tau, &value);
        Ok(value)
    }

    /// Scoped alignment without a value exchange: runs `f` inside a
    /// frame for `tag`, so call points inside compose distinct traces
    /// per call site.
    pub fn aligned<R, F>(&mut self, tag: u32, f: F) -> FieldcastResult<R>
    where
        F: FnOnce(&mut Self) -> FieldcastResult<R>,
    {
        self.stack.push(tag);
        let out = f(self);
        self.stack.pop();
        out
    }

    /// Value-dependent branching with alignment.
    ///
    /// Devices taking different arms evaluate under different traces,
    /// so a device that does not enter an arm neither sees nor
    /// pollutes the arm's exchanges: neighbours projecting inside an
    /// arm observe only same-arm devices.
    pub fn branch<R, FT, FE>(
        &mut self,
        tag: u32,
        cond: bool,
        then_f: FT,
        else_f: FE,
    ) -> FieldcastResult<R>
    where
        FT: FnOnce(&mut Self) -> FieldcastResult<R>,
        FE: FnOnce(&mut Self) -> FieldcastResult<R>,
    {
        self.stack.push(tag);
        self.stack.push(cond as u32);
        let out = if cond { then_f(self) } else { else_f(self) };
        self.stack.pop();
        self.stack.pop();
        out
    }

    fn finish(mut self) -> Export {
        self.export.seal();
        self.export
    }
}

// ── Round execution ───────────────────────────────────────────────────

/// Derive the seed of one round's RNG substream.
///
/// Depends only on the net seed, the device uid and the round time,
/// so sequential and parallel executions draw identical streams.
pub fn round_seed(net_seed: u64, uid: DeviceId, now: SimTime) -> u64 {
    let mut h = net_seed ^ 0x517cc1b727220a95;
    h = h.wrapping_mul(0x5851f42d4c957f2d).wrapping_add(uid.raw() as u64);
    h ^= now.secs().to_bits();
    h ^ (h >> 31)
}

/// Evaluate one round of `program` for device `uid` at time `now`.
///
/// On success returns the sealed outbound export; on failure the
/// caller retains the previous export and reschedules the device.
pub fn run_round<P: Program>(
    program: &P,
    uid: DeviceId,
    now: SimTime,
    context: &Context,
    storage: &mut P::Storage,
    seed: u64,
) -> FieldcastResult<Export> {
    let _guard = RoundGuard::enter(uid)?;
    let mut vm = RoundVm {
        uid,
        now,
        context,
        export: Export::new(),
        stack: TraceStack::new(),
        rng: ChaCha8Rng::seed_from_u64(seed),
    };
    program.round(&mut vm, storage)?;
    Ok(vm.finish())
}
