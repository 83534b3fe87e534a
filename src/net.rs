//! The network-wide coordinator.
//!
//! The net owns the device population (behind per-device locks so
//! concurrent rounds can proceed), the global event queue, the
//! random generator, and the connectivity model. It dispatches
//! wake-ups in deterministic order, executes rounds sequentially or
//! as parallel front-groups, routes broadcasts into mailboxes, and
//! feeds storage snapshots to the logger.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::warn;

use crate::connector::{
    decode_envelope, encode_envelope, Connectivity, DeviceSnapshot, Envelope,
};
use crate::device::{Device, DeviceId, DeviceStatus, Mailbox, RoundSchedule, StorageRecord};
use crate::error::{FieldcastError, FieldcastResult};
use crate::logger::{Aggregator, LogSink, Logger};
use crate::scheduler::{EventKind, EventQueue, NetEvent};
use crate::spawner::NodeRow;
use crate::time::{Pacing, SimTime};
use crate::vm::{round_seed, run_round, Program};

/// Callback receiving every non-fatal error the net absorbs.
pub type ErrorHook = Box<dyn Fn(&FieldcastError) + Send + Sync>;

/// Tallies of absorbed (non-fatal) errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorCounters {
    pub round: u64,
    pub transport: u64,
    pub protocol: u64,
}

// ── Builder ───────────────────────────────────────────────────────────

/// Builds one concrete net, validating the composition before any
/// device runs: a missing retain window, a non-positive round
/// period, or a zero-sized worker pool are configuration errors.
pub struct NetBuilder<P, C> {
    program: P,
    connectivity: C,
    name: String,
    seed: u64,
    threads: usize,
    epsilon: f64,
    retain_window: Option<f64>,
    round_start: f64,
    round_period: f64,
    pacing: Option<f64>,
    log: Option<(LogSink, Vec<Aggregator>, f64)>,
}

impl<P, C> NetBuilder<P, C>
where
    P: Program,
    P::Storage: StorageRecord,
    C: Connectivity,
{
    /// Name used in the log preamble and generated file names.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Seed for the net's random generator and all round substreams.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Worker pool size; `1` selects the sequential executor.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Front-group tolerance: events within `epsilon` of the minimum
    /// pending time may execute in the same parallel batch.
    pub fn epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    /// Maximum age of a context entry before eviction. Required.
    pub fn retain_window(mut self, window: f64) -> Self {
        self.retain_window = Some(window);
        self
    }

    /// Default round schedule for emplaced devices.
    pub fn round(mut self, start: f64, period: f64) -> Self {
        self.round_start = start;
        self.round_period = period;
        self
    }

    /// Map wall-clock time onto simulated time with this factor.
    pub fn pacing(mut self, factor: f64) -> Self {
        self.pacing = Some(factor);
        self
    }

    /// Attach a logger: sink, aggregators, and write period.
    pub fn logger(mut self, sink: LogSink, aggregators: Vec<Aggregator>, period: f64) -> Self {
        self.log = Some((sink, aggregators, period));
        self
    }

    /// Validate the composition and construct the net.
    pub fn build(self) -> FieldcastResult<Net<P, C>> {
        let retain_window = self.retain_window.ok_or_else(|| {
            FieldcastError::Config("retain_window is required and has no default".into())
        })?;
        if retain_window <= 0.0 {
            return Err(FieldcastError::Config(format!(
                "retain_window must be positive, got {retain_window}"
            )));
        }
        if self.round_period <= 0.0 {
            return Err(FieldcastError::Config(format!(
                "round period must be positive, got {}",
                self.round_period
            )));
        }
        if self.threads == 0 {
            return Err(FieldcastError::Config(
                "the executor needs at least one worker".into(),
            ));
        }
        if self.epsilon < 0.0 {
            return Err(FieldcastError::Config(format!(
                "front-group epsilon must be non-negative, got {}",
                self.epsilon
            )));
        }
        if let Some((_, aggregators, period)) = &self.log {
            if aggregators.is_empty() {
                return Err(FieldcastError::Config(
                    "logger configured without aggregators".into(),
                ));
            }
            if *period <= 0.0 {
                return Err(FieldcastError::Config(format!(
                    "log period must be positive, got {period}"
                )));
            }
        }

        let params = vec![
            ("seed".to_string(), self.seed.to_string()),
            ("retain".to_string(), retain_window.to_string()),
            ("period".to_string(), self.round_period.to_string()),
            ("threads".to_string(), self.threads.to_string()),
        ];
        let mut queue = EventQueue::new();
        let logger = match self.log {
            Some((sink, aggregators, period)) => {
                let logger =
                    Logger::open(sink, aggregators, SimTime::ZERO, period, &self.name, &params)?;
                queue.push(NetEvent::log(logger.next()));
                Some(logger)
            }
            None => None,
        };

        Ok(Net {
            program: self.program,
            connectivity: self.connectivity,
            name: self.name,
            devices: BTreeMap::new(),
            queue,
            rng: ChaCha8Rng::seed_from_u64(self.seed),
            seed: self.seed,
            now: SimTime::ZERO,
            retain_window,
            threads: self.threads,
            epsilon: self.epsilon,
            round_start: self.round_start,
            round_period: self.round_period,
            next_uid: 0,
            logger,
            hook: None,
            counters: ErrorCounters::default(),
            stop: Arc::new(AtomicBool::new(false)),
            pacing: self.pacing.map(Pacing::starting_now),
            events_processed: 0,
        })
    }
}

// ── Net ───────────────────────────────────────────────────────────────

/// One running network of devices.
pub struct Net<P: Program, C: Connectivity>
where
    P::Storage: StorageRecord,
{
    program: P,
    connectivity: C,
    name: String,
    devices: BTreeMap<DeviceId, Mutex<Device<P::Storage>>>,
    queue: EventQueue,
    rng: ChaCha8Rng,
    seed: u64,
    now: SimTime,
    retain_window: f64,
    threads: usize,
    epsilon: f64,
    round_start: f64,
    round_period: f64,
    next_uid: u32,
    logger: Option<Logger<P::Storage>>,
    hook: Option<ErrorHook>,
    counters: ErrorCounters,
    stop: Arc<AtomicBool>,
    pacing: Option<Pacing>,
    events_processed: u64,
}

impl<P: Program, C: Connectivity> std::fmt::Debug for Net<P, C>
where
    P::Storage: StorageRecord,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Net")
            .field("name", &self.name)
            .field("seed", &self.seed)
            .field("now", &self.now)
            .field("threads", &self.threads)
            .finish()
    }
}

/// What one device round produced, reported back to the scheduler.
struct RoundOutcome {
    uid: DeviceId,
    next: SimTime,
    error: Option<FieldcastError>,
}

impl<P, C> Net<P, C>
where
    P: Program,
    P::Storage: StorageRecord,
    C: Connectivity,
{
    /// Start building a net around a program and a connectivity
    /// model.
    pub fn builder(program: P, connectivity: C) -> NetBuilder<P, C> {
        NetBuilder {
            program,
            connectivity,
            name: "fieldcast".into(),
            seed: 0,
            threads: 1,
            epsilon: 0.0,
            retain_window: None,
            round_start: 0.0,
            round_period: 1.0,
            pacing: None,
            log: None,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current simulated time.
    #[inline]
    pub fn internal_time(&self) -> SimTime {
        self.now
    }

    /// Total events dispatched so far.
    #[inline]
    pub fn events_processed(&self) -> u64 {
        self.events_processed
    }

    /// The net's random generator.
    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    /// Counters of absorbed errors.
    #[inline]
    pub fn counters(&self) -> ErrorCounters {
        self.counters
    }

    /// Register a callback receiving every absorbed error.
    pub fn set_error_hook(&mut self, hook: ErrorHook) {
        self.hook = Some(hook);
    }

    /// A flag that, once set, makes the scheduler drain no further
    /// events; in-flight rounds complete.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    // ── Identifier: device population ─────────────────────

    /// Spawn a device with an auto-assigned uid and the net's
    /// default round schedule.
    pub fn node_emplace(&mut self, storage: P::Storage) -> DeviceId {
        let uid = DeviceId::new(self.next_uid);
        self.emplace_inner(uid, storage, None, SimTime::new(self.round_start))
            .expect("auto-assigned uid cannot collide")
    }

    /// Spawn a device at a chosen uid.
    pub fn node_emplace_at(
        &mut self,
        uid: DeviceId,
        storage: P::Storage,
    ) -> FieldcastResult<DeviceId> {
        self.emplace_inner(uid, storage, None, SimTime::new(self.round_start))
    }

    /// Spawn a positioned device, optionally overriding the first
    /// round time.
    pub fn node_emplace_spatial(
        &mut self,
        uid: DeviceId,
        storage: P::Storage,
        position: [f64; 2],
        start: Option<SimTime>,
    ) -> FieldcastResult<DeviceId> {
        self.emplace_inner(
            uid,
            storage,
            Some(position),
            start.unwrap_or(SimTime::new(self.round_start)),
        )
    }

    fn emplace_inner(
        &mut self,
        uid: DeviceId,
        storage: P::Storage,
        position: Option<[f64; 2]>,
        start: SimTime,
    ) -> FieldcastResult<DeviceId> {
        if self.devices.contains_key(&uid) {
            return Err(FieldcastError::Invariant(format!(
                "two live devices would share uid {uid}"
            )));
        }
        let schedule = RoundSchedule::periodic(start, self.round_period);
        let mut device = Device::new(uid, storage, schedule);
        if let Some(p) = position {
            device.set_position(p);
        }
        self.queue.push(NetEvent::round(device.next(), uid));
        self.devices.insert(uid, Mutex::new(device));
        self.next_uid = self.next_uid.max(uid.raw() + 1);
        Ok(uid)
    }

    /// Spawn one device per parsed graph row, in file order, with
    /// sequential uids; `init` turns a row into storage and an
    /// optional position.
    pub fn spawn_rows(
        &mut self,
        rows: &[NodeRow],
        init: impl Fn(&NodeRow) -> (P::Storage, Option<[f64; 2]>),
    ) -> FieldcastResult<Vec<DeviceId>> {
        let mut spawned = Vec::with_capacity(rows.len());
        for row in rows {
            let uid = DeviceId::new(self.next_uid);
            let (storage, position) = init(row);
            let start = row.start.unwrap_or(SimTime::new(self.round_start));
            self.emplace_inner(uid, storage, position, start)?;
            spawned.push(uid);
        }
        Ok(spawned)
    }

    /// Retire a device and remove it from the population.
    pub fn node_erase(&mut self, uid: DeviceId) -> FieldcastResult<()> {
        match self.devices.remove(&uid) {
            Some(cell) => {
                cell.lock().retire();
                Ok(())
            }
            None => Err(FieldcastError::Config(format!("no device with uid {uid}"))),
        }
    }

    /// Locked access to one device.
    pub fn node_at(&self, uid: DeviceId) -> Option<MutexGuard<'_, Device<P::Storage>>> {
        self.devices.get(&uid).map(|cell| cell.lock())
    }

    pub fn node_count(&self) -> usize {
        self.devices.len()
    }

    /// All uids in ascending order.
    pub fn node_uids(&self) -> Vec<DeviceId> {
        self.devices.keys().copied().collect()
    }

    // ── Run loop ──────────────────────────────────────────

    /// Drain events until the queue is empty or the stop flag is
    /// set. Returns the number of events dispatched.
    pub fn run(&mut self) -> FieldcastResult<u64> {
        self.run_until(SimTime::NEVER)
    }

    /// Drain events up to and including time `limit`.
    pub fn run_until(&mut self, limit: SimTime) -> FieldcastResult<u64> {
        let start = self.events_processed;
        while let Some(head) = self.queue.peek().copied() {
            if head.time > limit || self.stop.load(Ordering::Relaxed) {
                break;
            }
            let event = self.queue.pop().expect("peeked event vanished");
            debug_assert!(event.time >= self.now, "event time went backward");
            if let Some(pacing) = &self.pacing {
                pacing.sleep_until(event.time);
            }
            self.now = event.time;
            match event.kind {
                EventKind::Log => {
                    self.log_tick(event.time)?;
                    self.events_processed += 1;
                }
                EventKind::Round(_) => {
                    let group = if self.threads > 1 {
                        self.queue.pop_front_group(event, self.epsilon)
                    } else {
                        vec![event]
                    };
                    self.events_processed += group.len() as u64;
                    self.execute_group(&group)?;
                }
            }
        }
        if let Some(logger) = &mut self.logger {
            if self.queue.is_empty() {
                logger.finish()?;
            }
        }
        Ok(self.events_processed - start)
    }

    fn log_tick(&mut self, now: SimTime) -> FieldcastResult<()> {
        let Some(logger) = &mut self.logger else {
            return Ok(());
        };
        let rows: Vec<P::Storage> = self
            .devices
            .values()
            .map(|cell| cell.lock().storage().clone())
            .collect();
        logger.write_row(now, rows.iter())?;
        self.queue.push(NetEvent::log(logger.next()));
        Ok(())
    }

    /// Execute a front-group of rounds, sequentially or on the
    /// worker pool, then reinsert next wake-ups in uid order.
    fn execute_group(&mut self, group: &[NetEvent]) -> FieldcastResult<()> {
        // Connectivity and delivery view at batch start: events in a
        // group are simultaneous up to epsilon and must not rely on
        // observing each other.
        let snapshots: Vec<DeviceSnapshot> = self
            .devices
            .iter()
            .map(|(uid, cell)| DeviceSnapshot {
                uid: *uid,
                position: cell.lock().position(),
            })
            .collect();
        let mailboxes: BTreeMap<DeviceId, Arc<Mailbox>> = self
            .devices
            .iter()
            .map(|(uid, cell)| (*uid, cell.lock().mailbox()))
            .collect();

        let work: Vec<(DeviceId, SimTime, u64)> = group
            .iter()
            .filter_map(|event| match event.kind {
                EventKind::Round(uid) => {
                    Some((uid, event.time, round_seed(self.seed, uid, event.time)))
                }
                EventKind::Log => None,
            })
            .collect();

        let program = &self.program;
        let connectivity = &self.connectivity;
        let devices = &self.devices;
        let retain = self.retain_window;
        let run_one = |item: &(DeviceId, SimTime, u64)| {
            execute_one(
                program,
                devices,
                connectivity,
                &snapshots,
                &mailboxes,
                retain,
                *item,
            )
        };

        let run_one = &run_one;
        let outcomes: Vec<RoundOutcome> = if self.threads > 1 && work.len() > 1 {
            let chunk_size = work.len().div_ceil(self.threads);
            std::thread::scope(|scope| {
                let handles: Vec<_> = work
                    .chunks(chunk_size)
                    .map(|chunk| scope.spawn(move || chunk.iter().map(run_one).collect::<Vec<_>>()))
                    .collect();
                handles
                    .into_iter()
                    .flat_map(|h| h.join().expect("round worker panicked"))
                    .collect()
            })
        } else {
            work.iter().map(run_one).collect()
        };

        for outcome in outcomes {
            if let Some(error) = outcome.error {
                if error.is_fatal() {
                    return Err(error);
                }
                self.absorb(error);
            }
            self.queue.push(NetEvent::round(outcome.next, outcome.uid));
        }
        Ok(())
    }

    fn absorb(&mut self, error: FieldcastError) {
        match &error {
            FieldcastError::Round { .. } | FieldcastError::TypeMismatch { .. } => {
                self.counters.round += 1
            }
            FieldcastError::Transport { .. } => self.counters.transport += 1,
            FieldcastError::Protocol(_) => self.counters.protocol += 1,
            _ => {}
        }
        warn!(error = %error, "absorbed error");
        if let Some(hook) = &self.hook {
            hook(&error);
        }
    }
}

/// Run one round on one device and broadcast its export.
///
/// Free function so worker threads can call it while borrowing only
/// the shared arena, the connectivity model and the batch-start
/// snapshots.
fn execute_one<P, C>(
    program: &P,
    devices: &BTreeMap<DeviceId, Mutex<Device<P::Storage>>>,
    connectivity: &C,
    snapshots: &[DeviceSnapshot],
    mailboxes: &BTreeMap<DeviceId, Arc<Mailbox>>,
    retain_window: f64,
    (uid, now, seed): (DeviceId, SimTime, u64),
) -> RoundOutcome
where
    P: Program,
    C: Connectivity,
{
    let Some(cell) = devices.get(&uid) else {
        // Erased while queued; nothing to do.
        return RoundOutcome {
            uid,
            next: SimTime::NEVER,
            error: None,
        };
    };
    let mut device = cell.lock();
    if device.status() == DeviceStatus::Retired {
        return RoundOutcome {
            uid,
            next: SimTime::NEVER,
            error: None,
        };
    }

    device.round_start(now, retain_window);
    let result = {
        let (context, storage) = device.round_parts();
        run_round(program, uid, now, context, storage, seed)
    };

    match result {
        Ok(export) => {
            let shared = device.round_end(export);
            let next = device.next();
            let sender_snap = DeviceSnapshot {
                uid,
                position: device.position(),
            };
            drop(device);

            // The export crosses the wire format once per broadcast;
            // receivers share the parsed copy.
            let wire = encode_envelope(uid, now, &shared);
            match decode_envelope(&wire) {
                Ok((sender, send_time, parsed)) => {
                    let parsed = Arc::new(parsed);
                    for receiver in snapshots {
                        if receiver.uid == uid
                            || !connectivity.connected(&sender_snap, receiver)
                        {
                            continue;
                        }
                        if let Some(mailbox) = mailboxes.get(&receiver.uid) {
                            let delay = connectivity.delay(&sender_snap, receiver);
                            mailbox.push(Envelope {
                                sender,
                                send_time,
                                arrival: send_time.plus(delay),
                                export: Arc::clone(&parsed),
                            });
                        }
                    }
                    RoundOutcome {
                        uid,
                        next,
                        error: None,
                    }
                }
                Err(error) => RoundOutcome {
                    uid,
                    next,
                    error: Some(error),
                },
            }
        }
        Err(error) => {
            device.round_failed();
            let next = device.next();
            drop(device);
            if error.is_fatal() {
                RoundOutcome {
                    uid,
                    next,
                    error: Some(error),
                }
            } else {
                RoundOutcome {
                    uid,
                    next,
                    error: Some(FieldcastError::Round {
                        device: uid,
                        time: now,
                        reason: error.to_string(),
                    }),
                }
            }
        }
    }
}
