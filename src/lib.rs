//! # Fieldcast — a runtime for field-calculus programs
//!
//! Distributed aggregate computations: every device repeatedly
//! evaluates the same expression, exchanges state with neighbours,
//! and derives new local values from the collective field of data
//! across the network. The crate provides the execution core that
//! makes such programs run, deterministically, in simulation or on
//! real radios.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────┐
//! │            Net              │ ← device arena + event queue
//! │  ┌──────────────────────┐  │
//! │  │      Device           │  │ ← storage, context, mailbox
//! │  │  ┌────────────────┐  │  │
//! │  │  │    RoundVm      │  │  │ ← old / nbr / share / branch
//! │  │  │  ┌──────────┐  │  │  │
//! │  │  │  │ TraceStack│  │  │  │ ← call-point alignment
//! │  │  │  └──────────┘  │  │  │
//! │  │  │  ┌──────────┐  │  │  │
//! │  │  │  │  Context  │  │  │  │ ← neighbour exports
//! │  │  │  └──────────┘  │  │  │
//! │  │  └────────────────┘  │  │
//! │  └──────────────────────┘  │
//! │  ┌──────────────────────┐  │
//! │  │     Connectivity      │  │ ← who hears whom, with delay
//! │  └──────────────────────┘  │
//! └────────────────────────────┘
//! ```
//!
//! One round on device `d` at time `t`: the scheduler wakes `d`,
//! the mailbox flushes into the context, the round engine walks the
//! program reading projected fields and writing the outbound export,
//! the sealed export is serialised and broadcast to every connected
//! device's mailbox, and `d` is reinserted at its next round time.

pub mod connector;
pub mod context;
pub mod device;
pub mod error;
pub mod export;
pub mod field;
pub mod logger;
pub mod net;
pub mod scheduler;
pub mod spawner;
pub mod time;
pub mod trace;
pub mod transceiver;
pub mod vm;

// Re-exports for convenience.
pub use connector::{
    decode_envelope, encode_envelope, Connectivity, DeviceSnapshot, DiskConnect, Envelope,
    FullConnect, GraphConnect,
};
pub use context::Context;
pub use device::{Device, DeviceId, DeviceStatus, Mailbox, RoundSchedule, StorageRecord};
pub use error::{FieldcastError, FieldcastResult};
pub use export::{Export, FieldValue, Payload};
pub use field::Field;
pub use logger::{Aggregator, LogSink, Logger};
pub use net::{ErrorCounters, ErrorHook, Net, NetBuilder};
pub use scheduler::{EventKind, EventQueue, NetEvent};
pub use spawner::{read_arcs, read_arcs_path, GraphSpawner, NodeRow};
pub use time::{Pacing, SimTime};
pub use trace::{TraceHash, TraceStack};
pub use transceiver::{Radio, RadioLink, RawMessage};
pub use vm::{program_fn, run_round, Program, RoundVm};
