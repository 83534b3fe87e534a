//! Structured error types for fieldcast.
//!
//! All fallible public APIs return `Result<T, FieldcastError>`. The
//! variants follow the runtime's error taxonomy: configuration and
//! invariant errors are fatal and surface out of the core, while
//! round, transport and protocol errors are reported through the
//! net's error hook and never interrupt the scheduler.

use thiserror::Error;

use crate::device::DeviceId;
use crate::time::SimTime;
use crate::trace::TraceHash;

/// The top-level error type for the fieldcast runtime.
#[derive(Debug, Error)]
pub enum FieldcastError {
    // ── Configuration errors (fatal at startup) ───────────

    /// Unknown tag, incompatible composition, or malformed input.
    #[error("configuration error: {0}")]
    Config(String),

    /// An I/O failure on a log or graph file.
    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    // ── Round errors (abort one round, node rescheduled) ──

    /// User code failed mid-round; the previous export is retained.
    #[error("round failed on device {device} at {time}: {reason}")]
    Round {
        device: DeviceId,
        time: SimTime,
        reason: String,
    },

    /// A projected payload failed to decode as the expected type.
    #[error("payload type mismatch at trace {trace}: expected tag {expected:#04x}, found {found:#04x}")]
    TypeMismatch {
        trace: TraceHash,
        expected: u8,
        found: u8,
    },

    // ── Transport errors (counted, retried) ───────────────

    /// A send attempt failed on the underlying radio.
    #[error("send attempt {attempt} failed for device {device}")]
    Transport { device: DeviceId, attempt: u32 },

    // ── Protocol errors (dropped, counted) ────────────────

    /// A malformed envelope was received.
    #[error("malformed envelope: {0}")]
    Protocol(String),

    // ── Invariant violations (abort the net) ──────────────

    /// A broken internal invariant, e.g. a duplicate live uid.
    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl FieldcastError {
    /// Process exit code for this error when it escapes the core.
    ///
    /// `0` is reserved for normal shutdown; configuration errors map
    /// to `1`, I/O errors on log or graph files to `2`, and anything
    /// else that manages to surface to `3`.
    pub fn exit_code(&self) -> i32 {
        match self {
            FieldcastError::Config(_) => 1,
            FieldcastError::Io { .. } => 2,
            _ => 3,
        }
    }

    /// Whether this error kind surfaces out of the core.
    ///
    /// Round, transport and protocol errors are absorbed by the
    /// scheduler and reported through the error hook instead.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FieldcastError::Config(_)
                | FieldcastError::Io { .. }
                | FieldcastError::Invariant(_)
        )
    }
}

/// Convenience alias for `Result<T, FieldcastError>`.
pub type FieldcastResult<T> = Result<T, FieldcastError>;
