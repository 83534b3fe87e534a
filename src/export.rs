//! Outbound messages: a map from trace to type-erased payload.
//!
//! An export collects, during one round, exactly the values that any
//! neighbour might read from this device at each call point. Payloads
//! are stored as a one-byte type tag plus encoded bytes; the trace is
//! the static key, so the reader always knows which type to expect,
//! and a tag mismatch on decode is a protocol error.

use std::collections::BTreeMap;

use crate::device::DeviceId;
use crate::error::{FieldcastError, FieldcastResult};
use crate::time::SimTime;
use crate::trace::TraceHash;

// ── Value codec ───────────────────────────────────────────────────────

/// A value that can travel inside an export.
///
/// Encodings are little-endian and fixed per type; `TYPE_TAG` is the
/// one-byte discriminant carried next to the bytes.
pub trait FieldValue: Clone {
    /// One-byte discriminant for this type on the wire.
    const TYPE_TAG: u8;

    /// Append the encoded value to `out`.
    fn encode(&self, out: &mut Vec<u8>);

    /// Decode a value from exactly the bytes produced by `encode`.
    fn decode(bytes: &[u8]) -> FieldcastResult<Self>;
}

fn short(kind: &str, want: usize, got: usize) -> FieldcastError {
    FieldcastError::Protocol(format!("{kind}: expected {want} bytes, got {got}"))
}

macro_rules! numeric_field_value {
    ($ty:ty, $tag:expr, $len:expr) => {
        impl FieldValue for $ty {
            const TYPE_TAG: u8 = $tag;

            fn encode(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn decode(bytes: &[u8]) -> FieldcastResult<Self> {
                let arr: [u8; $len] = bytes
                    .try_into()
                    .map_err(|_| short(stringify!($ty), $len, bytes.len()))?;
                Ok(<$ty>::from_le_bytes(arr))
            }
        }
    };
}

numeric_field_value!(u32, 0x02, 4);
numeric_field_value!(u64, 0x03, 8);
numeric_field_value!(i64, 0x04, 8);
numeric_field_value!(f64, 0x05, 8);

impl FieldValue for bool {
    const TYPE_TAG: u8 = 0x01;

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(*self as u8);
    }

    fn decode(bytes: &[u8]) -> FieldcastResult<Self> {
        match bytes {
            [0] => Ok(false),
            [1] => Ok(true),
            [b] => Err(FieldcastError::Protocol(format!("bool: bad byte {b:#04x}"))),
            _ => Err(short("bool", 1, bytes.len())),
        }
    }
}

impl FieldValue for DeviceId {
    const TYPE_TAG: u8 = 0x06;

    fn encode(&self, out: &mut Vec<u8>) {
        self.raw().encode(out);
    }

    fn decode(bytes: &[u8]) -> FieldcastResult<Self> {
        u32::decode(bytes).map(DeviceId::new)
    }
}

impl FieldValue for SimTime {
    const TYPE_TAG: u8 = 0x07;

    fn encode(&self, out: &mut Vec<u8>) {
        self.secs().encode(out);
    }

    fn decode(bytes: &[u8]) -> FieldcastResult<Self> {
        f64::decode(bytes).map(SimTime::new)
    }
}

/// Pairs nest their elements with inner tags and length prefixes, so
/// `(f64, DeviceId)` and friends (argmin tuples) can cross the wire.
impl<A: FieldValue, B: FieldValue> FieldValue for (A, B) {
    const TYPE_TAG: u8 = 0x10;

    fn encode(&self, out: &mut Vec<u8>) {
        for (tag, body) in [
            (A::TYPE_TAG, {
                let mut b = Vec::new();
                self.0.encode(&mut b);
                b
            }),
            (B::TYPE_TAG, {
                let mut b = Vec::new();
                self.1.encode(&mut b);
                b
            }),
        ] {
            out.push(tag);
            out.extend_from_slice(&(body.len() as u32).to_le_bytes());
            out.extend_from_slice(&body);
        }
    }

    fn decode(bytes: &[u8]) -> FieldcastResult<Self> {
        let (a, rest) = decode_nested::<A>(bytes)?;
        let (b, rest) = decode_nested::<B>(rest)?;
        if !rest.is_empty() {
            return Err(FieldcastError::Protocol(format!(
                "pair: {} trailing bytes",
                rest.len()
            )));
        }
        Ok((a, b))
    }
}

fn decode_nested<T: FieldValue>(bytes: &[u8]) -> FieldcastResult<(T, &[u8])> {
    if bytes.len() < 5 {
        return Err(short("pair element header", 5, bytes.len()));
    }
    if bytes[0] != T::TYPE_TAG {
        return Err(FieldcastError::Protocol(format!(
            "pair element: expected tag {:#04x}, found {:#04x}",
            T::TYPE_TAG,
            bytes[0]
        )));
    }
    let len = u32::from_le_bytes(bytes[1..5].try_into().unwrap()) as usize;
    if bytes.len() < 5 + len {
        return Err(short("pair element body", 5 + len, bytes.len()));
    }
    Ok((T::decode(&bytes[5..5 + len])?, &bytes[5 + len..]))
}

// ── Payload ───────────────────────────────────────────────────────────

/// A type-erased export slot: a type tag plus encoded bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    tag: u8,
    bytes: Vec<u8>,
}

impl Payload {
    /// Erase a value into a payload.
    pub fn pack<T: FieldValue>(value: &T) -> Payload {
        let mut bytes = Vec::new();
        value.encode(&mut bytes);
        Payload {
            tag: T::TYPE_TAG,
            bytes,
        }
    }

    /// Recover a value, checking the type tag first.
    pub fn unpack<T: FieldValue>(&self, trace: TraceHash) -> FieldcastResult<T> {
        if self.tag != T::TYPE_TAG {
            return Err(FieldcastError::TypeMismatch {
                trace,
                expected: T::TYPE_TAG,
                found: self.tag,
            });
        }
        T::decode(&self.bytes)
    }

    #[inline]
    pub fn tag(&self) -> u8 {
        self.tag
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub(crate) fn from_parts(tag: u8, bytes: Vec<u8>) -> Payload {
        Payload { tag, bytes }
    }
}

// ── Export ────────────────────────────────────────────────────────────

/// The outbound message of one round, keyed by trace.
///
/// Append-only while the round runs; sealed at round end, after
/// which writes are an invariant violation. A re-write at the same
/// trace within a round replaces the slot (the call point is the
/// same, the newest value wins).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Export {
    slots: BTreeMap<TraceHash, Payload>,
    sealed: bool,
}

impl Export {
    /// A fresh, empty, unsealed export.
    pub fn new() -> Self {
        Export::default()
    }

    /// Write a value at a trace.
    pub fn insert<T: FieldValue>(&mut self, trace: TraceHash, value: &T) {
        assert!(!self.sealed, "write to a sealed export");
        self.slots.insert(trace, Payload::pack(value));
    }

    /// The payload at a trace, if any.
    pub fn get(&self, trace: TraceHash) -> Option<&Payload> {
        self.slots.get(&trace)
    }

    /// Decode the value at a trace, if present.
    pub fn value_at<T: FieldValue>(&self, trace: TraceHash) -> FieldcastResult<Option<T>> {
        match self.slots.get(&trace) {
            Some(p) => p.unpack::<T>(trace).map(Some),
            None => Ok(None),
        }
    }

    /// Mark the export immutable.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    #[inline]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Iterate `(trace, payload)` in ascending trace order.
    pub fn iter(&self) -> impl Iterator<Item = (TraceHash, &Payload)> {
        self.slots.iter().map(|(t, p)| (*t, p))
    }

    /// Traces present in this export.
    pub fn traces(&self) -> impl Iterator<Item = TraceHash> + '_ {
        self.slots.keys().copied()
    }

    // ── Wire body ─────────────────────────────────────────

    /// Append the export body to `out`: a sequence of
    /// `[trace: u64_le][type_tag: u8][value_len: u32_le][bytes]`.
    pub fn encode_body(&self, out: &mut Vec<u8>) {
        for (trace, payload) in &self.slots {
            out.extend_from_slice(&trace.raw().to_le_bytes());
            out.push(payload.tag);
            out.extend_from_slice(&(payload.bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(&payload.bytes);
        }
    }

    /// Parse an export body. The result is already sealed.
    pub fn decode_body(mut bytes: &[u8]) -> FieldcastResult<Export> {
        let mut slots = BTreeMap::new();
        while !bytes.is_empty() {
            if bytes.len() < 13 {
                return Err(short("export entry header", 13, bytes.len()));
            }
            let trace = TraceHash::new(u64::from_le_bytes(bytes[..8].try_into().unwrap()));
            let tag = bytes[8];
            let len = u32::from_le_bytes(bytes[9..13].try_into().unwrap()) as usize;
            if bytes.len() < 13 + len {
                return Err(short("export entry body", 13 + len, bytes.len()));
            }
            slots.insert(trace, Payload::from_parts(tag, bytes[13..13 + len].to_vec()));
            bytes = &bytes[13 + len..];
        }
        Ok(Export {
            slots,
            sealed: true,
        })
    }
}
