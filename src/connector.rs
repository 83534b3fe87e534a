//! Neighbour discovery and message transport for simulated nets.
//!
//! A connectivity model decides which pairs of devices can hear each
//! other and how long propagation takes. On round end the device's
//! sealed export is wrapped in an envelope, serialised, and offered
//! to every connected device's mailbox; the receiver back-computes
//! the reception time from the send time plus the model's delay.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::device::DeviceId;
use crate::error::{FieldcastError, FieldcastResult};
use crate::export::Export;
use crate::time::SimTime;

// ── Snapshots ─────────────────────────────────────────────────────────

/// The slice of device state a connectivity model may consult.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceSnapshot {
    pub uid: DeviceId,
    pub position: Option<[f64; 2]>,
}

fn euclidean(a: [f64; 2], b: [f64; 2]) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    (dx * dx + dy * dy).sqrt()
}

// ── Connectivity models ──────────────────────────────────────────────

/// Decides connection and propagation delay between device pairs.
pub trait Connectivity: Send + Sync {
    /// Whether a message from `sender` reaches `receiver`.
    fn connected(&self, sender: &DeviceSnapshot, receiver: &DeviceSnapshot) -> bool;

    /// Propagation delay in seconds. Zero by default.
    fn delay(&self, _sender: &DeviceSnapshot, _receiver: &DeviceSnapshot) -> f64 {
        0.0
    }
}

/// Every device hears every other device.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullConnect;

impl Connectivity for FullConnect {
    fn connected(&self, sender: &DeviceSnapshot, receiver: &DeviceSnapshot) -> bool {
        sender.uid != receiver.uid
    }
}

/// Devices hear each other within a Euclidean radius.
///
/// Devices without a position are unreachable. An optional
/// per-distance delay models propagation.
#[derive(Debug, Clone, Copy)]
pub struct DiskConnect {
    pub radius: f64,
    pub delay_per_unit: f64,
}

impl DiskConnect {
    pub fn new(radius: f64) -> Self {
        DiskConnect {
            radius,
            delay_per_unit: 0.0,
        }
    }

    pub fn with_delay(mut self, delay_per_unit: f64) -> Self {
        self.delay_per_unit = delay_per_unit;
        self
    }
}

impl Connectivity for DiskConnect {
    fn connected(&self, sender: &DeviceSnapshot, receiver: &DeviceSnapshot) -> bool {
        if sender.uid == receiver.uid {
            return false;
        }
        match (sender.position, receiver.position) {
            (Some(a), Some(b)) => euclidean(a, b) <= self.radius,
            _ => false,
        }
    }

    fn delay(&self, sender: &DeviceSnapshot, receiver: &DeviceSnapshot) -> f64 {
        match (sender.position, receiver.position) {
            (Some(a), Some(b)) => euclidean(a, b) * self.delay_per_unit,
            _ => 0.0,
        }
    }
}

/// Explicit directed arcs, typically loaded from a graph file.
/// Call `connect` twice for an undirected link.
#[derive(Debug, Clone, Default)]
pub struct GraphConnect {
    arcs: BTreeSet<(DeviceId, DeviceId)>,
}

impl GraphConnect {
    pub fn new() -> Self {
        GraphConnect::default()
    }

    pub fn from_arcs(arcs: impl IntoIterator<Item = (DeviceId, DeviceId)>) -> Self {
        GraphConnect {
            arcs: arcs.into_iter().collect(),
        }
    }

    /// Add a directed arc from `from` to `to`.
    pub fn connect(&mut self, from: DeviceId, to: DeviceId) {
        self.arcs.insert((from, to));
    }

    /// Remove a directed arc.
    pub fn disconnect(&mut self, from: DeviceId, to: DeviceId) {
        self.arcs.remove(&(from, to));
    }

    pub fn arc_count(&self) -> usize {
        self.arcs.len()
    }
}

impl Connectivity for GraphConnect {
    fn connected(&self, sender: &DeviceSnapshot, receiver: &DeviceSnapshot) -> bool {
        self.arcs.contains(&(sender.uid, receiver.uid))
    }
}

// ── Envelope ──────────────────────────────────────────────────────────

/// A broadcast export in flight towards one receiver.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub sender: DeviceId,
    pub send_time: SimTime,
    /// Reception time: send time plus the metric's propagation delay.
    pub arrival: SimTime,
    pub export: Arc<Export>,
}

// ── Wire format ───────────────────────────────────────────────────────
//
// [sender_uid: u32_le][send_time: f64_le][len: u32_le][payload]
// where payload is the export body (entries of
// [trace: u64_le][type_tag: u8][value_len: u32_le][value bytes]).

/// Serialise an envelope for broadcast.
pub fn encode_envelope(sender: DeviceId, send_time: SimTime, export: &Export) -> Vec<u8> {
    let mut body = Vec::new();
    export.encode_body(&mut body);

    let mut wire = Vec::with_capacity(16 + body.len());
    wire.extend_from_slice(&sender.raw().to_le_bytes());
    wire.extend_from_slice(&send_time.secs().to_le_bytes());
    wire.extend_from_slice(&(body.len() as u32).to_le_bytes());
    wire.extend_from_slice(&body);
    wire
}

/// Parse an envelope received off the wire.
pub fn decode_envelope(wire: &[u8]) -> FieldcastResult<(DeviceId, SimTime, Export)> {
    if wire.len() < 16 {
        return Err(FieldcastError::Protocol(format!(
            "envelope header: expected 16 bytes, got {}",
            wire.len()
        )));
    }
    let sender = DeviceId::new(u32::from_le_bytes(wire[0..4].try_into().unwrap()));
    let send_secs = f64::from_le_bytes(wire[4..12].try_into().unwrap());
    if send_secs.is_nan() {
        return Err(FieldcastError::Protocol("envelope send_time is NaN".into()));
    }
    let len = u32::from_le_bytes(wire[12..16].try_into().unwrap()) as usize;
    if wire.len() != 16 + len {
        return Err(FieldcastError::Protocol(format!(
            "envelope length field says {len}, body has {}",
            wire.len() - 16
        )));
    }
    let export = Export::decode_body(&wire[16..])?;
    Ok((sender, SimTime::new(send_secs), export))
}

/// Append the real-mode trailing byte: the send-to-now delay in
/// hundred-twenty-eighths of a second, clamped to 255.
///
/// The clamp loses precision above roughly two seconds; the original
/// deployment format accepts that, and so does this one.
pub fn encode_radio_delay(wire: &mut Vec<u8>, send_time: SimTime, now: SimTime) {
    let delay = (now.since(send_time) * 128.0).clamp(0.0, 255.0);
    wire.push(delay as u8);
}

/// Strip the trailing delay byte and back-date reception.
pub fn decode_radio_delay(wire: &mut Vec<u8>, now: SimTime) -> FieldcastResult<SimTime> {
    let byte = wire
        .pop()
        .ok_or_else(|| FieldcastError::Protocol("radio frame is empty".into()))?;
    Ok(now.minus(byte as f64 / 128.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::TraceHash;

    fn uid(n: u32) -> DeviceId {
        DeviceId::new(n)
    }

    fn snap(n: u32, pos: Option<[f64; 2]>) -> DeviceSnapshot {
        DeviceSnapshot {
            uid: uid(n),
            position: pos,
        }
    }

    #[test]
    fn test_full_connect_excludes_self() {
        let c = FullConnect;
        assert!(c.connected(&snap(0, None), &snap(1, None)));
        assert!(!c.connected(&snap(0, None), &snap(0, None)));
    }

    #[test]
    fn test_disk_connect_radius() {
        let c = DiskConnect::new(5.0);
        let a = snap(0, Some([0.0, 0.0]));
        let b = snap(1, Some([3.0, 4.0])); // distance 5
        let far = snap(2, Some([6.0, 0.0]));
        assert!(c.connected(&a, &b));
        assert!(!c.connected(&a, &far));
        assert!(!c.connected(&a, &snap(3, None)));
    }

    #[test]
    fn test_disk_delay_scales_with_distance() {
        let c = DiskConnect::new(10.0).with_delay(0.1);
        let a = snap(0, Some([0.0, 0.0]));
        let b = snap(1, Some([3.0, 4.0]));
        assert!((c.delay(&a, &b) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_graph_connect_is_directed() {
        let mut c = GraphConnect::new();
        c.connect(uid(0), uid(1));
        assert!(c.connected(&snap(0, None), &snap(1, None)));
        assert!(!c.connected(&snap(1, None), &snap(0, None)));

        c.disconnect(uid(0), uid(1));
        assert!(!c.connected(&snap(0, None), &snap(1, None)));
    }

    #[test]
    fn test_envelope_round_trip() {
        let mut e = Export::new();
        e.insert(TraceHash::new(0xFEED), &1.25f64);
        e.insert(TraceHash::new(0xF00D), &uid(4));
        e.seal();

        let wire = encode_envelope(uid(7), SimTime::new(3.5), &e);
        let (sender, send_time, back) = decode_envelope(&wire).unwrap();
        assert_eq!(sender, uid(7));
        assert_eq!(send_time, SimTime::new(3.5));
        assert_eq!(
            back.value_at::<f64>(TraceHash::new(0xFEED)).unwrap(),
            Some(1.25)
        );

        // Bitwise-stable re-encoding.
        assert_eq!(encode_envelope(sender, send_time, &back), wire);
    }

    #[test]
    fn test_envelope_malformed_is_protocol_error() {
        assert!(matches!(
            decode_envelope(&[1, 2, 3]),
            Err(FieldcastError::Protocol(_))
        ));

        let mut e = Export::new();
        e.insert(TraceHash::new(1), &1.0f64);
        e.seal();
        let mut wire = encode_envelope(uid(0), SimTime::ZERO, &e);
        wire.push(0xFF); // length field no longer matches
        assert!(matches!(
            decode_envelope(&wire),
            Err(FieldcastError::Protocol(_))
        ));
    }

    #[test]
    fn test_radio_delay_round_trip() {
        let mut wire = vec![1, 2, 3];
        let sent = SimTime::new(10.0);
        let now = SimTime::new(10.5);
        encode_radio_delay(&mut wire, sent, now);
        assert_eq!(wire.len(), 4);

        let received = decode_radio_delay(&mut wire, now).unwrap();
        assert_eq!(wire, vec![1, 2, 3]);
        assert!((received.secs() - 10.0).abs() <= 1.0 / 128.0);
    }

    #[test]
    fn test_radio_delay_clamps_at_255() {
        let mut wire = Vec::new();
        encode_radio_delay(&mut wire, SimTime::ZERO, SimTime::new(100.0));
        assert_eq!(wire, vec![255]);
    }
}
