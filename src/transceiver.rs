//! Real-mode networking: a background worker driving the radio.
//!
//! Each deployed device owns a [`RadioLink`]: a worker thread that
//! retries the pending outbound frame until the radio accepts it and
//! drains incoming frames into a swap-out buffer. Every frame
//! carries a one-byte relative timestamp (hundred-twenty-eighths of
//! a second) appended at actual send time, letting the receiver
//! back-date reception. The worker exits on a stop flag checked each
//! iteration and is joined on drop.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::debug;

use crate::connector::{decode_radio_delay, encode_radio_delay};
use crate::device::DeviceId;
use crate::time::SimTime;

/// A raw frame received off the radio.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    /// Back-dated reception time.
    pub time: SimTime,
    /// Uid of the sender.
    pub device: DeviceId,
    /// Signal power estimate (RSSI), if the radio reports one.
    pub power: f64,
    /// The frame content (the trailing delay byte already stripped).
    pub content: Vec<u8>,
}

/// Low-level hardware network interface.
///
/// `send` broadcasts a frame, reporting success; `receive` listens
/// for one frame and is expected to block with a backoff that grows
/// with the number of consecutive failed sends.
pub trait Radio: Send + 'static {
    fn send(&mut self, uid: DeviceId, frame: &[u8], attempt: u32) -> bool;
    fn receive(&mut self, failed_attempts: u32) -> Option<RawMessage>;
}

struct Pending {
    frame: Vec<u8>,
    send_time: SimTime,
}

#[derive(Default)]
struct LinkShared {
    outbox: Mutex<Option<Pending>>,
    inbox: Mutex<Vec<RawMessage>>,
    running: AtomicBool,
    attempt: AtomicU32,
    failed_sends: AtomicU64,
    protocol_drops: AtomicU64,
}

/// The per-device radio worker handle.
pub struct RadioLink {
    shared: Arc<LinkShared>,
    worker: Option<JoinHandle<()>>,
}

impl RadioLink {
    /// Start the worker. `clock` supplies the device's internal time
    /// for timestamping and back-dating.
    pub fn spawn<R, K>(uid: DeviceId, mut radio: R, clock: K) -> RadioLink
    where
        R: Radio,
        K: Fn() -> SimTime + Send + 'static,
    {
        let shared = Arc::new(LinkShared {
            running: AtomicBool::new(true),
            ..LinkShared::default()
        });
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::spawn(move || {
            let shared = worker_shared;
            while shared.running.load(Ordering::Relaxed) {
                // Sending: retry the pending frame, delay byte
                // appended at each actual attempt.
                {
                    let mut outbox = shared.outbox.lock();
                    if let Some(pending) = outbox.as_ref() {
                        let mut frame = pending.frame.clone();
                        encode_radio_delay(&mut frame, pending.send_time, clock());
                        let attempt = shared.attempt.load(Ordering::Relaxed);
                        if radio.send(uid, &frame, attempt) {
                            *outbox = None;
                            shared.attempt.store(0, Ordering::Relaxed);
                        } else {
                            shared.attempt.store(attempt + 1, Ordering::Relaxed);
                            shared.failed_sends.fetch_add(1, Ordering::Relaxed);
                            debug!(device = %uid, attempt, "send attempt failed");
                        }
                    }
                }
                std::thread::yield_now();

                // Receiving: strip the delay byte and back-date.
                let failed = shared.attempt.load(Ordering::Relaxed);
                if let Some(mut message) = radio.receive(failed) {
                    if !message.content.is_empty() {
                        match decode_radio_delay(&mut message.content, clock()) {
                            Ok(time) => {
                                message.time = time;
                                shared.inbox.lock().push(message);
                            }
                            Err(_) => {
                                shared.protocol_drops.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                }
                std::thread::yield_now();
            }
        });

        RadioLink {
            shared,
            worker: Some(worker),
        }
    }

    /// Schedule a frame for broadcast, replacing any frame still
    /// pending. The send time is recorded now; the relative delay
    /// byte is computed at each transmission attempt.
    pub fn send(&self, frame: Vec<u8>, now: SimTime) {
        let mut outbox = self.shared.outbox.lock();
        *outbox = Some(Pending {
            frame,
            send_time: now,
        });
        self.shared.attempt.store(0, Ordering::Relaxed);
    }

    /// Swap out the messages received since the last fetch.
    pub fn fetch(&self) -> Vec<RawMessage> {
        std::mem::take(&mut *self.shared.inbox.lock())
    }

    /// Whether a frame is still waiting to be accepted by the radio.
    pub fn is_sending(&self) -> bool {
        self.shared.outbox.lock().is_some()
    }

    /// Total failed send attempts.
    pub fn failed_sends(&self) -> u64 {
        self.shared.failed_sends.load(Ordering::Relaxed)
    }

    /// Frames dropped for a malformed trailing timestamp.
    pub fn protocol_drops(&self) -> u64 {
        self.shared.protocol_drops.load(Ordering::Relaxed)
    }
}

impl Drop for RadioLink {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
