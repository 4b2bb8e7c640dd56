//! Hand-off conduit between the device session and a sample consumer.
//!
//! The producer pushes timestamped samples as bursts arrive; the consumer
//! pulls fixed-size slices at its own pace. The buffer is bounded and drops
//! the oldest samples once full: it feeds a live display, not a recording.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::NaiveDateTime;
use log::{debug, info};
use serde::Serialize;

use crate::events::{DisplayMeta, Event};

/// Nominal ECG sampling rate of the recorder.
pub const SAMPLE_RATE_HZ: f64 = 150.0;

/// Three seconds of signal.
pub const DEFAULT_CAPACITY: usize = 150 * 3;

/// One ECG sample: seconds since the Unix epoch and millivolts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    pub timestamp: f64,
    pub value: f64,
}

/// Connection/acquisition state shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub active: bool,
    pub text: String,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            active: false,
            text: "Uninitialized".into(),
        }
    }
}

#[derive(Debug)]
struct Ring {
    data: VecDeque<Sample>,
    capacity: usize,
    overwritten: u64,
}

/// Bounded single-producer/single-consumer sample buffer plus status.
///
/// Each accessor holds its lock only for the copy in or out, so neither side
/// can stall the other for longer than that.
#[derive(Debug)]
pub struct SampleSink {
    ring: Mutex<Ring>,
    status: Mutex<Status>,
    meta: Mutex<DisplayMeta>,
}

/// Lock, ignoring poison. No critical section here can panic mid-update.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SampleSink {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(Ring {
                data: VecDeque::with_capacity(capacity),
                capacity,
                overwritten: 0,
            }),
            status: Mutex::new(Status::default()),
            meta: Mutex::new(DisplayMeta::default()),
        }
    }

    /// Append samples, discarding the oldest ones beyond capacity.
    pub fn push(&self, samples: &[Sample]) {
        let mut ring = lock(&self.ring);
        let capacity = ring.capacity;
        // Only the newest `capacity` samples can survive this push.
        let skip = samples.len().saturating_sub(capacity);
        let incoming = &samples[skip..];
        let overflow = (ring.data.len() + incoming.len()).saturating_sub(capacity);
        ring.data.drain(..overflow);
        ring.data.extend(incoming.iter().copied());
        ring.overwritten += (skip + overflow) as u64;
    }

    /// Remove and return up to `count` of the oldest samples.
    pub fn pull(&self, count: usize) -> Vec<Sample> {
        let mut ring = lock(&self.ring);
        let n = count.min(ring.data.len());
        ring.data.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.ring).data.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.ring).data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        lock(&self.ring).capacity
    }

    /// Samples discarded because the consumer fell behind.
    pub fn overwritten(&self) -> u64 {
        lock(&self.ring).overwritten
    }

    /// Drop buffered samples and display readings.
    pub fn clear(&self) {
        let mut ring = lock(&self.ring);
        ring.data.clear();
        ring.overwritten = 0;
        drop(ring);
        *lock(&self.meta) = DisplayMeta::default();
    }

    pub fn report_status(&self, active: bool, text: impl Into<String>) {
        let text = text.into();
        debug!("status: active={} {}", active, text);
        *lock(&self.status) = Status { active, text };
    }

    pub fn get_status(&self) -> Status {
        lock(&self.status).clone()
    }

    pub fn update_meta(&self, event: &Event) {
        lock(&self.meta).apply(event);
    }

    pub fn meta(&self) -> DisplayMeta {
        lock(&self.meta).clone()
    }
}

impl Default for SampleSink {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ============================================================================
// Timestamp reconstruction
// ============================================================================

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Stamps samples at the nominal rate.
///
/// The device sends no per-sample time. The clock is anchored to the device
/// clock when a `Time` event has been seen, otherwise to the host clock at
/// the first burst, and advances 1/150 s per sample from there. Each
/// measurement starts from a fresh anchor.
#[derive(Debug, Clone, Default)]
pub struct SampleClock {
    next: Option<f64>,
}

impl SampleClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn anchor(&mut self, timestamp: f64) {
        self.next = Some(timestamp);
    }

    /// Anchor to device calendar time, interpreted as UTC.
    pub fn anchor_datetime(&mut self, datetime: NaiveDateTime) {
        let utc = datetime.and_utc();
        self.anchor(utc.timestamp() as f64 + f64::from(utc.timestamp_subsec_nanos()) * 1e-9);
    }

    pub fn reset(&mut self) {
        self.next = None;
    }

    pub fn stamp(&mut self, values: &[f64]) -> Vec<Sample> {
        let period = 1.0 / SAMPLE_RATE_HZ;
        let mut t = self.next.unwrap_or_else(now_secs);
        let samples = values
            .iter()
            .map(|&value| {
                let sample = Sample {
                    timestamp: t,
                    value,
                };
                t += period;
                sample
            })
            .collect();
        self.next = Some(t);
        samples
    }
}

// ============================================================================
// Event forwarding
// ============================================================================

/// Routes decoded events into a [`SampleSink`]: samples, display readings and
/// acquisition status.
#[derive(Debug)]
pub struct EventFeed {
    sink: Arc<SampleSink>,
    clock: SampleClock,
    standby: bool,
}

impl EventFeed {
    pub fn new(sink: Arc<SampleSink>) -> Self {
        Self {
            sink,
            clock: SampleClock::new(),
            standby: true,
        }
    }

    pub fn sink(&self) -> &Arc<SampleSink> {
        &self.sink
    }

    /// Forget timing and acquisition state, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.clock.reset();
        self.standby = true;
    }

    pub fn forward(&mut self, event: &Event) {
        self.sink.update_meta(event);

        if let Event::Time(t) = event {
            if let Some(datetime) = t.as_datetime() {
                debug!("device time {}", datetime);
                self.clock.anchor_datetime(datetime);
            }
            return;
        }

        let Some(is_final) = event.data_final() else {
            return;
        };

        if is_final {
            self.standby = true;
            // The next measurement starts after an unknown pause. A device
            // time event arriving before it re-anchors the clock.
            self.clock.reset();
            info!("measurement finished");
            self.sink.report_status(false, "Ready for acquisition");
            return;
        }
        if self.standby {
            self.standby = false;
            self.sink.report_status(true, "Sending ECG data");
        }

        let samples = self.clock.stamp(event.samples());
        self.sink.push(&samples);
    }
}
