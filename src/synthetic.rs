//! Device-free signal source for working on consumers without hardware.
//!
//! Emits the same events a streaming recorder would, through the same
//! [`EventFeed`] path: 25-sample continuous bursts six times a second, a
//! battery heartbeat every 30 bursts and a device clock event at the start
//! of every cycle.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc};
use log::{error, info};
use once_cell::sync::Lazy;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::events::{ContinuousData, Event, Time, CONTINUOUS_SAMPLES};
use crate::session::cancellable;
use crate::sink::{EventFeed, SampleSink, SAMPLE_RATE_HZ};

/// One burst every 25 samples at 150 Hz.
pub const BURST_PERIOD: Duration = Duration::from_micros(166_667);

/// Bursts per simulated measurement cycle, after which the step wraps to 0.
const CYCLE_STEPS: u8 = 121;

/// One heartbeat of ECG-like signal at 60 bpm, in millivolts.
static WAVEFORM: Lazy<Vec<f64>> = Lazy::new(|| {
    // (centre in seconds, width in seconds, amplitude in mV): P, Q, R, S, T
    const WAVES: [(f64, f64, f64); 5] = [
        (0.20, 0.025, 0.15),
        (0.32, 0.008, -0.10),
        (0.35, 0.010, 1.20),
        (0.38, 0.008, -0.25),
        (0.60, 0.040, 0.30),
    ];
    (0..SAMPLE_RATE_HZ as usize)
        .map(|i| {
            let t = i as f64 / SAMPLE_RATE_HZ;
            WAVES
                .iter()
                .map(|&(centre, width, amplitude)| {
                    amplitude * (-((t - centre) / width).powi(2) / 2.0).exp()
                })
                .sum()
        })
        .collect()
});

/// The waveform slice for burst `index`, cycling through one heartbeat.
fn burst(index: usize) -> &'static [f64] {
    let bursts = WAVEFORM.len() / CONTINUOUS_SAMPLES;
    let start = (index % bursts) * CONTINUOUS_SAMPLES;
    &WAVEFORM[start..start + CONTINUOUS_SAMPLES]
}

/// Events emitted for one step of the simulated measurement.
fn step_events(step: u8, samples: &[f64], now: DateTime<Utc>) -> Vec<Event> {
    let mut events = Vec::with_capacity(3);
    if step == 0 {
        events.push(Event::Time(Time {
            second: now.second() as u8,
            minute: now.minute() as u8,
            hour: now.hour() as u8,
            day: now.day() as u8,
            month: now.month() as u8,
            year: u16::try_from(now.year()).unwrap_or(0),
            zone: 0,
        }));
    }
    events.push(Event::ContinuousData(ContinuousData {
        sequence_no: step,
        is_final: false,
        heart_rate: (step / 20) * 40,
        lead_off: step > 60,
        gain: 0,
        volume: 0,
        samples: samples.to_vec(),
    }));
    if step % 30 == 0 {
        events.push(Event::Heartbeat {
            battery_level: 3u8.saturating_sub(step / 30),
        });
    }
    events
}

pub struct SyntheticSource {
    sink: Arc<SampleSink>,
    period: Duration,
}

impl SyntheticSource {
    pub fn new(sink: Arc<SampleSink>) -> Self {
        Self {
            sink,
            period: BURST_PERIOD,
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period.max(Duration::from_millis(1));
        self
    }

    /// Spawn the generator on the current tokio runtime.
    pub fn start(self) -> SyntheticHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(generate(EventFeed::new(self.sink), self.period, stop_rx));
        SyntheticHandle {
            stop_tx,
            task: tokio::sync::Mutex::new(Some(task)),
        }
    }
}

pub struct SyntheticHandle {
    stop_tx: watch::Sender<bool>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SyntheticHandle {
    /// Stop generating and wait for the task to finish. Idempotent.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                error!("synthetic source ended abnormally: {e}");
            }
        }
    }
}

async fn generate(mut feed: EventFeed, period: Duration, mut stop: watch::Receiver<bool>) {
    info!("synthetic source started");
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut index = 0usize;
    while cancellable(&mut stop, ticker.tick()).await.is_some() {
        let step = (index % usize::from(CYCLE_STEPS)) as u8;
        for event in step_events(step, burst(index), Utc::now()) {
            feed.forward(&event);
        }
        if index == 0 {
            feed.sink().report_status(true, "Sending test signal");
        }
        index = index.wrapping_add(1);
    }

    feed.sink().clear();
    feed.sink().report_status(false, "Acquisition stopped");
    info!("synthetic source stopped");
}
