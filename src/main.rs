use std::io::{self, Write};
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::info;

use pc80b_rs::logging::init_logging_with;
use pc80b_rs::sink::DEFAULT_CAPACITY;
use pc80b_rs::{SampleSink, SessionConfig, SessionHandle, SyntheticHandle, SyntheticSource};

/// Display refresh rate the demo pulls samples at.
const FRAME_PERIOD: Duration = Duration::from_nanos(1_000_000_000 / 30);

/// Samples taken per refresh: 150 Hz / 30 fps.
const SAMPLES_PER_FRAME: usize = 5;

#[derive(Parser, Debug)]
#[command(
    name = "pc80b-stream",
    about = "Stream ECG samples from a PC-80B recorder as `<timestamp> <millivolts>` lines"
)]
struct Args {
    /// Generate a synthetic signal instead of connecting to a device
    #[arg(long)]
    synthetic: bool,
    /// Advertised device name (default PC80B-BLE, or PC80B_DEVICE_NAME)
    #[arg(long)]
    name: Option<String>,
    /// Delay between discovery and connect, in milliseconds
    #[arg(long)]
    settle_ms: Option<u64>,
    /// Sample buffer capacity
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    capacity: usize,
    /// Log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,
}

enum Source {
    Device(SessionHandle),
    Synthetic(SyntheticHandle),
}

impl Source {
    async fn stop(&self) {
        match self {
            Source::Device(handle) => handle.stop().await,
            Source::Synthetic(handle) => handle.stop().await,
        }
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();
    init_logging_with(args.log_level.as_deref());

    let mut config = SessionConfig::from_env()?;
    if let Some(name) = args.name.clone() {
        config.device_name = name;
    }
    if let Some(ms) = args.settle_ms {
        config.settle_delay = Duration::from_millis(ms);
    }

    let sink = Arc::new(SampleSink::new(args.capacity));
    let source = if args.synthetic {
        Source::Synthetic(SyntheticSource::new(Arc::clone(&sink)).start())
    } else {
        Source::Device(start_device(Arc::clone(&sink), config).await?)
    };

    let result = pump(&sink).await;
    info!("stopping");
    source.stop().await;
    result
}

#[cfg(feature = "bluez")]
async fn start_device(sink: Arc<SampleSink>, config: SessionConfig) -> Result<SessionHandle> {
    let transport = pc80b_rs::BluezTransport::new().await?;
    Ok(pc80b_rs::DeviceSession::new(transport, sink, config).start())
}

#[cfg(not(feature = "bluez"))]
async fn start_device(_sink: Arc<SampleSink>, _config: SessionConfig) -> Result<SessionHandle> {
    anyhow::bail!("built without the `bluez` feature; rebuild with it or pass --synthetic")
}

/// Print samples until Ctrl-C or until stdout goes away.
async fn pump(sink: &SampleSink) -> Result<()> {
    let mut ticker = tokio::time::interval(FRAME_PERIOD);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut last_status = String::new();

    loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                signal?;
                return Ok(());
            }
            _ = ticker.tick() => {}
        }

        let status = sink.get_status();
        if status.text != last_status {
            info!("status: {} ({})", status.text, if status.active { "active" } else { "idle" });
            last_status = status.text;
        }

        let mut out = io::stdout().lock();
        for sample in sink.pull(SAMPLES_PER_FRAME) {
            if let Err(e) = writeln!(out, "{:.3} {:.4}", sample.timestamp, sample.value) {
                if e.kind() == io::ErrorKind::BrokenPipe {
                    return Ok(());
                }
                return Err(e.into());
            }
        }
        out.flush()?;
    }
}
