//! kinect-sync demo: blocking frame reads against the simulated driver

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use color_eyre::{eyre::eyre, Result};
use tracing::{error, info, warn};

use kinect_sync::driver::SimDriver;
use kinect_sync::{BridgeConfig, CaptureBridge, Led, Stream};

/// What a consumer thread reports back for each frame
struct FrameSummary {
    stream: Stream,
    timestamp: u32,
    mean: f64,
    latency: Duration,
}

fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kinect_sync=debug".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("kinect-sync demo launching...");

    // Load configuration
    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = BridgeConfig::load(path.as_deref())?;
    let sim = config.sim.clone();
    info!(devices = sim.devices, fps = sim.fps, "Using simulated driver");

    let (driver, _controller) = SimDriver::synthetic(sim.devices, sim.fps);
    let bridge = Arc::new(CaptureBridge::with_driver(driver, config));
    bridge.start()?;

    bridge.set_led(0, Led::BlinkGreen)?;
    let accel = bridge.get_accelerometer(0)?;
    info!(x = accel.x, y = accel.y, z = accel.z, "Accelerometer (m/s^2)");

    let (tx, rx) = flume::bounded::<FrameSummary>(sim.frames);

    // One blocking reader per stream
    let readers: Vec<_> = Stream::ALL
        .into_iter()
        .map(|stream| {
            let bridge = Arc::clone(&bridge);
            let tx = tx.clone();
            let frames = sim.frames;
            thread::Builder::new()
                .name(format!("reader-{stream}"))
                .spawn(move || {
                    for _ in 0..frames {
                        let requested = Instant::now();
                        let frame = match bridge.get_frame(0, stream, Some(Duration::from_secs(2))) {
                            Ok(frame) => frame,
                            Err(e) if e.is_terminal() => {
                                error!("Failed to get {} frame: {}", stream, e);
                                break;
                            }
                            Err(e) => {
                                warn!("Retrying {} frame: {}", stream, e);
                                continue;
                            }
                        };
                        let pixels = frame.pixels();
                        let mean = pixels.iter().map(|&b| f64::from(b)).sum::<f64>()
                            / pixels.len() as f64;
                        let summary = FrameSummary {
                            stream,
                            timestamp: frame.timestamp(),
                            mean,
                            latency: requested.elapsed(),
                        };
                        if tx.send(summary).is_err() {
                            break;
                        }
                    }
                })
        })
        .collect::<std::io::Result<_>>()?;
    drop(tx);

    for summary in rx.iter() {
        info!(
            stream = %summary.stream,
            timestamp = summary.timestamp,
            mean = format!("{:.1}", summary.mean),
            latency_ms = summary.latency.as_secs_f64() * 1e3,
            "Frame"
        );
    }

    for reader in readers {
        reader.join().map_err(|_| eyre!("reader thread panicked"))?;
    }

    for stream in Stream::ALL {
        match bridge.mailbox_stats(0, stream) {
            Some(stats) => info!(
                %stream,
                published = stats.published,
                taken = stats.taken,
                overwritten = stats.overwritten,
                "Mailbox stats"
            ),
            None => warn!(%stream, "No session for device 0"),
        }
    }

    bridge.set_led(0, Led::Off)?;
    bridge.stop();
    info!("kinect-sync shutting down");
    Ok(())
}
