pub mod bridge;
pub mod capture;
pub mod device;
pub mod driver;
pub mod error;
pub mod pipeline;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use bridge::{CaptureBridge, WorkerState};
pub use capture::{Frame, Stream, StreamFormat};
pub use device::{DeviceRegistry, DeviceSession};
pub use driver::{Accelerometer, DeviceHandle, Driver, DriverError, Led, RawTiltState};
pub use error::{Error, Result};
pub use pipeline::{FrameMailbox, WakePolicy};

/// Environment prefix for configuration overrides, e.g. `KINECT_SYNC__MAX_DEVICES=4`
pub const ENV_PREFIX: &str = "KINECT_SYNC";

/// Bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Re-check interval of a waiting `get_frame`
    pub poll_interval_ms: u64,
    /// Highest device index + 1 the bridge will try to open
    pub max_devices: u32,
    pub wake_policy: WakePolicy,
    pub depth_format: StreamFormat,
    pub color_format: StreamFormat,
    pub worker_thread_name: String,
    pub sim: SimConfig,
}

/// Simulated driver settings used by the demo binary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub devices: u32,
    pub fps: u32,
    /// Frames per stream the demo reads before stopping
    pub frames: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            max_devices: 64,
            wake_policy: WakePolicy::One,
            depth_format: StreamFormat::Depth11Bit,
            color_format: StreamFormat::Rgb,
            worker_thread_name: "kinect-sync-worker".into(),
            sim: SimConfig::default(),
        }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            devices: 1,
            fps: 30,
            frames: 60,
        }
    }
}

impl BridgeConfig {
    /// Defaults, overlaid by an optional TOML file, overlaid by `KINECT_SYNC__*`
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::Config(config::ConfigError::Message(msg)));
        if self.poll_interval_ms == 0 {
            return invalid("poll_interval_ms must be positive".into());
        }
        if self.depth_format.stream() != Stream::Depth {
            return invalid(format!("{:?} is not a depth format", self.depth_format));
        }
        if self.color_format.stream() != Stream::Color {
            return invalid(format!("{:?} is not a colour format", self.color_format));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn format(&self, stream: Stream) -> StreamFormat {
        match stream {
            Stream::Depth => self.depth_format,
            Stream::Color => self.color_format,
        }
    }
}
