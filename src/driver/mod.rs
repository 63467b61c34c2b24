//! Boundary to the callback-driven device driver
//!
//! The driver owns a single event loop: `process_events` blocks on the
//! transport and dispatches every finished frame to a [`FrameSink`] on the
//! calling thread. Everything else on [`Driver`] is a short control call.

pub mod runloop;
pub mod sim;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::capture::{Stream, StreamFormat};

pub use runloop::Runloop;
pub use sim::{SimController, SimDriver};

/// Opaque handle the driver hands out for an opened device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceHandle(pub u64);

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev#{}", self.0)
    }
}

/// Front-panel LED states understood by the device firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Led {
    Off = 0,
    Green = 1,
    Red = 2,
    Yellow = 3,
    BlinkGreen = 4,
    BlinkRedYellow = 6,
}

/// Motor state reported alongside the accelerometer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TiltStatus {
    Stopped,
    Limit,
    Moving,
}

/// Unconverted tilt/accelerometer report
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawTiltState {
    pub accel_x: i16,
    pub accel_y: i16,
    pub accel_z: i16,
    /// Tilt angle in half-degree steps as reported by the motor
    pub tilt_angle: i8,
    pub status: TiltStatus,
}

impl RawTiltState {
    pub fn accelerometer(&self) -> Accelerometer {
        Accelerometer {
            x: mks(self.accel_x),
            y: mks(self.accel_y),
            z: mks(self.accel_z),
        }
    }

    pub fn tilt_degrees(&self) -> f64 {
        f64::from(self.tilt_angle) / 2.0
    }
}

/// Accelerometer counts per g of the device's KXSD9 sensor
pub const ACCEL_COUNTS_PER_G: f64 = 819.0;
/// Standard gravity, m/s^2
pub const GRAVITY: f64 = 9.80665;

fn mks(counts: i16) -> f64 {
    f64::from(counts) / ACCEL_COUNTS_PER_G * GRAVITY
}

/// Acceleration in m/s^2
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Accelerometer {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    #[error("no device at index {0}")]
    NoSuchDevice(u32),

    #[error("device {0} is already claimed")]
    DeviceBusy(u32),

    #[error("unknown device handle {0}")]
    UnknownHandle(DeviceHandle),

    #[error("event processing interrupted")]
    Interrupted,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("fatal driver error: {0}")]
    Fatal(String),

    #[error("{0:?} is not supported")]
    Unsupported(StreamFormat),
}

/// Receiver for frames delivered from inside `process_events`.
///
/// `data` is only valid for the duration of the call.
pub trait FrameSink {
    fn on_frame(&self, handle: DeviceHandle, stream: Stream, data: &[u8], timestamp: u32);
}

/// Callback-driven, single-threaded device driver.
///
/// Control calls are serialised against `process_events` by [`Runloop`];
/// implementations only need `interrupt` to be safe while an event call is
/// in flight.
pub trait Driver: Send + Sync {
    /// (Re)create the driver context
    fn init(&self) -> Result<(), DriverError>;

    fn open_device(&self, index: u32) -> Result<DeviceHandle, DriverError>;

    fn close_device(&self, handle: DeviceHandle) -> Result<(), DriverError>;

    fn set_stream_format(
        &self,
        handle: DeviceHandle,
        stream: Stream,
        format: StreamFormat,
    ) -> Result<(), DriverError>;

    fn start_stream(&self, handle: DeviceHandle, stream: Stream) -> Result<(), DriverError>;

    fn stop_stream(&self, handle: DeviceHandle, stream: Stream) -> Result<(), DriverError>;

    /// Block until events arrive, dispatch them to `sink`, then return.
    /// An error means the context is unusable.
    fn process_events(&self, sink: &dyn FrameSink) -> Result<(), DriverError>;

    /// Tear down the context so an in-flight `process_events` returns
    fn interrupt(&self);

    fn set_led(&self, handle: DeviceHandle, led: Led) -> Result<(), DriverError>;

    /// Target angle in degrees; the device clamps to +/-31
    fn set_tilt(&self, handle: DeviceHandle, degrees: f64) -> Result<(), DriverError>;

    fn tilt_state(&self, handle: DeviceHandle) -> Result<RawTiltState, DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_counts_convert_to_mks() {
        let raw = RawTiltState {
            accel_x: 0,
            accel_y: 819,
            accel_z: -819,
            tilt_angle: -20,
            status: TiltStatus::Stopped,
        };
        let accel = raw.accelerometer();
        assert_eq!(accel.x, 0.0);
        assert!((accel.y - GRAVITY).abs() < 1e-9);
        assert!((accel.z + GRAVITY).abs() < 1e-9);
        assert_eq!(raw.tilt_degrees(), -10.0);
    }
}
