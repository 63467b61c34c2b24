//! In-process stand-in for the device driver
//!
//! `SimDriver` behaves like a real driver from the bridge's point of view:
//! devices must be opened, streams configured and started, and frames only
//! arrive for started streams from inside `process_events`. A paired
//! [`SimController`] injects frames and faults, optionally alongside a
//! synthetic test-pattern generator.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, trace};

use super::{DeviceHandle, Driver, DriverError, FrameSink, Led, RawTiltState, TiltStatus};
use crate::capture::{Stream, StreamFormat, FRAME_HEIGHT, FRAME_WIDTH};

const EVENT_TIMEOUT: Duration = Duration::from_millis(10);
/// Accelerometer counts for 1 g
const COUNTS_PER_G: i16 = 819;
const MAX_TILT_DEGREES: f64 = 31.0;

enum SimEvent {
    Frame {
        index: u32,
        stream: Stream,
        data: Bytes,
        timestamp: u32,
    },
    Fault(String),
    Wake,
}

struct SimDevice {
    handle: DeviceHandle,
    formats: HashMap<Stream, StreamFormat>,
    started: HashSet<Stream>,
    led: Led,
    tilt_degrees: f64,
}

impl SimDevice {
    fn format(&self, stream: Stream) -> StreamFormat {
        self.formats.get(&stream).copied().unwrap_or(match stream {
            Stream::Depth => StreamFormat::Depth11Bit,
            Stream::Color => StreamFormat::Rgb,
        })
    }
}

#[derive(Default)]
struct SimState {
    devices: HashMap<u32, SimDevice>,
    next_handle: u64,
    open_calls: HashMap<u32, usize>,
    fail_open: HashSet<u32>,
}

impl SimState {
    fn by_handle(&mut self, handle: DeviceHandle) -> Result<&mut SimDevice, DriverError> {
        self.devices
            .values_mut()
            .find(|dev| dev.handle == handle)
            .ok_or(DriverError::UnknownHandle(handle))
    }
}

struct Shared {
    device_count: u32,
    live: AtomicBool,
    state: Mutex<SimState>,
    changed: Condvar,
    events_tx: Sender<SimEvent>,
    events_rx: Receiver<SimEvent>,
    synthetic_interval: Option<Duration>,
    clock: AtomicU32,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Simulated multi-device driver
pub struct SimDriver {
    shared: Arc<Shared>,
}

/// Test and demo handle for a [`SimDriver`]
#[derive(Clone)]
pub struct SimController {
    shared: Arc<Shared>,
}

impl SimDriver {
    /// Driver with `device_count` attached devices that only emits injected frames
    pub fn new(device_count: u32) -> (Self, SimController) {
        Self::build(device_count, None)
    }

    /// Driver that also generates test patterns at `fps` for every started stream
    pub fn synthetic(device_count: u32, fps: u32) -> (Self, SimController) {
        let interval = Duration::from_secs(1) / fps.max(1);
        Self::build(device_count, Some(interval))
    }

    fn build(device_count: u32, synthetic_interval: Option<Duration>) -> (Self, SimController) {
        let (events_tx, events_rx) = flume::unbounded();
        let shared = Arc::new(Shared {
            device_count,
            live: AtomicBool::new(false),
            state: Mutex::new(SimState::default()),
            changed: Condvar::new(),
            events_tx,
            events_rx,
            synthetic_interval,
            clock: AtomicU32::new(0),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            SimController { shared },
        )
    }

    fn emit_synthetic(&self, sink: &dyn FrameSink) {
        let timestamp = self.shared.clock.fetch_add(1, Ordering::Relaxed);
        let targets: Vec<(DeviceHandle, StreamFormat)> = {
            let state = self.shared.state();
            state
                .devices
                .values()
                .flat_map(|dev| dev.started.iter().map(move |s| (dev.handle, dev.format(*s))))
                .collect()
        };
        for (handle, format) in targets {
            let data = synthetic_frame(format, timestamp);
            sink.on_frame(handle, format.stream(), &data, timestamp);
        }
    }
}

impl Driver for SimDriver {
    fn init(&self) -> Result<(), DriverError> {
        while self.shared.events_rx.try_recv().is_ok() {}
        self.shared.state().devices.clear();
        self.shared.live.store(true, Ordering::Release);
        debug!(devices = self.shared.device_count, "Simulated driver initialised");
        Ok(())
    }

    fn open_device(&self, index: u32) -> Result<DeviceHandle, DriverError> {
        if !self.shared.live.load(Ordering::Acquire) {
            return Err(DriverError::Transport("context is not initialised".into()));
        }
        let mut state = self.shared.state();
        *state.open_calls.entry(index).or_default() += 1;

        if index >= self.shared.device_count {
            return Err(DriverError::NoSuchDevice(index));
        }
        if state.fail_open.remove(&index) {
            return Err(DriverError::Transport(format!(
                "claiming interface of device {index} failed"
            )));
        }
        if state.devices.contains_key(&index) {
            return Err(DriverError::DeviceBusy(index));
        }

        state.next_handle += 1;
        let handle = DeviceHandle(state.next_handle);
        state.devices.insert(
            index,
            SimDevice {
                handle,
                formats: HashMap::new(),
                started: HashSet::new(),
                led: Led::Green,
                tilt_degrees: 0.0,
            },
        );
        self.shared.changed.notify_all();
        Ok(handle)
    }

    fn close_device(&self, handle: DeviceHandle) -> Result<(), DriverError> {
        let mut state = self.shared.state();
        let before = state.devices.len();
        state.devices.retain(|_, dev| dev.handle != handle);
        if state.devices.len() == before {
            return Err(DriverError::UnknownHandle(handle));
        }
        self.shared.changed.notify_all();
        Ok(())
    }

    fn set_stream_format(
        &self,
        handle: DeviceHandle,
        stream: Stream,
        format: StreamFormat,
    ) -> Result<(), DriverError> {
        if format.stream() != stream {
            return Err(DriverError::Unsupported(format));
        }
        let mut state = self.shared.state();
        state.by_handle(handle)?.formats.insert(stream, format);
        Ok(())
    }

    fn start_stream(&self, handle: DeviceHandle, stream: Stream) -> Result<(), DriverError> {
        if !self.shared.live.load(Ordering::Acquire) {
            return Err(DriverError::Transport("context is not initialised".into()));
        }
        let mut state = self.shared.state();
        state.by_handle(handle)?.started.insert(stream);
        self.shared.changed.notify_all();
        Ok(())
    }

    fn stop_stream(&self, handle: DeviceHandle, stream: Stream) -> Result<(), DriverError> {
        let mut state = self.shared.state();
        state.by_handle(handle)?.started.remove(&stream);
        self.shared.changed.notify_all();
        Ok(())
    }

    fn process_events(&self, sink: &dyn FrameSink) -> Result<(), DriverError> {
        if !self.shared.live.load(Ordering::Acquire) {
            return Err(DriverError::Interrupted);
        }

        let timeout = self.shared.synthetic_interval.unwrap_or(EVENT_TIMEOUT);
        match self.shared.events_rx.recv_timeout(timeout) {
            Ok(SimEvent::Frame {
                index,
                stream,
                data,
                timestamp,
            }) => {
                let target = {
                    let state = self.shared.state();
                    state
                        .devices
                        .get(&index)
                        .filter(|dev| dev.started.contains(&stream))
                        .map(|dev| dev.handle)
                };
                match target {
                    Some(handle) => sink.on_frame(handle, stream, &data, timestamp),
                    None => trace!(index, %stream, "Dropping frame for inactive stream"),
                }
                Ok(())
            }
            Ok(SimEvent::Fault(reason)) => {
                self.shared.live.store(false, Ordering::Release);
                Err(DriverError::Fatal(reason))
            }
            Ok(SimEvent::Wake) | Err(RecvTimeoutError::Disconnected) => {
                if self.shared.live.load(Ordering::Acquire) {
                    Ok(())
                } else {
                    Err(DriverError::Interrupted)
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if self.shared.synthetic_interval.is_some() {
                    self.emit_synthetic(sink);
                }
                Ok(())
            }
        }
    }

    fn interrupt(&self) {
        self.shared.live.store(false, Ordering::Release);
        let _ = self.shared.events_tx.send(SimEvent::Wake);
    }

    fn set_led(&self, handle: DeviceHandle, led: Led) -> Result<(), DriverError> {
        self.shared.state().by_handle(handle)?.led = led;
        Ok(())
    }

    fn set_tilt(&self, handle: DeviceHandle, degrees: f64) -> Result<(), DriverError> {
        self.shared.state().by_handle(handle)?.tilt_degrees =
            degrees.clamp(-MAX_TILT_DEGREES, MAX_TILT_DEGREES);
        Ok(())
    }

    fn tilt_state(&self, handle: DeviceHandle) -> Result<RawTiltState, DriverError> {
        let mut state = self.shared.state();
        let dev = state.by_handle(handle)?;
        // Level device at rest: gravity along +y.
        Ok(RawTiltState {
            accel_x: 0,
            accel_y: COUNTS_PER_G,
            accel_z: 0,
            tilt_angle: (dev.tilt_degrees * 2.0) as i8,
            status: TiltStatus::Stopped,
        })
    }
}

impl SimController {
    /// Queue a raw buffer as if the device produced it
    pub fn inject_frame(&self, index: u32, stream: Stream, data: impl Into<Bytes>, timestamp: u32) {
        let _ = self.shared.events_tx.send(SimEvent::Frame {
            index,
            stream,
            data: data.into(),
            timestamp,
        });
    }

    /// Make the next `process_events` fail fatally
    pub fn inject_fault(&self, reason: impl Into<String>) {
        let _ = self.shared.events_tx.send(SimEvent::Fault(reason.into()));
    }

    /// Make the next `open_device(index)` fail with a transport error
    pub fn fail_next_open(&self, index: u32) {
        self.shared.state().fail_open.insert(index);
    }

    pub fn open_calls(&self, index: u32) -> usize {
        self.shared.state().open_calls.get(&index).copied().unwrap_or(0)
    }

    pub fn is_open(&self, index: u32) -> bool {
        self.shared.state().devices.contains_key(&index)
    }

    pub fn led(&self, index: u32) -> Option<Led> {
        self.shared.state().devices.get(&index).map(|dev| dev.led)
    }

    pub fn tilt_degrees(&self, index: u32) -> Option<f64> {
        self.shared.state().devices.get(&index).map(|dev| dev.tilt_degrees)
    }

    pub fn format(&self, index: u32, stream: Stream) -> Option<StreamFormat> {
        self.shared
            .state()
            .devices
            .get(&index)
            .and_then(|dev| dev.formats.get(&stream).copied())
    }

    pub fn is_streaming(&self, index: u32, stream: Stream) -> bool {
        self.shared
            .state()
            .devices
            .get(&index)
            .is_some_and(|dev| dev.started.contains(&stream))
    }

    /// Block until `stream` of device `index` is started; false on timeout
    pub fn wait_for_stream(&self, index: u32, stream: Stream, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state();
        loop {
            if state
                .devices
                .get(&index)
                .is_some_and(|dev| dev.started.contains(&stream))
            {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .shared
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// Moving gradient for depth, colour bars for RGB, checkerboard for Bayer
fn synthetic_frame(format: StreamFormat, timestamp: u32) -> Vec<u8> {
    let (width, height) = (FRAME_WIDTH as usize, FRAME_HEIGHT as usize);
    let mut data = Vec::with_capacity(format.frame_bytes());
    let shift = timestamp as usize;
    for y in 0..height {
        for x in 0..width {
            match format {
                StreamFormat::Rgb => data.extend_from_slice(&[
                    (x * 255 / width) as u8,
                    (y * 255 / height) as u8,
                    shift as u8,
                ]),
                StreamFormat::Bayer => data.push(if (x / 8 + y / 8) % 2 == 0 { 0xff } else { 0 }),
                _ => {
                    let sample = ((x + y + shift) % 2048) as u16;
                    data.extend_from_slice(&sample.to_le_bytes());
                }
            }
        }
    }
    data
}
